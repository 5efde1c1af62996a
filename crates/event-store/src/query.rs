use crate::{AggregateId, EventEnvelope};

/// Filter over the journal.
///
/// Results are returned in journal (sequence) order.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub aggregate_id: Option<AggregateId>,
    pub aggregate_type: Option<String>,
    /// Any of these event types.
    pub event_types: Option<Vec<String>>,
    /// Only entries with a sequence strictly greater than this.
    pub after_sequence: Option<u64>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_aggregate(aggregate_id: AggregateId) -> Self {
        Self {
            aggregate_id: Some(aggregate_id),
            ..Default::default()
        }
    }

    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types
            .get_or_insert_with(Vec::new)
            .push(event_type.into());
        self
    }

    /// Resumes after a previously observed journal position.
    pub fn after(mut self, sequence: u64) -> Self {
        self.after_sequence = Some(sequence);
        self
    }

    /// Returns true if the envelope satisfies every filter that is set.
    pub fn matches(&self, event: &EventEnvelope) -> bool {
        if self.aggregate_id.is_some_and(|id| id != event.aggregate_id) {
            return false;
        }
        if let Some(ref aggregate_type) = self.aggregate_type
            && aggregate_type != &event.aggregate_type
        {
            return false;
        }
        if let Some(ref types) = self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        !self.after_sequence.is_some_and(|seq| event.sequence <= seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Version;

    fn envelope(event_type: &str, sequence: u64) -> EventEnvelope {
        let mut envelope = EventEnvelope::builder()
            .event_type(event_type)
            .aggregate_id(AggregateId::new())
            .aggregate_type("BloodRequest")
            .version(Version::first())
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap();
        envelope.sequence = sequence;
        envelope
    }

    #[test]
    fn event_type_filters_accumulate() {
        let query = EventQuery::new()
            .event_type("CommitmentOpened")
            .event_type("CommitmentFailed");

        assert!(query.matches(&envelope("CommitmentOpened", 1)));
        assert!(query.matches(&envelope("CommitmentFailed", 2)));
        assert!(!query.matches(&envelope("DeliveryRecorded", 3)));
    }

    #[test]
    fn after_sequence_is_exclusive() {
        let query = EventQuery::new().after(5);
        assert!(!query.matches(&envelope("RequestSubmitted", 5)));
        assert!(query.matches(&envelope("RequestSubmitted", 6)));
    }

    #[test]
    fn aggregate_type_filter() {
        let query = EventQuery::new().aggregate_type("TransportJob");
        assert!(!query.matches(&envelope("RequestSubmitted", 1)));
    }
}

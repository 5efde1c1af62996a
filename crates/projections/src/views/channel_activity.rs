//! Commitment activity per supply channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use common::CommitmentId;
use domain::{Channel, RequestEvent};
use event_store::EventEnvelope;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::Result;
use crate::projection::{Projection, ProjectionPosition};
use crate::read_model::ReadModel;

/// Commitment counters for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChannelActivity {
    pub opened: u64,
    pub delivered: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub delivered_units: u64,
}

impl ChannelActivity {
    pub fn open(&self) -> u64 {
        self.opened - self.delivered - self.cancelled - self.failed
    }
}

#[derive(Debug, Clone, Copy)]
struct Tracked {
    channel: Channel,
    promised: u32,
    delivered: u32,
}

#[derive(Default)]
struct State {
    channels: BTreeMap<Channel, ChannelActivity>,
    open: HashMap<CommitmentId, Tracked>,
}

impl State {
    fn close(&mut self, commitment_id: CommitmentId, outcome: fn(&mut ChannelActivity)) {
        if let Some(tracked) = self.open.remove(&commitment_id) {
            outcome(self.channels.entry(tracked.channel).or_default());
        }
    }

    fn settle_if_complete(&mut self, commitment_id: CommitmentId) {
        let complete = self
            .open
            .get(&commitment_id)
            .is_some_and(|t| t.delivered >= t.promised);
        if complete {
            self.close(commitment_id, |a| a.delivered += 1);
        }
    }
}

/// Opened, delivered, cancelled and failed commitments per channel.
#[derive(Clone)]
pub struct ChannelActivityView {
    state: Arc<RwLock<State>>,
    position: Arc<RwLock<ProjectionPosition>>,
}

impl ChannelActivityView {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            position: Arc::new(RwLock::new(ProjectionPosition::zero())),
        }
    }

    pub async fn channel(&self, channel: Channel) -> ChannelActivity {
        self.state
            .read()
            .await
            .channels
            .get(&channel)
            .copied()
            .unwrap_or_default()
    }

    /// Every channel, including those with no activity yet.
    pub async fn all(&self) -> BTreeMap<Channel, ChannelActivity> {
        let state = self.state.read().await;
        [Channel::Bank, Channel::Donor, Channel::Institution]
            .into_iter()
            .map(|c| (c, state.channels.get(&c).copied().unwrap_or_default()))
            .collect()
    }
}

impl Default for ChannelActivityView {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Projection for ChannelActivityView {
    fn name(&self) -> &'static str {
        "ChannelActivityView"
    }

    async fn handle(&self, event: &EventEnvelope) -> Result<()> {
        if event.aggregate_type == "BloodRequest" {
            let request_event: RequestEvent = event.decode()?;
            let mut state = self.state.write().await;

            match request_event {
                RequestEvent::CommitmentOpened(data) => {
                    let channel = data.kind.channel();
                    state.channels.entry(channel).or_default().opened += 1;
                    state.open.insert(
                        data.commitment_id,
                        Tracked {
                            channel,
                            promised: data.units,
                            delivered: 0,
                        },
                    );
                }
                RequestEvent::CommitmentReduced(data) => {
                    if let Some(t) = state.open.get_mut(&data.commitment_id) {
                        t.promised = data.to_units;
                    }
                    state.settle_if_complete(data.commitment_id);
                }
                RequestEvent::DeliveryRecorded(data) => {
                    let channel = state.open.get_mut(&data.commitment_id).map(|t| {
                        t.delivered += data.units;
                        t.channel
                    });
                    if let Some(channel) = channel {
                        state.channels.entry(channel).or_default().delivered_units +=
                            u64::from(data.units);
                    }
                    state.settle_if_complete(data.commitment_id);
                }
                RequestEvent::CommitmentCancelled(data) => {
                    state.close(data.commitment_id, |a| a.cancelled += 1);
                }
                RequestEvent::CommitmentFailed(data) => {
                    state.close(data.commitment_id, |a| a.failed += 1);
                }
                _ => {}
            }
        }

        let mut pos = self.position.write().await;
        *pos = pos.advance(event.sequence);
        Ok(())
    }

    async fn position(&self) -> ProjectionPosition {
        *self.position.read().await
    }

    async fn reset(&self) -> Result<()> {
        *self.state.write().await = State::default();
        *self.position.write().await = ProjectionPosition::zero();
        Ok(())
    }
}

impl ReadModel for ChannelActivityView {
    fn name(&self) -> &'static str {
        "ChannelActivityView"
    }

    fn count(&self) -> usize {
        self.state
            .try_read()
            .map(|s| s.channels.len())
            .unwrap_or(0)
    }
}

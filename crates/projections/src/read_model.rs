//! Read model trait for query-side views.

/// A view that dashboards and the HTTP layer query.
pub trait ReadModel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of rows or buckets currently held.
    fn count(&self) -> usize;
}

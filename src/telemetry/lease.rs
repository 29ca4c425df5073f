//! Lease span helpers.
//!
//! Messages carry no identity of their own, so every lease gets a random id
//! to correlate its log lines.

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one leased message.
///
/// The `lease.route` field is declared empty and filled by [`record_route`].
pub fn start_lease_span(queue: &str, lease_id: &Uuid) -> Span {
    tracing::info_span!(
        "rmq.lease",
        "queue.name" = queue,
        "lease.id" = %lease_id,
        "lease.route" = tracing::field::Empty,
    )
}

/// Record where the leased message went when the lease closed.
pub fn record_route(span: &Span, from: &str, to: &str) {
    span.record("lease.route", to);
    span.in_scope(|| {
        tracing::debug!(from = from, to = to, "message routed");
    });
}

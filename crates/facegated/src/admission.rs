//! Admission bookkeeping: the attendee counter moves exactly once per
//! ticket, at activation, through the store's guarded increment. Expiry
//! never gives the seat back.

use facegate_core::GateError;
use facegate_source::Artifact;
use facegate_store::Store;

#[derive(Clone)]
pub struct AdmissionController {
    store: Store,
    strict: bool,
}

impl AdmissionController {
    pub fn new(store: Store, strict: bool) -> Self {
        Self { store, strict }
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    /// Seats left before the event is full. Never negative.
    pub async fn capacity_remaining(&self, event_id: &str) -> Result<u32, GateError> {
        let (attendees, capacity) = self.store.capacity(event_id).await?;
        Ok(capacity.saturating_sub(attendees))
    }

    /// Activate the ticket and count the admission atomically. In strict
    /// mode a full event rejects with [`GateError::CapacityExceeded`];
    /// soft mode counts past capacity and warns.
    pub async fn record_activation(
        &self,
        ticket_id: &str,
        event_id: &str,
        artifact: &Artifact,
        method: &str,
    ) -> Result<(), GateError> {
        let (attendees, capacity) = self
            .store
            .activate_and_count(ticket_id, event_id, artifact, method, self.strict)
            .await?;

        if attendees > capacity {
            tracing::warn!(
                event_id,
                attendees,
                capacity,
                "event over declared capacity (soft enforcement)"
            );
        } else {
            tracing::info!(event_id, attendees, capacity, ticket_id, "admission counted");
        }
        Ok(())
    }
}

//! Registration and enrollment: create the ticket in its class-derived
//! initial status, confirm payment when an external gateway says so, then
//! bind the biometric artifact and activate.

use chrono::Utc;
use facegate_core::{GateError, Holder, Ticket, TicketClass, TicketStatus};
use facegate_source::{Capture, DescriptorSource};
use facegate_store::Store;
use std::sync::Arc;
use uuid::Uuid;

use crate::admission::AdmissionController;

#[derive(Clone)]
pub struct Registrar {
    store: Store,
    source: Arc<dyn DescriptorSource>,
    admission: AdmissionController,
}

impl Registrar {
    pub fn new(store: Store, source: Arc<dyn DescriptorSource>, admission: AdmissionController) -> Self {
        Self {
            store,
            source,
            admission,
        }
    }

    /// Create a ticket for an active event. Free events always issue
    /// free-class tickets; paid events never do. With strict capacity
    /// enforcement a full event rejects registration up front (the
    /// binding check happens again, atomically, at activation).
    pub async fn register(
        &self,
        event_id: &str,
        holder: Holder,
        requested_class: TicketClass,
    ) -> Result<Ticket, GateError> {
        let event = self.store.get_event(event_id).await?;
        if !event.is_active {
            return Err(GateError::EventNotFound(format!(
                "event {event_id} is not accepting registrations"
            )));
        }
        if self.admission.strict() && event.at_capacity() {
            return Err(GateError::CapacityExceeded);
        }

        let class = if event.is_free {
            TicketClass::Free
        } else if requested_class == TicketClass::Free {
            TicketClass::Standard
        } else {
            requested_class
        };

        let ticket = Ticket {
            id: Uuid::new_v4().to_string(),
            event_id: event.id.clone(),
            holder,
            class,
            price: if event.is_free { 0.0 } else { class.default_price() },
            status: TicketStatus::initial(class),
            purchased_at: Utc::now(),
            artifact_method: None,
        };
        self.store.create_ticket(&ticket).await?;

        tracing::info!(
            ticket_id = %ticket.id,
            event_id,
            class = class.as_str(),
            status = %ticket.status,
            "ticket registered"
        );
        Ok(ticket)
    }

    /// External payment confirmation: `PendingPayment -> PaidPendingFace`.
    pub async fn confirm_payment(&self, ticket_id: &str) -> Result<Ticket, GateError> {
        let ticket = self.store.confirm_payment(ticket_id).await?;
        tracing::info!(ticket_id, "payment confirmed");
        Ok(ticket)
    }

    /// Validate the enrollment capture with the descriptor source, bind
    /// the resulting artifact, and activate the ticket. The artifact is
    /// bound exactly once; a second enrollment fails before any backend
    /// call.
    pub async fn enroll_face(&self, ticket_id: &str, capture: &Capture) -> Result<Ticket, GateError> {
        let ticket = self.store.get_ticket(ticket_id).await?;
        ticket.status.enroll()?;

        let artifact = self
            .source
            .enroll(capture)
            .await
            .map_err(GateError::from)?;

        self.admission
            .record_activation(&ticket.id, &ticket.event_id, &artifact, self.source.method())
            .await?;

        tracing::info!(ticket_id, method = self.source.method(), "ticket activated");
        self.store.get_ticket(ticket_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::tests::StubSource;
    use chrono::Utc;
    use facegate_core::Event;
    use facegate_store::Seal;

    async fn setup(is_free: bool, capacity: u32, strict: bool) -> (Store, Registrar) {
        let store = Store::open_in_memory(Seal::from_passphrase("test"))
            .await
            .unwrap();
        store
            .insert_event(&Event {
                id: "ev".into(),
                name: "Launch Night".into(),
                schedule: Utc::now(),
                location: "Hall A".into(),
                is_free,
                price: if is_free { 0.0 } else { 150.0 },
                max_capacity: capacity,
                current_attendees: 0,
                is_active: true,
            })
            .await
            .unwrap();
        let source = Arc::new(StubSource::matching(facegate_core::Tier::High));
        let admission = AdmissionController::new(store.clone(), strict);
        let registrar = Registrar::new(store.clone(), source, admission);
        (store, registrar)
    }

    fn holder(email: &str) -> Holder {
        Holder {
            name: "Ana Souza".into(),
            email: email.into(),
            national_id: "123.456.789-00".into(),
        }
    }

    fn capture() -> Capture {
        Capture::from_jpeg(vec![0xFF, 0xD8])
    }

    #[tokio::test]
    async fn test_free_event_issues_free_ticket_awaiting_face() {
        let (_, registrar) = setup(true, 10, true).await;
        let ticket = registrar
            .register("ev", holder("a@x.com"), TicketClass::Vip)
            .await
            .unwrap();
        assert_eq!(ticket.class, TicketClass::Free);
        assert_eq!(ticket.price, 0.0);
        assert_eq!(ticket.status, TicketStatus::PaidPendingFace);
    }

    #[tokio::test]
    async fn test_paid_event_starts_pending_payment() {
        let (_, registrar) = setup(false, 10, true).await;
        let ticket = registrar
            .register("ev", holder("a@x.com"), TicketClass::Vip)
            .await
            .unwrap();
        assert_eq!(ticket.class, TicketClass::Vip);
        assert_eq!(ticket.price, 450.0);
        assert_eq!(ticket.status, TicketStatus::PendingPayment);
    }

    #[tokio::test]
    async fn test_paid_event_never_issues_free_class() {
        let (_, registrar) = setup(false, 10, true).await;
        let ticket = registrar
            .register("ev", holder("a@x.com"), TicketClass::Free)
            .await
            .unwrap();
        assert_eq!(ticket.class, TicketClass::Standard);
        assert_eq!(ticket.price, 150.0);
    }

    #[tokio::test]
    async fn test_full_enrollment_flow_activates_and_counts() {
        let (store, registrar) = setup(false, 10, true).await;
        let ticket = registrar
            .register("ev", holder("a@x.com"), TicketClass::Standard)
            .await
            .unwrap();

        // Enrollment before payment is an illegal transition.
        assert!(matches!(
            registrar.enroll_face(&ticket.id, &capture()).await,
            Err(GateError::InvalidTransition { .. })
        ));

        registrar.confirm_payment(&ticket.id).await.unwrap();
        let active = registrar.enroll_face(&ticket.id, &capture()).await.unwrap();
        assert_eq!(active.status, TicketStatus::Active);
        assert_eq!(active.artifact_method.as_deref(), Some("stub"));
        assert_eq!(store.capacity("ev").await.unwrap(), (1, 10));

        // The descriptor is immutable: a second enrollment fails.
        assert!(matches!(
            registrar.enroll_face(&ticket.id, &capture()).await,
            Err(GateError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_enroll_rejected_capture_leaves_ticket_unchanged() {
        let store = Store::open_in_memory(Seal::from_passphrase("test"))
            .await
            .unwrap();
        store
            .insert_event(&Event {
                id: "ev".into(),
                name: "Launch Night".into(),
                schedule: Utc::now(),
                location: "Hall A".into(),
                is_free: true,
                price: 0.0,
                max_capacity: 10,
                current_attendees: 0,
                is_active: true,
            })
            .await
            .unwrap();
        let source = Arc::new(StubSource::rejecting_enrollment("face is obstructed"));
        let admission = AdmissionController::new(store.clone(), true);
        let registrar = Registrar::new(store.clone(), source, admission);

        let ticket = registrar
            .register("ev", holder("a@x.com"), TicketClass::Free)
            .await
            .unwrap();
        let err = registrar.enroll_face(&ticket.id, &capture()).await.unwrap_err();
        assert!(matches!(err, GateError::DescriptorInvalid(_)));

        let unchanged = store.get_ticket(&ticket.id).await.unwrap();
        assert_eq!(unchanged.status, TicketStatus::PaidPendingFace);
        assert_eq!(store.capacity("ev").await.unwrap(), (0, 10));
    }

    #[tokio::test]
    async fn test_registration_rejected_at_capacity() {
        let (_, registrar) = setup(true, 1, true).await;
        let first = registrar
            .register("ev", holder("a@x.com"), TicketClass::Free)
            .await
            .unwrap();
        registrar.enroll_face(&first.id, &capture()).await.unwrap();

        assert!(matches!(
            registrar.register("ev", holder("b@x.com"), TicketClass::Free).await,
            Err(GateError::CapacityExceeded)
        ));
    }

    #[tokio::test]
    async fn test_duplicate_live_registration_rejected() {
        let (_, registrar) = setup(true, 10, true).await;
        registrar
            .register("ev", holder("a@x.com"), TicketClass::Free)
            .await
            .unwrap();
        assert!(matches!(
            registrar.register("ev", holder("A@X.com"), TicketClass::Free).await,
            Err(GateError::AmbiguousClaim(_))
        ));
    }
}

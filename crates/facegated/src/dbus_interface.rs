//! D-Bus interface for the Facegate daemon.
//!
//! Bus name: org.facegate.Gate1
//! Object path: /org/facegate/Gate1
//!
//! Results cross the bus as JSON strings; capture payloads arrive as raw
//! JPEG byte arrays. A gate denial is a normal result, not a D-Bus
//! error — errors are reserved for misuse (bad arguments, missing
//! session, insufficient role).

use chrono::Utc;
use facegate_core::{GateError, Holder, Role, TicketClass};
use facegate_source::Capture;
use facegate_store::Store;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use zbus::fdo;
use zbus::interface;

use crate::admission::AdmissionController;
use crate::auth::{AuthError, SessionBook};
use crate::gate::GateVerifier;
use crate::registration::Registrar;

pub struct GateService {
    pub sessions: Arc<SessionBook>,
    pub registrar: Registrar,
    pub verifier: GateVerifier,
    pub admission: AdmissionController,
    pub store: Store,
    pub backend_method: String,
}

/// Payload for `create_event`.
#[derive(Deserialize)]
struct NewEvent {
    name: String,
    schedule: chrono::DateTime<Utc>,
    location: String,
    is_free: bool,
    #[serde(default)]
    price: f64,
    max_capacity: u32,
}

#[interface(name = "org.facegate.Gate1")]
impl GateService {
    /// Authenticate an operator account; returns the session as JSON.
    async fn login(&self, email: &str, password: &str) -> fdo::Result<String> {
        let session = self.sessions.login(email, password).map_err(auth_err)?;
        Ok(serde_json::json!({
            "token": session.token,
            "email": session.email,
            "role": session.role.as_str(),
            "expires_at": session.expires_at.to_rfc3339(),
        })
        .to_string())
    }

    async fn logout(&self, token: &str) -> fdo::Result<bool> {
        Ok(self.sessions.logout(token))
    }

    /// Create an event. Requires Manager.
    async fn create_event(&self, token: &str, event_json: &str) -> fdo::Result<String> {
        self.sessions.authorize(token, Role::Manager).map_err(auth_err)?;
        let new: NewEvent = serde_json::from_str(event_json)
            .map_err(|e| fdo::Error::InvalidArgs(format!("event payload: {e}")))?;

        let event = facegate_core::Event {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            schedule: new.schedule,
            location: new.location,
            is_free: new.is_free,
            price: if new.is_free { 0.0 } else { new.price },
            max_capacity: new.max_capacity,
            current_attendees: 0,
            is_active: true,
        };
        self.store.insert_event(&event).await.map_err(gate_err)?;
        tracing::info!(event_id = %event.id, name = %event.name, "event created");
        to_json(&event)
    }

    async fn list_events(&self, active_only: bool) -> fdo::Result<String> {
        let events = self.store.list_events(active_only).await.map_err(gate_err)?;
        to_json(&events)
    }

    /// Self-service registration from a kiosk; no session required.
    async fn register_ticket(
        &self,
        event_id: &str,
        name: &str,
        email: &str,
        national_id: &str,
        class: &str,
    ) -> fdo::Result<String> {
        let class = TicketClass::from_str(class)
            .ok_or_else(|| fdo::Error::InvalidArgs(format!("unknown ticket class {class:?}")))?;
        let holder = Holder {
            name: name.to_string(),
            email: email.to_string(),
            national_id: national_id.to_string(),
        };
        let ticket = self
            .registrar
            .register(event_id, holder, class)
            .await
            .map_err(gate_err)?;
        to_json(&ticket)
    }

    async fn confirm_payment(&self, ticket_id: &str) -> fdo::Result<String> {
        let ticket = self.registrar.confirm_payment(ticket_id).await.map_err(gate_err)?;
        to_json(&ticket)
    }

    /// Bind the holder's face to the ticket and activate it.
    async fn enroll_face(&self, ticket_id: &str, capture: Vec<u8>) -> fdo::Result<String> {
        let capture = Capture::from_jpeg(capture);
        let ticket = self
            .registrar
            .enroll_face(ticket_id, &capture)
            .await
            .map_err(gate_err)?;
        to_json(&ticket)
    }

    /// Run a gate verification attempt. Requires Operator. The returned
    /// JSON is the full verification result, grant or denial.
    async fn verify_gate(
        &self,
        token: &str,
        event_id: &str,
        claim_email: &str,
        capture: Vec<u8>,
    ) -> fdo::Result<String> {
        let operator = self
            .sessions
            .authorize(token, Role::Operator)
            .map_err(auth_err)?;
        tracing::debug!(operator = %operator.email, event_id, "gate attempt authorized");

        let capture = Capture::from_jpeg(capture);
        let result = self.verifier.verify(event_id, claim_email, &capture).await;
        to_json(&result)
    }

    async fn capacity_remaining(&self, event_id: &str) -> fdo::Result<u32> {
        self.admission
            .capacity_remaining(event_id)
            .await
            .map_err(gate_err)
    }

    /// List an event's tickets. Requires Manager.
    async fn list_tickets(&self, token: &str, event_id: &str) -> fdo::Result<String> {
        self.sessions.authorize(token, Role::Manager).map_err(auth_err)?;
        let tickets = self.store.list_tickets(event_id).await.map_err(gate_err)?;
        to_json(&tickets)
    }

    /// Administrative expiry. Requires Admin.
    async fn expire_ticket(&self, token: &str, ticket_id: &str) -> fdo::Result<String> {
        let admin = self.sessions.authorize(token, Role::Admin).map_err(auth_err)?;
        let ticket = self.store.expire(ticket_id).await.map_err(gate_err)?;
        tracing::info!(ticket_id, admin = %admin.email, "ticket expired");
        to_json(&ticket)
    }

    /// Daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "backend": self.backend_method,
        })
        .to_string())
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encode response: {e}")))
}

fn gate_err(e: GateError) -> fdo::Error {
    fdo::Error::Failed(e.to_string())
}

fn auth_err(e: AuthError) -> fdo::Error {
    fdo::Error::AccessDenied(e.to_string())
}

//! Ticket lifecycle state machine.
//!
//! A ticket's status only ever moves forward:
//!
//! ```text
//! PendingPayment -> PaidPendingFace -> Active -> Used
//!        \                 \             \
//!         +---------------- Expired -----+   (from any non-terminal state)
//! ```
//!
//! Free tickets skip `PendingPayment` and are created directly in
//! `PaidPendingFace`. `Active` is the only state eligible for a gate
//! match attempt; `Used` is terminal and re-admission is denied without
//! re-running the comparison.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    PendingPayment,
    PaidPendingFace,
    Active,
    Used,
    Expired,
}

impl TicketStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketStatus::PendingPayment => "pending_payment",
            TicketStatus::PaidPendingFace => "paid_pending_face",
            TicketStatus::Active => "active",
            TicketStatus::Used => "used",
            TicketStatus::Expired => "expired",
        }
    }

    pub fn from_str(s: &str) -> Option<TicketStatus> {
        match s {
            "pending_payment" => Some(TicketStatus::PendingPayment),
            "paid_pending_face" => Some(TicketStatus::PaidPendingFace),
            "active" => Some(TicketStatus::Active),
            "used" => Some(TicketStatus::Used),
            "expired" => Some(TicketStatus::Expired),
            _ => None,
        }
    }

    /// Initial status for a freshly created ticket of the given class.
    /// Free tickets skip payment and immediately await enrollment.
    pub fn initial(class: TicketClass) -> TicketStatus {
        if class == TicketClass::Free {
            TicketStatus::PaidPendingFace
        } else {
            TicketStatus::PendingPayment
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TicketStatus::Used | TicketStatus::Expired)
    }

    /// A live ticket is one that could still lead to admission.
    pub fn is_live(self) -> bool {
        !self.is_terminal()
    }

    /// `PendingPayment -> PaidPendingFace`, on external payment confirmation.
    pub fn confirm_payment(self) -> Result<TicketStatus, GateError> {
        match self {
            TicketStatus::PendingPayment => Ok(TicketStatus::PaidPendingFace),
            other => Err(GateError::InvalidTransition {
                from: other,
                attempted: "confirm_payment",
            }),
        }
    }

    /// `PaidPendingFace -> Active`, on successful descriptor enrollment.
    /// The descriptor is bound at this point and becomes immutable, so a
    /// second enroll always fails here.
    pub fn enroll(self) -> Result<TicketStatus, GateError> {
        match self {
            TicketStatus::PaidPendingFace => Ok(TicketStatus::Active),
            other => Err(GateError::InvalidTransition {
                from: other,
                attempted: "enroll",
            }),
        }
    }

    /// `Active -> Used`, on a successful gate match. A `Used` ticket
    /// fails with [`GateError::AlreadyUsed`] so callers can fail fast
    /// before any biometric call.
    pub fn admit(self) -> Result<TicketStatus, GateError> {
        match self {
            TicketStatus::Active => Ok(TicketStatus::Used),
            TicketStatus::Used => Err(GateError::AlreadyUsed),
            other => Err(GateError::InvalidTransition {
                from: other,
                attempted: "admit",
            }),
        }
    }

    /// Administrative expiry, valid from any non-terminal state.
    pub fn expire(self) -> Result<TicketStatus, GateError> {
        if self.is_terminal() {
            return Err(GateError::InvalidTransition {
                from: self,
                attempted: "expire",
            });
        }
        Ok(TicketStatus::Expired)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketClass {
    Free,
    Standard,
    Vip,
    Backstage,
}

impl TicketClass {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketClass::Free => "free",
            TicketClass::Standard => "standard",
            TicketClass::Vip => "vip",
            TicketClass::Backstage => "backstage",
        }
    }

    pub fn from_str(s: &str) -> Option<TicketClass> {
        match s {
            "free" => Some(TicketClass::Free),
            "standard" => Some(TicketClass::Standard),
            "vip" => Some(TicketClass::Vip),
            "backstage" => Some(TicketClass::Backstage),
            _ => None,
        }
    }

    /// List price per class.
    pub fn default_price(self) -> f64 {
        match self {
            TicketClass::Free => 0.0,
            TicketClass::Standard => 150.0,
            TicketClass::Vip => 450.0,
            TicketClass::Backstage => 1200.0,
        }
    }
}

/// Identity of the ticket holder as captured at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub name: String,
    pub email: String,
    pub national_id: String,
}

/// A ticket record. Price is immutable after creation; status is mutated
/// only through the transition functions above, and only the repository
/// commits those moves (as conditional writes).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub event_id: String,
    pub holder: Holder,
    pub class: TicketClass,
    pub price: f64,
    pub status: TicketStatus,
    pub purchased_at: DateTime<Utc>,
    /// Extraction method of the bound biometric artifact, once enrolled.
    pub artifact_method: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_ticket_skips_payment() {
        assert_eq!(
            TicketStatus::initial(TicketClass::Free),
            TicketStatus::PaidPendingFace
        );
        for class in [TicketClass::Standard, TicketClass::Vip, TicketClass::Backstage] {
            assert_eq!(TicketStatus::initial(class), TicketStatus::PendingPayment);
        }
    }

    #[test]
    fn test_payment_confirmation_only_from_pending() {
        assert_eq!(
            TicketStatus::PendingPayment.confirm_payment().unwrap(),
            TicketStatus::PaidPendingFace
        );
        for status in [
            TicketStatus::PaidPendingFace,
            TicketStatus::Active,
            TicketStatus::Used,
            TicketStatus::Expired,
        ] {
            assert!(matches!(
                status.confirm_payment(),
                Err(GateError::InvalidTransition { .. })
            ));
        }
    }

    #[test]
    fn test_enroll_only_from_paid_pending_face() {
        assert_eq!(
            TicketStatus::PaidPendingFace.enroll().unwrap(),
            TicketStatus::Active
        );
        // A second enroll finds the ticket Active and fails: the
        // descriptor bound at the first enroll is immutable.
        assert!(matches!(
            TicketStatus::Active.enroll(),
            Err(GateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            TicketStatus::PendingPayment.enroll(),
            Err(GateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_admit_only_from_active() {
        assert_eq!(TicketStatus::Active.admit().unwrap(), TicketStatus::Used);
        assert!(matches!(TicketStatus::Used.admit(), Err(GateError::AlreadyUsed)));
        assert!(matches!(
            TicketStatus::PaidPendingFace.admit(),
            Err(GateError::InvalidTransition { .. })
        ));
        assert!(matches!(
            TicketStatus::Expired.admit(),
            Err(GateError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_expire_from_any_non_terminal_state() {
        for status in [
            TicketStatus::PendingPayment,
            TicketStatus::PaidPendingFace,
            TicketStatus::Active,
        ] {
            assert_eq!(status.expire().unwrap(), TicketStatus::Expired);
        }
        assert!(TicketStatus::Used.expire().is_err());
        assert!(TicketStatus::Expired.expire().is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            TicketStatus::PendingPayment,
            TicketStatus::PaidPendingFace,
            TicketStatus::Active,
            TicketStatus::Used,
            TicketStatus::Expired,
        ] {
            assert_eq!(TicketStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_class_prices() {
        assert_eq!(TicketClass::Free.default_price(), 0.0);
        assert_eq!(TicketClass::Standard.default_price(), 150.0);
        assert_eq!(TicketClass::Vip.default_price(), 450.0);
        assert_eq!(TicketClass::Backstage.default_price(), 1200.0);
    }
}

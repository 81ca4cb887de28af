use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event with capacity bookkeeping. The attendee counter is mutated
/// only by the admission controller, and only through the repository's
/// atomic increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub schedule: DateTime<Utc>,
    pub location: String,
    pub is_free: bool,
    pub price: f64,
    pub max_capacity: u32,
    pub current_attendees: u32,
    pub is_active: bool,
}

impl Event {
    /// Seats left before the event is full. Never negative, even if the
    /// counter has drifted past capacity in soft-enforcement mode.
    pub fn capacity_remaining(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_attendees)
    }

    pub fn at_capacity(&self) -> bool {
        self.current_attendees >= self.max_capacity
    }
}

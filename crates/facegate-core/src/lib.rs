//! Facegate core — the decision logic of the biometric admission system.
//!
//! Pure domain types only: descriptor comparison and confidence tiers,
//! the ticket lifecycle state machine, event capacity arithmetic, operator
//! roles, and the denial taxonomy. No I/O lives here; storage and the
//! descriptor backends build on these types.

pub mod descriptor;
pub mod error;
pub mod event;
pub mod role;
pub mod ticket;

pub use descriptor::{Descriptor, MatchPolicy, PolicyError, Tier, Verdict};
pub use error::GateError;
pub use event::Event;
pub use role::Role;
pub use ticket::{Holder, Ticket, TicketClass, TicketStatus};

//! Domain models for the dispatch system.

mod candidate;
mod case;
mod event;
mod responder;

pub use candidate::*;
pub use case::*;
pub use event::*;
pub use responder::*;

use chrono::{DateTime, SubsecRound, Utc};

/// Current time at the precision the store keeps (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

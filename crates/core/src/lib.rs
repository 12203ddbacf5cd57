//! Core types shared by every layer: content-addressed identifiers,
//! the wall clock, and the base error model.

pub mod error;
pub mod id;
pub mod time;

pub use error::{CoreError, CoreResult};
pub use id::{EventId, KeyId, ID_LEN};
pub use time::{now_ms, Clock, FixedClock, SystemClock};

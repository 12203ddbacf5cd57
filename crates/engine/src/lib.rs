//! The event pipeline engine: stages, blocked/recheck, scheduler, outgoing
//! queue, and the node API surface.

pub mod blocked;
pub mod cache;
pub mod error;
pub mod node;
pub mod outgoing;
pub mod pipeline;
pub mod scheduler;

pub use cache::{TransitCache, TRANSIT_CACHE_TTL_MS};
pub use error::{EngineError, EngineResult};
pub use node::{CommandReceipt, Node};
pub use outgoing::OutgoingDatagram;
pub use pipeline::{Pipeline, RunOutcome, Stage, StageCtx, StageResult};
pub use scheduler::{JobConfig, SchedulerHandle};

//! Agent side of Zenthor: turns queued conversation jobs into replies.
//!
//! A job is claimed from the queue, its conversation is loaded and compacted
//! when long, a model is driven through a bounded tool-calling loop with
//! failover to a fallback model, and the reply is either streamed into the
//! conversation or stored and forwarded to the contact. High-risk tools pause
//! for a human decision through [`approval::ApprovalGate`]. Scheduled tasks and
//! old-job cleanup run in [`maintenance::Maintenance`].

pub mod approval;
pub mod compaction;
pub mod delivery;
pub mod failover;
pub mod gateway;
pub mod generate;
pub mod llm;
pub mod maintenance;
pub mod replies;
pub mod runtime;
pub mod streaming;
pub mod tools;

pub use maintenance::{Maintenance, MaintenanceSettings};
pub use runtime::{AgentStores, JobLoop, JobLoopSettings};

//! Worker Layer
//!
//! Runs OCR jobs on an isolated worker thread behind a single-slot queue.
//! The queue and the worker exchange only typed messages.

pub mod context;
pub mod messages;
pub mod queue;

pub use context::WorkerContext;
pub use messages::{JobEvent, JobId, JobState, WorkerRequest, WorkerResponse};
pub use queue::{JobTicket, TaskQueue};

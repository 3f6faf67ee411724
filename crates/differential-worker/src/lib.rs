//! Worker process internals: the function registry populated at startup, a
//! bounded-concurrency task queue, and the polling agent that claims jobs
//! from the control plane and posts their results back.

pub mod agent;
pub mod env;
pub mod error;
pub mod registry;
pub mod task_queue;

pub use agent::{PollingAgent, PollingAgentConfig};
pub use error::WorkerError;
pub use registry::{FunctionRegistry, Handler, RegisteredFunction};
pub use task_queue::{ExecutionOutcome, TaskQueue};

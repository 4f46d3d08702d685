//! External tool invocation for the gallery pipeline

pub mod invoker;
pub mod runner;

pub use invoker::{verify_output, InvokeError, ToolInvoker, Verified, PROGRESS_BINARY};
pub use runner::{OutputMode, RunOutput, SystemRunner, ToolCommand, ToolRunner};

#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Wire types shared by every component of the NanoGrid agent.

mod result;
mod runtime;
mod task;

pub use result::ExecutionResult;
pub use runtime::RuntimeKind;
pub use task::Task;

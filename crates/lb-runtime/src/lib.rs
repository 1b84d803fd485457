pub mod bridge;
pub mod registry;
mod runner;
mod scheduler;

pub use lb_core::{BridgeError, GcOperation, HostValue};
pub use registry::{FunctionRegistry, HostFunction};
pub use runner::{ExecCallback, ScriptRunner, ScriptRunnerOptions, STATUS_OK};

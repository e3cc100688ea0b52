//! Call lifecycle: orchestration, recording, and the live-call registry.

pub mod orchestrator;
pub mod recorder;
pub mod registry;
pub mod tools;

pub use orchestrator::{run_call, CallDeps, CallTiming};
pub use recorder::{CallRecorder, RecorderConfig};
pub use registry::{CallRegistry, ControlCommand, StopScope};
pub use tools::{StubToolHandler, ToolHandler};

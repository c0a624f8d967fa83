pub mod analysis;
pub mod config;
pub mod engine;
pub mod frame;
pub mod logging;
pub mod message;
pub mod overlay;
pub mod queue;
pub mod stop;

pub use analysis::{AnalysisResult, Task};
pub use frame::{Frame, FrameCodec, FrameGeometry, WireMode};
pub use queue::{HandoffQueue, Pop};
pub use stop::{StageExit, StopReason, StopToken};

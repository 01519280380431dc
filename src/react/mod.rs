//! 认知层：执行引擎、Planner、Reflector、决策解析、Trace 与过程事件

pub mod decision;
pub mod engine;
pub mod events;
pub mod planner;
pub mod prompts;
pub mod reflector;
pub mod trace;

pub use decision::{parse_decision, Decision, ToolCall};
pub use engine::{Engine, RunOptions, RunOutcome, Task};
pub use events::EngineEvent;
pub use planner::{PlanOutcome, Planner, Subtask, SubtaskStatus};
pub use reflector::{Reflection, ReflectionRecord, Reflector};
pub use trace::{Observation, RunStatus, Step, StepAction};

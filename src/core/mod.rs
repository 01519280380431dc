//! 核心层：错误与恢复、执行状态机、动作调度、优雅关闭

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;

pub use error::{AgentError, ProtocolError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{
    ProtocolClientCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason,
};
pub use state::{ExecutionState, StateMachine};
pub use task_scheduler::TaskScheduler;

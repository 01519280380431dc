//! 执行状态机：ExecutionState 与合法转移
//!
//! IDLE → PLANNING → EXECUTING ⇄ OBSERVING → REFLECTING → … → RESPONDING / ERROR。
//! 状态只归执行引擎所有，转移只能沿下列边进行；非终态都可以进入 ERROR。

use serde::Serialize;

use crate::core::AgentError;

/// 执行循环的有限状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Idle,
    Planning,
    Executing,
    Observing,
    Reflecting,
    /// 终态（成功）
    Responding,
    /// 终态（失败 / 中止）
    Error,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Responding | ExecutionState::Error)
    }

    /// 是否允许 self → next
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Executing)
                | (Planning, Responding)
                | (Executing, Observing)
                | (Observing, Executing)
                | (Observing, Reflecting)
                | (Observing, Responding)
                | (Reflecting, Executing)
                | (Reflecting, Responding)
        )
    }
}

/// 带历史的状态机
#[derive(Clone, Debug)]
pub struct StateMachine {
    current: ExecutionState,
    history: Vec<ExecutionState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: ExecutionState::Idle,
            history: vec![ExecutionState::Idle],
        }
    }

    pub fn current(&self) -> ExecutionState {
        self.current
    }

    pub fn history(&self) -> &[ExecutionState] {
        &self.history
    }

    pub fn transition(&mut self, next: ExecutionState) -> Result<(), AgentError> {
        if !self.current.can_transition_to(next) {
            return Err(AgentError::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        tracing::debug!(from = ?self.current, to = ?next, "state transition");
        self.current = next;
        self.history.push(next);
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExecutionState::*;

    #[test]
    fn test_happy_path() {
        let mut sm = StateMachine::new();
        for next in [Planning, Executing, Observing, Reflecting, Executing, Observing, Responding] {
            sm.transition(next).unwrap();
        }
        assert_eq!(sm.current(), Responding);
        assert_eq!(sm.history().len(), 8);
    }

    #[test]
    fn test_trivial_plan_goes_straight_to_responding() {
        assert!(Planning.can_transition_to(Responding));
    }

    #[test]
    fn test_rejects_illegal_edges() {
        assert!(!Idle.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Responding));
        assert!(!Executing.can_transition_to(Reflecting));
        assert!(!Responding.can_transition_to(Planning));

        let mut sm = StateMachine::new();
        assert!(matches!(
            sm.transition(Observing),
            Err(AgentError::InvalidTransition { from: Idle, to: Observing })
        ));
    }

    #[test]
    fn test_error_reachable_from_any_live_state() {
        for s in [Idle, Planning, Executing, Observing, Reflecting] {
            assert!(s.can_transition_to(Error));
        }
        assert!(!Responding.can_transition_to(Error));
        assert!(!Error.can_transition_to(Error));
    }
}

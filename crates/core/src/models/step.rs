use std::fmt;

use serde::{Deserialize, Serialize};

/// 任务步骤
///
/// 步骤是有序的整数。`INIT` 表示尚未开始，`DONE` 表示所有步骤已完成，
/// 业务步骤从 1 开始递增，由任务类型的 `get_next_step` 决定顺序。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Step(pub i64);

impl Step {
    pub const INIT: Step = Step(-1);
    pub const DONE: Step = Step(-2);
    pub const ONE: Step = Step(1);
    pub const TWO: Step = Step(2);
    pub const THREE: Step = Step(3);

    pub fn value(self) -> i64 {
        self.0
    }

    pub fn is_init(self) -> bool {
        self == Step::INIT
    }

    pub fn is_done(self) -> bool {
        self == Step::DONE
    }

    /// 是否为业务步骤（既非 INIT 也非 DONE）
    pub fn is_business(self) -> bool {
        self.0 > 0
    }
}

impl From<i64> for Step {
    fn from(v: i64) -> Self {
        Step(v)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Step::INIT => write!(f, "StepInit"),
            Step::DONE => write!(f, "StepDone"),
            Step(n) => write!(f, "Step{n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_display() {
        assert_eq!(Step::INIT.to_string(), "StepInit");
        assert_eq!(Step::DONE.to_string(), "StepDone");
        assert_eq!(Step::TWO.to_string(), "Step2");
    }

    #[test]
    fn test_step_kinds() {
        assert!(Step::INIT.is_init());
        assert!(Step::DONE.is_done());
        assert!(Step::ONE.is_business());
        assert!(!Step::DONE.is_business());
        assert!(Step::ONE < Step::TWO);
    }
}

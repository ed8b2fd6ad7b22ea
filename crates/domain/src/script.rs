//! 步骤树模型
//!
//! 脚本被编译为一棵带类型的步骤树：叶子是 shell 命令，内部节点是
//! 顺序、并行、分支与循环。脚本正文即步骤树的 JSON 序列化形式。

use serde::{Deserialize, Serialize};

use crate::value_objects::Variables;
use crate::{SchedulerError, SchedulerResult};

pub const DEFAULT_QUEUE: &str = "@default";

fn default_queue() -> String {
    DEFAULT_QUEUE.to_string()
}

/// 步骤树中的一个节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// 展开时写入子令牌上下文的变量
    #[serde(default, skip_serializing_if = "Variables::is_empty")]
    pub env: Variables,
    /// 失败时按 WARNING 参与父节点的汇聚
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Command(CommandStep),
    Sequence {
        steps: Vec<Step>,
    },
    Parallel {
        steps: Vec<Step>,
        #[serde(default)]
        join: JoinPolicy,
    },
    Branch {
        arms: Vec<BranchArm>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Box<Step>>,
    },
    Loop {
        condition: Condition,
        body: Box<Step>,
        max_iterations: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandStep {
    pub shell: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    /// 失败后允许的重试次数
    #[serde(default)]
    pub retry: u32,
    /// 预期内存上限 (KB)，优先于作业定义上的期望值
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_memory: Option<i64>,
    /// 视为 WARNING 而非 FAILURE 的退出码
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warning_exit_codes: Vec<i32>,
}

/// 并行步骤的汇聚策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    #[default]
    AllSucceed,
    AnySucceed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    pub condition: Condition,
    pub step: Step,
}

/// 针对上下文变量的条件表达式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Present { var: String },
    Absent { var: String },
    Equals { var: String, value: String },
    NotEquals { var: String, value: String },
    LessThan { var: String, value: i64 },
    GreaterThan { var: String, value: i64 },
}

impl Condition {
    /// 数值比较时变量缺失或无法解析均视为不成立
    pub fn evaluate(&self, vars: &Variables) -> bool {
        let numeric = |var: &str| vars.get(var).and_then(|v| v.trim().parse::<i64>().ok());

        match self {
            Condition::Always => true,
            Condition::Present { var } => vars.contains_key(var),
            Condition::Absent { var } => !vars.contains_key(var),
            Condition::Equals { var, value } => vars.get(var) == Some(value),
            Condition::NotEquals { var, value } => vars.get(var) != Some(value),
            Condition::LessThan { var, value } => numeric(var).is_some_and(|v| v < *value),
            Condition::GreaterThan { var, value } => numeric(var).is_some_and(|v| v > *value),
        }
    }
}

/// 将脚本中的 CRLF 统一为 LF
pub fn normalize_script(script: &str) -> String {
    script.replace("\r\n", "\n")
}

impl Step {
    pub fn command(shell: impl Into<String>) -> Self {
        Self::from_kind(StepKind::Command(CommandStep {
            shell: shell.into(),
            queue: default_queue(),
            retry: 0,
            expected_memory: None,
            warning_exit_codes: Vec::new(),
        }))
    }

    pub fn sequence(steps: Vec<Step>) -> Self {
        Self::from_kind(StepKind::Sequence { steps })
    }

    pub fn parallel(steps: Vec<Step>, join: JoinPolicy) -> Self {
        Self::from_kind(StepKind::Parallel { steps, join })
    }

    pub fn branch(arms: Vec<BranchArm>, otherwise: Option<Step>) -> Self {
        Self::from_kind(StepKind::Branch {
            arms,
            otherwise: otherwise.map(Box::new),
        })
    }

    pub fn looping(condition: Condition, body: Step, max_iterations: u32) -> Self {
        Self::from_kind(StepKind::Loop {
            condition,
            body: Box::new(body),
            max_iterations,
        })
    }

    fn from_kind(kind: StepKind) -> Self {
        Self {
            name: None,
            env: Variables::new(),
            ignore_errors: false,
            kind,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn ignoring_errors(mut self) -> Self {
        self.ignore_errors = true;
        self
    }

    /// 仅对命令步骤生效
    pub fn with_retry(mut self, retry: u32) -> Self {
        if let StepKind::Command(command) = &mut self.kind {
            command.retry = retry;
        }
        self
    }

    /// 仅对命令步骤生效
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        if let StepKind::Command(command) = &mut self.kind {
            command.queue = queue.into();
        }
        self
    }

    /// 仅对命令步骤生效
    pub fn with_expected_memory(mut self, kilobytes: i64) -> Self {
        if let StepKind::Command(command) = &mut self.kind {
            command.expected_memory = Some(kilobytes);
        }
        self
    }

    /// 解析并校验脚本正文
    pub fn parse(script: &str) -> SchedulerResult<Self> {
        let normalized = normalize_script(script);
        let step: Step = serde_json::from_str(&normalized)
            .map_err(|e| SchedulerError::InvalidScript(format!("脚本解析失败: {e}")))?;
        step.validate()?;
        Ok(step)
    }

    pub fn to_json(&self) -> SchedulerResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// 用于日志展示的步骤名
    pub fn label(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match &self.kind {
            StepKind::Command(command) => command.shell.lines().next().unwrap_or_default().to_string(),
            StepKind::Sequence { .. } => "sequence".to_string(),
            StepKind::Parallel { .. } => "parallel".to_string(),
            StepKind::Branch { .. } => "branch".to_string(),
            StepKind::Loop { .. } => "loop".to_string(),
        }
    }

    pub fn is_command(&self) -> bool {
        matches!(self.kind, StepKind::Command(_))
    }

    /// 按序号取子步骤
    ///
    /// 分支的 `otherwise` 序号为 `arms.len()`；循环的每次迭代都对应同一个循环体。
    pub fn child(&self, index: u32) -> Option<&Step> {
        let index = index as usize;
        match &self.kind {
            StepKind::Command(_) => None,
            StepKind::Sequence { steps } | StepKind::Parallel { steps, .. } => steps.get(index),
            StepKind::Branch { arms, otherwise } => {
                if index < arms.len() {
                    Some(&arms[index].step)
                } else if index == arms.len() {
                    otherwise.as_deref()
                } else {
                    None
                }
            }
            StepKind::Loop { body, .. } => Some(body),
        }
    }

    /// 分支选择：返回第一个成立分支的序号，都不成立时取 `otherwise`
    pub fn select_branch(&self, vars: &Variables) -> Option<u32> {
        let StepKind::Branch { arms, otherwise } = &self.kind else {
            return None;
        };
        arms.iter()
            .position(|arm| arm.condition.evaluate(vars))
            .or_else(|| otherwise.as_ref().map(|_| arms.len()))
            .map(|index| index as u32)
    }

    /// 递归校验步骤树
    pub fn validate(&self) -> SchedulerResult<()> {
        match &self.kind {
            StepKind::Command(command) => {
                if command.shell.trim().is_empty() {
                    return Err(SchedulerError::InvalidScript(format!(
                        "命令步骤的shell不能为空: {}",
                        self.label()
                    )));
                }
                if command.queue.trim().is_empty() {
                    return Err(SchedulerError::InvalidScript(format!(
                        "命令步骤的队列名不能为空: {}",
                        self.label()
                    )));
                }
                if command.expected_memory.is_some_and(|m| m < 0) {
                    return Err(SchedulerError::InvalidScript(format!(
                        "预期内存不能为负数: {}",
                        self.label()
                    )));
                }
                Ok(())
            }
            StepKind::Sequence { steps } | StepKind::Parallel { steps, .. } => {
                steps.iter().try_for_each(Step::validate)
            }
            StepKind::Branch { arms, otherwise } => {
                if arms.is_empty() {
                    return Err(SchedulerError::InvalidScript(
                        "分支步骤至少需要一个条件分支".to_string(),
                    ));
                }
                arms.iter().try_for_each(|arm| arm.step.validate())?;
                otherwise.as_deref().map_or(Ok(()), Step::validate)
            }
            StepKind::Loop {
                body,
                max_iterations,
                ..
            } => {
                if *max_iterations == 0 {
                    return Err(SchedulerError::InvalidScript(
                        "循环步骤的最大迭代次数必须大于0".to_string(),
                    ));
                }
                body.validate()
            }
        }
    }

    /// 树中命令步骤的数量
    pub fn command_count(&self) -> usize {
        match &self.kind {
            StepKind::Command(_) => 1,
            StepKind::Sequence { steps } | StepKind::Parallel { steps, .. } => {
                steps.iter().map(Step::command_count).sum()
            }
            StepKind::Branch { arms, otherwise } => {
                arms.iter().map(|arm| arm.step.command_count()).sum::<usize>()
                    + otherwise.as_deref().map_or(0, Step::command_count)
            }
            StepKind::Loop { body, .. } => body.command_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_nested_script() {
        let script = r#"{
            "type": "sequence",
            "steps": [
                { "type": "command", "shell": "echo prepare", "retry": 2 },
                {
                    "type": "parallel",
                    "join": "any_succeed",
                    "steps": [
                        { "type": "command", "shell": "./a.sh", "queue": "heavy" },
                        { "type": "command", "shell": "./b.sh", "ignore_errors": true }
                    ]
                },
                {
                    "type": "loop",
                    "condition": { "op": "less_than", "var": "N", "value": 3 },
                    "max_iterations": 5,
                    "body": { "type": "command", "shell": "echo ::set N=$((N+1))" }
                }
            ]
        }"#;

        let step = Step::parse(script).unwrap();
        let StepKind::Sequence { steps } = &step.kind else {
            panic!("expected sequence");
        };
        assert_eq!(steps.len(), 3);

        let StepKind::Command(first) = &steps[0].kind else {
            panic!("expected command");
        };
        assert_eq!(first.retry, 2);
        assert_eq!(first.queue, DEFAULT_QUEUE);

        let StepKind::Parallel { steps: branches, join } = &steps[1].kind else {
            panic!("expected parallel");
        };
        assert_eq!(*join, JoinPolicy::AnySucceed);
        assert!(branches[1].ignore_errors);
        assert_eq!(step.command_count(), 4);
    }

    #[test]
    fn test_crlf_is_normalized() {
        let script = "{\r\n  \"type\": \"command\",\r\n  \"shell\": \"echo a\\necho b\"\r\n}";
        let step = Step::parse(script).unwrap();
        let StepKind::Command(command) = step.kind else {
            panic!("expected command");
        };
        assert_eq!(command.shell, "echo a\necho b");
        assert_eq!(normalize_script("a\r\nb\r\n"), "a\nb\n");
    }

    #[test]
    fn test_invalid_scripts_rejected() {
        assert!(Step::parse("not json").is_err());
        assert!(Step::parse(r#"{"type": "command", "shell": "  "}"#).is_err());
        assert!(Step::parse(r#"{"type": "branch", "arms": []}"#).is_err());
        assert!(Step::parse(
            r#"{"type": "loop", "condition": {"op": "always"}, "max_iterations": 0,
                "body": {"type": "command", "shell": "true"}}"#
        )
        .is_err());
    }

    #[test]
    fn test_builder_roundtrip_through_json() {
        let step = Step::sequence(vec![
            Step::command("echo one").with_retry(1).on_queue("io"),
            Step::command("echo two").ignoring_errors(),
        ])
        .with_name("pipeline")
        .with_env("STAGE", "prod");

        let json = step.to_json().unwrap();
        assert_eq!(Step::parse(&json).unwrap(), step);
    }

    #[test]
    fn test_condition_evaluation() {
        let v = vars(&[("MODE", "full"), ("N", "2")]);
        assert!(Condition::Always.evaluate(&v));
        assert!(Condition::Present { var: "MODE".into() }.evaluate(&v));
        assert!(Condition::Absent { var: "X".into() }.evaluate(&v));
        assert!(Condition::Equals { var: "MODE".into(), value: "full".into() }.evaluate(&v));
        assert!(!Condition::NotEquals { var: "MODE".into(), value: "full".into() }.evaluate(&v));
        assert!(Condition::LessThan { var: "N".into(), value: 3 }.evaluate(&v));
        assert!(!Condition::GreaterThan { var: "N".into(), value: 3 }.evaluate(&v));
        assert!(!Condition::LessThan { var: "MODE".into(), value: 3 }.evaluate(&v));
    }

    #[test]
    fn test_branch_selection() {
        let step = Step::branch(
            vec![
                BranchArm {
                    condition: Condition::Equals { var: "MODE".into(), value: "full".into() },
                    step: Step::command("full.sh"),
                },
                BranchArm {
                    condition: Condition::Equals { var: "MODE".into(), value: "diff".into() },
                    step: Step::command("diff.sh"),
                },
            ],
            Some(Step::command("noop.sh")),
        );

        assert_eq!(step.select_branch(&vars(&[("MODE", "diff")])), Some(1));
        assert_eq!(step.select_branch(&vars(&[])), Some(2));
        assert_eq!(step.child(2).map(Step::label), Some("noop.sh".to_string()));
        assert!(step.child(3).is_none());
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 令牌上下文中的变量表，子令牌在展开时复制父令牌的快照
pub type Variables = BTreeMap<String, String>;

/// 命令通过标准输出写回上下文变量的前缀，格式为 `::set NAME=VALUE`
pub const CONTEXT_EXPORT_PREFIX: &str = "::set ";

/// 从执行输出中提取导出的上下文变量，同名变量以最后一次为准
pub fn parse_context_exports(output: &str) -> Variables {
    output
        .lines()
        .filter_map(|line| line.strip_prefix(CONTEXT_EXPORT_PREFIX))
        .filter_map(|assignment| {
            let (name, value) = assignment.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim_end_matches('\r').to_string()))
        })
        .collect()
}

/// 令牌在步骤树中的物化路径，由各层兄弟序号组成
///
/// 根令牌的路径为 `/`，其子令牌依次为 `/0`、`/1`，孙令牌如 `/0/2/1`。
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TokenPath(Vec<u32>);

impl TokenPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: u32) -> Self {
        let mut segments = self.0.clone();
        segments.push(index);
        Self(segments)
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn segments(&self) -> &[u32] {
        &self.0
    }

    /// 最后一段序号，根路径返回 None
    pub fn last_index(&self) -> Option<u32> {
        self.0.last().copied()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// 严格祖先判断：路径更短且按段前缀匹配
    pub fn is_ancestor_of(&self, other: &TokenPath) -> bool {
        self.0.len() < other.0.len() && other.0.starts_with(&self.0)
    }
}

impl fmt::Display for TokenPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for TokenPath {
    type Err = SchedulerError;

    fn from_str(s: &str) -> SchedulerResult<Self> {
        let rest = s
            .strip_prefix('/')
            .ok_or_else(|| SchedulerError::Internal(format!("无效的令牌路径: {s}")))?;
        if rest.is_empty() {
            return Ok(Self::root());
        }
        rest.split('/')
            .map(|segment| {
                segment
                    .parse::<u32>()
                    .map_err(|_| SchedulerError::Internal(format!("无效的令牌路径: {s}")))
            })
            .collect::<SchedulerResult<Vec<_>>>()
            .map(Self)
    }
}

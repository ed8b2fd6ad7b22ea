use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::validation::{ConfigValidator, ValidationUtils};
use crate::{SchedulerError, SchedulerResult};

/// 数据库配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    /// SQLite 写锁等待时间，多个Worker并发认领时依赖它排队
    pub busy_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:workflow_scheduler.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            idle_timeout_seconds: 600,
            busy_timeout_seconds: 5,
        }
    }
}

impl DatabaseConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_seconds)
    }
}

impl ConfigValidator for DatabaseConfig {
    fn validate(&self) -> SchedulerResult<()> {
        ValidationUtils::validate_not_empty(&self.url, "database.url")?;

        if !self.url.starts_with("sqlite:") {
            return Err(SchedulerError::Configuration(
                "数据库URL必须是SQLite格式 (sqlite:...)".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(SchedulerError::Configuration(
                "最大连接数必须大于0".to_string(),
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(SchedulerError::Configuration(
                "最小连接数不能大于最大连接数".to_string(),
            ));
        }

        ValidationUtils::validate_positive(
            self.connection_timeout_seconds,
            "database.connection_timeout_seconds",
        )?;

        Ok(())
    }
}

//! 行映射辅助函数
//!
//! SQLite 中 uuid、上下文变量和令牌路径都以文本存储。

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{TokenPath, Variables};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn parse_uuid(row: &SqliteRow, field_name: &str) -> SchedulerResult<Uuid> {
        let raw: String = row.try_get(field_name)?;
        Uuid::parse_str(&raw)
            .map_err(|e| SchedulerError::Internal(format!("解析UUID失败 {field_name}={raw}: {e}")))
    }

    pub fn parse_variables(row: &SqliteRow, field_name: &str) -> SchedulerResult<Variables> {
        let raw: String = row.try_get(field_name)?;
        if raw.is_empty() {
            return Ok(Variables::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn parse_path(row: &SqliteRow, field_name: &str) -> SchedulerResult<TokenPath> {
        let raw: String = row.try_get(field_name)?;
        raw.parse()
    }

    pub fn encode_variables(variables: &Variables) -> SchedulerResult<String> {
        Ok(serde_json::to_string(variables)?)
    }
}

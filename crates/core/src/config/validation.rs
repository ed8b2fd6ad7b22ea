use crate::{SchedulerError, SchedulerResult};

/// 配置节校验接口
pub trait ConfigValidator {
    fn validate(&self) -> SchedulerResult<()>;
}

/// 常用校验工具
pub struct ValidationUtils;

impl ValidationUtils {
    pub fn validate_not_empty(value: &str, field: &str) -> SchedulerResult<()> {
        if value.trim().is_empty() {
            return Err(SchedulerError::Configuration(format!("{field} 不能为空")));
        }
        Ok(())
    }

    pub fn validate_positive(value: u64, field: &str) -> SchedulerResult<()> {
        if value == 0 {
            return Err(SchedulerError::Configuration(format!("{field} 必须大于0")));
        }
        Ok(())
    }

    pub fn validate_count(value: usize, field: &str, max: usize) -> SchedulerResult<()> {
        if value == 0 || value > max {
            return Err(SchedulerError::Configuration(format!(
                "{field} 必须在 1 到 {max} 之间，当前值: {value}"
            )));
        }
        Ok(())
    }

    pub fn validate_one_of(value: &str, field: &str, allowed: &[&str]) -> SchedulerResult<()> {
        if !allowed.contains(&value) {
            return Err(SchedulerError::Configuration(format!(
                "无效的{field}: {value}，支持: {allowed:?}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_utils() {
        assert!(ValidationUtils::validate_not_empty("x", "name").is_ok());
        assert!(ValidationUtils::validate_not_empty("  ", "name").is_err());
        assert!(ValidationUtils::validate_positive(0, "interval").is_err());
        assert!(ValidationUtils::validate_count(4, "workers", 64).is_ok());
        assert!(ValidationUtils::validate_count(0, "workers", 64).is_err());
        assert!(ValidationUtils::validate_count(65, "workers", 64).is_err());
        assert!(ValidationUtils::validate_one_of("json", "format", &["json", "pretty"]).is_ok());
        assert!(ValidationUtils::validate_one_of("xml", "format", &["json", "pretty"]).is_err());
    }
}

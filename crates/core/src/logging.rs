use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{SchedulerError, SchedulerResult};

/// 初始化日志系统
///
/// 优先使用 `RUST_LOG` 环境变量，否则使用传入的日志级别。
/// 支持的格式: `json`、`pretty`、`compact`。
pub fn init_logging(log_level: &str, log_format: &str) -> SchedulerResult<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match log_format {
        "json" => registry
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(false)
                    .with_span_list(false),
            )
            .try_init(),
        "pretty" => registry
            .with(fmt::layer().pretty().with_target(true))
            .try_init(),
        "compact" => registry.with(fmt::layer().compact()).try_init(),
        other => {
            return Err(SchedulerError::Configuration(format!(
                "不支持的日志格式: {other}"
            )))
        }
    };

    result.map_err(|e| SchedulerError::Configuration(format!("初始化日志系统失败: {e}")))
}

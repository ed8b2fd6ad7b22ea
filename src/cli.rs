//! 命令行入口：服务进程与运维命令

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use scheduler_domain::{JobDefinition, Step, Variables};

use crate::app::{AppMode, Application};
use crate::shutdown::{wait_for_signal, ShutdownManager};

const CLI_EDITOR: &str = "cli";

#[derive(Parser, Debug)]
#[command(name = "workflow-scheduler", version, about = "多Worker批处理作业调度系统")]
pub struct Cli {
    /// 配置文件路径，缺省时依次查找默认位置
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(short, long, global = true, value_parser = ["trace", "debug", "info", "warn", "error"])]
    pub log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, global = true, value_parser = ["json", "pretty", "compact"])]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 运行服务循环直到收到 SIGINT/SIGTERM
    Run {
        #[arg(short, long, value_enum, default_value_t = AppMode::All)]
        mode: AppMode,
    },
    /// 执行数据库迁移
    Migrate,
    /// 作业定义管理
    Definition {
        #[command(subcommand)]
        action: DefinitionAction,
    },
    /// 为作业定义创建一个实例
    Trigger {
        #[arg(long)]
        definition: i64,
        /// 初始上下文，JSON对象，值为字符串
        #[arg(long)]
        context: Option<String>,
    },
    /// 取消作业实例
    Cancel {
        #[arg(long)]
        instance: i64,
    },
    /// 重试出错的作业实例
    Retry {
        #[arg(long)]
        instance: i64,
    },
    /// 查看作业实例、令牌与实例日志
    Status {
        #[arg(long)]
        instance: i64,
    },
    /// 作业定义的期望内存
    Expectancy {
        #[command(subcommand)]
        action: ExpectancyAction,
    },
    /// Worker管理
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum DefinitionAction {
    Create {
        #[arg(long)]
        name: String,
        /// JSON格式的步骤树
        #[arg(long)]
        script_file: PathBuf,
        #[arg(long, default_value = "")]
        description: String,
        /// 同时运行的实例上限，0 表示不限制
        #[arg(long, default_value_t = 1)]
        prevent_multi: i32,
        /// 取消时不发送通知
        #[arg(long)]
        no_cancellation_notice: bool,
    },
    /// 修改属性；给出脚本时版本号加一
    Update {
        #[arg(long)]
        id: i64,
        #[arg(long)]
        script_file: Option<PathBuf>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        prevent_multi: Option<i32>,
        /// true 或 false
        #[arg(long)]
        notify_cancellation: Option<bool>,
    },
    /// 删除定义及其已终结的实例
    Delete {
        #[arg(long)]
        id: i64,
    },
    Suspend {
        #[arg(long)]
        id: i64,
    },
    Resume {
        #[arg(long)]
        id: i64,
    },
    List,
}

#[derive(Subcommand, Debug)]
pub enum ExpectancyAction {
    Set {
        #[arg(long)]
        definition: i64,
        /// 单位 KB，0 表示不限制
        #[arg(long)]
        value: i64,
    },
}

#[derive(Subcommand, Debug)]
pub enum WorkerAction {
    Suspend {
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        worker_id: i32,
    },
    Resume {
        #[arg(long)]
        hostname: String,
        #[arg(long)]
        worker_id: i32,
    },
    List,
}

/// 执行一条命令
pub async fn execute(app: Application, command: Commands) -> Result<()> {
    match command {
        Commands::Run { mode } => run(app, mode).await,
        // 应用初始化时已完成迁移
        Commands::Migrate => {
            println!("数据库迁移完成");
            Ok(())
        }
        Commands::Definition { action } => definition(&app, action).await,
        Commands::Trigger { definition, context } => {
            let context = parse_context(context.as_deref())?;
            let instance = app.dispatcher().trigger().trigger(definition, context).await?;
            print_json(&instance)
        }
        Commands::Cancel { instance } => {
            let instance = app.dispatcher().lifecycle().cancel_instance(instance).await?;
            print_json(&instance)
        }
        Commands::Retry { instance } => {
            let instance = app.dispatcher().lifecycle().retry_instance(instance).await?;
            print_json(&instance)
        }
        Commands::Status { instance } => status(&app, instance).await,
        Commands::Expectancy {
            action: ExpectancyAction::Set { definition, value },
        } => {
            anyhow::ensure!(value >= 0, "期望内存不能为负数: {value}");
            let expectancy = app.repositories().memory.set_expectancy(definition, value).await?;
            print_json(&expectancy)
        }
        Commands::Worker { action } => worker(&app, action).await,
    }
}

async fn run(app: Application, mode: AppMode) -> Result<()> {
    let enabled = match mode {
        AppMode::Dispatcher => app.config().dispatcher.enabled,
        AppMode::Worker => app.config().worker.enabled,
        AppMode::All => true,
    };
    anyhow::ensure!(enabled, "{:?} 模式在配置中被禁用", mode);

    let shutdown = ShutdownManager::new();
    let shutdown_rx = shutdown.subscribe().await;
    let handle = tokio::spawn(async move { app.run(mode, shutdown_rx).await });

    wait_for_signal().await.context("安装信号处理器失败")?;
    tracing::info!("开始优雅关闭，等待正在运行的进程结束");
    shutdown.shutdown().await;

    handle.await.context("应用任务异常退出")?
}

async fn definition(app: &Application, action: DefinitionAction) -> Result<()> {
    let definitions = &app.repositories().definitions;
    match action {
        DefinitionAction::Create {
            name,
            script_file,
            description,
            prevent_multi,
            no_cancellation_notice,
        } => {
            anyhow::ensure!(prevent_multi >= 0, "prevent_multi 不能为负数");
            let script = read_script(&script_file)?;
            let mut definition = JobDefinition::new(name, script);
            definition.description = description;
            definition.prevent_multi = prevent_multi;
            definition.notify_cancellation = !no_cancellation_notice;
            print_json(&definitions.create(&definition, Some(CLI_EDITOR)).await?)
        }
        DefinitionAction::Update {
            id,
            script_file,
            name,
            description,
            prevent_multi,
            notify_cancellation,
        } => {
            let has_attributes =
                name.is_some() || description.is_some() || prevent_multi.is_some() || notify_cancellation.is_some();
            anyhow::ensure!(has_attributes || script_file.is_some(), "没有需要修改的内容");
            anyhow::ensure!(!matches!(prevent_multi, Some(n) if n < 0), "prevent_multi 不能为负数");

            // 先读脚本，文件有误时不做任何修改
            let script = script_file.as_deref().map(read_script).transpose()?;
            let mut definition = definitions
                .find_by_id(id)
                .await?
                .with_context(|| format!("作业定义 {id} 不存在"))?;
            if has_attributes {
                if let Some(name) = name {
                    definition.name = name;
                }
                if let Some(description) = description {
                    definition.description = description;
                }
                if let Some(prevent_multi) = prevent_multi {
                    definition.prevent_multi = prevent_multi;
                }
                if let Some(notify_cancellation) = notify_cancellation {
                    definition.notify_cancellation = notify_cancellation;
                }
                definition = definitions.update(&definition).await?;
            }
            if let Some(script) = script {
                definition = definitions.update_script(id, &script, Some(CLI_EDITOR)).await?;
            }
            print_json(&definition)
        }
        DefinitionAction::Delete { id } => {
            anyhow::ensure!(definitions.delete(id).await?, "作业定义 {id} 不存在");
            println!("已删除作业定义 {id}");
            Ok(())
        }
        DefinitionAction::Suspend { id } => set_suspended(app, id, true).await,
        DefinitionAction::Resume { id } => set_suspended(app, id, false).await,
        DefinitionAction::List => print_json(&definitions.find_all().await?),
    }
}

async fn set_suspended(app: &Application, id: i64, suspended: bool) -> Result<()> {
    let definitions = &app.repositories().definitions;
    let mut definition = definitions
        .find_by_id(id)
        .await?
        .with_context(|| format!("作业定义 {id} 不存在"))?;
    definition.suspended = suspended;
    print_json(&definitions.update(&definition).await?)
}

async fn status(app: &Application, id: i64) -> Result<()> {
    let repos = app.repositories();
    let instance = repos
        .instances
        .find_by_id(id)
        .await?
        .with_context(|| format!("作业实例 {id} 不存在"))?;

    println!("实例 {} 状态: {:?}", instance.id, instance.status());
    for token in repos.tokens.find_by_instance(id).await? {
        println!(
            "  {:<12} {:<10} 重试 {} {}",
            token.path.to_string(),
            token.status.as_str(),
            token.retry_count,
            token.message.unwrap_or_default()
        );
    }
    for log in repos.logs.find_by_instance(id).await? {
        println!("  [{}] {} {}", log.created_at.to_rfc3339(), log.level.as_str(), log.message);
    }
    Ok(())
}

async fn worker(app: &Application, action: WorkerAction) -> Result<()> {
    let workers = &app.repositories().workers;
    match action {
        WorkerAction::Suspend { hostname, worker_id } => {
            print_json(&workers.set_suspended(&hostname, worker_id, true).await?)
        }
        WorkerAction::Resume { hostname, worker_id } => {
            print_json(&workers.set_suspended(&hostname, worker_id, false).await?)
        }
        WorkerAction::List => print_json(&workers.find_all().await?),
    }
}

/// 读取脚本文件并在保存前校验
fn read_script(path: &Path) -> Result<String> {
    let script = std::fs::read_to_string(path).with_context(|| format!("读取脚本文件失败: {}", path.display()))?;
    Step::parse(&script).with_context(|| format!("脚本校验失败: {}", path.display()))?;
    Ok(script)
}

pub fn parse_context(raw: Option<&str>) -> Result<Variables> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("上下文必须是值为字符串的JSON对象"),
        None => Ok(Variables::new()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

//! 令牌树执行器
//!
//! 以存储为唯一状态源推进一个实例的令牌树：
//! PENDING 的复合令牌展开子令牌，PENDING 的命令令牌派发执行；
//! RUNNING 的令牌观察子令牌或执行的结果并向上汇聚；
//! CANCELING 的令牌等待执行进程退出，超时后强制结束。
//!
//! 每一步都是带前置状态的条件更新，重复推进同一个令牌是安全的。

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    parse_context_exports, CommandStep, Execution, InstanceLogLevel, JobInstance, JoinPolicy, ProcessSignal,
    Repositories, Step, StepKind, Token, TokenStatus,
};

use crate::archiver::HistoryArchiver;

/// 单次推进中对同一实例的最大扫描轮数
const MAX_PASSES: usize = 16;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    /// 取消请求发出后等待进程退出的时间
    pub cancel_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            cancel_timeout: Duration::from_secs(300),
        }
    }
}

pub struct TokenExecutor {
    repos: Repositories,
    archiver: Arc<HistoryArchiver>,
    settings: ExecutorSettings,
}

impl TokenExecutor {
    pub fn new(repos: Repositories, archiver: Arc<HistoryArchiver>, settings: ExecutorSettings) -> Self {
        Self {
            repos,
            archiver,
            settings,
        }
    }

    /// 准入等待中的实例并创建根令牌，返回准入数量
    pub async fn admit_pending(&self, limit: u32) -> SchedulerResult<usize> {
        let mut admitted = 0;
        for instance in self.repos.instances.find_pending(limit).await? {
            if !self.repos.instances.try_admit(instance.id, Utc::now()).await? {
                debug!(instance_id = instance.id, "实例暂不满足准入条件");
                continue;
            }
            admitted += 1;
            // 根令牌创建失败时实例保持已准入，下一轮推进时补建
            if let Err(e) = self.plant_root(&instance).await {
                if e.is_fatal() {
                    return Err(e);
                }
                warn!(instance_id = instance.id, "创建根令牌失败: {}", e);
            }
        }
        Ok(admitted)
    }

    /// 为已准入的实例创建根令牌，脚本无法编译时实例直接出错
    async fn plant_root(&self, instance: &JobInstance) -> SchedulerResult<bool> {
        let step = match Step::parse(&instance.script) {
            Ok(step) => step,
            Err(e) => {
                warn!(instance_id = instance.id, "实例脚本无法编译: {}", e);
                self.repos
                    .logs
                    .append(instance.id, InstanceLogLevel::Error, &format!("脚本无法编译: {e}"))
                    .await?;
                self.repos.instances.mark_error(instance.id, Utc::now()).await?;
                return Ok(false);
            }
        };

        let root = self.repos.tokens.create(&Token::root(instance, &step)?).await?;
        self.repos
            .logs
            .append(instance.id, InstanceLogLevel::Info, "实例开始执行")
            .await?;
        info!(instance_id = instance.id, token_id = root.id, "作业实例开始执行");
        Ok(true)
    }

    /// 推进实例直到本轮没有新的进展
    pub async fn advance_instance(&self, instance: &JobInstance) -> SchedulerResult<bool> {
        if self.repos.tokens.find_root(instance.id).await?.is_none() {
            if instance.is_resolved() {
                return Ok(false);
            }
            warn!(instance_id = instance.id, "已准入的实例缺少根令牌，重新创建");
            if !self.plant_root(instance).await? {
                return Ok(false);
            }
        }

        let mut progressed = false;
        for _ in 0..MAX_PASSES {
            if !self.advance_pass(instance.id).await? {
                break;
            }
            progressed = true;
        }
        Ok(progressed)
    }

    async fn advance_pass(&self, job_instance_id: i64) -> SchedulerResult<bool> {
        let mut progressed = false;
        for token in self.repos.tokens.find_by_instance(job_instance_id).await? {
            if token.status.is_terminal() {
                continue;
            }
            // 同一轮内前面的令牌可能已改变它的状态
            let Some(token) = self.repos.tokens.find_by_id(token.id).await? else {
                continue;
            };
            progressed |= self.advance_token(&token).await?;
        }
        Ok(progressed)
    }

    async fn advance_token(&self, token: &Token) -> SchedulerResult<bool> {
        let step = token.step()?;
        match (token.status, &step.kind) {
            (TokenStatus::Pending, StepKind::Command(command)) => self.dispatch(token, command).await,
            (TokenStatus::Pending, _) => {
                if !self
                    .repos
                    .tokens
                    .transition(token.id, TokenStatus::Pending, TokenStatus::Running, None)
                    .await?
                {
                    return Ok(false);
                }
                let mut running = token.clone();
                running.status = TokenStatus::Running;
                self.expand(&running, &step).await?;
                Ok(true)
            }
            (TokenStatus::Running, StepKind::Command(command)) => self.observe_execution(token, &step, command).await,
            (TokenStatus::Running, _) => self.fan_in(token, &step).await,
            (TokenStatus::Canceling, StepKind::Command(_)) => self.settle_canceling_command(token).await,
            (TokenStatus::Canceling, _) => self.settle_canceling_compound(token).await,
            _ => Ok(false),
        }
    }

    /// 命令令牌：先持久化执行记录，令牌随之进入 RUNNING
    async fn dispatch(&self, token: &Token, command: &CommandStep) -> SchedulerResult<bool> {
        // 上一次尝试的执行若未及归档，先归档以释放唯一键
        if let Some(stale) = self.repos.executions.find_by_token(token.id).await? {
            if !stale.is_finished() {
                warn!(token_id = token.id, execution_id = stale.id, "PENDING令牌存在未结束的执行，跳过派发");
                return Ok(false);
            }
            self.archiver.archive(&stale).await?;
        }

        let execution = self
            .repos
            .executions
            .dispatch(&Execution::for_token(token, &command.queue, &command.shell))
            .await?;
        info!(
            instance_id = token.job_instance_id,
            token_id = token.id,
            execution_id = execution.id,
            "派发执行到队列 {} (路径 {})",
            execution.queue,
            token.path
        );
        Ok(true)
    }

    /// 复合令牌的初始展开；没有子步骤可执行时直接决议
    async fn expand(&self, token: &Token, step: &Step) -> SchedulerResult<bool> {
        match &step.kind {
            StepKind::Command(_) => Ok(false),
            StepKind::Sequence { steps } => match steps.first() {
                Some(first) => {
                    self.spawn_child(token, 0, first).await?;
                    Ok(true)
                }
                None => self.resolve(token, TokenStatus::Success, None).await,
            },
            StepKind::Parallel { steps, .. } => {
                if steps.is_empty() {
                    return self.resolve(token, TokenStatus::Success, None).await;
                }
                let existing: Vec<u32> = self
                    .repos
                    .tokens
                    .find_children(token.id)
                    .await?
                    .iter()
                    .filter_map(|child| child.path.last_index())
                    .collect();
                for (index, child) in steps.iter().enumerate() {
                    let index = index as u32;
                    if !existing.contains(&index) {
                        self.spawn_child(token, index, child).await?;
                    }
                }
                Ok(true)
            }
            StepKind::Branch { .. } => match step.select_branch(&token.context) {
                Some(index) => {
                    let chosen = step
                        .child(index)
                        .ok_or_else(|| SchedulerError::Internal(format!("分支序号越界: {index}")))?;
                    self.spawn_child(token, index, chosen).await?;
                    Ok(true)
                }
                None => self.resolve(token, TokenStatus::Success, Some("没有满足条件的分支")).await,
            },
            StepKind::Loop { condition, body, .. } => {
                if condition.evaluate(&token.context) {
                    self.spawn_child(token, 0, body).await?;
                    Ok(true)
                } else {
                    self.resolve(token, TokenStatus::Success, None).await
                }
            }
        }
    }

    async fn spawn_child(&self, parent: &Token, index: u32, step: &Step) -> SchedulerResult<Token> {
        let child = self.repos.tokens.create(&parent.child(index, step)?).await?;
        debug!(
            instance_id = parent.job_instance_id,
            token_id = child.id,
            "展开子令牌 {} ({})",
            child.path,
            step.label()
        );
        Ok(child)
    }

    /// 观察命令令牌的执行结果
    async fn observe_execution(&self, token: &Token, step: &Step, command: &CommandStep) -> SchedulerResult<bool> {
        let Some(execution) = self.repos.executions.find_by_token(token.id).await? else {
            return self.resolve(token, TokenStatus::Failure, Some("执行记录丢失")).await;
        };
        if !execution.is_finished() {
            return Ok(false);
        }

        let status = if execution.succeeded() {
            TokenStatus::Success
        } else if execution.term_signal.is_none()
            && execution
                .exit_status
                .is_some_and(|code| command.warning_exit_codes.contains(&code))
        {
            TokenStatus::Warning
        } else {
            TokenStatus::Failure
        };

        if status.is_successful() {
            let exports = parse_context_exports(&execution.output);
            if !exports.is_empty() {
                let mut context = token.context.clone();
                context.extend(exports);
                self.repos.tokens.update_context(token.id, &context).await?;
            }
            self.resolve(token, status, None).await?;
            self.archiver.archive(&execution).await?;
            return Ok(true);
        }

        let message = describe_failure(&execution);
        let retry_count = token.retry_count.max(0) as u32;
        if retry_count < command.retry {
            // 失败后重置为 PENDING，下一轮重新派发
            if self
                .repos
                .tokens
                .reset_for_retry(token.id, TokenStatus::Running, token.retry_count + 1)
                .await?
            {
                self.archiver.archive(&execution).await?;
                self.repos
                    .logs
                    .append(
                        token.job_instance_id,
                        InstanceLogLevel::Warn,
                        &format!(
                            "步骤 {} 失败 ({}), 第 {}/{} 次重试",
                            step.label(),
                            message,
                            retry_count + 1,
                            command.retry
                        ),
                    )
                    .await?;
                info!(token_id = token.id, "步骤失败，准备重试 {}/{}", retry_count + 1, command.retry);
            }
            return Ok(true);
        }

        self.repos
            .logs
            .append(
                token.job_instance_id,
                InstanceLogLevel::Error,
                &format!("步骤 {} 失败: {}", step.label(), message),
            )
            .await?;
        self.resolve(token, TokenStatus::Failure, Some(&message)).await?;
        self.archiver.archive(&execution).await?;
        Ok(true)
    }

    /// 复合令牌的汇聚
    async fn fan_in(&self, token: &Token, step: &Step) -> SchedulerResult<bool> {
        let mut children = self.repos.tokens.find_children(token.id).await?;
        if children.is_empty() {
            return self.expand(token, step).await;
        }
        children.sort_by_key(|child| child.path.last_index());

        match &step.kind {
            StepKind::Command(_) => Ok(false),
            StepKind::Sequence { steps } => self.fan_in_sequence(token, steps, &children).await,
            StepKind::Parallel { join, .. } => self.fan_in_parallel(token, *join, &children).await,
            StepKind::Branch { .. } => {
                let Some(chosen) = children.first() else {
                    return Ok(false);
                };
                if !chosen.status.is_terminal() {
                    return Ok(false);
                }
                let outcome = outcome_of(chosen)?;
                if outcome.is_successful() {
                    self.merge_context(token, std::slice::from_ref(chosen)).await?;
                }
                self.resolve(token, outcome, None).await
            }
            StepKind::Loop {
                condition,
                body,
                max_iterations,
            } => {
                let Some(last) = children.last() else {
                    return Ok(false);
                };
                if !last.status.is_terminal() {
                    return Ok(false);
                }
                let outcome = outcome_of(last)?;
                if !outcome.is_successful() {
                    return self.resolve(token, outcome, None).await;
                }

                let merged = self.merge_context(token, std::slice::from_ref(last)).await?;
                if !condition.evaluate(&merged.context) {
                    let status = aggregate(&children)?;
                    return self.resolve(token, status, None).await;
                }

                let next = last.path.last_index().map_or(0, |index| index + 1);
                if next >= *max_iterations {
                    let message = format!("循环超过最大迭代次数 {max_iterations}");
                    self.repos
                        .logs
                        .append(token.job_instance_id, InstanceLogLevel::Error, &message)
                        .await?;
                    return self.resolve(token, TokenStatus::Failure, Some(&message)).await;
                }
                self.spawn_child(&merged, next, body).await?;
                Ok(true)
            }
        }
    }

    async fn fan_in_sequence(&self, token: &Token, steps: &[Step], children: &[Token]) -> SchedulerResult<bool> {
        let Some(last) = children.last() else {
            return Ok(false);
        };
        if !last.status.is_terminal() {
            return Ok(false);
        }

        let outcome = outcome_of(last)?;
        if !outcome.is_successful() {
            // 短路：后续兄弟步骤不再展开
            let message = format!("子步骤 {} 未成功", last.path);
            return self.resolve(token, outcome, Some(&message)).await;
        }

        let merged = self.merge_context(token, std::slice::from_ref(last)).await?;
        let next = last.path.last_index().map_or(0, |index| index + 1);
        match steps.get(next as usize) {
            Some(step) => {
                self.spawn_child(&merged, next, step).await?;
                Ok(true)
            }
            None => {
                let status = aggregate(children)?;
                self.resolve(token, status, None).await
            }
        }
    }

    async fn fan_in_parallel(&self, token: &Token, join: JoinPolicy, children: &[Token]) -> SchedulerResult<bool> {
        let mut outcomes = Vec::with_capacity(children.len());
        for child in children {
            outcomes.push(if child.status.is_terminal() {
                Some(outcome_of(child)?)
            } else {
                None
            });
        }

        let any_success = outcomes.iter().flatten().any(|status| status.is_successful());
        let any_failure = outcomes
            .iter()
            .flatten()
            .any(|status| matches!(status, TokenStatus::Failure | TokenStatus::Canceled));
        let decided = match join {
            JoinPolicy::AllSucceed => any_failure,
            JoinPolicy::AnySucceed => any_success,
        };

        let open: Vec<&Token> = children.iter().filter(|child| !child.status.is_terminal()).collect();
        if !open.is_empty() {
            if !decided {
                return Ok(false);
            }
            // 结果已确定，取消其余仍在运行的子令牌
            let mut progressed = false;
            for child in open {
                progressed |= self.cancel_subtree(child).await?;
            }
            return Ok(progressed);
        }

        let status = match join {
            JoinPolicy::AllSucceed if any_failure => TokenStatus::Failure,
            JoinPolicy::AnySucceed if !any_success => TokenStatus::Failure,
            _ => aggregate(children)?,
        };
        if status.is_successful() {
            let successful: Vec<Token> = children
                .iter()
                .zip(&outcomes)
                .filter(|(_, outcome)| outcome.is_some_and(|s| s.is_successful()))
                .map(|(child, _)| child.clone())
                .collect();
            self.merge_context(token, &successful).await?;
        }
        self.resolve(token, status, None).await
    }

    /// 子令牌的上下文按顺序合并进父令牌
    async fn merge_context(&self, token: &Token, children: &[Token]) -> SchedulerResult<Token> {
        let mut merged = token.clone();
        for child in children {
            merged.context.extend(child.context.clone());
        }
        if merged.context != token.context {
            self.repos.tokens.update_context(token.id, &merged.context).await?;
        }
        Ok(merged)
    }

    async fn resolve(&self, token: &Token, status: TokenStatus, message: Option<&str>) -> SchedulerResult<bool> {
        let changed = self.repos.tokens.transition(token.id, token.status, status, message).await?;
        if changed {
            debug!(
                instance_id = token.job_instance_id,
                token_id = token.id,
                "令牌 {} 决议为 {}",
                token.path,
                status.as_str()
            );
        }
        Ok(changed)
    }

    /// 取消以 `token` 为根的子树
    ///
    /// PENDING 令牌直接取消；RUNNING 令牌进入 CANCELING，命令令牌同时请求终止进程。
    pub async fn cancel_subtree(&self, token: &Token) -> SchedulerResult<bool> {
        let mut progressed = false;
        let mut stack = vec![token.clone()];

        while let Some(token) = stack.pop() {
            match token.status {
                TokenStatus::Pending => {
                    if self
                        .repos
                        .tokens
                        .transition(token.id, TokenStatus::Pending, TokenStatus::Canceled, Some("已取消"))
                        .await?
                    {
                        progressed = true;
                        continue;
                    }
                    // 与派发竞争失败，按最新状态再处理一次
                    if let Some(current) = self.repos.tokens.find_by_id(token.id).await? {
                        if current.status == TokenStatus::Running {
                            stack.push(current);
                        }
                    }
                }
                TokenStatus::Running => {
                    if !self
                        .repos
                        .tokens
                        .transition(token.id, TokenStatus::Running, TokenStatus::Canceling, Some("取消中"))
                        .await?
                    {
                        continue;
                    }
                    progressed = true;

                    let mut canceling = token.clone();
                    canceling.status = TokenStatus::Canceling;
                    if token.step()?.is_command() {
                        self.settle_canceling_command(&canceling).await?;
                    } else {
                        stack.extend(self.repos.tokens.find_children(token.id).await?);
                    }
                }
                _ => {}
            }
        }
        Ok(progressed)
    }

    async fn settle_canceling_command(&self, token: &Token) -> SchedulerResult<bool> {
        let Some(execution) = self.repos.executions.find_by_token(token.id).await? else {
            return self.resolve(token, TokenStatus::Canceled, Some("已取消")).await;
        };

        if execution.is_finished() {
            self.archiver.archive(&execution).await?;
            return self.resolve(token, TokenStatus::Canceled, Some("已取消")).await;
        }

        if !execution.is_claimed() {
            if self.repos.executions.withdraw_unclaimed(execution.id).await? {
                return self.resolve(token, TokenStatus::Canceled, Some("已取消")).await;
            }
            // 撤回时恰好被认领，下一轮按已认领处理
            return Ok(false);
        }

        self.request_termination(&execution).await?;

        let timeout = chrono::Duration::from_std(self.settings.cancel_timeout).unwrap_or(chrono::Duration::MAX);
        if Utc::now().signed_duration_since(token.updated_at) < timeout {
            return Ok(false);
        }

        warn!(
            token_id = token.id,
            execution_id = execution.id,
            "等待进程退出超时，强制结束执行"
        );
        self.repos
            .executions
            .append_output(execution.id, "\n[取消超时，执行被强制结束]\n")
            .await?;
        self.repos.executions.complete(execution.id, None, None, Utc::now()).await?;
        if let Some(finished) = self.repos.executions.find_by_id(execution.id).await? {
            self.archiver.archive(&finished).await?;
        }
        self.resolve(token, TokenStatus::Canceled, Some("取消超时，强制结束")).await
    }

    /// 为已启动的执行登记一次终止信号
    async fn request_termination(&self, execution: &Execution) -> SchedulerResult<()> {
        let (Some(hostname), Some(pid)) = (&execution.hostname, execution.pid) else {
            // 进程尚未启动，等待下一轮
            return Ok(());
        };
        if !self.repos.signals.find_by_execution(execution.id).await?.is_empty() {
            return Ok(());
        }

        let signal = self
            .repos
            .signals
            .create(&ProcessSignal::terminate(hostname.as_str(), pid, execution.id, "作业实例已取消"))
            .await?;
        info!(
            execution_id = execution.id,
            "请求终止进程 {}:{} (信号 {})",
            hostname,
            pid,
            signal.number
        );
        Ok(())
    }

    async fn settle_canceling_compound(&self, token: &Token) -> SchedulerResult<bool> {
        let children = self.repos.tokens.find_children(token.id).await?;
        let mut progressed = false;
        for child in children.iter().filter(|child| !child.status.is_terminal()) {
            progressed |= self.cancel_subtree(child).await?;
        }
        if children.iter().all(|child| child.status.is_terminal()) {
            progressed |= self.resolve(token, TokenStatus::Canceled, Some("已取消")).await?;
        }
        Ok(progressed)
    }
}

/// 子令牌参与汇聚时的结果：忽略错误的步骤失败按 WARNING 计
fn outcome_of(child: &Token) -> SchedulerResult<TokenStatus> {
    if child.status == TokenStatus::Failure && child.step()?.ignore_errors {
        return Ok(TokenStatus::Warning);
    }
    Ok(child.status)
}

fn aggregate(children: &[Token]) -> SchedulerResult<TokenStatus> {
    for child in children {
        if outcome_of(child)? == TokenStatus::Warning {
            return Ok(TokenStatus::Warning);
        }
    }
    Ok(TokenStatus::Success)
}

fn describe_failure(execution: &Execution) -> String {
    match (execution.exit_status, execution.term_signal) {
        (_, Some(signal)) => format!("被信号 {signal} 终止"),
        (Some(code), None) => format!("退出码 {code}"),
        (None, None) => "进程未正常退出".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::{JobDefinition, Variables};

    fn token_for(step: &Step, status: TokenStatus) -> Token {
        let definition = JobDefinition::new("unit", step.to_json().expect("json"));
        let instance = JobInstance::new(&definition, Variables::new());
        let mut token = Token::root(&instance, step).expect("token");
        token.status = status;
        token
    }

    #[test]
    fn test_ignored_failure_counts_as_warning() {
        let ignored = token_for(&Step::command("false").ignoring_errors(), TokenStatus::Failure);
        assert_eq!(outcome_of(&ignored).unwrap(), TokenStatus::Warning);

        let strict = token_for(&Step::command("false"), TokenStatus::Failure);
        assert_eq!(outcome_of(&strict).unwrap(), TokenStatus::Failure);
    }

    #[test]
    fn test_aggregate_prefers_warning() {
        let ok = token_for(&Step::command("true"), TokenStatus::Success);
        let warned = token_for(&Step::command("true"), TokenStatus::Warning);
        assert_eq!(aggregate(&[ok.clone()]).unwrap(), TokenStatus::Success);
        assert_eq!(aggregate(&[ok, warned]).unwrap(), TokenStatus::Warning);
    }

    #[test]
    fn test_failure_description() {
        let step = Step::command("true");
        let token = token_for(&step, TokenStatus::Running);
        let mut execution = Execution::for_token(&token, "@default", "true");
        execution.exit_status = Some(3);
        assert_eq!(describe_failure(&execution), "退出码 3");
        execution.term_signal = Some(9);
        assert_eq!(describe_failure(&execution), "被信号 9 终止");
    }
}

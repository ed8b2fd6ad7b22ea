#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use scheduler_core::{DispatcherConfig, SchedulerResult};
use scheduler_dispatcher::{DispatcherService, Notifier};
use scheduler_domain::{Execution, JobDefinition, JobInstance, Repositories, Step, Token, Variables, DEFAULT_QUEUE};
use scheduler_testing_utils::{register_worker, JobDefinitionBuilder, TestDatabase};

/// 记录所有通知的测试实现
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("lock").clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_error(&self, instance: &JobInstance, _message: &str) -> SchedulerResult<()> {
        self.events.lock().expect("lock").push(format!("error:{}", instance.id));
        Ok(())
    }

    async fn notify_cancellation(&self, instance: &JobInstance) -> SchedulerResult<()> {
        self.events.lock().expect("lock").push(format!("cancel:{}", instance.id));
        Ok(())
    }

    async fn notify_long_running(&self, execution: &Execution) -> SchedulerResult<()> {
        self.events.lock().expect("lock").push(format!("long:{}", execution.id));
        Ok(())
    }
}

pub struct Harness {
    pub db: TestDatabase,
    pub service: DispatcherService,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Result<Self> {
        Self::with_config(DispatcherConfig::default()).await
    }

    pub async fn with_config(config: DispatcherConfig) -> Result<Self> {
        let db = TestDatabase::new().await?;
        let notifier = Arc::new(RecordingNotifier::default());
        let service = DispatcherService::new(db.repos.clone(), config, notifier.clone());
        for worker_id in 1..=3 {
            register_worker(&db.repos, worker_id, DEFAULT_QUEUE).await?;
        }
        Ok(Self { db, service, notifier })
    }

    pub fn repos(&self) -> &Repositories {
        &self.db.repos
    }

    pub async fn define(&self, step: &Step) -> Result<JobDefinition> {
        Ok(JobDefinitionBuilder::new(step).create(self.repos()).await?)
    }

    pub async fn start(&self, step: &Step, context: Variables) -> Result<(JobDefinition, JobInstance)> {
        let definition = self.define(step).await?;
        let instance = self.service.trigger().trigger(definition.id, context).await?;
        self.service.tick().await?;
        Ok((definition, instance))
    }

    pub async fn instance(&self, id: i64) -> Result<JobInstance> {
        Ok(self.repos().instances.find_by_id(id).await?.expect("instance exists"))
    }

    /// 按路径索引的令牌
    pub async fn tokens(&self, instance_id: i64) -> Result<BTreeMap<String, Token>> {
        Ok(self
            .repos()
            .tokens
            .find_by_instance(instance_id)
            .await?
            .into_iter()
            .map(|token| (token.path.to_string(), token))
            .collect())
    }
}

pub fn vars(pairs: &[(&str, &str)]) -> Variables {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

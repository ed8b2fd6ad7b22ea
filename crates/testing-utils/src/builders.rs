//! 测试数据构建器

use std::sync::atomic::{AtomicUsize, Ordering};

use scheduler_core::SchedulerResult;
use scheduler_domain::{JobDefinition, Repositories, Step};

/// 作业名唯一，按序号生成默认名
static NEXT_NAME: AtomicUsize = AtomicUsize::new(1);

pub struct JobDefinitionBuilder {
    definition: JobDefinition,
}

impl JobDefinitionBuilder {
    pub fn new(step: &Step) -> Self {
        let script = step.to_json().expect("step serializes");
        Self {
            definition: JobDefinition::new(format!("test_job_{}", NEXT_NAME.fetch_add(1, Ordering::Relaxed)), script),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.definition.name = name.to_string();
        self
    }

    pub fn with_prevent_multi(mut self, prevent_multi: i32) -> Self {
        self.definition.prevent_multi = prevent_multi;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.definition.suspended = true;
        self
    }

    pub fn without_cancellation_notice(mut self) -> Self {
        self.definition.notify_cancellation = false;
        self
    }

    pub fn build(self) -> JobDefinition {
        self.definition
    }

    pub async fn create(self, repos: &Repositories) -> SchedulerResult<JobDefinition> {
        repos.definitions.create(&self.definition, Some("tester")).await
    }
}

use futures_util::future::BoxFuture;
use std::{collections::HashMap, sync::Arc};

use super::{job_result::JobResult, Job, JobContext, JobError};

type JobExecutor = Arc<
    dyn Fn(JobContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, JobError>>
        + Send
        + Sync,
>;

/// Maps `job_type` strings to their handlers.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, JobExecutor>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("jobs", &self.jobs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
        }
    }

    pub fn register_job<J: Job + 'static>(&mut self) {
        self.jobs.insert(
            J::name(),
            Arc::new(
                |context: JobContext,
                 args_json: serde_json::Value|
                 -> BoxFuture<'static, Result<serde_json::Value, JobError>> {
                Box::pin(async move {
                    let arguments: J::Arguments =
                        serde_json::from_value(args_json).map_err(|e| {
                            JobError::FailPermanently(format!("Failed to parse job arguments: {e}"))
                        })?;
                    J::execute(&context, arguments).await
                })
            }),
        );
    }

    pub(crate) fn job_names(&self) -> impl Iterator<Item = &&'static str> {
        self.jobs.keys()
    }

    pub(crate) async fn execute(
        &self,
        context: JobContext,
        r#type: &str,
        arguments: serde_json::Value,
    ) -> JobResult {
        if let Some(executor) = self.jobs.get(r#type) {
            match executor(context, arguments).await {
                Ok(output) => JobResult::Completed(output),
                Err(e) => JobResult::Failed(e),
            }
        } else {
            JobResult::Failed(JobError::FailPermanently(format!(
                "No job registered for job type: {type}"
            )))
        }
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

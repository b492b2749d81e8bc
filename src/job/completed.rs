//! A task whose outcome was known when it was created

use async_trait::async_trait;
use std::time::Duration;
use virtmgmt_core_interface::ObjectPath;

use super::{CompletedHandler, MsvmError, Task, TaskStatus};
use crate::error::{codes, DefaultErrorCodeMapper, Error, Result};

#[derive(Debug, Clone, Default)]
pub struct CompletedTask {
    error_code: i64,
    summary: Option<String>,
    detail: Option<String>,
    wrapped: Option<Error>,
    affected: Vec<ObjectPath>,
}

impl CompletedTask {
    /// Finished successfully
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_affected(affected: Vec<ObjectPath>) -> Self {
        Self {
            affected,
            ..Self::default()
        }
    }

    pub fn from_code(error_code: i64) -> Self {
        Self {
            error_code,
            ..Self::default()
        }
    }

    /// Carry a failure that happened before any job existed
    pub fn from_error(error: Error) -> Self {
        let error_code = match &error {
            Error::OperationFailed { error_code, .. } => *error_code,
            other => other.error_code(),
        };
        Self {
            error_code,
            summary: Some(error.summary()),
            detail: error.description(),
            wrapped: Some(error),
            affected: Vec::new(),
        }
    }

    pub fn wrapped_error(&self) -> Option<&Error> {
        self.wrapped.as_ref()
    }

    pub fn affected_elements(&self) -> &[ObjectPath] {
        &self.affected
    }
}

#[async_trait]
impl Task for CompletedTask {
    fn instance_id(&self) -> String {
        String::new()
    }

    fn name(&self) -> String {
        String::new()
    }

    fn status(&self) -> TaskStatus {
        if self.error_code == codes::SUCCESS {
            TaskStatus::CompletedSuccessfully
        } else {
            TaskStatus::CompletedWithErrors
        }
    }

    fn error_code(&self) -> i64 {
        self.error_code
    }

    fn percent_complete(&self) -> u16 {
        100
    }

    fn error_summary(&self) -> Option<String> {
        self.summary.clone()
    }

    fn error_detail(&self) -> Option<String> {
        self.detail.clone()
    }

    fn is_deleted(&self) -> bool {
        false
    }

    async fn cancel(&self) -> Result<()> {
        Err(Error::cancel_task_failed(
            codes::CLIENT_DISCONNECTED,
            &DefaultErrorCodeMapper,
        ))
    }

    async fn wait_for_completion(&self, _timeout: Option<Duration>) -> bool {
        true
    }

    async fn get_errors(&self) -> Result<Vec<MsvmError>> {
        Ok(Vec::new())
    }

    fn on_completed(&self, handler: CompletedHandler) -> u64 {
        handler(self.status());
        0
    }

    async fn dispose(&self) {}
}

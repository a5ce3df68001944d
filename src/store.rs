use std::future::Future;

use anyhow::Result;
use sqlx::SqlitePool;

use crate::database as db;
use crate::submission::{JudgeContext, StatusView, SubmissionId, Verdict};

/// Persisted submission records as seen by the dispatcher
///
/// Only the dispatcher that claimed an id mutates its record, and both
/// transitions are guarded so a record never moves backwards.
pub trait SubmissionStore: Send + Sync + 'static {
    /// Submission, problem limits and ordered test cases, `None` if any is missing
    fn load_context(
        &self,
        id: SubmissionId,
    ) -> impl Future<Output = Result<Option<JudgeContext>>> + Send;

    /// PENDING -> RUNNING, returns `false` if the record was not pending
    fn mark_running(&self, id: SubmissionId) -> impl Future<Output = Result<bool>> + Send;

    /// Writes verdict, diagnostic text and DONE unless the record is already done
    fn finish(
        &self,
        id: SubmissionId,
        verdict: Verdict,
        diagnostic_text: Option<&str>,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn status_view(
        &self,
        id: SubmissionId,
    ) -> impl Future<Output = Result<Option<StatusView>>> + Send;
}

impl SubmissionStore for SqlitePool {
    async fn load_context(&self, id: SubmissionId) -> Result<Option<JudgeContext>> {
        Ok(db::fetch_judge_context(self, id).await?)
    }

    async fn mark_running(&self, id: SubmissionId) -> Result<bool> {
        Ok(db::update_submission_to_running(self, id).await?)
    }

    async fn finish(
        &self,
        id: SubmissionId,
        verdict: Verdict,
        diagnostic_text: Option<&str>,
    ) -> Result<bool> {
        Ok(db::save_verdict(self, id, verdict, diagnostic_text).await?)
    }

    async fn status_view(&self, id: SubmissionId) -> Result<Option<StatusView>> {
        Ok(db::fetch_status_view(self, id).await?)
    }
}

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tokio::sync::Notify;

use crate::database as db;
use crate::submission::{NewSubmission, SubmissionId};

/// FIFO handoff of submission ids between the submit side and the dispatcher
///
/// A successful pop hands an id to exactly one caller. This is the only
/// exclusivity mechanism the dispatcher relies on when claiming work.
pub trait SubmissionQueue: Send + Sync + 'static {
    /// Appends an id to the tail
    fn enqueue(&self, id: SubmissionId) -> impl Future<Output = Result<()>> + Send;

    /// Removes and returns the head, or `None` right away if the queue is empty
    fn try_pop(&self) -> impl Future<Output = Result<Option<SubmissionId>>> + Send;

    /// Resolves once an id may have been enqueued
    ///
    /// Spurious wakeups are allowed. Dropping the future never consumes an id.
    fn wait_for_work(&self) -> impl Future<Output = ()> + Send;

    /// Removes and returns the head, waiting until one is available
    fn pop(&self) -> impl Future<Output = Result<SubmissionId>> + Send {
        async move {
            loop {
                if let Some(id) = self.try_pop().await? {
                    return Ok(id);
                }
                self.wait_for_work().await;
            }
        }
    }

    /// Claims up to `max` ids without waiting
    fn try_pop_batch(&self, max: usize) -> impl Future<Output = Result<Vec<SubmissionId>>> + Send {
        async move {
            let mut claimed = Vec::with_capacity(max);
            while claimed.len() < max {
                match self.try_pop().await? {
                    Some(id) => claimed.push(id),
                    None => break,
                }
            }
            Ok(claimed)
        }
    }

    /// Stores a new pending submission and queues it
    ///
    /// Either both happen or neither: if queueing fails, the stored row is
    /// removed again.
    fn submit(
        &self,
        pool: &SqlitePool,
        submission: &NewSubmission<'_>,
    ) -> impl Future<Output = Result<SubmissionId>> + Send {
        async move {
            let id = db::create_submission(pool, submission).await?;
            if let Err(e) = self.enqueue(id).await {
                if let Err(delete_error) = db::delete_submission(pool, id).await {
                    log::error!("Submission {id} stored but never queued: {delete_error}");
                }
                return Err(e.context(format!("Failed to enqueue submission {id}")));
            }
            Ok(id)
        }
    }
}

/// Queue living in this process only
pub struct MemoryQueue {
    queue: Mutex<VecDeque<SubmissionId>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionQueue for MemoryQueue {
    async fn enqueue(&self, id: SubmissionId) -> Result<()> {
        self.queue.lock().push_back(id);
        self.notify.notify_one();
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<SubmissionId>> {
        Ok(self.queue.lock().pop_front())
    }

    async fn wait_for_work(&self) {
        // An enqueue without a waiter leaves a permit behind, so none is missed
        self.notify.notified().await;
    }
}

/// Queue stored in the `submission_queue` table
///
/// Every dispatcher process pointed at the same database shares it. A pop is
/// a single `DELETE ... RETURNING` statement, so SQLite's write lock makes the
/// claim atomic across processes. The table sits next to `submissions`, which
/// lets [`submit`](SubmissionQueue::submit) write both rows in one transaction.
pub struct SqliteQueue {
    pool: SqlitePool,
    notify: Notify,
    poll_interval: Duration,
}

impl SqliteQueue {
    pub fn new(pool: SqlitePool, poll_interval: Duration) -> Self {
        Self {
            pool,
            notify: Notify::new(),
            poll_interval,
        }
    }

    pub async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM submission_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

impl SubmissionQueue for SqliteQueue {
    async fn enqueue(&self, id: SubmissionId) -> Result<()> {
        sqlx::query("INSERT INTO submission_queue (submission_id) VALUES (?)")
            .bind(id)
            .execute(&self.pool)
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn try_pop(&self) -> Result<Option<SubmissionId>> {
        let id = sqlx::query_scalar::<_, SubmissionId>(
            r"
            DELETE FROM submission_queue
            WHERE seq = (SELECT seq FROM submission_queue ORDER BY seq LIMIT 1)
            RETURNING submission_id
            ",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    async fn wait_for_work(&self) {
        // Other processes enqueue without notifying us, so poll as well
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    /// Inserts the submission and its queue entry in one transaction
    async fn submit(&self, pool: &SqlitePool, submission: &NewSubmission<'_>) -> Result<SubmissionId> {
        let id = db::create_queued_submission(pool, submission).await?;
        self.notify.notify_one();
        Ok(id)
    }
}

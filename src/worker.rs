use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::language::LanguageRegistry;
use crate::queue::SubmissionQueue;
use crate::sandbox::{EnvironmentProvider, Judge, Judgement};
use crate::store::SubmissionStore;
use crate::submission::{JudgeContext, SubmissionId, Verdict};

/// Pause before popping again after the queue itself failed
const QUEUE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Attempts at writing a verdict before the submission is left running
const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Counted wake events for the triggered dispatcher
///
/// Every [`notify`](Self::notify) is remembered until it is consumed, so
/// signals raised while a batch is running each get their own batch.
pub struct WakeSignal {
    pending: Semaphore,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            pending: Semaphore::new(0),
        }
    }

    pub fn notify(&self) {
        self.pending.add_permits(1);
    }

    /// Wake events not consumed yet
    pub fn pending(&self) -> usize {
        self.pending.available_permits()
    }

    /// Waits for one wake event and consumes it
    pub async fn notified(&self) {
        // The semaphore is never closed
        if let Ok(permit) = self.pending.acquire().await {
            permit.forget();
        }
    }
}

impl Default for WakeSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to one claimed submission id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The record could not be loaded; it is dropped, not re-queued
    Abandoned,
    /// The record was no longer pending, someone else owns it
    Skipped,
    Judged(Verdict),
}

/// Summary of one triggered batch
#[derive(Serialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: Vec<SubmissionId>,
    pub judged: usize,
    pub abandoned: usize,
    pub skipped: usize,
}

/// Claims queued submissions and drives each of them to a terminal verdict
pub struct Dispatcher<Q, S, P> {
    queue: Arc<Q>,
    store: Arc<S>,
    judge: Arc<Judge<P>>,
    languages: Arc<LanguageRegistry>,
    batch_size: usize,
}

impl<Q, S, P> Clone for Dispatcher<Q, S, P> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            store: Arc::clone(&self.store),
            judge: Arc::clone(&self.judge),
            languages: Arc::clone(&self.languages),
            batch_size: self.batch_size,
        }
    }
}

impl<Q, S, P> Dispatcher<Q, S, P>
where
    Q: SubmissionQueue,
    S: SubmissionStore,
    P: EnvironmentProvider,
{
    pub fn new(
        queue: Arc<Q>,
        store: Arc<S>,
        judge: Arc<Judge<P>>,
        languages: Arc<LanguageRegistry>,
        batch_size: usize,
    ) -> Self {
        Self {
            queue,
            store,
            judge,
            languages,
            batch_size: batch_size.max(1),
        }
    }

    /// Judges one claimed submission
    ///
    /// Once the submission is marked running, a terminal verdict is written
    /// whatever the engine does, panics included.
    pub async fn process_one(&self, id: SubmissionId) -> Outcome {
        // 1. Load the submission with its limits and test cases
        let context = match self.store.load_context(id).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                log::error!("Submission {id} or its problem does not exist, submission discarded");
                return Outcome::Abandoned;
            }
            Err(e) => {
                log::error!("Failed to fetch submission {id} from database, submission discarded: {e:#}");
                return Outcome::Abandoned;
            }
        };

        // 2. Update status to Running
        match self.store.mark_running(id).await {
            Ok(true) => log::info!("Submission {id} is running"),
            Ok(false) => {
                log::warn!("Submission {id} is not pending anymore, skipped");
                return Outcome::Skipped;
            }
            Err(e) => {
                log::error!("Failed to update submission {id} status to Running: {e:#}");
                return Outcome::Abandoned;
            }
        }

        // 3. Judge
        let judgement = self.judge_isolated(context).await;

        // 4. Write the terminal state
        self.finish(id, &judgement).await;
        Outcome::Judged(judgement.verdict)
    }

    /// Runs the engine in its own task so a panic still ends in a verdict
    async fn judge_isolated(&self, context: JudgeContext) -> Judgement {
        let JudgeContext {
            submission,
            limits,
            test_cases,
        } = context;

        let Some(language) = self.languages.get(&submission.language).cloned() else {
            log::warn!(
                "Submission {} uses unknown language {}",
                submission.id,
                submission.language
            );
            return Judgement::new(
                Verdict::RuntimeError,
                Some(format!("Language `{}` is not supported", submission.language)),
            );
        };

        let judge = Arc::clone(&self.judge);
        let handle = tokio::spawn(async move {
            judge
                .judge(&submission.source_code, &language, &test_cases, &limits)
                .await
        });

        match handle.await {
            Ok(judgement) => judgement,
            Err(e) => {
                log::error!("Judging task failed: {e}");
                Judgement::new(Verdict::RuntimeError, Some(format!("Judging task failed: {e}")))
            }
        }
    }

    async fn finish(&self, id: SubmissionId, judgement: &Judgement) {
        let verdict = judgement.verdict;
        for attempt in 1..=FINISH_ATTEMPTS {
            match self
                .store
                .finish(id, verdict, judgement.diagnostic.as_deref())
                .await
            {
                Ok(true) => {
                    log::info!("Submission {id} finished: {verdict}");
                    return;
                }
                Ok(false) => {
                    log::warn!("Submission {id} already has a verdict, {verdict} discarded");
                    return;
                }
                Err(e) => {
                    log::error!(
                        "Failed to save submission {id} verdict (attempt {attempt}/{FINISH_ATTEMPTS}): {e:#}"
                    );
                    if attempt < FINISH_ATTEMPTS {
                        tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                    }
                }
            }
        }
        log::error!("Submission {id} is left running, its verdict {verdict} was lost");
    }

    /// Judges every id concurrently; one failing task never affects another
    pub async fn process_batch(&self, ids: Vec<SubmissionId>) -> Vec<(SubmissionId, Outcome)> {
        let mut tasks = JoinSet::new();
        for id in ids {
            let dispatcher = self.clone();
            tasks.spawn(async move { (id, dispatcher.process_one(id).await) });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => log::error!("Batch task failed: {e:?}"),
            }
        }
        outcomes
    }

    /// Claims up to one batch without waiting and judges it
    pub async fn wake(&self) -> anyhow::Result<BatchReport> {
        let claimed = self.queue.try_pop_batch(self.batch_size).await?;
        if claimed.is_empty() {
            log::debug!("Woken up with an empty queue");
            return Ok(BatchReport::default());
        }
        log::info!("Claimed {} submissions: {claimed:?}", claimed.len());

        let mut report = BatchReport {
            claimed: claimed.clone(),
            ..BatchReport::default()
        };
        for (_, outcome) in self.process_batch(claimed).await {
            match outcome {
                Outcome::Judged(_) => report.judged += 1,
                Outcome::Abandoned => report.abandoned += 1,
                Outcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    /// Waits on the queue and judges one submission at a time until cancelled
    ///
    /// Only the wait is raced against cancellation. A claim runs to completion
    /// and its submission is judged, so shutting down never loses a popped id.
    pub async fn run_continuous(self, worker_id: u8, token: CancellationToken) -> anyhow::Result<()> {
        log::info!("Worker {worker_id} initialized in continuous mode");

        while !token.is_cancelled() {
            match self.queue.try_pop().await {
                Ok(Some(id)) => {
                    log::info!("Worker {worker_id} got submission {id} from queue");
                    let outcome = self.process_one(id).await;
                    log::debug!("Worker {worker_id} done with submission {id}: {outcome:?}");
                }
                Ok(None) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = self.queue.wait_for_work() => {}
                    }
                }
                Err(e) => {
                    log::error!("Worker {worker_id} failed to pop from queue: {e:#}");
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(QUEUE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        log::info!("Worker {worker_id} has shut down gracefully");
        Ok(())
    }

    /// Judges one batch per wake event until cancelled
    pub async fn run_triggered(self, trigger: Arc<WakeSignal>, token: CancellationToken) -> anyhow::Result<()> {
        log::info!(
            "Dispatcher initialized in triggered mode, batch size {}",
            self.batch_size
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    log::info!("Triggered dispatcher received shutdown signal, stopping");
                    break;
                }

                _ = trigger.notified() => {
                    match self.wake().await {
                        Ok(report) if report.claimed.is_empty() => {}
                        Ok(report) => log::info!(
                            "Batch done: {} judged, {} abandoned, {} skipped",
                            report.judged,
                            report.abandoned,
                            report.skipped
                        ),
                        Err(e) => log::error!("Failed to claim a batch: {e:#}"),
                    }
                }
            }
        }

        log::info!("Triggered dispatcher has shut down gracefully");
        Ok(())
    }
}

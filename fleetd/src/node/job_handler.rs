//! Job coordinator
//!
//! Hands out job leases and crawl directives, and retires leases on
//! finish, failure or expiry. Only ever driven on the leader.
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetd_api::{
    CrawlData, CrawlToken, Delimiters, FailedJob, FailureReason, Job, JobAssignment, JobReport,
    LeaseRef, NewJob, PayloadError, Peer, Response,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::retry::{query_with_retry, RetryPolicy};
use crate::stats::Stats;
use crate::store::{now_millis, JobStore, StoreError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error(transparent)]
    Payload(#[from] PayloadError),
    /// Unknown job, or a lease that was already renewed or retired
    #[error("Job not currently expected.")]
    NotExpected,
    #[error("Crawl result deprecated.")]
    CrawlDeprecated,
    #[error("Unable to add job {0} to database.")]
    Upload(usize),
    #[error("Job store unavailable: {0}")]
    Store(#[from] StoreError),
}

pub type JobResult<T> = std::result::Result<T, JobError>;

impl JobError {
    pub fn into_response(self) -> Response {
        match self {
            JobError::Payload(_) | JobError::NotExpected | JobError::CrawlDeprecated => {
                Response::client_error(self.to_string())
            }
            JobError::Upload(_) | JobError::Store(_) => Response::server_error(self.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobSettings {
    pub delimiters: Delimiters,
    /// Below this queue depth workers are sent crawling
    pub min_queued_jobs: u64,
    pub max_job_retries: u32,
    /// How long an issued crawl directive blocks issuing another one
    pub crawl_cooldown: Duration,
    /// Seconds; used for uploaded jobs that don't carry a timeout
    pub default_job_timeout: i64,
    pub retry: RetryPolicy,
}

/// State guarded by the job-acquisition lock
#[derive(Debug, Default)]
struct CrawlState {
    outstanding: Option<CrawlToken>,
}

pub struct JobHandler {
    settings: JobSettings,
    store: Arc<dyn JobStore>,
    stats: Arc<dyn Stats>,
    crawl: Mutex<CrawlState>,
    /// Held from the fencing check until the lease table write is done
    leases: Mutex<()>,
    /// Last known crawl id; on followers this is what heartbeats carry
    crawl_id: AtomicI32,
}

impl JobHandler {
    pub const UPLOAD_OK: &'static str = "Your job(s) has been successfully added to the queue.";
    pub const FINISH_OK: &'static str = "Job finished successfully.";
    pub const FAIL_OK: &'static str = "Job failed successfully.";

    pub fn new(settings: JobSettings, store: Arc<dyn JobStore>, stats: Arc<dyn Stats>) -> Self {
        Self {
            settings,
            store,
            stats,
            crawl: Mutex::new(CrawlState::default()),
            leases: Mutex::new(()),
            crawl_id: AtomicI32::new(0),
        }
    }

    pub fn crawl_id(&self) -> i32 {
        self.crawl_id.load(Ordering::SeqCst)
    }

    pub fn set_cached_crawl_id(&self, crawl_id: i32) {
        self.crawl_id.store(crawl_id, Ordering::SeqCst);
    }

    pub async fn connect(&self, db: &Peer) -> JobResult<()> {
        let store = &self.store;
        query_with_retry(&self.settings.retry, "connect", || store.connect(db)).await?;
        Ok(())
    }

    /// Refresh the crawl id from the store; done when becoming leader
    pub async fn load_crawl_id(&self) -> JobResult<i32> {
        let store = &self.store;
        let crawl_id =
            query_with_retry(&self.settings.retry, "get_crawl_id", || store.get_crawl_id()).await?;
        self.set_cached_crawl_id(crawl_id);
        Ok(crawl_id)
    }

    /// Enqueue a batch of `url F priority [F timeout]` lines
    ///
    /// Nothing is enqueued unless every line parses.
    pub async fn upload_jobs(&self, body: &str) -> JobResult<&'static str> {
        let d = &self.settings.delimiters;
        let jobs = NewJob::parse_batch(d.entries(body), d)?;
        if jobs.is_empty() {
            return Err(PayloadError::ArgumentCount.into());
        }
        self.enqueue_new(&jobs).await?;
        Ok(Self::UPLOAD_OK)
    }

    async fn enqueue_new(&self, jobs: &[NewJob]) -> JobResult<()> {
        let store = &self.store;
        for (i, job) in jobs.iter().enumerate() {
            let timeout = job.timeout.unwrap_or(self.settings.default_job_timeout);
            query_with_retry(&self.settings.retry, "upload_job", || {
                store.upload_job(&job.url, job.priority, 0, timeout, true)
            })
            .await
            .map_err(|e| {
                warn!(url = %job.url, error = %e, "Could not enqueue job");
                JobError::Upload(i)
            })?;
        }
        debug!(count = jobs.len(), "Enqueued jobs");
        Ok(())
    }

    /// Put a job back in the queue with its stored priority
    async fn requeue(&self, job: &Job, retries: u32) -> JobResult<()> {
        let store = &self.store;
        query_with_retry(&self.settings.retry, "upload_job", || {
            store.upload_job(&job.url, job.priority, retries, job.timeout, false)
        })
        .await?;
        Ok(())
    }

    pub async fn get_job(&self) -> JobResult<JobAssignment> {
        let retry = &self.settings.retry;
        let store = &self.store;

        let mut crawl = self.crawl.lock().await;
        let now = now_millis();
        let cooldown = i64::try_from(self.settings.crawl_cooldown.as_millis()).unwrap_or(i64::MAX);
        let crawling = crawl
            .outstanding
            .map_or(false, |t| now.saturating_sub(t.token) <= cooldown);

        let depth = query_with_retry(retry, "get_number_of_jobs", || store.get_number_of_jobs())
            .await?;

        if self.settings.min_queued_jobs <= depth || (crawling && 1 <= depth) {
            match query_with_retry(retry, "get_top_job", || store.get_top_job()).await {
                Ok(job) => return self.lease(job).await,
                // someone else drained the queue since we counted
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if crawling {
            let token = crawl.outstanding.unwrap_or(CrawlToken {
                crawl_id: self.crawl_id(),
                token: now,
            });
            return Ok(JobAssignment::NoJob(token));
        }

        let token = CrawlToken {
            crawl_id: self.crawl_id(),
            token: crawl
                .outstanding
                .map_or(now, |prev| now.max(prev.token + 1)),
        };
        crawl.outstanding = Some(token);
        info!(crawl_id = token.crawl_id, token = token.token, depth, "Issuing crawl directive");
        Ok(JobAssignment::Crawl(token))
    }

    async fn lease(&self, job: Job) -> JobResult<JobAssignment> {
        let store = &self.store;
        let leased = query_with_retry(&self.settings.retry, "add_current_job", || {
            store.add_current_job(&job)
        })
        .await;
        match leased {
            Ok(lease_time) => {
                debug!(job_id = %job.id, lease_time, "Leased job");
                Ok(JobAssignment::Spider {
                    job_id: job.id,
                    url: job.url,
                    lease_time,
                    timeout: job.timeout,
                })
            }
            Err(e) => {
                // don't lose the job we already popped
                if let Err(requeue_err) = self.requeue(&job, job.retries).await {
                    warn!(job_id = %job.id, error = %requeue_err, "Could not requeue job after failed lease");
                }
                Err(e.into())
            }
        }
    }

    /// Fetch the leased job, if `lease` is its current lease
    ///
    /// Callers hold `leases` until they are done writing the lease table.
    async fn fenced(&self, lease: &LeaseRef) -> JobResult<Job> {
        let retry = &self.settings.retry;
        let store = &self.store;
        let id = lease.job_id.as_str();

        let current = query_with_retry(retry, "get_current_job_time", || {
            store.get_current_job_time(id)
        })
        .await?;
        if current != Some(lease.lease_time) {
            debug!(job_id = id, claimed = lease.lease_time, ?current, "Stale lease");
            return Err(JobError::NotExpected);
        }

        match query_with_retry(retry, "get_current_job", || store.get_current_job(id)).await {
            Ok(job) => Ok(job),
            Err(StoreError::NotFound) => Err(JobError::NotExpected),
            Err(e) => Err(e.into()),
        }
    }

    /// Renew a lease; returns the new lease time
    pub async fn update_job(&self, body: &str) -> JobResult<i64> {
        let lease = LeaseRef::parse(body, &self.settings.delimiters)?;
        let _leases = self.leases.lock().await;
        let job = self.fenced(&lease).await?;

        let store = &self.store;
        let lease_time = query_with_retry(&self.settings.retry, "add_current_job", || {
            store.add_current_job(&job)
        })
        .await?;
        debug!(job_id = %job.id, lease_time, "Renewed lease");
        Ok(lease_time)
    }

    pub async fn finish_job(&self, node: &Peer, client: &str, body: &str) -> JobResult<&'static str> {
        let report = JobReport::parse(body, &self.settings.delimiters)?;
        let _leases = self.leases.lock().await;
        let job = self.fenced(&report.lease).await?;
        let retry = &self.settings.retry;
        let store = &self.store;

        self.stats.record_finished_job(node, client, report.reason);

        if report.reason.is_success() {
            query_with_retry(retry, "delete_current_job", || {
                store.delete_current_job(&job.id)
            })
            .await?;
            self.stats.add_recent_project(&job.url);
            debug!(job_id = %job.id, "Job finished");
            return Ok(Self::FINISH_OK);
        }

        let failed = FailedJob {
            job,
            reason: report.reason,
            reason_data: report.reason_data,
        };
        query_with_retry(retry, "add_failed_job", || store.add_failed_job(&failed)).await?;

        let job = &failed.job;
        if job.retries < self.settings.max_job_retries && failed.reason.is_retriable() {
            self.requeue(job, job.retries + 1).await?;
        } else {
            info!(job_id = %job.id, url = %job.url, reason = failed.reason.id(), "Dropping failed job");
        }
        query_with_retry(retry, "delete_current_job", || {
            store.delete_current_job(&job.id)
        })
        .await?;

        Ok(Self::FAIL_OK)
    }

    /// Accept the results of a crawl directive
    pub async fn upload_crawl_data(&self, body: &str) -> JobResult<&'static str> {
        let data = CrawlData::parse(body, &self.settings.delimiters)?;

        {
            let mut crawl = self.crawl.lock().await;
            match crawl.outstanding {
                Some(token) if token.token == data.token.token => {}
                _ => {
                    debug!(token = data.token.token, outstanding = ?crawl.outstanding, "Deprecated crawl result");
                    return Err(JobError::CrawlDeprecated);
                }
            }
            crawl.outstanding = None;
        }

        let crawl_id = data.token.crawl_id;
        if crawl_id != self.crawl_id() {
            let store = &self.store;
            query_with_retry(&self.settings.retry, "set_crawl_id", || {
                store.set_crawl_id(crawl_id)
            })
            .await?;
            self.set_cached_crawl_id(crawl_id);
        }

        if !data.languages.is_empty() {
            self.stats.record_language_bytes(&data.languages);
        }

        self.enqueue_new(&data.jobs).await?;
        Ok(Self::UPLOAD_OK)
    }

    /// Retire every lease that ran out before `now`; returns how many
    pub async fn reclaim_expired(&self, now: i64) -> JobResult<usize> {
        let retry = &self.settings.retry;
        let store = &self.store;

        let jobs = query_with_retry(retry, "current_jobs", || store.current_jobs()).await?;
        let mut reclaimed = 0;

        for job in jobs.into_iter().filter(|job| job.is_expired(now)) {
            let id = job.id.as_str();
            let _leases = self.leases.lock().await;
            // the lease may have been renewed or finished since the scan
            let current = query_with_retry(retry, "get_current_job_time", || {
                store.get_current_job_time(id)
            })
            .await?;
            if current != Some(job.lease_time) {
                continue;
            }

            let failed = FailedJob {
                job,
                reason: FailureReason::Timeout,
                reason_data: String::new(),
            };
            query_with_retry(retry, "add_failed_job", || store.add_failed_job(&failed)).await?;
            let job = &failed.job;
            query_with_retry(retry, "delete_current_job", || {
                store.delete_current_job(&job.id)
            })
            .await?;
            if job.retries < self.settings.max_job_retries {
                self.requeue(job, job.retries + 1).await?;
            }
            info!(job_id = %job.id, url = %job.url, retries = job.retries, "Reclaimed expired lease");
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MemStats;
    use crate::store::MemJobStore;

    struct Fixture {
        store: Arc<MemJobStore>,
        stats: Arc<MemStats>,
        jobs: JobHandler,
    }

    fn settings(min_queued_jobs: u64) -> JobSettings {
        JobSettings {
            delimiters: Delimiters::default(),
            min_queued_jobs,
            max_job_retries: 3,
            crawl_cooldown: Duration::from_secs(150),
            default_job_timeout: 3600,
            retry: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::ZERO,
            },
        }
    }

    fn fixture(min_queued_jobs: u64) -> Fixture {
        let store = Arc::new(MemJobStore::new());
        let stats = Arc::new(MemStats::default());
        let jobs = JobHandler::new(settings(min_queued_jobs), store.clone(), stats.clone());
        Fixture { store, stats, jobs }
    }

    /// Parks the first `get_current_job` after `arm` until `release`
    struct GatedStore {
        inner: Arc<MemJobStore>,
        armed: std::sync::atomic::AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl GatedStore {
        fn new(inner: Arc<MemJobStore>) -> Self {
            Self {
                inner,
                armed: Default::default(),
                entered: Default::default(),
                release: Default::default(),
            }
        }

        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait::async_trait]
    impl JobStore for GatedStore {
        async fn connect(&self, db: &Peer) -> crate::store::StoreResult<()> {
            self.inner.connect(db).await
        }

        async fn upload_job(
            &self,
            url: &str,
            priority: i64,
            retries: u32,
            timeout: i64,
            is_new: bool,
        ) -> crate::store::StoreResult<()> {
            self.inner
                .upload_job(url, priority, retries, timeout, is_new)
                .await
        }

        async fn get_top_job(&self) -> crate::store::StoreResult<Job> {
            self.inner.get_top_job().await
        }

        async fn get_current_job(&self, job_id: &str) -> crate::store::StoreResult<Job> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.get_current_job(job_id).await
        }

        async fn add_current_job(&self, job: &Job) -> crate::store::StoreResult<i64> {
            self.inner.add_current_job(job).await
        }

        async fn get_current_job_time(
            &self,
            job_id: &str,
        ) -> crate::store::StoreResult<Option<i64>> {
            self.inner.get_current_job_time(job_id).await
        }

        async fn delete_current_job(&self, job_id: &str) -> crate::store::StoreResult<()> {
            self.inner.delete_current_job(job_id).await
        }

        async fn add_failed_job(&self, job: &FailedJob) -> crate::store::StoreResult<()> {
            self.inner.add_failed_job(job).await
        }

        async fn get_number_of_jobs(&self) -> crate::store::StoreResult<u64> {
            self.inner.get_number_of_jobs().await
        }

        async fn get_crawl_id(&self) -> crate::store::StoreResult<i32> {
            self.inner.get_crawl_id().await
        }

        async fn set_crawl_id(&self, crawl_id: i32) -> crate::store::StoreResult<()> {
            self.inner.set_crawl_id(crawl_id).await
        }

        async fn current_jobs(&self) -> crate::store::StoreResult<Vec<Job>> {
            self.inner.current_jobs().await
        }
    }

    fn me() -> Peer {
        Peer::new("127.0.0.1", 8003)
    }

    async fn lease_one(jobs: &JobHandler) -> (String, i64) {
        match jobs.get_job().await.unwrap() {
            JobAssignment::Spider {
                job_id, lease_time, ..
            } => (job_id, lease_time),
            other => panic!("expected a job, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lease_renewal_is_fenced() -> anyhow::Result<()> {
        let f = fixture(1);
        f.jobs.upload_jobs("https://x?1?69\n").await?;

        let before = now_millis();
        let assignment = f.jobs.get_job().await?;
        let after = now_millis();
        let JobAssignment::Spider {
            job_id,
            url,
            lease_time,
            timeout,
        } = assignment
        else {
            panic!("expected a job");
        };
        assert_eq!(url, "https://x");
        assert_eq!(timeout, 69);
        assert!(before <= lease_time && lease_time <= after + 1);
        assert_eq!(f.store.get_current_job(&job_id).await?.retries, 0);

        let wrong = format!("{job_id}?{}", lease_time - 1);
        assert_eq!(f.jobs.update_job(&wrong).await, Err(JobError::NotExpected));
        assert_eq!(
            f.store.get_current_job_time(&job_id).await?,
            Some(lease_time)
        );

        let right = format!("{job_id}?{lease_time}");
        let renewed = f.jobs.update_job(&right).await?;
        assert!(lease_time < renewed);

        // the old lease is now stale
        assert_eq!(f.jobs.update_job(&right).await, Err(JobError::NotExpected));
        Ok(())
    }

    #[tokio::test]
    async fn finish_racing_a_renewal_does_not_resurrect_the_lease() -> anyhow::Result<()> {
        let store = Arc::new(MemJobStore::new());
        let gated = Arc::new(GatedStore::new(store.clone()));
        let jobs = Arc::new(JobHandler::new(
            settings(1),
            gated.clone(),
            Arc::new(MemStats::default()),
        ));
        jobs.upload_jobs("https://x?1?69\n").await?;
        let (job_id, lease_time) = lease_one(&jobs).await;

        // renewal passes its lease check, then stalls
        gated.arm();
        let update = tokio::spawn({
            let jobs = jobs.clone();
            let body = format!("{job_id}?{lease_time}");
            async move { jobs.update_job(&body).await }
        });
        gated.entered.notified().await;

        let finish = tokio::spawn({
            let jobs = jobs.clone();
            let body = format!("{job_id}?{lease_time}?0?");
            async move { jobs.finish_job(&me(), "w", &body).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gated.release.notify_one();

        let renewed = update.await??;
        assert_eq!(finish.await?, Err(JobError::NotExpected));
        assert_eq!(store.get_current_job_time(&job_id).await?, Some(renewed));

        // the renewed lease finishes normally and stays finished
        let body = format!("{job_id}?{renewed}?0?");
        assert_eq!(jobs.finish_job(&me(), "w", &body).await, Ok(JobHandler::FINISH_OK));
        assert_eq!(jobs.reclaim_expired(i64::MAX).await?, 0);
        assert!(store.failed_jobs().is_empty());
        assert!(store.queued_jobs().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn empty_upload_is_rejected() -> anyhow::Result<()> {
        let f = fixture(1);
        assert_eq!(
            f.jobs.upload_jobs("").await,
            Err(JobError::Payload(PayloadError::ArgumentCount))
        );
        assert_eq!(
            f.jobs.upload_jobs("\n").await,
            Err(JobError::Payload(PayloadError::ArgumentCount))
        );
        Ok(())
    }

    #[tokio::test]
    async fn crawl_directive_is_not_reissued_during_cooldown() -> anyhow::Result<()> {
        let f = fixture(500);

        let JobAssignment::Crawl(first) = f.jobs.get_job().await? else {
            panic!("expected a crawl directive");
        };
        match f.jobs.get_job().await? {
            JobAssignment::NoJob(token) => assert_eq!(token, first),
            other => panic!("unexpected: {other:?}"),
        }

        // while crawling, a single queued job is enough
        f.jobs.upload_jobs("https://x?1?69\n").await?;
        assert!(matches!(
            f.jobs.get_job().await?,
            JobAssignment::Spider { .. }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn crawl_data_needs_the_outstanding_token() -> anyhow::Result<()> {
        let f = fixture(500);
        let JobAssignment::Crawl(token) = f.jobs.get_job().await? else {
            panic!("expected a crawl directive");
        };

        let stale = format!("5?{}\n\nhttps://a?1?60\n", token.token - 1);
        assert_eq!(
            f.jobs.upload_crawl_data(&stale).await,
            Err(JobError::CrawlDeprecated)
        );
        assert!(f.store.queued_jobs().is_empty());

        let good = format!("5?{}\nRust?1000\nhttps://a?1?60\nhttps://b?2\n", token.token);
        assert_eq!(f.jobs.upload_crawl_data(&good).await, Ok(JobHandler::UPLOAD_OK));
        assert_eq!(f.store.get_crawl_id().await?, 5);
        assert_eq!(f.jobs.crawl_id(), 5);
        assert_eq!(f.stats.language_bytes("Rust"), 1000);

        let queued = f.store.queued_jobs();
        assert_eq!(queued.len(), 2);
        assert!(queued.iter().any(|j| j.url == "https://b" && j.timeout == 3600));

        // consumed; the same token can't be used twice
        assert_eq!(
            f.jobs.upload_crawl_data(&good).await,
            Err(JobError::CrawlDeprecated)
        );

        // and a fresh directive can be issued right away
        assert!(matches!(f.jobs.get_job().await?, JobAssignment::Crawl(t) if t.crawl_id == 5));
        Ok(())
    }

    #[tokio::test]
    async fn bad_upload_enqueues_nothing() -> anyhow::Result<()> {
        let f = fixture(1);
        assert_eq!(
            f.jobs.upload_jobs("https://a?1?60\nhttps://b?high?60\n").await,
            Err(JobError::Payload(PayloadError::Priority))
        );
        assert!(f.store.queued_jobs().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn finish_success_retires_the_lease() -> anyhow::Result<()> {
        let f = fixture(1);
        f.jobs.upload_jobs("https://x?1?69\n").await?;
        let (job_id, lease_time) = lease_one(&f.jobs).await;

        let wrong = format!("{job_id}?{}?0?", lease_time + 5);
        assert_eq!(
            f.jobs.finish_job(&me(), "w", &wrong).await,
            Err(JobError::NotExpected)
        );
        assert!(f.store.get_current_job_time(&job_id).await?.is_some());

        let body = format!("{job_id}?{lease_time}?0?");
        assert_eq!(
            f.jobs.finish_job(&me(), "w", &body).await,
            Ok(JobHandler::FINISH_OK)
        );
        assert_eq!(f.store.get_current_job_time(&job_id).await?, None);
        assert_eq!(
            f.store.get_current_job(&job_id).await,
            Err(StoreError::NotFound)
        );
        assert_eq!(f.stats.recent_projects(), vec!["https://x".to_owned()]);
        assert_eq!(f.stats.finished_jobs(FailureReason::Success), 1);
        Ok(())
    }

    #[tokio::test]
    async fn retriable_failure_requeues_with_incremented_retries() -> anyhow::Result<()> {
        let f = fixture(1);
        f.jobs.upload_jobs("https://x?1?69\n").await?;
        let (job_id, lease_time) = lease_one(&f.jobs).await;
        let priority = f.store.get_current_job(&job_id).await?.priority;

        let body = format!("{job_id}?{lease_time}?5?network hiccup");
        assert_eq!(
            f.jobs.finish_job(&me(), "w", &body).await,
            Ok(JobHandler::FAIL_OK)
        );

        let failed = f.store.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::Other(5));
        assert_eq!(failed[0].reason_data, "network hiccup");

        let queued = f.store.queued_jobs();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retries, 1);
        assert_eq!(queued[0].priority, priority);
        assert_eq!(f.store.get_current_job_time(&job_id).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn non_retriable_or_exhausted_failures_are_dropped() -> anyhow::Result<()> {
        let f = fixture(1);

        f.jobs.upload_jobs("https://known?1?69\n").await?;
        let (job_id, lease_time) = lease_one(&f.jobs).await;
        let body = format!("{job_id}?{lease_time}?10?");
        f.jobs.finish_job(&me(), "w", &body).await?;
        assert!(f.store.queued_jobs().is_empty());

        f.store.upload_job("https://tired", 1, 3, 69, false).await?;
        let (job_id, lease_time) = lease_one(&f.jobs).await;
        let body = format!("{job_id}?{lease_time}?1?");
        f.jobs.finish_job(&me(), "w", &body).await?;
        assert!(f.store.queued_jobs().is_empty());
        assert_eq!(f.store.failed_jobs().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed() -> anyhow::Result<()> {
        let f = fixture(1);
        f.jobs.upload_jobs("https://slow?1?10\nhttps://fast?1?1000\n").await?;
        let (slow_id, slow_lease) = lease_one(&f.jobs).await;
        let (fast_id, _) = lease_one(&f.jobs).await;

        let now = slow_lease + 10 * 1000 + 1;
        assert_eq!(f.jobs.reclaim_expired(now).await?, 1);

        assert_eq!(f.store.get_current_job_time(&slow_id).await?, None);
        assert!(f.store.get_current_job_time(&fast_id).await?.is_some());

        let failed = f.store.failed_jobs();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].reason, FailureReason::Timeout);

        let queued = f.store.queued_jobs();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].url, "https://slow");
        assert_eq!(queued[0].retries, 1);

        assert_eq!(f.jobs.reclaim_expired(now).await?, 0);
        Ok(())
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            JobError::NotExpected.into_response(),
            Response::client_error("Job not currently expected.")
        );
        assert_eq!(
            JobError::Upload(2).into_response(),
            Response::server_error("Unable to add job 2 to database.")
        );
        assert!(!JobError::Store(StoreError::Unreachable("x".into()))
            .into_response()
            .is_success());
    }
}

//! Job queue and lease table access
//!
//! The queue and the lease table live in an external database shared by
//! the whole fleet. [`JobStore`] is the contract the coordinator relies on;
//! [`MemJobStore`] is an in-process implementation.
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fleetd_api::{FailedJob, Job, Peer};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The requested row does not exist; retrying won't help
    #[error("not found")]
    NotFound,
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("store unreachable: {0}")]
    Unreachable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Milliseconds since the unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn connect(&self, db: &Peer) -> StoreResult<()>;

    /// Enqueue a job
    ///
    /// New jobs get their stored priority aged by the current time, so
    /// older jobs of equal priority surface first. Re-enqueued jobs
    /// (`is_new == false`) keep `priority` as is.
    async fn upload_job(
        &self,
        url: &str,
        priority: i64,
        retries: u32,
        timeout: i64,
        is_new: bool,
    ) -> StoreResult<()>;

    /// Pop the job with the smallest stored priority
    async fn get_top_job(&self) -> StoreResult<Job>;

    async fn get_current_job(&self, job_id: &str) -> StoreResult<Job>;

    /// Write `job` into the lease table with a fresh lease time, which is returned
    async fn add_current_job(&self, job: &Job) -> StoreResult<i64>;

    /// Lease time of a held job, `None` if the job is not leased
    async fn get_current_job_time(&self, job_id: &str) -> StoreResult<Option<i64>>;

    async fn delete_current_job(&self, job_id: &str) -> StoreResult<()>;

    async fn add_failed_job(&self, job: &FailedJob) -> StoreResult<()>;

    /// Number of queued jobs; may lag behind
    async fn get_number_of_jobs(&self) -> StoreResult<u64>;

    async fn get_crawl_id(&self) -> StoreResult<i32>;

    async fn set_crawl_id(&self, crawl_id: i32) -> StoreResult<()>;

    /// Every currently leased job
    async fn current_jobs(&self) -> StoreResult<Vec<Job>>;
}

#[derive(Default, Debug)]
struct MemState {
    /// Keyed by `(stored priority, sequence)`
    queue: BTreeMap<(i64, u64), Job>,
    current: HashMap<String, Job>,
    failed: Vec<FailedJob>,
    crawl_id: i32,
    next_seq: u64,
    last_lease_time: i64,
    db: Option<Peer>,
}

/// Job store kept in process memory
#[derive(Default, Debug)]
pub struct MemJobStore {
    inner: Mutex<MemState>,
}

impl MemJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs in the queue, in the order they'd be served
    pub fn queued_jobs(&self) -> Vec<Job> {
        self.inner
            .lock()
            .expect("Locking failed")
            .queue
            .values()
            .cloned()
            .collect()
    }

    pub fn failed_jobs(&self) -> Vec<FailedJob> {
        self.inner.lock().expect("Locking failed").failed.clone()
    }
}

#[async_trait]
impl JobStore for MemJobStore {
    async fn connect(&self, db: &Peer) -> StoreResult<()> {
        info!(%db, "Using in-memory job store");
        self.inner.lock().expect("Locking failed").db = Some(db.clone());
        Ok(())
    }

    async fn upload_job(
        &self,
        url: &str,
        priority: i64,
        retries: u32,
        timeout: i64,
        is_new: bool,
    ) -> StoreResult<()> {
        let priority = if is_new {
            now_millis().saturating_sub(priority)
        } else {
            priority
        };

        let mut inner = self.inner.lock().expect("Locking failed");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let job = Job {
            id: format!("job-{seq}"),
            lease_time: 0,
            timeout,
            priority,
            url: url.to_owned(),
            retries,
        };
        debug!(job_id = %job.id, priority, "Enqueued job");
        inner.queue.insert((priority, seq), job);
        Ok(())
    }

    async fn get_top_job(&self) -> StoreResult<Job> {
        let mut inner = self.inner.lock().expect("Locking failed");
        inner
            .queue
            .pop_first()
            .map(|(_, job)| job)
            .ok_or(StoreError::NotFound)
    }

    async fn get_current_job(&self, job_id: &str) -> StoreResult<Job> {
        self.inner
            .lock()
            .expect("Locking failed")
            .current
            .get(job_id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn add_current_job(&self, job: &Job) -> StoreResult<i64> {
        let mut inner = self.inner.lock().expect("Locking failed");
        // strictly increasing, so a renewed lease never equals the old one
        let lease_time = now_millis().max(inner.last_lease_time + 1);
        inner.last_lease_time = lease_time;
        inner.current.insert(
            job.id.clone(),
            Job {
                lease_time,
                ..job.clone()
            },
        );
        Ok(lease_time)
    }

    async fn get_current_job_time(&self, job_id: &str) -> StoreResult<Option<i64>> {
        Ok(self
            .inner
            .lock()
            .expect("Locking failed")
            .current
            .get(job_id)
            .map(|job| job.lease_time))
    }

    async fn delete_current_job(&self, job_id: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("Locking failed")
            .current
            .remove(job_id);
        Ok(())
    }

    async fn add_failed_job(&self, job: &FailedJob) -> StoreResult<()> {
        self.inner
            .lock()
            .expect("Locking failed")
            .failed
            .push(job.clone());
        Ok(())
    }

    async fn get_number_of_jobs(&self) -> StoreResult<u64> {
        let len = self.inner.lock().expect("Locking failed").queue.len();
        Ok(u64::try_from(len).unwrap_or(u64::MAX))
    }

    async fn get_crawl_id(&self) -> StoreResult<i32> {
        Ok(self.inner.lock().expect("Locking failed").crawl_id)
    }

    async fn set_crawl_id(&self, crawl_id: i32) -> StoreResult<()> {
        self.inner.lock().expect("Locking failed").crawl_id = crawl_id;
        Ok(())
    }

    async fn current_jobs(&self) -> StoreResult<Vec<Job>> {
        Ok(self
            .inner
            .lock()
            .expect("Locking failed")
            .current
            .values()
            .cloned()
            .collect())
    }
}

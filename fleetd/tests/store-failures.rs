mod common;

use async_trait::async_trait;
use common::*;
use fleet::std::Client;
use fleetd::stats::MemStats;
use fleetd::store::{JobStore, MemJobStore, StoreError, StoreResult};
use fleetd::Node;
use fleetd_api::{FailedJob, Job, JobAssignment, NewJob, Peer, RequestCode, Status};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Fails the first `failures` calls, or every call while `down` is set
#[derive(Default)]
struct FlakyStore {
    inner: MemJobStore,
    failures: AtomicUsize,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("down".into()));
        }
        let left = self.failures.load(Ordering::SeqCst);
        if 0 < left {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(StoreError::Transient("hiccup".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn connect(&self, db: &Peer) -> StoreResult<()> {
        self.check()?;
        self.inner.connect(db).await
    }

    async fn upload_job(
        &self,
        url: &str,
        priority: i64,
        retries: u32,
        timeout: i64,
        is_new: bool,
    ) -> StoreResult<()> {
        self.check()?;
        self.inner
            .upload_job(url, priority, retries, timeout, is_new)
            .await
    }

    async fn get_top_job(&self) -> StoreResult<Job> {
        self.check()?;
        self.inner.get_top_job().await
    }

    async fn get_current_job(&self, job_id: &str) -> StoreResult<Job> {
        self.check()?;
        self.inner.get_current_job(job_id).await
    }

    async fn add_current_job(&self, job: &Job) -> StoreResult<i64> {
        self.check()?;
        self.inner.add_current_job(job).await
    }

    async fn get_current_job_time(&self, job_id: &str) -> StoreResult<Option<i64>> {
        self.check()?;
        self.inner.get_current_job_time(job_id).await
    }

    async fn delete_current_job(&self, job_id: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.delete_current_job(job_id).await
    }

    async fn add_failed_job(&self, job: &FailedJob) -> StoreResult<()> {
        self.check()?;
        self.inner.add_failed_job(job).await
    }

    async fn get_number_of_jobs(&self) -> StoreResult<u64> {
        self.check()?;
        self.inner.get_number_of_jobs().await
    }

    async fn get_crawl_id(&self) -> StoreResult<i32> {
        self.check()?;
        self.inner.get_crawl_id().await
    }

    async fn set_crawl_id(&self, crawl_id: i32) -> StoreResult<()> {
        self.check()?;
        self.inner.set_crawl_id(crawl_id).await
    }

    async fn current_jobs(&self) -> StoreResult<Vec<Job>> {
        self.check()?;
        self.inner.current_jobs().await
    }
}

fn start(store: Arc<FlakyStore>, stats: Arc<MemStats>) -> anyhow::Result<TestNode> {
    Ok(TestNode::from_node(Node::with_backends(
        test_params(vec![]),
        store,
        stats,
    )?))
}

#[test]
fn transient_failures_are_retried() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::default());
    let stats = Arc::new(MemStats::default());
    // connect itself needs a retry
    store.failures.store(1, Ordering::SeqCst);
    let server = start(store.clone(), stats.clone())?;
    let mut client = server.new_client()?;

    store.failures.store(2, Ordering::SeqCst);
    client.upload_jobs(&[NewJob::new("https://x", 1, 60)])?;
    assert!(matches!(client.get_job()?, JobAssignment::Spider { .. }));
    assert_eq!(stats.requests("test", RequestCode::GetJob), 1);
    Ok(())
}

#[test]
fn exhausted_retries_are_a_server_error() -> anyhow::Result<()> {
    let store = Arc::new(FlakyStore::default());
    let server = start(store.clone(), Arc::new(MemStats::default()))?;
    let mut client = server.new_client()?;

    store.down.store(true, Ordering::SeqCst);
    let response = client.request(RequestCode::GetJob, b"")?;
    assert_eq!(response.status, Status::ServerError);

    let response = client.request(RequestCode::UploadJobs, b"https://x?1?60\n")?;
    assert_eq!(response.status, Status::ServerError);
    assert_eq!(
        response.message_str(),
        "Unable to add job 0 to database."
    );

    // the connection and the node survive
    store.down.store(false, Ordering::SeqCst);
    client.upload_jobs(&[NewJob::new("https://x", 1, 60)])?;
    Ok(())
}

#[test]
fn unreachable_store_fails_startup() {
    let store = Arc::new(FlakyStore::default());
    store.down.store(true, Ordering::SeqCst);
    assert!(Node::with_backends(test_params(vec![]), store, Arc::new(MemStats::default())).is_err());
}

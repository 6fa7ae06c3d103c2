use std::time::Duration;

use fleet::tokio::Client;
use fleet::{CrawlData, CrawlToken, Error, FailureReason, JobAssignment, JobReport, LeaseRef, NewJob, Status};
use rand::prelude::StdRng;
use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const LANGUAGES: [&str; 4] = ["Rust", "C++", "Go", "Python"];

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound of the random pause while "processing" a job
    pub delay: Duration,
    /// Jobs uploaded for every crawl directive
    pub crawl_jobs: usize,
    /// Share of jobs reported as failed
    pub failure_rate: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub finished: u64,
    pub failed: u64,
    pub crawled: u64,
    pub idle: u64,
    /// Leases or crawl tokens the leader no longer accepted
    pub stale: u64,
}

/// Behaves like a spider: takes jobs, renews them once, reports back
pub struct Worker<C> {
    client: C,
    config: WorkerConfig,
    rng: StdRng,
    stats: WorkerStats,
}

/// The leader turned the request down; the worker can carry on
fn is_rejected(e: &Error) -> bool {
    matches!(
        e,
        Error::Status {
            status: Status::ClientError,
            ..
        }
    )
}

impl<C: Client> Worker<C> {
    pub fn new(client: C, config: WorkerConfig, rng: StdRng) -> Self {
        Self {
            client,
            config,
            rng,
            stats: WorkerStats::default(),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Loop until an error, or `iterations` steps are done
    pub async fn run(&mut self, iterations: Option<u64>) -> fleet::Result<WorkerStats> {
        let mut done = 0;
        while iterations.map_or(true, |max| done < max) {
            self.step().await?;
            done += 1;
        }
        Ok(self.stats)
    }

    pub async fn step(&mut self) -> fleet::Result<()> {
        match self.client.get_job().await? {
            JobAssignment::Spider {
                job_id,
                url,
                lease_time,
                timeout,
            } => {
                debug!(%job_id, %url, timeout, "Got job");
                self.process(LeaseRef { job_id, lease_time }, &url).await
            }
            JobAssignment::Crawl(token) => self.crawl(token).await,
            JobAssignment::NoJob(token) => {
                debug!(crawl_id = token.crawl_id, "Nothing to do");
                self.stats.idle += 1;
                self.pause().await;
                Ok(())
            }
        }
    }

    async fn process(&mut self, lease: LeaseRef, url: &str) -> fleet::Result<()> {
        self.pause().await;

        let lease_time = match self.client.update_job(&lease).await {
            Ok(lease_time) => lease_time,
            Err(e) if is_rejected(&e) => {
                warn!(job_id = %lease.job_id, error = %e, "Lease lost");
                self.stats.stale += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let failure_rate = self.config.failure_rate.clamp(0.0, 1.0);
        let (reason, reason_data) = if self.rng.gen_bool(failure_rate) {
            (
                FailureReason::Other(self.rng.gen_range(2..10)),
                format!("synthetic failure processing {url}"),
            )
        } else {
            (FailureReason::Success, String::new())
        };

        let report = JobReport {
            lease: LeaseRef {
                job_id: lease.job_id,
                lease_time,
            },
            reason,
            reason_data,
        };
        match self.client.finish_job(&report).await {
            Ok(()) if reason.is_success() => self.stats.finished += 1,
            Ok(()) => self.stats.failed += 1,
            Err(e) if is_rejected(&e) => {
                warn!(job_id = %report.lease.job_id, error = %e, "Lease lost");
                self.stats.stale += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn crawl(&mut self, token: CrawlToken) -> fleet::Result<()> {
        let jobs = (0..self.config.crawl_jobs)
            .map(|_| {
                NewJob::new(
                    format!("https://example.com/project/{}", self.rng.gen::<u32>()),
                    self.rng.gen_range(0..100),
                    60,
                )
            })
            .collect();
        let languages = LANGUAGES
            .iter()
            .map(|language| ((*language).to_owned(), self.rng.gen_range(0..100_000)))
            .collect();
        let data = CrawlData {
            token,
            languages,
            jobs,
        };

        match self.client.upload_crawl_data(&data).await {
            Ok(()) => {
                info!(crawl_id = token.crawl_id, jobs = data.jobs.len(), "Crawl uploaded");
                self.stats.crawled += 1;
            }
            Err(e) if is_rejected(&e) => {
                warn!(token = token.token, error = %e, "Crawl superseded");
                self.stats.stale += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn pause(&mut self) {
        if self.config.delay.is_zero() {
            return;
        }
        let max = u64::try_from(self.config.delay.as_millis()).unwrap_or(u64::MAX);
        sleep(Duration::from_millis(self.rng.gen_range(0..max))).await;
    }
}

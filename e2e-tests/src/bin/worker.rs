use clap::Parser;
use derive_more::Display;
use error_stack::{Context, IntoReport, Report, ResultExt};
use fleet_e2e::worker::{Worker, WorkerConfig};
use rand::{prelude::StdRng, SeedableRng};
use std::{io, time::Duration};
use tracing::info;
use tracing_subscriber::{prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Display)]
#[display(fmt = "application error")]
pub struct AppError;

impl Context for AppError {}

pub type AppResult<T> = error_stack::Result<T, AppError>;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(flatten)]
    pub common: fleet_e2e::Opts,

    /// Max milliseconds spent on a single job
    #[clap(long, default_value = "1000")]
    pub delay: u64,

    #[clap(long, default_value = "1")]
    pub workers: u64,

    #[clap(long = "client-id", default_value = "worker")]
    pub client_id: String,

    #[clap(long = "crawl-jobs", default_value = "20")]
    pub crawl_jobs: usize,

    #[clap(long = "failure-rate", default_value = "0.05")]
    pub failure_rate: f64,

    /// Stop after this many requests per worker
    #[clap(long)]
    pub iterations: Option<u64>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            delay: Duration::from_millis(self.delay),
            crawl_jobs: self.crawl_jobs,
            failure_rate: self.failure_rate,
        }
    }
}

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(atty::is(atty::Stream::Stderr))
                .with_writer(io::stderr),
        )
        .init();

    let opts = Opts::from_args();

    let mut join: Vec<tokio::task::JoinHandle<Result<(), Report<AppError>>>> = vec![];

    for i in 0..opts.workers {
        let opts = opts.clone();
        join.push(tokio::spawn(async move {
            let client_id = format!("{}-{i}", opts.client_id);
            let client = fleet::tokio::RawClient::connect(opts.common.server_addr, client_id)
                .await
                .report()
                .change_context(AppError)?;

            let mut worker = Worker::new(client, opts.worker_config(), StdRng::from_entropy());
            let stats = worker
                .run(opts.iterations)
                .await
                .report()
                .change_context(AppError)?;

            info!(worker = i, ?stats, "Worker done");
            Ok(())
        }));
    }

    for join in join {
        join.await.report().change_context(AppError)??;
    }

    Ok(())
}

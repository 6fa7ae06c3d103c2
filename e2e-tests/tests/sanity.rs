use fleet_e2e::worker::{Worker, WorkerConfig};
use fleetd::{Node, Parameters};
use rand::{prelude::StdRng, SeedableRng};
use std::time::Duration;
use tokio::test;

fn config() -> WorkerConfig {
    WorkerConfig {
        delay: Duration::ZERO,
        crawl_jobs: 10,
        failure_rate: 0.0,
    }
}

fn leader() -> anyhow::Result<Node> {
    Node::new(
        Parameters::builder()
            .assume_leader(true)
            .min_queued_jobs(5)
            .build(),
    )
}

#[test(flavor = "multi_thread")]
async fn worker_crawls_and_drains_jobs() -> anyhow::Result<()> {
    let node = leader()?;

    let client = fleet::tokio::RawClient::connect(node.local_addr(), "sanity").await?;
    let mut worker = Worker::new(client, config(), StdRng::seed_from_u64(7));
    let stats = worker.run(Some(40)).await?;

    assert!(1 <= stats.crawled, "{stats:?}");
    assert!(10 <= stats.finished, "{stats:?}");
    assert_eq!(stats.stale, 0);
    assert_eq!(stats.idle, 0);
    Ok(())
}

#[test(flavor = "multi_thread")]
async fn worker_on_a_follower() -> anyhow::Result<()> {
    let leader = leader()?;
    let follower = Node::new(Parameters::builder().seeds(vec![leader.me()]).build())?;
    assert!(!follower.is_leader());

    let client = fleet::tokio::RawClient::connect(follower.local_addr(), "sanity").await?;
    let mut worker = Worker::new(
        client,
        WorkerConfig {
            failure_rate: 0.5,
            ..config()
        },
        StdRng::seed_from_u64(11),
    );
    let stats = worker.run(Some(30)).await?;

    assert!(1 <= stats.crawled, "{stats:?}");
    assert!(1 <= stats.finished + stats.failed, "{stats:?}");
    assert_eq!(stats.stale, 0);
    Ok(())
}

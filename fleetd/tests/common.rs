#![allow(unused)]

use anyhow::{bail, Result};
use fleetd::retry::RetryPolicy;
use fleetd::Parameters;
use fleetd_api::Peer;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

/// Parameters with timings short enough for tests
pub fn test_params(seeds: Vec<Peer>) -> Parameters {
    Parameters::builder()
        .assume_leader(seeds.is_empty())
        .seeds(seeds)
        .heartbeat_period(Duration::from_millis(50))
        .leader_timeout(Duration::from_secs(1))
        .leader_dropout_wait(Duration::from_millis(100))
        .join_timeout(Duration::from_secs(1))
        .lease_sweep_period(Duration::from_millis(100))
        .min_queued_jobs(1)
        .store_retry(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
        })
        .build()
}

pub struct TestNode {
    node: Option<fleetd::Node>,
}

impl TestNode {
    /// A node leading its own cluster
    pub fn new() -> Result<Self> {
        Self::with_params(test_params(vec![]))
    }

    /// A node joining through `seeds`
    pub fn join(seeds: &[&TestNode]) -> Result<Self> {
        Self::with_params(test_params(seeds.iter().map(|n| n.peer()).collect()))
    }

    pub fn with_params(params: Parameters) -> Result<Self> {
        Ok(Self {
            node: Some(fleetd::Node::new(params)?),
        })
    }

    pub fn from_node(node: fleetd::Node) -> Self {
        Self { node: Some(node) }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.node().get_ctrl().local_addr()
    }

    pub fn peer(&self) -> Peer {
        self.node().me()
    }

    pub fn node(&self) -> &fleetd::Node {
        self.node.as_ref().expect("Node was already dropped")
    }

    pub fn new_client(&self) -> Result<fleet::std::RawClient> {
        Ok(fleet::std::RawClient::connect(self.local_addr(), "test")?)
    }

    pub async fn new_client_async(&self) -> Result<fleet::tokio::RawClient> {
        Ok(fleet::tokio::RawClient::connect(self.local_addr(), "test").await?)
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.node().get_ctrl().stop();
        self.node.take();
    }
}

/// Poll `cond` until it holds or `timeout` runs out
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let start = Instant::now();
    while !cond() {
        if timeout < start.elapsed() {
            bail!("condition not met within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}

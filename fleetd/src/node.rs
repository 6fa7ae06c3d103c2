mod job_handler;
mod lease_sweeper;
mod peer_handler;
mod request_handler;

use crate::node::job_handler::{JobHandler, JobSettings};
use crate::node::peer_handler::CoordinatorState;
use crate::node::request_handler::RequestHandler;
use crate::retry::RetryPolicy;
use crate::stats::{Stats, TracingStats};
use crate::store::{JobStore, MemJobStore};
use crate::task::PanicGuard;
use fleetd_api::{Delimiters, Peer};
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use std::io;
use thiserror::Error;
use tracing::{debug, error, info, trace};
use typed_builder::TypedBuilder;

pub use self::job_handler::{JobError, JobResult};
pub use self::peer_handler::Role;

/// Some parameters of runtime operation
#[derive(TypedBuilder, Debug, Clone)]
pub struct Parameters {
    #[builder(default = Parameters::DEFAULT_BIND_ADDR)]
    pub bind: SocketAddr,

    /// Host other nodes reach this one at; defaults to the bound ip
    #[builder(default)]
    pub advertise: Option<String>,

    /// Nodes to try joining, in order
    #[builder(default)]
    pub seeds: Vec<Peer>,

    /// Skip joining and lead right away
    #[builder(default = false)]
    pub assume_leader: bool,

    /// Job store location
    #[builder(default = Peer::new(Parameters::DEFAULT_DB_ADDR, Parameters::DEFAULT_DB_PORT))]
    pub db: Peer,

    #[builder(default)]
    pub delimiters: Delimiters,

    #[builder(default = Parameters::DEFAULT_HEARTBEAT_PERIOD)]
    pub heartbeat_period: Duration,

    /// A follower that hears nothing from the leader for this long drops it
    #[builder(default = Parameters::DEFAULT_LEADER_TIMEOUT)]
    pub leader_timeout: Duration,

    /// How long a follower waits before joining a successor
    #[builder(default = Parameters::DEFAULT_LEADER_DROPOUT_WAIT)]
    pub leader_dropout_wait: Duration,

    /// Bound on connecting and on each join handshake
    #[builder(default = Parameters::DEFAULT_JOIN_TIMEOUT)]
    pub join_timeout: Duration,

    #[builder(default = Parameters::DEFAULT_LEASE_SWEEP_PERIOD)]
    pub lease_sweep_period: Duration,

    #[builder(default = Parameters::DEFAULT_CRAWL_COOLDOWN)]
    pub crawl_cooldown: Duration,

    #[builder(default = Parameters::DEFAULT_MIN_QUEUED_JOBS)]
    pub min_queued_jobs: u64,

    #[builder(default = Parameters::DEFAULT_MAX_JOB_RETRIES)]
    pub max_job_retries: u32,

    /// Seconds
    #[builder(default = Parameters::DEFAULT_JOB_TIMEOUT)]
    pub default_job_timeout: i64,

    /// Retries around job store calls
    #[builder(default)]
    pub store_retry: RetryPolicy,
}

impl Parameters {
    pub const DEFAULT_PORT: u16 = fleetd_api::DEFAULT_PORT;
    pub const DEFAULT_BIND_ADDR: SocketAddr =
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    pub const DEFAULT_DB_ADDR: &'static str = "cassandra";
    pub const DEFAULT_DB_PORT: u16 = 8002;
    pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);
    pub const DEFAULT_LEADER_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DEFAULT_LEADER_DROPOUT_WAIT: Duration = Duration::from_secs(1);
    pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_LEASE_SWEEP_PERIOD: Duration = Duration::from_secs(10);
    pub const DEFAULT_CRAWL_COOLDOWN: Duration = Duration::from_secs(150);
    pub const DEFAULT_MIN_QUEUED_JOBS: u64 = 500;
    pub const DEFAULT_MAX_JOB_RETRIES: u32 = 3;
    pub const DEFAULT_JOB_TIMEOUT: i64 = 3600;

    fn job_settings(&self) -> JobSettings {
        JobSettings {
            delimiters: self.delimiters,
            min_queued_jobs: self.min_queued_jobs,
            max_job_retries: self.max_job_retries,
            crawl_cooldown: self.crawl_cooldown,
            default_job_timeout: self.default_job_timeout,
            retry: self.store_retry,
        }
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("job store error: {0}")]
    Store(#[from] JobError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

pub struct NodeShared {
    params: Parameters,

    is_node_shutting_down: Arc<AtomicBool>,

    /// Set when the node stopped because it could not find a leader
    has_failed: Arc<AtomicBool>,

    /// Role and membership, see [`peer_handler`]
    state: Mutex<CoordinatorState>,

    jobs: JobHandler,

    stats: Arc<dyn Stats>,
}

impl NodeShared {
    pub fn panic_guard(&self, name: &'static str) -> PanicGuard {
        PanicGuard::new(name, self.is_node_shutting_down.clone())
    }

    pub fn is_node_shutting_down(&self) -> bool {
        self.is_node_shutting_down.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    /// Give up; the node can't continue
    pub fn fail(&self) {
        error!("Node failed, shutting down");
        self.has_failed.store(true, Ordering::SeqCst);
        self.stop();
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().expect("Locking failed")
    }

    /// Run the startup sequence: connect the job store, then find or become the leader
    async fn start(self: &Arc<Self>, local_addr: SocketAddr) -> NodeResult<()> {
        debug!(db = %self.params.db, "Connecting to job store");
        self.jobs.connect(&self.params.db).await?;
        peer_handler::start(self, local_addr).await;
        Ok(())
    }
}

pub struct NodeCtrl {
    is_node_shutting_down: Arc<AtomicBool>,
    has_failed: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl NodeCtrl {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.is_node_shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed.load(Ordering::SeqCst)
    }

    pub fn install_signal_handler(&self) -> anyhow::Result<()> {
        debug!("Installing signal handler");
        for sig in TERM_SIGNALS {
            trace!(sig, "Installing signal handler");
            flag::register(*sig, Arc::clone(&self.is_node_shutting_down))?;
        }
        Ok(())
    }
}

pub struct Node {
    is_node_shutting_down: Arc<AtomicBool>,
    stop_on_drop: bool,
    shared: Arc<NodeShared>,
    /// Tokio executor running the listener, connections and background tasks
    request_handler: RequestHandler,
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.stop_on_drop {
            self.is_node_shutting_down.store(true, Ordering::SeqCst);
        }
    }
}

impl Node {
    /// Start a node with an in-memory job store
    pub fn new(params: Parameters) -> anyhow::Result<Self> {
        Self::with_backends(params, Arc::new(MemJobStore::new()), Arc::new(TracingStats))
    }

    /// Start a node and block until it is either leading or following
    pub fn with_backends(
        params: Parameters,
        store: Arc<dyn JobStore>,
        stats: Arc<dyn Stats>,
    ) -> anyhow::Result<Self> {
        info!(
            bind = %params.bind,
            seeds = ?params.seeds,
            assume_leader = params.assume_leader,
            "Starting fleetd"
        );

        let is_node_shutting_down = Arc::new(AtomicBool::new(false));

        let shared = Arc::new(NodeShared {
            jobs: JobHandler::new(params.job_settings(), store, stats.clone()),
            stats,
            state: Mutex::new(CoordinatorState::default()),
            is_node_shutting_down: is_node_shutting_down.clone(),
            has_failed: Arc::new(AtomicBool::new(false)),
            params: params.clone(),
        });

        let request_handler = RequestHandler::new(shared.clone(), params.bind)?;

        Ok(Node {
            stop_on_drop: true,
            shared,
            request_handler,
            is_node_shutting_down,
        })
    }

    pub fn get_ctrl(&self) -> NodeCtrl {
        NodeCtrl {
            is_node_shutting_down: Arc::clone(&self.is_node_shutting_down),
            has_failed: Arc::clone(&self.shared.has_failed),
            local_addr: self.request_handler.local_addr(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.request_handler.local_addr()
    }

    pub fn is_leader(&self) -> bool {
        self.shared.state().is_leader()
    }

    pub fn role(&self) -> Role {
        self.shared.state().role.clone()
    }

    /// Identity of this node as known to the cluster
    pub fn me(&self) -> Peer {
        self.shared.state().me.clone()
    }

    /// Every member this node knows of, itself included
    pub fn current_peers(&self) -> Vec<Peer> {
        self.shared.state().current_peers()
    }

    pub fn crawl_id(&self) -> i32 {
        self.shared.jobs.crawl_id()
    }

    pub fn wait(mut self) {
        self.stop_on_drop = false;
        drop(self);
        info!("Node finished");
    }
}

//! Leader election and membership
//!
//! A node either finds a leader through its seeds and follows it, or leads
//! itself. The leader keeps one socket per follower (the one the follower
//! joined on) and pushes heartbeats with membership changes over it.
//! Followers keep an ordered view of the membership; when the leader goes
//! away, the first member of that view takes over.
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use std::{io, iter, mem};

use fleetd_api::peer::{Heartbeat, JoinResponse, MembershipDelta, PeerMessageError};
use fleetd_api::{encode_request, RequestCode, Response};
use fleetd_api::{Delimiters, Peer};
use futures::stream::{self, StreamExt};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::lease_sweeper::LeaseSweeper;
use super::NodeShared;
use crate::task::spawn_guarded;
use crate::wire::{self, ConnectionError, ConnectionResult, FrameWriter, ReadResult, Request, WireConnection};

/// Redirects followed within one join attempt
const MAX_REDIRECTS: usize = 8;

/// Attempts at joining each successor candidate
const SUCCESSOR_JOIN_ATTEMPTS: usize = 5;

/// Followers written to at the same time by the heartbeat sender
const MAX_CONCURRENT_HEARTBEATS: usize = 32;

/// Bound on waits that must not block a shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("connection: {0}")]
    Connection(#[from] ConnectionError),
    #[error("timeout")]
    Timeout,
    #[error("refused: {0}")]
    Refused(String),
    #[error("invalid join response: {0}")]
    Invalid(#[from] PeerMessageError),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("redirected to self")]
    RedirectedToSelf,
}

impl From<tokio::time::error::Elapsed> for JoinError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        JoinError::Timeout
    }
}

pub type JoinResult<T> = std::result::Result<T, JoinError>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Role {
    #[default]
    Unstarted,
    AttemptingJoin,
    Leader,
    Follower {
        leader: Peer,
    },
}

/// A follower connected to the leader
#[derive(Clone)]
pub struct ActivePeer {
    peer: Peer,
    /// Writing side of the socket the follower joined on
    writer: FrameWriter,
}

/// Role and membership of one node
///
/// Only ever touched under [`NodeShared::state`], and never across an `.await`.
#[derive(Default)]
pub struct CoordinatorState {
    pub role: Role,
    pub me: Peer,
    /// Follower only: known members, in join order
    view: Vec<Peer>,
    /// Leader only: connected followers, in join order
    active: Vec<ActivePeer>,
    /// Leader only: changes to broadcast with the next heartbeat
    pending: Vec<MembershipDelta>,
}

impl CoordinatorState {
    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader(&self) -> Option<Peer> {
        match &self.role {
            Role::Leader => Some(self.me.clone()),
            Role::Follower { leader } => Some(leader.clone()),
            Role::Unstarted | Role::AttemptingJoin => None,
        }
    }

    /// Every known member, leader first and without duplicates
    pub fn current_peers(&self) -> Vec<Peer> {
        let others: Vec<Peer> = match &self.role {
            Role::Leader => self.active.iter().map(|a| a.peer.clone()).collect(),
            Role::Follower { .. } => self.view.clone(),
            Role::Unstarted | Role::AttemptingJoin => vec![],
        };

        let mut seen = HashSet::new();
        self.leader()
            .into_iter()
            .chain(others)
            .chain(iter::once(self.me.clone()))
            .filter(|peer| seen.insert(peer.clone()))
            .collect()
    }

    fn apply(&mut self, delta: &MembershipDelta) {
        match delta {
            MembershipDelta::Added(peer) => {
                if !self.view.contains(peer) {
                    self.view.push(peer.clone());
                }
            }
            MembershipDelta::Removed(peer) => self.view.retain(|p| p != peer),
        }
    }

    /// Register a joined follower; a rejoin swaps the socket but keeps its place
    fn add_active(&mut self, peer: Peer, writer: FrameWriter) {
        match self.active.iter_mut().find(|a| a.peer == peer) {
            Some(active) => active.writer = writer,
            None => self.active.push(ActivePeer {
                peer: peer.clone(),
                writer,
            }),
        }
        self.pending.push(MembershipDelta::Added(peer));
    }

    /// Drop a follower whose socket failed, remembering to tell the others
    fn remove_active(&mut self, writer: &FrameWriter) {
        if let Some(pos) = self.active.iter().position(|a| a.writer.is_same(writer)) {
            // order is kept: joiners get a snapshot of this list as their view
            let removed = self.active.remove(pos);
            info!(peer = %removed.peer, "Peer removed");
            self.pending.push(MembershipDelta::Removed(removed.peer));
        }
    }
}

/// A successful join handshake
pub struct Joined {
    leader: Peer,
    you: Peer,
    members: Vec<Peer>,
    conn: WireConnection,
    writer: FrameWriter,
}

/// How this node identifies itself before a leader tells it otherwise
///
/// Without an advertised address and with a wildcard bind, the address is
/// left empty and the leader fills in what it sees.
fn initial_identity(advertise: Option<&str>, local_addr: SocketAddr) -> Peer {
    match advertise {
        Some(address) => Peer::new(address, local_addr.port()),
        None if local_addr.ip().is_unspecified() => Peer::new("", local_addr.port()),
        None => Peer::new(local_addr.ip().to_string(), local_addr.port()),
    }
}

/// Identity claimed by a joining node; an empty address means "as seen by you"
fn joiner_identity(body: &[u8], remote: SocketAddr, d: &Delimiters) -> Option<Peer> {
    let body = std::str::from_utf8(body).ok()?;
    let body = body.strip_suffix(d.entry_char()).unwrap_or(body);
    let mut fields = d.fields(body);
    let (address, port) = (fields.next()?, fields.next()?);
    if fields.next().is_some() {
        return None;
    }
    if address.is_empty() {
        Peer::from_fields(&remote.ip().to_string(), port)
    } else {
        Peer::from_fields(address, port)
    }
}

fn is_self(seed: &Peer, me: &Peer, local_addr: SocketAddr) -> bool {
    seed == me
        || (seed.port == local_addr.port() && seed.address == local_addr.ip().to_string())
}

/// Find a leader among the seeds, or become one
pub(super) async fn start(shared: &Arc<NodeShared>, local_addr: SocketAddr) {
    let params = &shared.params;
    let me = initial_identity(params.advertise.as_deref(), local_addr);
    {
        let mut state = shared.state();
        state.me = me.clone();
        state.role = Role::AttemptingJoin;
    }

    if params.assume_leader || params.seeds.is_empty() {
        become_leader(shared).await;
        return;
    }

    for seed in &params.seeds {
        if is_self(seed, &me, local_addr) {
            trace!(%seed, "Skipping self");
            continue;
        }
        match connect_to_leader(shared, seed).await {
            Ok(joined) => {
                let conn = follow(shared, joined);
                spawn_guarded(
                    "heartbeat-listener",
                    shared.is_node_shutting_down.clone(),
                    run_follower(shared.clone(), conn),
                );
                return;
            }
            Err(e) => info!(%seed, error = %e, "Could not join through seed"),
        }
    }

    info!("No seed led to a leader");
    become_leader(shared).await;
}

/// Join handshake against `target`, following redirects
pub(super) async fn connect_to_leader(shared: &NodeShared, target: &Peer) -> JoinResult<Joined> {
    let params = &shared.params;
    let d = params.delimiters;
    let me = shared.state().me.clone();
    let mut target = target.clone();

    for _ in 0..MAX_REDIRECTS {
        debug!(%target, "Attempting to join");
        let stream = timeout(
            params.join_timeout,
            TcpStream::connect((target.address.as_str(), target.port)),
        )
        .await??;
        let (mut conn, writer) = wire::split(stream, d)?;

        writer
            .write_frame(&encode_request(
                RequestCode::Connect.as_str(),
                &me.to_string(),
                me.encode(&d).as_bytes(),
                &d,
            ))
            .await?;

        let response = timeout(params.join_timeout, conn.read_response())
            .await??
            .ok_or(ConnectionError::Disconnected)?;
        if !response.is_success() {
            return Err(JoinError::Refused(response.message_str().into_owned()));
        }

        match JoinResponse::parse(&response.message_str(), &d)? {
            JoinResponse::Accepted { you, members } => {
                return Ok(Joined {
                    leader: target,
                    you,
                    members,
                    conn,
                    writer,
                });
            }
            JoinResponse::Redirect(leader) => {
                debug!(%target, %leader, "Redirected");
                if leader == me {
                    return Err(JoinError::RedirectedToSelf);
                }
                target = leader;
            }
        }
    }

    Err(JoinError::TooManyRedirects)
}

/// Record a successful join; returns the connection to listen on
fn follow(shared: &NodeShared, joined: Joined) -> FollowerConn {
    let Joined {
        leader,
        you,
        members,
        conn,
        writer,
    } = joined;

    let mut state = shared.state();
    state.role = Role::Follower {
        leader: leader.clone(),
    };
    state.me = you.clone();
    state.view.clear();
    for peer in members.into_iter().chain(iter::once(you)) {
        state.apply(&MembershipDelta::Added(peer));
    }
    info!(%leader, me = %state.me, view = ?state.view, "Following leader");

    FollowerConn {
        leader,
        conn,
        _writer: writer,
    }
}

pub(super) async fn become_leader(shared: &Arc<NodeShared>) {
    if let Err(e) = shared.jobs.load_crawl_id().await {
        warn!(error = %e, "Could not load crawl id, keeping the cached one");
    }

    let me = {
        let mut state = shared.state();
        state.role = Role::Leader;
        state.view.clear();
        state.me.clone()
    };
    if me.address.is_empty() {
        warn!("Leading without a known address; set one with --advertise");
    }
    info!(%me, crawl_id = shared.jobs.crawl_id(), "Became leader");

    spawn_guarded(
        "heartbeat-sender",
        shared.is_node_shutting_down.clone(),
        send_heartbeats(shared.clone()),
    );
    LeaseSweeper::spawn(shared.clone());
}

/// Leader side of `conn`
///
/// Writes the response itself, so it can't be overtaken by a heartbeat
/// on the same socket.
pub(super) async fn handle_join(
    shared: &NodeShared,
    body: &[u8],
    remote: SocketAddr,
    writer: &FrameWriter,
) -> Option<Response> {
    let d = shared.params.delimiters;
    let Some(peer) = joiner_identity(body, remote, &d) else {
        return Some(Response::client_error("Incorrect amount of arguments."));
    };

    let mut socket = writer.lock().await;
    let response = {
        let mut state = shared.state();
        match state.role.clone() {
            Role::Leader => {
                let members = state
                    .active
                    .iter()
                    .map(|a| a.peer.clone())
                    .filter(|p| *p != peer)
                    .collect();
                state.add_active(peer.clone(), writer.clone());
                info!(%peer, "Peer joined");
                Response::success(JoinResponse::Accepted { you: peer, members }.encode(&d))
            }
            Role::Follower { leader } => {
                debug!(%peer, %leader, "Redirecting join");
                Response::success(JoinResponse::Redirect(leader).encode(&d))
            }
            Role::Unstarted | Role::AttemptingJoin => {
                Response::server_error("Not ready to accept peers.")
            }
        }
    };

    if let Err(e) = socket.write_all(&response.encode(&d)).await {
        debug!(error = %e, "Could not answer join");
    }
    None
}

/// Relay a leader-only request to the leader over a fresh connection
pub(super) async fn forward(shared: &NodeShared, req: &Request) -> Response {
    let leader = {
        let state = shared.state();
        match &state.role {
            Role::Follower { leader } => leader.clone(),
            Role::Leader | Role::Unstarted | Role::AttemptingJoin => {
                return Response::server_error("No leader known.");
            }
        }
    };

    match forward_to(shared, &leader, req).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%leader, code = %req.code, error = %e, "Forwarding failed");
            Response::server_error("Unable to reach the leader.")
        }
    }
}

async fn forward_to(shared: &NodeShared, leader: &Peer, req: &Request) -> ConnectionResult<Response> {
    let d = shared.params.delimiters;
    let stream = timeout(
        shared.params.join_timeout,
        TcpStream::connect((leader.address.as_str(), leader.port)),
    )
    .await??;
    let (mut conn, writer) = wire::split(stream, d)?;
    writer
        .write_frame(&encode_request(&req.code, &req.client, &req.body, &d))
        .await?;
    conn.read_response()
        .await?
        .ok_or(ConnectionError::Disconnected)
}

async fn send_heartbeats(shared: Arc<NodeShared>) {
    let _guard = scopeguard::guard((), |_| {
        info!("HeartbeatSender is done");
    });
    let d = shared.params.delimiters;
    let mut ticker = interval(shared.params.heartbeat_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let write_timeout = shared.params.heartbeat_period.max(SHUTDOWN_POLL);

    while !shared.is_node_shutting_down() {
        if timeout(SHUTDOWN_POLL, ticker.tick()).await.is_err() {
            continue;
        }

        let (frame, targets) = {
            let mut state = shared.state();
            let heartbeat = Heartbeat {
                crawl_id: shared.jobs.crawl_id(),
                deltas: mem::take(&mut state.pending),
            };
            let frame = encode_request(
                RequestCode::Heartbeat.as_str(),
                &state.me.to_string(),
                heartbeat.encode(&d).as_bytes(),
                &d,
            );
            (frame, state.active.clone())
        };
        trace!(followers = targets.len(), "Sending heartbeat");

        let frame = &frame;
        let failed: Vec<ActivePeer> = stream::iter(targets)
            .map(|target| async move {
                match timeout(write_timeout, target.writer.write_frame(frame)).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        debug!(peer = %target.peer, error = %e, "Heartbeat write failed");
                        Some(target)
                    }
                    Err(_) => {
                        debug!(peer = %target.peer, "Heartbeat write timed out");
                        Some(target)
                    }
                }
            })
            .buffer_unordered(MAX_CONCURRENT_HEARTBEATS)
            .filter_map(|failed| async move { failed })
            .collect()
            .await;

        if !failed.is_empty() {
            let mut state = shared.state();
            for target in &failed {
                state.remove_active(&target.writer);
            }
        }
    }

    shared.state().active.clear();
}

/// Socket a follower listens for heartbeats on
pub struct FollowerConn {
    leader: Peer,
    conn: WireConnection,
    /// Kept so our side of the socket stays open
    _writer: FrameWriter,
}

enum LeaderLost {
    Disconnected,
    Silent,
    Error(ConnectionError),
}

enum Succession {
    Follow(Joined),
    Lead,
}

/// Heartbeat listener, including takeover when the leader goes away
async fn run_follower(shared: Arc<NodeShared>, mut current: FollowerConn) {
    let _guard = scopeguard::guard((), |_| {
        info!("HeartbeatListener is done");
    });

    loop {
        let Some(reason) = listen(&shared, &mut current.conn).await else {
            return;
        };
        match reason {
            LeaderLost::Disconnected => warn!(leader = %current.leader, "Leader disconnected"),
            LeaderLost::Silent => warn!(leader = %current.leader, "Leader went silent"),
            LeaderLost::Error(e) => warn!(leader = %current.leader, error = %e, "Leader connection failed"),
        }

        match find_successor(&shared).await {
            Some(Succession::Follow(joined)) => current = follow(&shared, joined),
            Some(Succession::Lead) => {
                become_leader(&shared).await;
                return;
            }
            None => {
                if !shared.is_node_shutting_down() {
                    shared.fail();
                }
                return;
            }
        }
    }
}

/// Apply heartbeats until the leader is lost; `None` on shutdown
async fn listen(shared: &NodeShared, conn: &mut WireConnection) -> Option<LeaderLost> {
    let leader_timeout = shared.params.leader_timeout;
    let mut last_heard = Instant::now();

    while !shared.is_node_shutting_down() {
        match timeout(SHUTDOWN_POLL, conn.has_data()).await {
            Err(_) => {
                if leader_timeout < last_heard.elapsed() {
                    return Some(LeaderLost::Silent);
                }
                continue;
            }
            Ok(Ok(false)) => return Some(LeaderLost::Disconnected),
            Ok(Err(e)) => return Some(LeaderLost::Error(e.into())),
            Ok(Ok(true)) => {}
        }

        let req = match timeout(leader_timeout, conn.read_request()).await {
            Err(_) => return Some(LeaderLost::Silent),
            Ok(Err(e)) => return Some(LeaderLost::Error(e)),
            Ok(Ok(ReadResult::Disconnected)) => return Some(LeaderLost::Disconnected),
            Ok(Ok(ReadResult::Rejected(e))) => {
                debug!(error = %e, "Bad frame from leader");
                continue;
            }
            Ok(Ok(ReadResult::Request(req))) => req,
        };
        last_heard = Instant::now();

        if req.code != RequestCode::Heartbeat.as_str() {
            debug!(code = %req.code, "Ignoring unexpected frame from leader");
            continue;
        }
        let heartbeat = match std::str::from_utf8(&req.body)
            .map_err(|_| PeerMessageError::MissingFields)
            .and_then(|body| Heartbeat::parse(body, &shared.params.delimiters))
        {
            Ok(heartbeat) => heartbeat,
            Err(e) => {
                debug!(error = %e, "Invalid heartbeat");
                continue;
            }
        };

        trace!(crawl_id = heartbeat.crawl_id, deltas = heartbeat.deltas.len(), "Heartbeat");
        shared.jobs.set_cached_crawl_id(heartbeat.crawl_id);
        if !heartbeat.deltas.is_empty() {
            let mut state = shared.state();
            for delta in &heartbeat.deltas {
                state.apply(delta);
            }
            debug!(view = ?state.view, "Membership updated");
        }
    }

    None
}

/// Walk the view in order: lead if we come first, otherwise join the first
/// member that accepts us
async fn find_successor(shared: &NodeShared) -> Option<Succession> {
    let dropout_wait = shared.params.leader_dropout_wait;
    let (me, candidates) = {
        let mut state = shared.state();
        state.role = Role::AttemptingJoin;
        (state.me.clone(), state.view.clone())
    };

    sleep(dropout_wait).await;

    for candidate in candidates {
        if candidate == me {
            info!("First in line, taking over");
            return Some(Succession::Lead);
        }
        for attempt in 0..SUCCESSOR_JOIN_ATTEMPTS {
            if shared.is_node_shutting_down() {
                return None;
            }
            match connect_to_leader(shared, &candidate).await {
                Ok(joined) => return Some(Succession::Follow(joined)),
                Err(e) => {
                    debug!(%candidate, attempt, error = %e, "Successor not ready");
                    sleep(dropout_wait).await;
                }
            }
        }
        warn!(%candidate, "Giving up on successor");
    }

    None
}

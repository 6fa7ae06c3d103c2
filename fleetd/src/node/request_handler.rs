use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use fleetd_api::{Peer, RequestCode, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace};

use super::job_handler::JobResult;
use super::{peer_handler, NodeError, NodeShared};
use crate::task::AutoJoinHandle;
use crate::wire::{self, ConnectionResult, FrameWriter, ReadResult, Request};

pub struct RequestHandler {
    local_addr: SocketAddr,
    #[allow(unused)]
    join_handle: AutoJoinHandle,
}

impl RequestHandler {
    /// Bind, start accepting and run the node startup sequence
    ///
    /// Returns once the node is leading or following.
    pub fn new(shared: Arc<NodeShared>, listen_addr: SocketAddr) -> anyhow::Result<Self> {
        let inner = Arc::new(RequestHandlerInner { shared });

        let rt = tokio::runtime::Runtime::new()?;

        let (tx, rx) = flume::bounded(1);

        let join_handle =
            AutoJoinHandle::spawn_res("request-handler", move || -> Result<(), io::Error> {
                let _guard = scopeguard::guard((), |_| {
                    info!("RequestHandler is done");
                });
                let res: Result<(), io::Error> = rt.block_on(async {
                    let listener = match TcpListener::bind(listen_addr).await {
                        Ok(listener) => listener,
                        Err(e) => {
                            tx.send(Err(NodeError::from(e)))
                                .expect("local_addr rx not there?");
                            return Ok(());
                        }
                    };
                    let local_addr = listener.local_addr()?;
                    info!(%local_addr, "Listening");

                    let accept_loop = tokio::spawn({
                        let inner = inner.clone();
                        async move { inner.handle_requests(listener).await }
                    });

                    let started = inner.shared.start(local_addr).await.map(|()| local_addr);
                    if started.is_err() {
                        inner.shared.stop();
                    }
                    tx.send(started).expect("local_addr rx not there?");

                    if let Err(e) = accept_loop.await {
                        error!(error = %e, "Accept loop failed");
                    }
                    Ok(())
                });

                res?;

                info!("Waiting for RequestHandler to complete all connections...");
                rt.shutdown_timeout(Duration::from_secs(10));

                Ok(())
            })?;

        let local_addr = rx.recv()??;

        Ok(Self {
            join_handle,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct RequestHandlerInner {
    shared: Arc<NodeShared>,
}

impl RequestHandlerInner {
    async fn handle_requests(self: &Arc<Self>, listener: TcpListener) {
        let guard = self.shared.panic_guard("accept-loop");
        while !self.shared.is_node_shutting_down() {
            let (stream, peer_addr) =
                // bound by a timeout, so we can exit after shutdown is requested in a reasonable time
                match timeout(Duration::from_millis(500), listener.accept()).await {
                    Ok(Ok(o)) => o,
                    Ok(Err(e)) => {
                        error!(%e, "request handling listener accept error");
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                    Err(_) => {
                        // just a timeout
                        continue;
                    }
                };

            debug!(%peer_addr, "New connection");

            let self_copy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = self_copy.handle_connection(stream, peer_addr).await {
                    info!(%peer_addr, "Connection error: {}", e);
                }
            });
        }
        guard.done();
    }

    /// Serve frames until the peer disconnects
    ///
    /// A frame with a bad header is answered with a client error; the
    /// connection carries on with the next one.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> ConnectionResult<()> {
        let local = stream.local_addr()?;
        let (mut conn, writer) = wire::split(stream, self.shared.params.delimiters)?;

        while !self.shared.is_node_shutting_down() {
            match timeout(Duration::from_millis(500), conn.has_data()).await {
                Err(_) => continue,
                Ok(Ok(false)) => break,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(true)) => {}
            }

            let response = match conn.read_request().await? {
                ReadResult::Disconnected => break,
                ReadResult::Rejected(e) => {
                    debug!(%remote, error = %e, "Rejected frame");
                    Some(Response::client_error(e.to_string()))
                }
                ReadResult::Request(req) => self.dispatch(req, remote, local, &writer).await,
            };

            if let Some(response) = response {
                writer.write_response(&response).await?;
            }
        }

        trace!(%remote, "Connection closed");
        Ok(())
    }

    /// Route one request; `None` if the handler already answered on `writer`
    async fn dispatch(
        &self,
        req: Request,
        remote: SocketAddr,
        local: SocketAddr,
        writer: &FrameWriter,
    ) -> Option<Response> {
        let shared = &self.shared;

        let Some(code) = RequestCode::from_code(&req.code) else {
            debug!(code = %req.code, client = %req.client, "Unknown request type");
            return Some(Response::client_error("Unknown request type."));
        };
        trace!(code = code.as_str(), client = %req.client, len = req.body.len(), "Request");

        let (me, is_leader) = {
            let state = shared.state();
            (state.me.clone(), state.is_leader())
        };

        // counted by the leader once it gets there
        if code.is_leader_only() && !is_leader {
            return Some(peer_handler::forward(shared, &req).await);
        }
        shared.stats.record_request(&me, &req.client, code);

        let response = match code {
            RequestCode::Connect => {
                return peer_handler::handle_join(shared, &req.body, remote, writer).await;
            }
            RequestCode::Heartbeat => Response::client_error("Heartbeat not expected."),
            RequestCode::GetIps => self.get_ips(local),
            RequestCode::UploadJobs
            | RequestCode::UploadCrawlData
            | RequestCode::GetJob
            | RequestCode::UpdateJob
            | RequestCode::FinishJob => match std::str::from_utf8(&req.body) {
                Ok(body) => self.handle_job_request(code, &me, &req.client, body).await,
                Err(_) => Response::client_error("Payload is not valid utf-8."),
            },
        };
        Some(response)
    }

    /// `local` stands in for our own address when we don't know it
    fn get_ips(&self, local: SocketAddr) -> Response {
        let d = self.shared.params.delimiters;
        let peers = self.shared.state().current_peers();
        let mut message = String::new();
        for mut peer in peers {
            if peer.address.is_empty() {
                peer.address = local.ip().to_string();
            }
            message.push_str(&peer.encode(&d));
            message.push(d.entry_char());
        }
        Response::success(message)
    }

    async fn handle_job_request(
        &self,
        code: RequestCode,
        me: &Peer,
        client: &str,
        body: &str,
    ) -> Response {
        let jobs = &self.shared.jobs;
        let d = self.shared.params.delimiters;

        let res: JobResult<String> = match code {
            RequestCode::UploadJobs => jobs.upload_jobs(body).await.map(str::to_owned),
            RequestCode::UploadCrawlData => jobs.upload_crawl_data(body).await.map(str::to_owned),
            RequestCode::GetJob => jobs.get_job().await.map(|assignment| assignment.encode(&d)),
            RequestCode::UpdateJob => jobs.update_job(body).await.map(|lease| lease.to_string()),
            RequestCode::FinishJob => jobs.finish_job(me, client, body).await.map(str::to_owned),
            RequestCode::Connect | RequestCode::GetIps | RequestCode::Heartbeat => {
                return Response::client_error("Unknown request type.");
            }
        };

        match res {
            Ok(message) => Response::success(message),
            Err(e) => {
                debug!(code = code.as_str(), client, error = %e, "Job request failed");
                e.into_response()
            }
        }
    }
}

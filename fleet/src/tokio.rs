use async_trait::async_trait;
use fleetd_api::{
    encode_request, CrawlData, Delimiters, HeaderError, JobAssignment, JobReport, LeaseRef, NewJob,
    PayloadError, Peer, RequestCode, Response,
};
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{check_response, parse_peers, Error, Result};

#[async_trait]
pub trait Client {
    async fn get_job(&mut self) -> Result<JobAssignment>;
    async fn update_job(&mut self, lease: &LeaseRef) -> Result<i64>;
    async fn finish_job(&mut self, report: &JobReport) -> Result<()>;
    async fn upload_jobs(&mut self, jobs: &[NewJob]) -> Result<()>;
    async fn upload_crawl_data(&mut self, data: &CrawlData) -> Result<()>;
    async fn get_ips(&mut self) -> Result<Vec<Peer>>;
}

/// Async `fleetd` client
pub struct RawClient {
    client_id: String,
    delimiters: Delimiters,
    conn: BufReader<TcpStream>,
}

#[async_trait]
impl Client for RawClient {
    async fn get_job(&mut self) -> Result<JobAssignment> {
        let response = self.request_ok(RequestCode::GetJob, b"").await?;
        Ok(JobAssignment::parse(
            &response.message_str(),
            &self.delimiters,
        )?)
    }

    async fn update_job(&mut self, lease: &LeaseRef) -> Result<i64> {
        let body = lease.encode(&self.delimiters);
        let response = self
            .request_ok(RequestCode::UpdateJob, body.as_bytes())
            .await?;
        i64::from_str(response.message_str().trim()).map_err(|_| PayloadError::JobTime.into())
    }

    async fn finish_job(&mut self, report: &JobReport) -> Result<()> {
        let body = report.encode(&self.delimiters);
        self.request_ok(RequestCode::FinishJob, body.as_bytes())
            .await?;
        Ok(())
    }

    async fn upload_jobs(&mut self, jobs: &[NewJob]) -> Result<()> {
        let body = NewJob::encode_batch(jobs, &self.delimiters);
        self.request_ok(RequestCode::UploadJobs, body.as_bytes())
            .await?;
        Ok(())
    }

    async fn upload_crawl_data(&mut self, data: &CrawlData) -> Result<()> {
        let body = data.encode(&self.delimiters);
        self.request_ok(RequestCode::UploadCrawlData, body.as_bytes())
            .await?;
        Ok(())
    }

    async fn get_ips(&mut self) -> Result<Vec<Peer>> {
        let response = self.request_ok(RequestCode::GetIps, b"").await?;
        parse_peers(&response.message_str(), &self.delimiters)
    }
}

impl RawClient {
    pub async fn connect(server_addr: SocketAddr, client_id: impl Into<String>) -> Result<Self> {
        debug!(?server_addr, "Connecting to fleetd");
        let conn = TcpStream::connect(server_addr).await?;
        trace!(?server_addr, "Connected");

        conn.set_nodelay(true)?;

        Ok(Self {
            client_id: client_id.into(),
            delimiters: Delimiters::default(),
            conn: BufReader::new(conn),
        })
    }

    pub async fn request(&mut self, code: RequestCode, body: &[u8]) -> Result<Response> {
        let frame = encode_request(code.as_str(), &self.client_id, body, &self.delimiters);
        self.conn.get_mut().write_all(&frame).await?;

        let mut header = vec![];
        self.conn
            .read_until(self.delimiters.entry, &mut header)
            .await?;
        if header.last() != Some(&self.delimiters.entry) {
            return Err(Error::Disconnected);
        }
        header.pop();

        let header = String::from_utf8(header).map_err(|_| HeaderError::NotUtf8)?;
        let (status, len) = Response::parse_header(&header, &self.delimiters)?;

        let mut message = vec![0; len];
        self.conn.read_exact(&mut message).await?;

        Ok(Response { status, message })
    }

    async fn request_ok(&mut self, code: RequestCode, body: &[u8]) -> Result<Response> {
        check_response(self.request(code, body).await?)
    }
}

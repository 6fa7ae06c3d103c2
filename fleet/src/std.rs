use fleetd_api::{
    encode_request, CrawlData, Delimiters, JobAssignment, JobReport, LeaseRef, NewJob, Peer,
    RequestCode, Response,
};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::str::FromStr;
use tracing::{debug, trace};

use super::{check_response, parse_peers, Error, Result};

pub trait Client {
    /// Ask for a job lease, or a crawl directive
    fn get_job(&mut self) -> Result<JobAssignment>;
    /// Renew a lease; returns the new lease time
    fn update_job(&mut self, lease: &LeaseRef) -> Result<i64>;
    /// Report a leased job as done or failed
    fn finish_job(&mut self, report: &JobReport) -> Result<()>;
    /// Enqueue new jobs
    fn upload_jobs(&mut self, jobs: &[NewJob]) -> Result<()>;
    /// Upload the results of a crawl directive
    fn upload_crawl_data(&mut self, data: &CrawlData) -> Result<()>;
    /// Current cluster members
    fn get_ips(&mut self) -> Result<Vec<Peer>>;
}

/// `fleetd` client over a single blocking connection
pub struct RawClient {
    client_id: String,
    delimiters: Delimiters,
    conn: BufReader<TcpStream>,
}

impl Client for RawClient {
    fn get_job(&mut self) -> Result<JobAssignment> {
        let response = self.request_ok(RequestCode::GetJob, b"")?;
        Ok(JobAssignment::parse(
            &response.message_str(),
            &self.delimiters,
        )?)
    }

    fn update_job(&mut self, lease: &LeaseRef) -> Result<i64> {
        let body = lease.encode(&self.delimiters);
        let response = self.request_ok(RequestCode::UpdateJob, body.as_bytes())?;
        i64::from_str(response.message_str().trim())
            .map_err(|_| Error::Decoding(fleetd_api::PayloadError::JobTime))
    }

    fn finish_job(&mut self, report: &JobReport) -> Result<()> {
        let body = report.encode(&self.delimiters);
        self.request_ok(RequestCode::FinishJob, body.as_bytes())?;
        Ok(())
    }

    fn upload_jobs(&mut self, jobs: &[NewJob]) -> Result<()> {
        let body = NewJob::encode_batch(jobs, &self.delimiters);
        self.request_ok(RequestCode::UploadJobs, body.as_bytes())?;
        Ok(())
    }

    fn upload_crawl_data(&mut self, data: &CrawlData) -> Result<()> {
        let body = data.encode(&self.delimiters);
        self.request_ok(RequestCode::UploadCrawlData, body.as_bytes())?;
        Ok(())
    }

    fn get_ips(&mut self) -> Result<Vec<Peer>> {
        let response = self.request_ok(RequestCode::GetIps, b"")?;
        parse_peers(&response.message_str(), &self.delimiters)
    }
}

impl RawClient {
    pub fn connect(server_addr: SocketAddr, client_id: impl Into<String>) -> Result<Self> {
        Self::connect_with(server_addr, client_id, Delimiters::default())
    }

    pub fn connect_with(
        server_addr: SocketAddr,
        client_id: impl Into<String>,
        delimiters: Delimiters,
    ) -> Result<Self> {
        debug!(?server_addr, "Connecting to fleetd");
        let conn = TcpStream::connect(server_addr)?;
        trace!(?server_addr, "Connected");

        // We always prepare exact buffers to be sent immediately
        conn.set_nodelay(true)?;

        Ok(Self {
            client_id: client_id.into(),
            delimiters,
            conn: BufReader::new(conn),
        })
    }

    /// Send one request and read back its response, whatever the status
    pub fn request(&mut self, code: RequestCode, body: &[u8]) -> Result<Response> {
        let frame = encode_request(code.as_str(), &self.client_id, body, &self.delimiters);
        self.send_raw(&frame)?;
        self.read_response()
    }

    fn request_ok(&mut self, code: RequestCode, body: &[u8]) -> Result<Response> {
        check_response(self.request(code, body)?)
    }

    /// Write arbitrary bytes to the connection
    ///
    /// Useful to exercise the server with frames the typed API can't produce.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.conn.get_mut().write_all(bytes)?;
        Ok(())
    }

    /// Read one response frame
    pub fn read_response(&mut self) -> Result<Response> {
        let mut header = vec![];
        self.conn.read_until(self.delimiters.entry, &mut header)?;
        if header.last() != Some(&self.delimiters.entry) {
            return Err(Error::Disconnected);
        }
        header.pop();

        let header = String::from_utf8(header).map_err(|_| fleetd_api::HeaderError::NotUtf8)?;
        let (status, len) = Response::parse_header(&header, &self.delimiters)?;

        let mut message = vec![0; len];
        self.conn.read_exact(&mut message)?;

        trace!(?status, len, "Response");
        Ok(Response { status, message })
    }
}

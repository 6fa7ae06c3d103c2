use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::borrow::Cow;
use std::str::FromStr;
use thiserror::Error;

use crate::Delimiters;

/// Longest header line (without the terminator) a node will scan for
pub const MAX_HEADER_LEN: usize = 1024;

/// Request code
///
/// Every request starts with a 4 character code naming the operation.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum RequestCode {
    /// A node joining the cluster
    Connect,
    /// List current cluster members
    GetIps,
    /// Enqueue a batch of jobs
    UploadJobs,
    /// Results of a crawl directive
    UploadCrawlData,
    /// Acquire a job lease or a crawl directive
    GetJob,
    /// Renew a job lease
    UpdateJob,
    /// Complete or fail a leased job
    FinishJob,
    /// Leader to follower membership update
    Heartbeat,
}

impl RequestCode {
    pub const ALL: [RequestCode; 8] = [
        RequestCode::Connect,
        RequestCode::GetIps,
        RequestCode::UploadJobs,
        RequestCode::UploadCrawlData,
        RequestCode::GetJob,
        RequestCode::UpdateJob,
        RequestCode::FinishJob,
        RequestCode::Heartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestCode::Connect => "conn",
            RequestCode::GetIps => "gtip",
            RequestCode::UploadJobs => "upjb",
            RequestCode::UploadCrawlData => "upcd",
            RequestCode::GetJob => "gtjb",
            RequestCode::UpdateJob => "udjb",
            RequestCode::FinishJob => "fnjb",
            RequestCode::Heartbeat => "hrtb",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == code)
    }

    /// Only the leader may act on these; followers forward them
    pub fn is_leader_only(self) -> bool {
        !matches!(self, RequestCode::Connect | RequestCode::Heartbeat)
    }
}

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum HeaderError {
    #[error("Header too short.")]
    TooShort,
    #[error("Header too long.")]
    TooLong,
    #[error("Invalid body length: {0}")]
    InvalidLength(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Header is not valid utf-8.")]
    NotUtf8,
}

/// Parsed request header line
///
/// `code F client F length`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub code: String,
    pub client: String,
    pub body_len: usize,
}

impl RequestHeader {
    /// Parse a header line, without its terminator
    pub fn parse(line: &str, delimiters: &Delimiters) -> Result<Self, HeaderError> {
        let mut fields = delimiters.fields(line);
        let (Some(code), Some(client), Some(len)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(HeaderError::TooShort);
        };

        Ok(Self {
            code: code.to_owned(),
            client: client.to_owned(),
            body_len: parse_len(len)?,
        })
    }
}

fn parse_len(len: &str) -> Result<usize, HeaderError> {
    usize::from_str(len.trim()).map_err(|_| HeaderError::InvalidLength(len.to_owned()))
}

/// Build a complete request frame
pub fn encode_request(code: &str, client: &str, body: &[u8], delimiters: &Delimiters) -> Vec<u8> {
    let mut frame = format!(
        "{code}{f}{client}{f}{len}",
        f = delimiters.field_char(),
        len = body.len()
    )
    .into_bytes();
    frame.push(delimiters.entry);
    frame.extend_from_slice(body);
    frame
}

/// Response status class
#[derive(IntoPrimitive, TryFromPrimitive, Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u16)]
pub enum Status {
    Success = 200,
    ClientError = 400,
    ServerError = 500,
}

/// A response: status plus a message
///
/// Framed as `status F length E message`, the same convention requests use,
/// so a response can be read off a connection that stays open and relayed
/// byte for byte when forwarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: Vec<u8>,
}

impl Response {
    pub fn new(status: Status, message: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<Vec<u8>>) -> Self {
        Self::new(Status::Success, message)
    }

    pub fn client_error(message: impl Into<Vec<u8>>) -> Self {
        Self::new(Status::ClientError, message)
    }

    pub fn server_error(message: impl Into<Vec<u8>>) -> Self {
        Self::new(Status::ServerError, message)
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn message_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.message)
    }

    pub fn encode(&self, delimiters: &Delimiters) -> Vec<u8> {
        let mut frame = format!(
            "{}{}{}",
            u16::from(self.status),
            delimiters.field_char(),
            self.message.len()
        )
        .into_bytes();
        frame.push(delimiters.entry);
        frame.extend_from_slice(&self.message);
        frame
    }

    /// Parse a response header line into status and message length
    pub fn parse_header(line: &str, delimiters: &Delimiters) -> Result<(Status, usize), HeaderError> {
        let mut fields = delimiters.fields(line);
        let (Some(status), Some(len)) = (fields.next(), fields.next()) else {
            return Err(HeaderError::TooShort);
        };
        let status = u16::from_str(status)
            .ok()
            .and_then(|s| Status::try_from(s).ok())
            .ok_or_else(|| HeaderError::InvalidStatus(status.to_owned()))?;

        Ok((status, parse_len(len)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_parse() {
        let d = Delimiters::default();
        assert_eq!(
            RequestHeader::parse("gtjb?worker-1?0", &d),
            Ok(RequestHeader {
                code: "gtjb".into(),
                client: "worker-1".into(),
                body_len: 0,
            })
        );
        assert_eq!(
            RequestHeader::parse("gtjb?worker-1", &d),
            Err(HeaderError::TooShort)
        );
        assert_eq!(
            RequestHeader::parse("gtjb?worker-1?-3", &d),
            Err(HeaderError::InvalidLength("-3".into()))
        );
        assert_eq!(
            RequestHeader::parse("gtjb?w?x", &d),
            Err(HeaderError::InvalidLength("x".into()))
        );
    }

    #[test]
    fn request_frame_layout() {
        let d = Delimiters::default();
        assert_eq!(
            encode_request("upjb", "c", b"a?1?2\n", &d),
            b"upjb?c?6\na?1?2\n".to_vec()
        );

        let custom = Delimiters {
            field: b'|',
            entry: b';',
        };
        assert_eq!(encode_request("gtjb", "c", b"", &custom), b"gtjb|c|0;".to_vec());
    }

    #[test]
    fn response_frame_layout() {
        let d = Delimiters::default();
        let resp = Response::client_error("Header too short.");
        assert_eq!(resp.encode(&d), b"400?17\nHeader too short.".to_vec());
        assert_eq!(
            Response::parse_header("400?17", &d),
            Ok((Status::ClientError, 17))
        );
        assert_eq!(
            Response::parse_header("201?0", &d),
            Err(HeaderError::InvalidStatus("201".into()))
        );
    }

    #[test]
    fn request_codes() {
        for code in RequestCode::ALL {
            assert_eq!(RequestCode::from_code(code.as_str()), Some(code));
            assert_eq!(code.as_str().len(), 4);
        }
        assert_eq!(RequestCode::from_code("upld"), None);
        assert!(!RequestCode::Connect.is_leader_only());
        assert!(RequestCode::GetJob.is_leader_only());
    }
}

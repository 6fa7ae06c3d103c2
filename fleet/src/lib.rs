pub mod std;
#[cfg(feature = "tokio")]
pub mod tokio;

mod error {
    use ::std::io;
    use fleetd_api::{HeaderError, PayloadError, Status};
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("server closed the connection")]
        Disconnected,
        #[error("io error: {0}")]
        Io(#[from] io::Error),
        #[error("invalid response header: {0}")]
        Header(#[from] HeaderError),
        #[error("data decoding error: {0}")]
        Decoding(#[from] PayloadError),
        #[error("request failed ({status:?}): {message}")]
        Status { status: Status, message: String },
    }
}

pub use self::error::Error;
pub type Result<T> = ::std::result::Result<T, Error>;

use fleetd_api::PayloadError;
pub use fleetd_api::{
    CrawlData, CrawlToken, Delimiters, FailureReason, JobAssignment, JobReport, LeaseRef, NewJob,
    Peer, RequestCode, Response, Status,
};

/// Turn a non-success response into an `Error`
fn check_response(response: Response) -> Result<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(Error::Status {
            status: response.status,
            message: response.message_str().into_owned(),
        })
    }
}

/// Decode a `gtip` answer
fn parse_peers(message: &str, d: &Delimiters) -> Result<Vec<Peer>> {
    d.entries(message)
        .map(|entry| {
            let mut fields = d.fields(entry);
            let peer = match (fields.next(), fields.next()) {
                (Some(address), Some(port)) => Peer::from_fields(address, port),
                _ => None,
            };
            peer.ok_or(Error::Decoding(PayloadError::ArgumentCount))
        })
        .collect()
}

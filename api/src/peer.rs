//! Node to node messages: join handshake and heartbeats
use std::str::FromStr;
use thiserror::Error;

use crate::{Delimiters, Peer};

/// Marks a join response from the actual leader
pub const RESPONSE_OK: &str = "ok";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerMessageError {
    #[error("missing fields")]
    MissingFields,
    #[error("invalid peer: {0}")]
    InvalidPeer(String),
    #[error("invalid crawl id: {0}")]
    InvalidCrawlId(String),
    #[error("invalid membership change: {0}")]
    InvalidDelta(String),
}

pub type PeerMessageResult<T> = std::result::Result<T, PeerMessageError>;

/// Membership change, as accumulated by the leader between heartbeats
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipDelta {
    Added(Peer),
    Removed(Peer),
}

impl MembershipDelta {
    const ADDED: &'static str = "A";
    const REMOVED: &'static str = "R";

    pub fn peer(&self) -> &Peer {
        match self {
            MembershipDelta::Added(peer) | MembershipDelta::Removed(peer) => peer,
        }
    }
}

/// Leader to follower heartbeat: `crawl_id (F A|R F address F port)*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub crawl_id: i32,
    pub deltas: Vec<MembershipDelta>,
}

impl Heartbeat {
    pub fn encode(&self, d: &Delimiters) -> String {
        let mut out = self.crawl_id.to_string();
        for delta in &self.deltas {
            let kind = match delta {
                MembershipDelta::Added(_) => MembershipDelta::ADDED,
                MembershipDelta::Removed(_) => MembershipDelta::REMOVED,
            };
            out.push(d.field_char());
            out.push_str(kind);
            out.push(d.field_char());
            out.push_str(&delta.peer().encode(d));
        }
        out
    }

    pub fn parse(body: &str, d: &Delimiters) -> PeerMessageResult<Self> {
        let body = body.strip_suffix(d.entry_char()).unwrap_or(body);
        let fields: Vec<_> = d.fields(body).collect();
        let (crawl_id, rest) = fields
            .split_first()
            .ok_or(PeerMessageError::MissingFields)?;
        let crawl_id = i32::from_str(crawl_id.trim())
            .map_err(|_| PeerMessageError::InvalidCrawlId((*crawl_id).to_owned()))?;

        if rest.len() % 3 != 0 {
            return Err(PeerMessageError::MissingFields);
        }

        let deltas = rest
            .chunks(3)
            .map(|chunk| {
                let peer = parse_peer(chunk[1], chunk[2])?;
                match chunk[0] {
                    MembershipDelta::ADDED => Ok(MembershipDelta::Added(peer)),
                    MembershipDelta::REMOVED => Ok(MembershipDelta::Removed(peer)),
                    other => Err(PeerMessageError::InvalidDelta(other.to_owned())),
                }
            })
            .collect::<PeerMessageResult<_>>()?;

        Ok(Self { crawl_id, deltas })
    }
}

/// Answer to a join request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinResponse {
    /// Responder is the leader
    ///
    /// `you` is how the leader sees the joiner, `members` all the other
    /// nodes currently connected to the leader.
    Accepted { you: Peer, members: Vec<Peer> },
    /// Responder is a follower; this is who it thinks the leader is
    Redirect(Peer),
}

impl JoinResponse {
    pub fn encode(&self, d: &Delimiters) -> String {
        match self {
            JoinResponse::Accepted { you, members } => {
                let mut out = RESPONSE_OK.to_owned();
                for peer in std::iter::once(you).chain(members) {
                    out.push(d.field_char());
                    out.push_str(&peer.encode(d));
                }
                out
            }
            JoinResponse::Redirect(leader) => leader.encode(d),
        }
    }

    pub fn parse(message: &str, d: &Delimiters) -> PeerMessageResult<Self> {
        let fields: Vec<_> = d.fields(message).collect();
        match fields.as_slice() {
            [RESPONSE_OK, rest @ ..] => {
                if rest.len() < 2 || rest.len() % 2 != 0 {
                    return Err(PeerMessageError::MissingFields);
                }
                let mut peers = rest
                    .chunks(2)
                    .map(|pair| parse_peer(pair[0], pair[1]))
                    .collect::<PeerMessageResult<Vec<_>>>()?;
                let you = peers.remove(0);
                Ok(JoinResponse::Accepted {
                    you,
                    members: peers,
                })
            }
            [address, port] => Ok(JoinResponse::Redirect(parse_peer(address, port)?)),
            _ => Err(PeerMessageError::MissingFields),
        }
    }
}

fn parse_peer(address: &str, port: &str) -> PeerMessageResult<Peer> {
    Peer::from_fields(address, port)
        .ok_or_else(|| PeerMessageError::InvalidPeer(format!("{address}:{port}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_wire_format() {
        let d = Delimiters::default();
        let hb = Heartbeat {
            crawl_id: 7,
            deltas: vec![
                MembershipDelta::Added(Peer::new("10.0.0.2", 8003)),
                MembershipDelta::Removed(Peer::new("10.0.0.3", 8004)),
            ],
        };
        assert_eq!(hb.encode(&d), "7?A?10.0.0.2?8003?R?10.0.0.3?8004");
        assert_eq!(Heartbeat::parse("7?A?10.0.0.2?8003?R?10.0.0.3?8004", &d), Ok(hb));
        assert_eq!(
            Heartbeat::parse("0", &d),
            Ok(Heartbeat {
                crawl_id: 0,
                deltas: vec![]
            })
        );
        assert_eq!(
            Heartbeat::parse("0?X?h?1", &d),
            Err(PeerMessageError::InvalidDelta("X".into()))
        );
        assert_eq!(
            Heartbeat::parse("0?A?h", &d),
            Err(PeerMessageError::MissingFields)
        );
    }

    #[test]
    fn join_response_wire_format() {
        let d = Delimiters::default();
        assert_eq!(
            JoinResponse::parse("ok?10.0.0.5?8003?10.0.0.2?8003", &d),
            Ok(JoinResponse::Accepted {
                you: Peer::new("10.0.0.5", 8003),
                members: vec![Peer::new("10.0.0.2", 8003)],
            })
        );
        assert_eq!(
            JoinResponse::parse("10.0.0.1?8003", &d),
            Ok(JoinResponse::Redirect(Peer::new("10.0.0.1", 8003)))
        );
        assert_eq!(
            JoinResponse::parse("ok", &d),
            Err(PeerMessageError::MissingFields)
        );
        assert!(JoinResponse::parse("10.0.0.1?port", &d).is_err());
    }
}

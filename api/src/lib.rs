//! Wire protocol shared by `fleetd` nodes and their clients
//!
//! Everything on the wire is text split by two single-byte separators
//! (see [`Delimiters`]). Requests and responses are both framed with a
//! short header line carrying the payload length, so payloads
//! themselves are binary safe.
use derive_more::Display;
use std::str::FromStr;

mod net;
pub use self::net::*;

mod job;
pub use self::job::*;

pub mod peer;

/// Default port a node listens on and seeds are contacted at
pub const DEFAULT_PORT: u16 = 8003;

/// Separators used to encode fields and entries of every payload
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Delimiters {
    /// Separates fields within one entry (and the parts of a header)
    pub field: u8,
    /// Separates entries, and terminates every frame header
    pub entry: u8,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: Self::DEFAULT_FIELD,
            entry: Self::DEFAULT_ENTRY,
        }
    }
}

impl Delimiters {
    pub const DEFAULT_FIELD: u8 = b'?';
    pub const DEFAULT_ENTRY: u8 = b'\n';

    pub fn field_char(&self) -> char {
        char::from(self.field)
    }

    pub fn entry_char(&self) -> char {
        char::from(self.entry)
    }

    pub fn fields<'a>(&self, s: &'a str) -> std::str::Split<'a, char> {
        s.split(self.field_char())
    }

    /// Non-empty entries of `s`
    ///
    /// Payloads conventionally end with an entry delimiter, so empty
    /// entries carry no information.
    pub fn entries<'a>(&self, s: &'a str) -> impl Iterator<Item = &'a str> {
        s.split(self.entry_char()).filter(|e| !e.is_empty())
    }

    pub fn join_fields<I, S>(&self, fields: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = String::new();
        for (i, field) in fields.into_iter().enumerate() {
            if i != 0 {
                out.push(self.field_char());
            }
            out.push_str(field.as_ref());
        }
        out
    }
}

/// Cluster member identity
///
/// Peers are compared by value: two peers are the same node
/// if and only if address and port match.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display(fmt = "{}:{}", address, port)]
pub struct Peer {
    pub address: String,
    pub port: u16,
}

impl Peer {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// `address F port`
    pub fn encode(&self, delimiters: &Delimiters) -> String {
        format!(
            "{}{}{}",
            self.address,
            delimiters.field_char(),
            self.port
        )
    }

    /// Build from the two wire fields
    pub fn from_fields(address: &str, port: &str) -> Option<Self> {
        if address.is_empty() {
            return None;
        }
        Some(Self::new(address, u16::from_str(port.trim()).ok()?))
    }

    /// Parse `host` or `host:port`, using `default_port` for the former
    pub fn parse_host_port(s: &str, default_port: u16) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && !host.ends_with(':') => {
                Some(Self::new(host, u16::from_str(port).ok()?))
            }
            Some(_) => None,
            None => Some(Self::new(s, default_port)),
        }
    }
}

#[test]
fn parse_host_port_test() {
    assert_eq!(
        Peer::parse_host_port("10.0.0.1", 8003),
        Some(Peer::new("10.0.0.1", 8003))
    );
    assert_eq!(
        Peer::parse_host_port(" db-1:9000 ", 8003),
        Some(Peer::new("db-1", 9000))
    );
    assert_eq!(Peer::parse_host_port("", 8003), None);
    assert_eq!(Peer::parse_host_port("host:port", 8003), None);
    assert_eq!(Peer::parse_host_port(":80", 8003), None);
}

#[test]
fn join_fields_test() {
    let d = Delimiters::default();
    assert_eq!(d.join_fields(["a", "b", "c"]), "a?b?c");
    assert_eq!(d.join_fields(Vec::<String>::new()), "");
    assert_eq!(d.entries("a\n\nb\n").collect::<Vec<_>>(), ["a", "b"]);
}

use std::net::SocketAddr;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Opts {
    #[clap(long = "server", env = "FLEETD_SERVER", default_value = "127.0.0.1:8003")]
    pub server_addr: SocketAddr,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

use std::net::Ipv4Addr;

use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Port to accept client connections on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind the listening socket to
    #[arg(short, long)]
    pub listen_addr: Option<Ipv4Addr>,
}

impl Default for Args {
    fn default() -> Self {
        Self::new()
    }
}

impl Args {
    pub fn new() -> Self {
        Self::parse()
    }
}

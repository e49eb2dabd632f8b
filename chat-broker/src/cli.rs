use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::config::{
    BrokerConfig, DEFAULT_INBOUND_CAPACITY, DEFAULT_OUTBOX_CAPACITY, SessionConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the message broker behind a local TCP listener.
    Broker(BrokerArgs),
    /// Connect to a broker and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub listen: SocketAddr,

    /// Messages the shared inbound queue holds before senders wait.
    #[arg(long, default_value_t = DEFAULT_INBOUND_CAPACITY, value_parser = parse_capacity)]
    pub inbound_capacity: usize,

    /// Messages buffered per connected client before deliveries are dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY, value_parser = parse_capacity)]
    pub outbox_capacity: usize,
}

impl BrokerArgs {
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig::with_inbound_capacity(self.inbound_capacity)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::with_outbox_capacity(self.outbox_capacity)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identity to register with the broker.
    #[arg(long)]
    pub id: String,

    /// Address of the broker to connect to.
    #[arg(long, default_value = "127.0.0.1:5000")]
    pub server: SocketAddr,
}

fn parse_capacity(raw: &str) -> Result<usize, String> {
    match raw.parse::<usize>() {
        Ok(0) => Err("capacity must be at least 1".to_string()),
        Ok(capacity) => Ok(capacity),
        Err(err) => Err(err.to_string()),
    }
}

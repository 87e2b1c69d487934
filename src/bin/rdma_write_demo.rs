//! RDMA write demo: the client writes numbered messages straight into the
//! server's buffer; the server busy-polls its memory for content changes
//! and needs no acknowledgements.
//!
//! Server: `rdma_write_demo -s -a <local ip> [-p <port>] [-n <count>]`
//! Client: `rdma_write_demo -c -a <server ip> [-p <port>] [-n <count>]`

use std::net::Ipv4Addr;
use std::process::ExitCode;

use clap::{ArgGroup, Parser};

use onesided::op::OpKind;
use onesided::{session, Config, Role, DEFAULT_COUNT, DEFAULT_PORT};

#[derive(Parser, Debug)]
#[command(name = "rdma_write_demo")]
#[command(about = "One-sided RDMA writes into the server's text buffer")]
#[command(group(ArgGroup::new("role").required(true).args(["server", "client"])))]
struct Args {
    /// Run as server (passive side)
    #[arg(short = 's')]
    server: bool,

    /// Run as client (active side)
    #[arg(short = 'c')]
    client: bool,

    /// Peer IP address (bind address in server mode)
    #[arg(short = 'a')]
    addr: Ipv4Addr,

    /// Primary RDMA port; the descriptor exchange uses port + 1
    #[arg(short = 'p', default_value_t = DEFAULT_PORT,
          value_parser = clap::value_parser!(u16).range(..=65534))]
    port: u16,

    /// Number of messages
    #[arg(short = 'n', default_value_t = DEFAULT_COUNT)]
    count: u32,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let role = if args.server { Role::Server } else { Role::Client };
    let cfg = Config::new(role, args.addr, args.port, args.count);

    let result = match cfg.role {
        Role::Server => session::run_server(&cfg, OpKind::Write).map(|_| ()),
        Role::Client => session::run_client(&cfg, OpKind::Write),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

//! `server <serverId> <configFile>` (§6).
//!
//! Binds the port that `<configFile>` names for `<serverId>` and
//! serves every other server's clients from that one process.

use std::process::ExitCode;

use bank_store::config::{find_server, parse_config_file};
use bank_store::server::Server;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).init();

    let args: Vec<String> = std::env::args().collect();
    let [_, server_id, config_path] = args.as_slice() else {
        eprintln!("usage: server <serverId> <configFile>");
        return ExitCode::FAILURE;
    };

    let entries = match parse_config_file(config_path) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let Some(entry) = find_server(&entries, server_id) else {
        tracing::error!("'{}' does not appear in config file '{}'", server_id, config_path);
        return ExitCode::FAILURE;
    };

    let addr = format!("0.0.0.0:{}", entry.port);
    let server = Server::new();
    if let Err(err) = server.run(&addr).await {
        tracing::error!("server '{}' exited: {}", server_id, err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

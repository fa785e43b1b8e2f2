//! `client <clientId> <configFile>` (§6).
//!
//! Dials every server named in `<configFile>` once, then hands the
//! connections to the [`Dispatcher`] to drive the interactive session
//! for the life of the process.

use std::collections::HashMap;
use std::process::ExitCode;

use bank_store::client::connection::ServerConnection;
use bank_store::client::Dispatcher;
use bank_store::config::parse_config_file;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_target(false).with_thread_ids(true).with_level(true).init();

    let args: Vec<String> = std::env::args().collect();
    let [_, client_id, config_path] = args.as_slice() else {
        eprintln!("usage: client <clientId> <configFile>");
        return ExitCode::FAILURE;
    };

    let entries = match parse_config_file(config_path) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::error!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut connections = HashMap::new();
    for entry in &entries {
        tracing::info!("connecting to server '{}' at {}", entry.name, entry.addr());
        match ServerConnection::connect(&entry.name, &entry.addr()).await {
            Ok(conn) => {
                connections.insert(entry.name.clone(), conn);
            }
            Err(err) => {
                tracing::error!("{}", err);
                return ExitCode::FAILURE;
            }
        }
    }

    let mut dispatcher = Dispatcher::new(client_id.clone(), connections);
    if let Err(err) = dispatcher.run().await {
        tracing::error!("client '{}' exited: {}", client_id, err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

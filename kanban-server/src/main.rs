use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use kanban_sync::{KanbanServer, ServerConfig, TrustStore};

/// Realtime sync server for collaborative kanban boards.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    /// Port to listen on
    #[clap(short, long, default_value = "9090")]
    port: u16,
    /// Board store directory
    #[clap(short, long, env = "KANBAN_DATA", default_value = "kanban_data")]
    data: PathBuf,
    /// Trusted `trust` cookie tokens; enables the handshake gate when given
    #[clap(long = "trust-token", env = "KANBAN_TRUST_TOKENS", value_delimiter = ',')]
    trust_tokens: Vec<String>,
    /// Frames buffered per connection
    #[clap(long, default_value = "256")]
    outbox_capacity: usize,
    /// Answer not-found failures with an Error event
    #[clap(long)]
    report_not_found: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            outbox_capacity: self.outbox_capacity,
            storage_path: self.data.clone(),
            require_trust: !self.trust_tokens.is_empty(),
            report_not_found: self.report_not_found,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config();
    let trust = Arc::new(TrustStore::with_tokens(args.trust_tokens.iter().cloned()));
    if config.require_trust {
        log::info!("Handshake gate enabled with {} trusted tokens", trust.len());
    }

    let server = KanbanServer::open(config, trust)?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                log::error!("Server stopped: {e}");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            log::info!(
                "Shutting down ({} connections served, {} messages)",
                stats.total_connections,
                stats.total_messages
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::try_parse_from(["kanban-server"]).unwrap();
        let config = args.server_config();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbox_capacity, 256);
        assert!(!config.require_trust);
        assert!(!config.report_not_found);
    }

    #[test]
    fn test_trust_tokens_enable_gate() {
        let args = Args::try_parse_from([
            "kanban-server",
            "-H",
            "0.0.0.0",
            "--port",
            "8000",
            "--trust-token",
            "a,b",
            "--report-not-found",
        ])
        .unwrap();
        assert_eq!(args.trust_tokens, vec!["a", "b"]);
        let config = args.server_config();
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert!(config.require_trust);
        assert!(config.report_not_found);
    }
}

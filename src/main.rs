//! Roomdrop relay server
//!
//! Usage:
//!   cargo run -- server                         # Run the relay on $PORT or 4433
//!   cargo run -- server --port 4433             # Run on a specific port

use std::env;
use std::net::SocketAddr;

use anyhow::Context;
use roomdrop::TransferMode;
use roomdrop::server::{DEFAULT_PORT, RelayServer, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "server" => run_server(&args).await?,
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!("Roomdrop - room-based file relay over QUIC");
    println!();
    println!("USAGE:");
    println!("    cargo run -- server [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("    server                       Start the relay server");
    println!("    help                         Show this help message");
    println!();
    println!("OPTIONS:");
    println!("    --port <PORT>                Port to listen on (default: $PORT or 4433)");
    println!("    --max-conn <NUM>             Maximum connections (default: 10000)");
    println!("    --max-direct-size <BYTES>    Largest direct transfer (default: 52428800)");
    println!();
    println!("EXAMPLES:");
    println!("    cargo run -- server");
    println!("    PORT=5000 cargo run -- server");
    println!("    RUST_LOG=debug cargo run -- server --max-direct-size 1048576");
}

/// Value following `flag`, parsed; `Ok(None)` when the flag is absent
fn parse_flag<T>(args: &[String], flag: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let Some(i) = args.iter().position(|a| a == flag) else {
        return Ok(None);
    };
    let raw = args
        .get(i + 1)
        .with_context(|| format!("{} needs a value", flag))?;
    raw.parse()
        .map(Some)
        .with_context(|| format!("invalid value for {}: {}", flag, raw))
}

fn build_config(args: &[String]) -> anyhow::Result<ServerConfig> {
    let mut config = ServerConfig::default();

    let port = match parse_flag::<u16>(args, "--port")? {
        Some(port) => port,
        None => match env::var("PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("invalid PORT: {}", raw))?,
            Err(_) => DEFAULT_PORT,
        },
    };
    config.bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

    if let Some(max) = parse_flag(args, "--max-conn")? {
        config.max_connections = max;
    }
    if let Some(max) = parse_flag(args, "--max-direct-size")? {
        config.transfer.max_direct_size = max;
    }

    Ok(config)
}

async fn run_server(args: &[String]) -> anyhow::Result<()> {
    let config = build_config(args)?;

    info!("Configuration:");
    info!("  - Bind address: {}", config.bind_addr);
    info!("  - Max connections: {}", config.max_connections);
    info!("  - Idle timeout: {:?}", config.idle_timeout);
    let mut policy = config.transfer.clone();
    policy.max_message_size = config.max_frame_size;
    info!("  - Max frame size: {} bytes", config.max_frame_size);
    info!(
        "  - Max direct size: {} bytes",
        policy.limit_for(TransferMode::Direct)
    );
    info!(
        "  - Max chunked size: {} bytes",
        policy.limit_for(TransferMode::Chunked)
    );

    let mut server = RelayServer::new(config);
    let status = server.clone_ref();

    // Periodic stats and room snapshot
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = status.get_stats().await;
            info!(
                "Stats: {} connections, {} rooms, {} active sessions, {} reassembling",
                stats.total_connections,
                stats.total_rooms,
                stats.active_sessions,
                stats.reassembling
            );
            for (room, members) in status.room_snapshot().await {
                info!("  room {}: {} members", room, members.len());
            }
        }
    });

    let result = server.start().await;
    stats_task.abort();

    if let Err(e) = result {
        error!("Server error: {}", e);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_config_flags() {
        let config = build_config(&args(&[
            "roomdrop",
            "server",
            "--port",
            "5000",
            "--max-conn",
            "12",
            "--max-direct-size",
            "1024",
        ]))
        .unwrap();

        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.transfer.max_direct_size, 1024);
    }

    #[test]
    fn test_build_config_rejects_bad_values() {
        assert!(build_config(&args(&["roomdrop", "server", "--port", "nope"])).is_err());
        assert!(build_config(&args(&["roomdrop", "server", "--max-conn"])).is_err());
    }
}

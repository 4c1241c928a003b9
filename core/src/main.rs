//! Capstan CLI
//!
//! Run a backup peer and drive it from a line-oriented console.
//!
//! Usage:
//!   capstan-cli --serve --listen 127.0.0.1:7000                 # first peer
//!   capstan-cli --serve --listen 127.0.0.1:7001 \
//!               --bootstrap 127.0.0.1:7000                      # join a ring
//!
//! Commands are read from stdin (BACKUP, RESTORE, DELETE, RECLAIM, STATE,
//! CHORD, LOOKUP); notifications print as they arrive.

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use capstan_core::{Peer, PeerConfig};

fn print_usage() {
    println!("Capstan Peer v0.1.0");
    println!();
    println!("Usage:");
    println!("  capstan-cli --serve --listen <ADDR>                 Start a new ring");
    println!("  capstan-cli --serve --listen <ADDR> --bootstrap <ADDR>   Join a ring");
    println!();
    println!("Options:");
    println!("  --serve, -s               Run the peer (required)");
    println!("  --listen <ADDR>           Listen address (default: 127.0.0.1:0)");
    println!("  --bootstrap <ADDR>        Peer to join through");
    println!("  --root <PATH>             Storage root (default: capstan_data)");
    println!("  --secret-hex <HEX>        Network secret, 64 hex chars");
    println!("  --capacity <SIZE>         Storage capacity (e.g. 500MB, 2GB)");
    println!("  --testing                 Fast intervals and a fixed dev secret");
    println!("  --help, -h                Show this help");
    println!();
    println!("Console commands:");
    println!("  BACKUP <file> <replication degree>");
    println!("  RESTORE <file>");
    println!("  DELETE <file>");
    println!("  RECLAIM <bytes>           0 evicts all and resets capacity");
    println!("  STATE");
    println!("  CHORD");
    println!("  LOOKUP <guid>");
    println!();
    println!("Environment:");
    println!("  CAPSTAN_SECRET            Network secret (64 hex chars)");
    println!("  RUST_LOG                  Log level (e.g. info, debug)");
}

/// Parse a human-readable size string into bytes (e.g. "500MB", "2GB").
fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let num_end = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (num_str, unit) = s.split_at(num_end);
    let num: f64 = num_str.parse().ok()?;
    let multiplier: u64 = match unit.trim() {
        "" | "B" => 1,
        "KB" | "K" => 1024,
        "MB" | "M" => 1024 * 1024,
        "GB" | "G" => 1024 * 1024 * 1024,
        "TB" | "T" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };
    Some((num * multiplier as f64) as u64)
}

fn parse_secret(hex_str: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&bytes);
    Some(secret)
}

/// Resolve the network secret: --secret-hex, then CAPSTAN_SECRET, then (in
/// testing mode only) a fixed development secret.
fn resolve_secret(arg: Option<&str>, testing: bool) -> [u8; 32] {
    if let Some(hex_str) = arg {
        return parse_secret(hex_str).unwrap_or_else(|| {
            eprintln!("Error: --secret-hex must be exactly 64 hex characters.");
            std::process::exit(1);
        });
    }
    if let Ok(hex_str) = env::var("CAPSTAN_SECRET") {
        return parse_secret(&hex_str).unwrap_or_else(|| {
            eprintln!("Error: CAPSTAN_SECRET must be exactly 64 hex characters.");
            std::process::exit(1);
        });
    }
    if testing {
        return *blake3::hash(b"capstan development secret").as_bytes();
    }
    eprintln!("Error: no network secret configured.");
    eprintln!("  Pass --secret-hex or set CAPSTAN_SECRET, e.g.:");
    eprintln!("  export CAPSTAN_SECRET=$(openssl rand -hex 32)");
    std::process::exit(1);
}

fn handle_command(peer: &Arc<Peer>, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some((command, rest)) = parts.split_first() else {
        return;
    };
    match (command.to_uppercase().as_str(), rest) {
        ("BACKUP", [file, degree]) => match degree.parse::<u32>() {
            Ok(degree) if degree > 0 => peer.backup(*file, degree),
            _ => println!("BACKUP needs a positive replication degree"),
        },
        ("RESTORE", [file]) => peer.restore(*file),
        ("DELETE", [file]) => peer.delete(*file),
        ("RECLAIM", [bytes]) => match bytes.parse::<u64>() {
            Ok(bytes) => peer.reclaim(bytes),
            Err(_) => println!("RECLAIM needs a byte count"),
        },
        ("STATE", []) => peer.state(),
        ("CHORD", []) => peer.chord(),
        ("LOOKUP", [guid]) => match guid.parse::<u32>() {
            Ok(guid) => peer.lookup(guid),
            Err(_) => println!("LOOKUP needs a numeric guid"),
        },
        _ => println!("Unknown command: {} (try --help)", line.trim()),
    }
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    let show_help = args.iter().any(|a| a == "--help" || a == "-h");
    let serve_mode = args.iter().any(|a| a == "--serve" || a == "-s");
    let testing_mode = args.iter().any(|a| a == "--testing");

    let listen_addr: Option<SocketAddr> = args
        .windows(2)
        .find(|w| w[0] == "--listen")
        .and_then(|w| w[1].parse().ok());
    let bootstrap: Option<SocketAddr> = args
        .windows(2)
        .find(|w| w[0] == "--bootstrap")
        .and_then(|w| w[1].parse().ok());
    let root: Option<PathBuf> = args
        .windows(2)
        .find(|w| w[0] == "--root")
        .map(|w| PathBuf::from(&w[1]));
    let secret_arg: Option<String> = args
        .windows(2)
        .find(|w| w[0] == "--secret-hex")
        .map(|w| w[1].clone());
    let capacity: Option<u64> = args.windows(2).find(|w| w[0] == "--capacity").and_then(|w| {
        parse_size(&w[1]).or_else(|| {
            eprintln!("Invalid --capacity value: {} (try 500MB, 2GB)", w[1]);
            None
        })
    });

    if show_help || !serve_mode {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let secret = resolve_secret(secret_arg.as_deref(), testing_mode);

    let mut config = if testing_mode {
        PeerConfig::for_testing()
    } else {
        PeerConfig::default()
    };
    config.secret = secret;
    if let Some(addr) = listen_addr {
        config.listen_addr = addr;
    }
    if let Some(addr) = bootstrap {
        config.bootstrap = Some(addr);
    }
    if let Some(root) = root {
        config.root = root;
    }
    if let Some(bytes) = capacity {
        config.capacity = bytes;
    }

    println!("Starting Capstan peer...");
    let peer = match Peer::start(config).await {
        Ok(peer) => peer,
        Err(e) => {
            eprintln!("Failed to start peer: {}", e);
            std::process::exit(1);
        }
    };

    let reference = peer.reference();
    println!();
    println!("=== Peer Identity ===");
    println!("GUID:    {}", reference.guid);
    println!("Address: {}", reference.addr);
    if let Some(boot) = bootstrap {
        println!("Joined via {}", boot);
    } else {
        println!("Started a new ring");
    }
    println!();
    println!("Type commands (BACKUP/RESTORE/DELETE/RECLAIM/STATE/CHORD/LOOKUP),");
    println!("Ctrl+C to stop.");
    println!();

    // print notifications as they arrive
    if let Some(mut notifications) = peer.notifications().await {
        tokio::spawn(async move {
            while let Some(message) = notifications.recv().await {
                println!("{}", message);
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("received shutdown signal");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_command(&peer, &line),
                Ok(None) => {
                    // stdin closed; keep serving until interrupted
                    tokio::signal::ctrl_c().await.ok();
                    break;
                }
                Err(e) => {
                    eprintln!("stdin error: {}", e);
                    break;
                }
            }
        }
    }

    println!("Shutting down...");
    peer.stop().await;
    println!("Done");
}

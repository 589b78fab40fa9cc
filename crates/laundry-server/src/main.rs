use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use laundry::transport::ServerConfig;
use laundry::{
    LaundryService, MemoryStore, PoolConfig, SqliteStore, Store, SystemClock, VersionInfo,
};

#[derive(Debug, PartialEq, Eq)]
struct Args {
    host: String,
    port: u16,
    machines: Option<u32>,
    db: Option<PathBuf>,
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("LAUNDRY_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "laundry={level},laundry_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn parse_args(
    args: &[String],
    env_port: Option<String>,
    env_db: Option<String>,
) -> Result<Args, String> {
    let defaults = ServerConfig::default();
    let mut parsed = Args {
        host: defaults.host,
        port: match env_port {
            Some(port) => port
                .parse()
                .map_err(|_| format!("PORT is not a valid port: {port}"))?,
            None => defaults.port,
        },
        machines: None,
        db: env_db.filter(|p| !p.is_empty()).map(PathBuf::from),
    };

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--host" => {
                i += 1;
                parsed.host = args.get(i).ok_or("--host requires a value")?.clone();
            }
            "--port" => {
                i += 1;
                let raw = args.get(i).ok_or("--port requires a value")?;
                parsed.port = raw
                    .parse()
                    .map_err(|_| format!("invalid port: {raw}"))?;
            }
            "--machines" => {
                i += 1;
                let raw = args.get(i).ok_or("--machines requires a value")?;
                parsed.machines = Some(
                    raw.parse()
                        .map_err(|_| format!("invalid machine count: {raw}"))?,
                );
            }
            "--db" => {
                i += 1;
                parsed.db = Some(PathBuf::from(args.get(i).ok_or("--db requires a value")?));
            }
            "--help" | "-h" => return Err("".to_string()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(parsed)
}

fn usage(msg: &str) -> ! {
    if !msg.is_empty() {
        eprintln!("error: {msg}");
        eprintln!();
    }
    eprintln!("Usage: laundry-server [--host <addr>] [--port <port>] [--machines <n>] [--db <path>]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --host <addr>     Bind address [default: 0.0.0.0]");
    eprintln!("  --port <port>     Listen port [env: PORT] [default: 5000]");
    eprintln!("  --machines <n>    Number of machines [env: LAUNDRY_MACHINES] [default: 3]");
    eprintln!("  --db <path>       SQLite database file [env: LAUNDRY_DB] [default: in-memory]");
    process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = parse_args(
        &argv,
        std::env::var("PORT").ok(),
        std::env::var("LAUNDRY_DB").ok(),
    )
    .unwrap_or_else(|msg| usage(&msg));

    init_tracing();

    let mut config = PoolConfig::from_env();
    if let Some(machines) = args.machines {
        config = config.with_machines(machines);
    }
    config.validate().context("invalid pool configuration")?;

    let (store, backend): (Arc<dyn Store>, &'static str) = match &args.db {
        Some(path) => {
            tracing::info!(path = %path.display(), "Opening SQLite store");
            let store = SqliteStore::open(path)
                .await
                .with_context(|| format!("failed to open database {}", path.display()))?;
            (Arc::new(store), "sqlite")
        }
        None => {
            tracing::info!("Using in-memory store, state is lost on exit");
            (Arc::new(MemoryStore::new()), "memory")
        }
    };

    let existing = store
        .init_machines(config.machines)
        .await
        .context("failed to initialise machines")?;
    if existing != config.machines as usize {
        tracing::warn!(
            configured = config.machines,
            existing,
            "Store already holds a different number of machines, keeping existing pool"
        );
    }

    let service = Arc::new(
        LaundryService::new(store, Arc::new(SystemClock), config)
            .with_version(VersionInfo::new().with_store(backend)),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(laundry::transport::cancel_on_signal(shutdown.clone()));

    laundry::transport::serve(
        ServerConfig {
            host: args.host,
            port: args.port,
        },
        service,
        shutdown,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("laundry-server")
            .chain(args.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        let args = parse_args(&argv(&[]), None, None).unwrap();
        assert_eq!(
            args,
            Args {
                host: "0.0.0.0".to_string(),
                port: 5000,
                machines: None,
                db: None,
            }
        );
    }

    #[test]
    fn flags_override_environment() {
        let args = parse_args(
            &argv(&["--port", "8080", "--machines", "5", "--db", "/tmp/a.db"]),
            Some("9000".to_string()),
            Some("/tmp/b.db".to_string()),
        )
        .unwrap();
        assert_eq!(args.port, 8080);
        assert_eq!(args.machines, Some(5));
        assert_eq!(args.db, Some(PathBuf::from("/tmp/a.db")));
    }

    #[test]
    fn environment_fills_port_and_db() {
        let args = parse_args(&argv(&[]), Some("7000".to_string()), Some("x.db".to_string()))
            .unwrap();
        assert_eq!(args.port, 7000);
        assert_eq!(args.db, Some(PathBuf::from("x.db")));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_args(&argv(&["--port", "nope"]), None, None).is_err());
        assert!(parse_args(&argv(&["--machines"]), None, None).is_err());
        assert!(parse_args(&argv(&["extra"]), None, None).is_err());
        assert!(parse_args(&argv(&[]), Some("99999".to_string()), None).is_err());
    }
}

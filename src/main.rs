use clap::Parser;
use std::sync::Arc;
use swarmd::config::{Config, LoggingConfig};
use swarmd::network::pnet::PreSharedKey;
use swarmd::node::Node;
use swarmd::orchestrator::Orchestrator;
use swarmd::shutdown::ShutdownManager;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

#[derive(Parser, Debug)]
#[command(name = "swarmd")]
#[command(about = "Private-network pubsub and content-addressed storage node", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "swarmd.toml")]
    config: String,

    #[arg(long)]
    listen_addr: Option<String>,

    /// Extra bootstrap peer (host:port or /ip4/.../tcp/.../p2p/...); repeatable
    #[arg(short, long)]
    bootstrap: Vec<String>,

    #[arg(short, long)]
    verbose: bool,

    /// Write a default config (with a new swarm key) and exit
    #[arg(long)]
    generate_config: bool,

    /// Print a new swarm key file to stdout and exit
    #[arg(long)]
    generate_swarm_key: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_swarm_key {
        print!("{}", PreSharedKey::generate().to_swarm_key_file().as_str());
        return;
    }

    if args.generate_config {
        match Config::generate().save_to_file(&args.config) {
            Ok(()) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    // Print hostname at startup before any logging
    if let Ok(hostname) = hostname::get() {
        if let Ok(hostname_str) = hostname.into_string() {
            let short_name = hostname_str.split('.').next().unwrap_or(&hostname_str);
            eprintln!("\n╔═══════════════════════════════════════════╗");
            eprintln!("║  🖥️  NODE: {:<30} ║", short_name);
            eprintln!("╚═══════════════════════════════════════════╝\n");
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(addr) = args.listen_addr {
        config.network.listen_address = addr;
    }
    config.network.bootstrap_peers.extend(args.bootstrap);

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let build_date = option_env!("BUILD_DATE").unwrap_or("unknown");
    println!("\n🚀 swarmd v{} ({})", version, git_hash);
    println!("  └─ Build: {}", build_date);
    println!("═══════════════════════════════════════════════════════");

    let cancel = CancellationToken::new();
    let mut shutdown_manager = ShutdownManager::new(cancel.clone());

    let node = match Node::from_config(config.clone(), cancel) {
        Ok(node) => Arc::new(node),
        Err(e) => {
            eprintln!("❌ Failed to initialize node: {}", e);
            std::process::exit(1);
        }
    };
    println!("🆔 Peer ID: {}", node.peer_id());

    let listen_addr = match node.start().await {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("❌ Failed to start network: {}", e);
            eprintln!("   (Port may already be in use)");
            std::process::exit(1);
        }
    };
    println!("📡 Listening on {}", listen_addr);
    if config.network.bootstrap_peers.is_empty() {
        println!("🔗 Bootstrap: none");
    } else {
        println!("🔗 Bootstrap: {:?}", config.network.bootstrap_peers);
    }

    shutdown_manager.register_task("bootstrap", node.spawn_bootstrap());

    if config.orchestrator.enabled {
        let orchestrator = Arc::new(Orchestrator::new(node.clone(), &config.orchestrator));
        match orchestrator.spawn() {
            Ok(tasks) => {
                for task in tasks {
                    shutdown_manager.register_task("orchestrator", task);
                }
            }
            Err(e) => {
                eprintln!("❌ Failed to start orchestrator: {}", e);
                node.shutdown();
                std::process::exit(1);
            }
        }
    }

    shutdown_manager.wait_for_shutdown().await;
    node.shutdown();
}

fn setup_logging(config: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    // Get hostname - shorten to first part before dot
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    let (writer, guard, to_file) = match config.output.as_str() {
        "file" => {
            let path = std::path::Path::new(&config.file_path);
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("swarmd.log");
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard), true)
        }
        _ => (BoxMakeWriter::new(std::io::stdout), None, false),
    };

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd && !to_file {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(!to_file)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    guard
}

// UTC time plus short hostname
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        // e.g. "2025-12-10 18:09:43.150 [server1]"
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}

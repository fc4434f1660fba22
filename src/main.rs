//! tunnelkeeper - CLI entry point

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tunnelkeeper::{Daemon, Settings, VERSION};

#[derive(Parser, Debug)]
#[command(name = "tunnelkeeper")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Always-on local SOCKS5 relay that supervises external tunnel engines")]
struct Args {
    /// Control API listen address
    #[arg(long = "addr")]
    addr: Option<String>,

    /// State directory (identity, bind record, engine logs)
    #[arg(long = "state")]
    state: Option<PathBuf>,

    /// Optional YAML settings file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `tunnelkeeper=trace`
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Validate settings and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 8))
        .enable_all()
        .thread_name("tunnelkeeper-worker")
        .build()?;

    runtime.block_on(async_main())
}

fn init_logging(level: Option<&str>) -> anyhow::Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::from_default_env()
            .add_directive("tunnelkeeper=info".parse()?)
            .add_directive("tower_http=info".parse()?),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
    Ok(())
}

async fn async_main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref())?;

    info!("tunnelkeeper v{}", VERSION);

    let mut settings = match &args.config {
        Some(path) => {
            info!("Loading settings from: {}", path.display());
            match Settings::load_async(path).await {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to load settings: {}", e);
                    std::process::exit(1);
                }
            }
        }
        None => Settings::default(),
    };
    settings.apply_env();

    // CLI overrides
    if let Some(addr) = args.addr {
        settings.listen = addr;
    }
    if let Some(state) = args.state {
        settings.state_dir = state;
    }

    if let Err(e) = settings.validate() {
        error!("Invalid settings: {}", e);
        std::process::exit(1);
    }

    if args.test {
        info!("Settings test passed");
        return Ok(());
    }

    info!("State directory: {}", settings.state_dir.display());
    let daemon = match Daemon::new(settings) {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to initialize daemon: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run().await {
        error!("Daemon error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pogo_core::{Config, Dispatcher, Error};

/// Exit codes of the dispatcher process
mod exit {
    /// Clean shutdown
    pub const OK: i32 = 0;

    /// Configuration error
    pub const CONFIG: i32 = 64;

    /// Coordination store unreachable at startup
    pub const STORE_UNREACHABLE: i32 = 69;

    /// Internal error
    pub const INTERNAL: i32 = 70;
}

#[derive(Parser)]
#[command(name = "pogo-dispatcher")]
#[command(about = "Pogo fleet command-execution dispatcher")]
#[command(version)]
struct Cli {
    #[arg(short, long, env = "POGO_CONFIG", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(long, help = "Run in the foreground with plain-text logs")]
    foreground: bool,

    #[arg(short, long, help = "Set log level")]
    log_level: Option<String>,

    #[arg(short, long, help = "Bind address (host:port)")]
    bind: Option<String>,
}

fn load_config(cli: &Cli) -> Result<Config, Error> {
    let mut config = match &cli.config {
        Some(path) => Config::load(&path.display().to_string())?,
        None => Config::from_env()?,
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(bind) = &cli.bind {
        config.server.apply_bind(bind)?;
    }

    Ok(config)
}

fn init_logging(config: &Config, foreground: bool) {
    // POGO_LOG_LEVEL wins over --log-level and the config file
    let level = config.logging.effective_level();
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if foreground || config.logging.format == "text" {
        builder.init();
    } else {
        builder.json().init();
    }
}

async fn serve(config: Config) -> i32 {
    let dispatcher = match Dispatcher::new(config.clone()).await {
        Ok(dispatcher) => dispatcher,
        Err(Error::StoreUnavailable(msg)) => {
            error!("coordination store unreachable: {}", msg);
            return exit::STORE_UNREACHABLE;
        }
        Err(Error::Config(msg)) => {
            error!("configuration error: {}", msg);
            return exit::CONFIG;
        }
        Err(e) => {
            error!("dispatcher failed to start: {}", e);
            return exit::INTERNAL;
        }
    };

    info!(
        "dispatcher {} serving on {}:{}",
        dispatcher.id(),
        config.server.host,
        config.server.port
    );

    tokio::select! {
        result = pogo_api::run(&config.server, dispatcher) => {
            match result {
                Ok(()) => exit::OK,
                Err(Error::Config(msg)) => {
                    error!("server error: {}", msg);
                    exit::CONFIG
                }
                Err(e) => {
                    error!("server error: {}", e);
                    exit::INTERNAL
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            exit::OK
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pogo-dispatcher: {}", e);
            std::process::exit(exit::CONFIG);
        }
    };

    init_logging(&config, cli.foreground);

    let code = serve(config).await;
    std::process::exit(code);
}

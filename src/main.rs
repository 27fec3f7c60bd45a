use bifrost_tunnel::config::{Config, LoggingConfig};
use bifrost_tunnel::logging::{self, CustomLogger};
use bifrost_tunnel::tunnel::TunnelServer;
use bifrost_tunnel::ProxyError;
use clap::Parser;
use log::{error, info};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version = "0.1.0",
    about = "Relays HTTP exchanges from a local port to a fixed target"
)]
struct Args {
    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(short = 'p', long, value_name = "PORT", help = "Port to listen on (default: 8888)")]
    listen_port: Option<u16>,

    #[clap(long, value_name = "NUM", help = "Accept backlog of the listening socket (default: 100)")]
    backlog: Option<u32>,

    #[clap(short, long, value_name = "NUM", help = "Number of relay worker threads (default: 10)")]
    workers: Option<usize>,

    #[clap(short, long, value_name = "HOST:PORT", help = "Target every request is relayed to (default: localhost:8080)")]
    target: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            return Err(format!("Configuration file not found: {}", config_file).into());
        }
        Config::from_file(config_file)?
    } else {
        Config::default()
    };

    apply_args(&mut config, &args)?;
    init_logging(&config, &args)?;
    config.validate()?;

    let server = Arc::new(TunnelServer::new(config.tunnel.clone()));
    let runner = Arc::clone(&server);
    let mut server_handle = tokio::task::spawn_blocking(move || runner.start());

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            server.stop();
            match (&mut server_handle).await {
                Ok(Err(e)) => error!("Server error during shutdown: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        result = &mut server_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!("Tunnel stopped");
    Ok(())
}

fn apply_args(config: &mut Config, args: &Args) -> Result<(), ProxyError> {
    if let Some(port) = args.listen_port {
        config.tunnel.listen_port = port;
    }
    if let Some(backlog) = args.backlog {
        config.tunnel.accept_backlog = backlog;
    }
    if let Some(workers) = args.workers {
        config.tunnel.worker_pool_size = workers;
    }
    if let Some(target) = &args.target {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::Config(format!("Invalid target '{}'. Use format 'HOST:PORT'", target)))?;
        config.tunnel.target_host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        config.tunnel.target_port = port
            .parse()
            .map_err(|_| ProxyError::Config(format!("Invalid target port in '{}'", target)))?;
    }
    Ok(())
}

fn init_logging(config: &Config, args: &Args) -> Result<(), ProxyError> {
    let level = args.log_level.as_deref().map(logging::parse_log_level).transpose()?;
    let format = args.log_format.as_deref().map(logging::parse_log_format).transpose()?;

    match &config.logging {
        Some(logging_config) => {
            let mut logging_config = logging_config.clone();
            if level.is_some() {
                logging_config.level = level;
            }
            if format.is_some() {
                logging_config.format = format;
            }
            CustomLogger::init(logging_config)
        }
        None => {
            logging::init_fallback(level.unwrap_or_default(), format.unwrap_or_default());
            Ok(())
        }
    }
}

fn generate_sample_config(file_path: &str) -> Result<(), ProxyError> {
    let mut config = Config::default();
    config.logging = Some(LoggingConfig::default());
    config.to_file(file_path)
}

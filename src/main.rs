use anyhow::Context;
use clap::Parser;
use log::{debug, info};
use std::net::SocketAddr;
use std::path::Path;
use tokio::signal;
use tollgate::config::Config;
use tollgate::gateway::TlsGateway;
use tollgate::monitor::MonitorServer;
use tollgate::{logging, trust};

#[derive(Parser)]
#[clap(
    version,
    about = "TLS-terminating forwarding proxy that stamps trusted client-identity headers"
)]
struct Args {
    #[clap(short, long, value_name = "ADDR", help = "Listen address (port 0 = ephemeral)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Backend HTTP listener to forward to")]
    backend: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "HOST", help = "Replacement value for the Host header")]
    forward_host: Option<String>,

    #[clap(long, help = "Suppress all log output")]
    silent: bool,

    #[clap(long, value_name = "FILE", help = "Private key file path for TLS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for TLS")]
    certificate: Option<String>,

    #[clap(long, value_name = "SECONDS", help = "Backend connect timeout in seconds")]
    connect_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Keep-alive idle timeout in seconds")]
    idle_timeout: Option<u64>,

    #[clap(long, value_name = "ADDR", help = "Serve /metrics and /health on this address")]
    monitor: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = args.generate_config {
        generate_sample_config(&config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let config = load_config(&args)?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {}", e))?;

    logging::init(&config).map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    // establish the process identity before the first connection arrives
    let identity = trust::process_identity();
    debug!(
        "forwarding digest initialized ({} characters)",
        identity.token().len()
    );

    info!("Starting tollgate...");

    let gateway = TlsGateway::bind(config.clone())
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind gateway: {}", e))?;

    if let Some(monitor_addr) = config.monitor_addr {
        let monitor = MonitorServer::new(monitor_addr);
        tokio::spawn(async move {
            if let Err(e) = monitor.run().await {
                eprintln!("Monitor server error: {}", e);
            }
        });
    }

    let server_handle = tokio::spawn(async move {
        if let Err(e) = gateway.run().await {
            eprintln!("Gateway error: {}", e);
        }
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = server_handle => {
            if let Err(e) = result {
                eprintln!("Gateway task error: {}", e);
            }
        }
    }

    info!("tollgate stopped.");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = if let Some(config_file) = &args.config {
        if !Path::new(config_file).exists() {
            anyhow::bail!("configuration file not found: {}", config_file);
        }
        Config::from_file(config_file)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {}", config_file, e))?
    } else {
        Config::default()
    };

    // CLI flags override whatever the file said
    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen address: {}", listen))?;
    }
    if let Some(backend) = &args.backend {
        config.backend_addr = backend.clone();
    }
    if let Some(host) = &args.forward_host {
        config.forward_host = Some(host.clone());
    }
    if args.silent {
        config.silent = true;
    }
    if let Some(key) = &args.private_key {
        config.private_key = Some(key.clone());
    }
    if let Some(cert) = &args.certificate {
        config.certificate = Some(cert.clone());
    }
    if let Some(secs) = args.connect_timeout {
        config.connect_timeout_secs = secs;
    }
    if let Some(secs) = args.idle_timeout {
        config.idle_timeout_secs = secs;
    }
    if let Some(monitor) = &args.monitor {
        config.monitor_addr = Some(
            monitor
                .parse::<SocketAddr>()
                .with_context(|| format!("invalid monitor address: {}", monitor))?,
        );
    }

    Ok(config)
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let sample = r#"{
  "listen_addr": "0.0.0.0:8443",
  "backend_addr": "127.0.0.1:8080",
  "forward_host": null,
  "silent": false,
  "private_key": "key.pem",
  "certificate": "cert.pem",
  "connect_timeout_secs": 10,
  "idle_timeout_secs": 90,
  "monitor_addr": "127.0.0.1:9900"
}"#;

    std::fs::write(file_path, sample)?;
    Ok(())
}

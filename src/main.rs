use clap::Parser;
use knoxy::config::ProxyConfig;

#[derive(Parser)]
#[command(name = "knoxy", about = "Transparent Kafka protocol proxy")]
struct Cli {
    /// Path to TOML config file
    #[arg(long)]
    config: Option<String>,

    /// Listen address
    #[arg(long, default_value = "127.0.0.1:9192")]
    listen: String,

    /// Upstream broker address (host:port)
    #[arg(long)]
    broker: Option<String>,

    /// Virtual cluster name
    #[arg(long)]
    cluster: Option<String>,

    /// Authenticate clients at the proxy before connecting upstream
    #[arg(long)]
    sasl_offload: bool,

    /// Log per-direction byte counts
    #[arg(long)]
    log_network: bool,

    /// Log every frame (decodes every frame)
    #[arg(long)]
    log_frames: bool,

    /// Output logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("knoxy=info"));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // Load config file or start with defaults
    let mut config = if let Some(ref path) = cli.config {
        ProxyConfig::from_toml_file(path)?
    } else {
        ProxyConfig::default()
    };

    // CLI overrides for global settings
    if let Some(broker) = cli.broker {
        config.broker = Some(broker);
    }
    if let Some(cluster) = cli.cluster {
        config.cluster = Some(cluster);
    }
    if cli.sasl_offload {
        config.sasl_offload = true;
    }
    if cli.log_network {
        config.log_network = true;
    }
    if cli.log_frames {
        config.log_frames = true;
    }

    let listen = config.listen.clone().unwrap_or_else(|| cli.listen.clone());
    let proxy = config.into_builder()?.build()?;
    proxy
        .listen_with_shutdown(&listen, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
}

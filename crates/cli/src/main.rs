use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kmeta_collector::{CollectorConfig, MetaCollector, StdoutSink};
use kmeta_kubehub::{KubeMetaManager, MetaManager};
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kmetactl", version, about = "kmeta metadata collector")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collect pod/service metadata and print log groups until Ctrl-C
    Run {
        /// YAML config file; KMETA_* env vars and flags override it
        #[arg(long = "config")]
        config: Option<PathBuf>,
        /// Kubernetes namespace (default: all namespaces)
        #[arg(long = "ns")]
        namespace: Option<String>,
        #[arg(long = "config-name")]
        config_name: Option<String>,
        /// Disable pod collection
        #[arg(long = "no-pod")]
        no_pod: bool,
        /// Disable service collection
        #[arg(long = "no-service")]
        no_service: bool,
        /// Disable pod->service links
        #[arg(long = "no-link")]
        no_link: bool,
        /// Keep-alive re-send interval in seconds
        #[arg(long = "interval")]
        interval: Option<f64>,
        #[arg(long = "flush-size")]
        flush_size: Option<usize>,
        /// Idle flush interval in seconds
        #[arg(long = "flush-interval")]
        flush_interval: Option<f64>,
        #[arg(long = "queue-cap")]
        queue_capacity: Option<usize>,
    },
    /// Print the identity key of a resource
    Key {
        namespace: String,
        kind: String,
        name: String,
    },
}

fn init_tracing() {
    let env = std::env::var("KMETA_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the log groups
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KMETA_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KMETA_METRICS_ADDR; expected host:port");
        }
    }
}

fn secs(v: f64) -> Result<std::time::Duration> {
    std::time::Duration::try_from_secs_f64(v).with_context(|| format!("invalid duration: {}s", v))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Key { namespace, kind, name } => {
            let key = kmeta_core::identity_key(&namespace, &kind, &name);
            match cli.output {
                Output::Human => println!("{}", key),
                Output::Json => println!(
                    "{}",
                    serde_json::json!({ "namespace": namespace, "kind": kind, "name": name, "key": key })
                ),
            }
        }
        Commands::Run {
            config,
            namespace,
            config_name,
            no_pod,
            no_service,
            no_link,
            interval,
            flush_size,
            flush_interval,
            queue_capacity,
        } => {
            let mut cfg = match config.as_ref() {
                Some(path) => CollectorConfig::from_yaml_file(path)?,
                None => CollectorConfig::default(),
            }
            .with_env();
            if namespace.is_some() {
                cfg.namespace = namespace;
            }
            if let Some(n) = config_name {
                cfg.config_name = n;
            }
            cfg.pod &= !no_pod;
            cfg.service &= !no_service;
            cfg.pod_service_link &= !no_link;
            if let Some(v) = interval {
                cfg.interval = secs(v)?;
            }
            if let Some(v) = flush_interval {
                cfg.flush_interval = secs(v)?;
            }
            if let Some(v) = flush_size {
                cfg.flush_size = v;
            }
            if let Some(v) = queue_capacity {
                cfg.queue_capacity = v;
            }
            cfg.validate()?;
            info!(config = %cfg.config_name, ns = ?cfg.namespace, kinds = ?cfg.enabled_kinds(), "run invoked");

            let manager = Arc::new(
                KubeMetaManager::try_default(cfg.namespace.clone()).await.context("connecting to cluster")?,
            );
            let collector = MetaCollector::new(cfg, Arc::clone(&manager) as Arc<dyn MetaManager>, Arc::new(StdoutSink));
            collector.start()?;

            signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received; stopping collector");

            if let Some(stats) = collector.stats() {
                info!(?stats, "engine stats at shutdown");
            }
            let report = collector.stop().await?;
            manager.shutdown();
            if report.total() > 0 {
                warn!(batched = report.batched, queued = report.queued, "records dropped at shutdown");
            }
        }
    }
    Ok(())
}

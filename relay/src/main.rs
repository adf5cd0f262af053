use std::path::{Path, PathBuf};

use clap::{Args, Parser};
use federation::Node;
use runtime::ast::Program;
use runtime::error::EvalError;
use runtime::eval::Runtime;
use tracing_subscriber::EnvFilter;

mod config;
use config::Config;

#[derive(Parser)]
#[command(name = "relay", version, about = "Relay distributed-services runtime")]
enum CliCommand {
    /// Evaluate a program (a parser-emitted JSON AST) and serve its
    /// servers.
    Run(RunArgs),
    /// Start a bare node with no program.
    Serve(ServeArgs),
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    #[arg(long, env = "RELAY_CONFIG")]
    config_file_path: Option<PathBuf>,
    #[arg(long, env = "RELAY_HOST")]
    host: Option<String>,
    #[arg(long, env = "RELAY_PORT")]
    port: Option<u16>,
    #[arg(long, env = "RELAY_NODE_ID")]
    node_id: Option<String>,
    #[arg(long, env = "RELAY_MESSAGE_TIMEOUT_SECS")]
    message_timeout_secs: Option<u64>,
    #[arg(long, env = "RELAY_TTL")]
    ttl_default: Option<u32>,
    #[arg(long, env = "RELAY_LOG_FILTER")]
    log_filter: Option<String>,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the program AST (JSON).
    program: PathBuf,
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[tokio::main]
async fn main() {
    let cli = CliCommand::parse();
    let (common, program_path) = match &cli {
        CliCommand::Run(args) => (&args.common, Some(args.program.as_path())),
        CliCommand::Serve(args) => (&args.common, None),
    };

    let mut config = match &common.config_file_path {
        Some(path) => Config::from_file(path).expect("Failed to load config file"),
        None => Config::default(),
    };
    apply_overrides(&mut config, common);

    init_tracing(config.log_filter.as_deref());
    init_metrics(config.statsd_addr.as_deref());

    let runtime = Runtime::new(config.runtime.clone());
    let node = Node::start_with_runtime(runtime.clone(), config.federation.clone())
        .await
        .expect("Failed to start node");

    if let Some(path) = program_path {
        let program = load_program(path).expect("Failed to load program");
        match runtime.evaluate(&program).await {
            Ok(value) => tracing::info!(result = %value, "program evaluated"),
            Err(error) => {
                tracing::error!(error = %error, tag = error.tag(), "program failed");
                std::process::exit(1);
            }
        }
    }

    tokio::signal::ctrl_c()
        .await
        .expect("Failed to listen for shutdown signal");
    tracing::info!("shutting down");
    node.shutdown();
}

fn apply_overrides(config: &mut Config, args: &CommonArgs) {
    if let Some(host) = &args.host {
        config.federation.host = host.clone();
    }
    if let Some(port) = args.port {
        config.federation.port = port;
    }
    if let Some(node_id) = &args.node_id {
        config.federation.node_id = Some(node_id.clone());
    }
    if let Some(secs) = args.message_timeout_secs {
        config.runtime.message_timeout_secs = secs;
    }
    if let Some(ttl) = args.ttl_default {
        config.federation.ttl_default = ttl;
    }
    if let Some(filter) = &args.log_filter {
        config.log_filter = Some(filter.clone());
    }
}

/// The parser is an external collaborator; programs arrive as serialized
/// ASTs and load errors surface under the Parse tag.
fn load_program(path: &Path) -> Result<Program, EvalError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| EvalError::Parse(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&text).map_err(|e| EvalError::Parse(e.to_string()))
}

fn init_tracing(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn init_metrics(statsd_addr: Option<&str>) {
    let Some(addr) = statsd_addr else {
        return;
    };
    let Some((host, port)) = addr.rsplit_once(':') else {
        tracing::warn!(%addr, "statsd_addr must be host:port, metrics exporter disabled");
        return;
    };
    let Ok(port) = port.parse::<u16>() else {
        tracing::warn!(%addr, "invalid statsd port, metrics exporter disabled");
        return;
    };
    match metrics_exporter_statsd::StatsdBuilder::from(host, port).build(Some("relay")) {
        Ok(recorder) => {
            if let Err(e) = metrics::set_global_recorder(recorder) {
                tracing::warn!(error = %e, "metrics recorder already installed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to build statsd exporter"),
    }
}

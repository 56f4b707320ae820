//! Practice Cloud: multi-tenant record service with database-enforced
//! tenant isolation.

use clap::{Parser, Subcommand};
use practice_api::ApiServer;
use practice_core::config::{AppConfig, Environment};
use practice_platform::IsolationStack;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "practice-cloud")]
#[command(about = "Multi-tenant record service with row-level tenant isolation")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "PRACTICE_CLOUD__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "PRACTICE_CLOUD__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Connection pool size (overrides config)
    #[arg(long, env = "PRACTICE_CLOUD__DATABASE__POOL_SIZE")]
    pool_size: Option<usize>,

    /// Expose internal error detail in responses
    #[arg(long, default_value_t = false)]
    dev: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install row policies and serve HTTP traffic (default)
    Serve,
    /// Install row policies and print the coverage report; exits 2 on gaps
    Coverage,
    /// Print the PostgreSQL migration for the configured tables
    PolicySql,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "practice_cloud=info,practice_platform=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(size) = cli.pool_size {
        config.database.pool_size = size;
    }
    if cli.dev {
        config.environment = Environment::Development;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Coverage => coverage(&config),
        Command::PolicySql => {
            let stack = IsolationStack::new(&config)?;
            println!("{}", stack.policies.render_sql());
            Ok(())
        }
    }
}

fn coverage(config: &AppConfig) -> anyhow::Result<()> {
    let stack = IsolationStack::bootstrap(config)?;
    let report = stack.policies.coverage_report();
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_covered() {
        std::process::exit(2);
    }
    Ok(())
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    info!(
        node_id = %config.node_id,
        environment = ?config.environment,
        http_port = config.api.http_port,
        pool_size = config.database.pool_size,
        tables = ?config.isolation.tenant_tables,
        "Practice Cloud starting up"
    );

    let stack = Arc::new(IsolationStack::bootstrap(&config)?);

    let report = stack.policies.coverage_report();
    for gap in &report.gaps {
        warn!(table = %gap.table, gap = ?gap.gap, "Row security gap");
    }
    if !report.is_covered() && config.isolation.enforce_policy_coverage {
        error!(gaps = report.gaps.len(), "Refusing to serve with row security gaps");
        anyhow::bail!("row security coverage incomplete: {} gap(s)", report.gaps.len());
    }

    let api_server = ApiServer::new(config, stack);

    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("Practice Cloud is ready to serve traffic");
    api_server.start_http().await
}

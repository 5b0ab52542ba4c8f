use clap::{Parser, Subcommand};
use pipecraft_agent::{ModelConfig, ModelProvider};
use pipecraft_gateway::{AuthConfig, GatewayServer, RateLimiter};
use pipecraft_store::{Role, RunMode};
use pipecraft_worker::{SupervisorConfig, WorkerSpawnConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "pipecraft", about = "Pipecraft — multi-role autonomous coding agent orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "pipecraft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print a `startRun` request body populated from this config's defaults
    Defaults,
}

#[derive(Deserialize)]
struct PipecraftConfig {
    #[serde(default = "default_worktree_root")]
    worktree_root: PathBuf,
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_interval_secs: u64,
    #[serde(default = "default_bridge_timeout_secs")]
    bridge_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    max_retries_per_task: u32,
    #[serde(default = "default_max_turns")]
    max_turns: u32,
    #[serde(default = "default_expansion_interval_secs")]
    expansion_interval_secs: u64,
    #[serde(default)]
    tester_command: Option<String>,
    #[serde(default = "default_model_priority")]
    default_model_priority: Vec<ModelConfig>,
    /// Per-role overrides of `default_model_priority`, keyed by role name
    /// (`analyst_a`, `implementer`, ...).
    #[serde(default)]
    role_model_priority: HashMap<Role, Vec<ModelConfig>>,
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    security: SecurityConfig,
}

#[derive(Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

#[derive(Deserialize)]
struct SecurityConfig {
    #[serde(default = "default_rps")]
    max_requests_per_second: f64,
    #[serde(default = "default_burst")]
    max_burst: f64,
    #[serde(default)]
    api_keys: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self { max_requests_per_second: default_rps(), max_burst: default_burst(), api_keys: vec![] }
    }
}

fn default_worktree_root() -> PathBuf {
    PathBuf::from("./worktrees")
}
fn default_heartbeat_secs() -> u64 {
    5
}
fn default_bridge_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    2
}
fn default_max_turns() -> u32 {
    20
}
fn default_expansion_interval_secs() -> u64 {
    2
}
fn default_model_priority() -> Vec<ModelConfig> {
    vec![ModelConfig {
        provider: ModelProvider::ClaudeCode,
        model_id: "default".into(),
        api_key: String::new(),
        api_base_url: None,
        temperature: 0.7,
        max_tokens: 4096,
    }]
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4200
}
fn default_rps() -> f64 {
    10.0
}
fn default_burst() -> f64 {
    50.0
}

const ROLES: [Role; 7] =
    [Role::AnalystA, Role::AnalystB, Role::ConsensusBuilder, Role::Splitter, Role::Implementer, Role::Tester, Role::Reviewer];

/// Analysts run in parallel pairs; every other role has exactly one
/// runnable slot in the fixed pipeline shape. Mirrors the cap in
/// `pipecraft_worker::supervisor::role_cap`.
fn default_worker_count(role: Role) -> u32 {
    match role {
        Role::AnalystA | Role::AnalystB => 2,
        _ => 1,
    }
}

fn model_priority_for(config: &PipecraftConfig, role: Role) -> Vec<ModelConfig> {
    config.role_model_priority.get(&role).cloned().unwrap_or_else(|| config.default_model_priority.clone())
}

fn default_worker_configs(config: &PipecraftConfig) -> Vec<WorkerSpawnConfig> {
    ROLES
        .iter()
        .map(|&role| WorkerSpawnConfig { role, max_workers: default_worker_count(role), model_priority: model_priority_for(config, role) })
        .collect()
}

fn default_supervisor_config(config: &PipecraftConfig) -> SupervisorConfig {
    SupervisorConfig {
        heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
        bridge_timeout: Duration::from_secs(config.bridge_timeout_secs),
        max_retries_per_task: config.max_retries_per_task,
        test_command: config.tester_command.clone(),
        max_turns: config.max_turns,
    }
}

async fn load_config(path: &std::path::Path) -> anyhow::Result<PipecraftConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read config file '{}': {}", path.display(), e))?;
    Ok(toml::from_str(&content)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Serve { host, port } => {
            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            let rate_limiter = Arc::new(RateLimiter::new(config.security.max_burst, config.security.max_requests_per_second));
            let auth_config = AuthConfig::new(config.security.api_keys.clone());
            if auth_config.is_enabled() {
                info!(keys = config.security.api_keys.len(), "API key auth enabled");
            }

            let app = GatewayServer::build_with_middleware(
                config.worktree_root.clone(),
                Duration::from_secs(config.expansion_interval_secs),
                Some(rate_limiter),
                auth_config,
            );

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, worktree_root = %config.worktree_root.display(), "pipecraft gateway listening");
            axum::serve(listener, app).await?;
        }
        Commands::Defaults => {
            let briefing = serde_json::json!({
                "mode": RunMode::ImplementFeature,
                "description": "describe the feature or bug here",
                "guidance": null,
                "working_dir": ".",
                "worker_configs": default_worker_configs(&config),
                "supervisor_config": default_supervisor_config(&config),
                "auto_start_workers": true,
            });
            println!("{}", serde_json::to_string_pretty(&briefing)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_minimal_config_with_all_defaults() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(tmp.path(), "").await.unwrap();
        let config = load_config(tmp.path()).await.unwrap();
        assert_eq!(config.server.port, 4200);
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.default_model_priority.len(), 1);
    }

    #[tokio::test]
    async fn role_override_wins_over_default() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        tokio::fs::write(
            tmp.path(),
            r#"
[[default_model_priority]]
provider = "claude_code"
model_id = "default"

[[role_model_priority.implementer]]
provider = "claude"
model_id = "claude-sonnet-4"
"#,
        )
        .await
        .unwrap();
        let config = load_config(tmp.path()).await.unwrap();
        let configs = default_worker_configs(&config);
        let implementer = configs.iter().find(|c| c.role == Role::Implementer).unwrap();
        assert_eq!(implementer.model_priority[0].model_id, "claude-sonnet-4");
        let tester = configs.iter().find(|c| c.role == Role::Tester).unwrap();
        assert_eq!(tester.model_priority[0].model_id, "default");
    }
}

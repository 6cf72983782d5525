//! nexus3 — multi-agent orchestration runtime CLI.
//!
//! Usage:
//!   nexus3 --serve [--port N] [-v] [-V] [--raw-log]  → HTTP gateway, JSON-RPC over Bearer auth
//!   nexus3 --connect URL --agent NAME                 → REPL driving a remote agent over HTTP
//!   nexus3 [--agent NAME]                              → fully local REPL, no network surface
//!
//! This binary is deliberately thin: no REPL TUI, no slash-command parser,
//! no editor/pager integration. It exists to drive the library crates
//! end-to-end, not to be a product surface in its own right.

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use nexus3_context::{ContextConfig, ContextManager, SimpleTokenCounter};
use nexus3_core::permission::PermissionPolicy;
use nexus3_core::types::{AgentPermissions, ConfirmationResult, PermissionLevel, SessionType, ToolCall};
use nexus3_gateway::{AgentPool, AgentPoolConfig, RegistryBuilder, ServerConfig, StaticPromptLoader};
use nexus3_llm::anthropic::AnthropicProvider;
use nexus3_llm::openrouter::OpenRouterProvider;
use nexus3_llm::provider::LlmProvider;
use nexus3_session::{ConfirmationProvider, LogMultiplexer, RawWriter, Session, SessionConfig, SessionPersistence};
use nexus3_skills::builtin::{bash::BashSkill, edit::EditSkill, glob_tool::GlobSkill, grep::GrepSkill, pool, read::ReadSkill, sleep::SleepSkill, write::WriteSkill};
use nexus3_skills::registry::SkillRegistry;
use nexus3_skills::services::ServicesBag;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DEFAULT_PORT: u16 = 8765;
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful autonomous agent with access to file, shell, and search tools.";

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_BIND_CONFLICT: i32 = 2;
const EXIT_CONFIG_ERROR: i32 = 3;

#[derive(Parser)]
#[command(name = "nexus3", about = "Multi-agent orchestration runtime", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Start the HTTP gateway (agent pool behind JSON-RPC over Bearer auth).
    #[arg(long)]
    serve: bool,

    /// Drive an agent on a running server instead of staying fully local.
    #[arg(long, value_name = "URL")]
    connect: Option<String>,

    /// Port to bind (--serve) or to assume on localhost (--connect's default base).
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Console debug logging.
    #[arg(short = 'v', long)]
    verbose: bool,

    /// File-verbose logging: mirrors the console layer into NEXUS_HOME/logs/verbose.log.
    #[arg(short = 'V', long = "log-verbose")]
    log_verbose: bool,

    /// No-op toggle kept for parity with the original CLI surface; raw.jsonl
    /// is always written once a session exists (§4.7 names it per-session,
    /// not opt-in).
    #[arg(long)]
    raw_log: bool,

    /// Agent id to create/connect/drive. Defaults to "default".
    #[arg(long, default_value = "default")]
    agent: String,

    /// Workspace root the file/shell/search skills operate under. Defaults
    /// to the current directory.
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Override the provider's default model name.
    #[arg(long)]
    model: Option<String>,
}

enum CliError {
    Config(String),
    BindConflict(String),
    Failure(anyhow::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let home = resolve_home();
    let _log_guard = init_tracing(&cli, &home);

    let exit_code = match run(cli, home).await {
        Ok(()) => EXIT_OK,
        Err(CliError::Config(msg)) => {
            eprintln!("nexus3: {msg}");
            EXIT_CONFIG_ERROR
        }
        Err(CliError::BindConflict(msg)) => {
            eprintln!("nexus3: {msg}");
            EXIT_BIND_CONFLICT
        }
        Err(CliError::Failure(err)) => {
            eprintln!("nexus3: {err:#}");
            EXIT_FAILURE
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli, home: PathBuf) -> Result<(), CliError> {
    if cli.serve {
        serve_mode(cli, home).await
    } else if let Some(url) = cli.connect.clone() {
        connect_mode(cli, url).await
    } else {
        local_mode(cli, home).await
    }
}

fn init_tracing(cli: &Cli, home: &Path) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let console_level = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("nexus3={console_level},nexus3_gateway={console_level},nexus3_session={console_level}").into()
    });

    let (file_layer, guard) = if cli.log_verbose {
        let log_dir = home.join("logs");
        let _ = std::fs::create_dir_all(&log_dir);
        let appender = tracing_appender::rolling::never(&log_dir, "verbose.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        (Some(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false)), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry().with(env_filter).with(tracing_subscriber::fmt::layer()).with(file_layer).init();
    guard
}

/// `${NEXUS_HOME:=~/.nexus3}` (§6).
fn resolve_home() -> PathBuf {
    if let Ok(explicit) = std::env::var("NEXUS_HOME") {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    PathBuf::from(home).join(".nexus3")
}

fn resolve_workspace(cli: &Cli) -> Result<PathBuf, CliError> {
    match &cli.workspace {
        Some(p) => Ok(p.clone()),
        None => std::env::current_dir().map_err(|e| CliError::Config(format!("failed to resolve current directory: {e}"))),
    }
}

/// Provider precedence: Anthropic first, then OpenRouter, then a bare
/// OpenAI key routed through the OpenRouter-compatible client (nexus3-llm
/// ships no separate direct-OpenAI transport).
fn resolve_provider(cli: &Cli) -> Result<(Arc<dyn LlmProvider>, String), CliError> {
    if let Ok(key) = std::env::var("ANTHROPIC_API_KEY") {
        let model = cli.model.clone().unwrap_or_else(|| "claude-sonnet-4-5-20250929".to_string());
        return Ok((Arc::new(AnthropicProvider::new(key)), model));
    }
    if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
        let model = cli.model.clone().unwrap_or_else(|| "anthropic/claude-sonnet-4-5".to_string());
        return Ok((Arc::new(OpenRouterProvider::new(key)), model));
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        let model = cli.model.clone().unwrap_or_else(|| "openai/gpt-4o-mini".to_string());
        return Ok((Arc::new(OpenRouterProvider::new(key)), model));
    }
    Err(CliError::Config(
        "no provider credentials found: set ANTHROPIC_API_KEY, OPENROUTER_API_KEY, or OPENAI_API_KEY".to_string(),
    ))
}

/// Wires the seven builtin file/shell/search skills plus the five
/// `nexus_*` pool-control skills into a fresh registry per agent. The
/// builtin names are fixed and known-valid, so a registration failure here
/// would mean this binary itself is broken, not a user-facing condition.
fn registry_builder(workspace_root: PathBuf) -> RegistryBuilder {
    Arc::new(move |services: &ServicesBag| {
        let mut registry = SkillRegistry::new();
        let root = workspace_root.clone();

        registry
            .register("read", Arc::new(move |_s: &ServicesBag| Arc::new(ReadSkill::new(root.clone())) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");
        let root = workspace_root.clone();
        registry
            .register("write", Arc::new(move |_s: &ServicesBag| Arc::new(WriteSkill::new(root.clone())) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");
        let root = workspace_root.clone();
        registry
            .register("edit", Arc::new(move |_s: &ServicesBag| Arc::new(EditSkill::new(root.clone())) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");
        let root = workspace_root.clone();
        registry
            .register("bash", Arc::new(move |_s: &ServicesBag| Arc::new(BashSkill::new(root.clone())) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");
        let root = workspace_root.clone();
        registry
            .register("grep", Arc::new(move |_s: &ServicesBag| Arc::new(GrepSkill::new(root.clone())) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");
        let root = workspace_root.clone();
        registry
            .register("glob", Arc::new(move |_s: &ServicesBag| Arc::new(GlobSkill::new(root.clone())) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");
        registry
            .register("sleep", Arc::new(|_s: &ServicesBag| Arc::new(SleepSkill) as Arc<dyn nexus3_skills::registry::Skill>), services)
            .expect("builtin skill name is valid");

        registry.register("nexus_send", pool::NexusSendSkill::factory(), services).expect("builtin skill name is valid");
        registry.register("nexus_cancel", pool::NexusCancelSkill::factory(), services).expect("builtin skill name is valid");
        registry.register("nexus_destroy", pool::NexusDestroySkill::factory(), services).expect("builtin skill name is valid");
        registry.register("nexus_shutdown", pool::NexusShutdownSkill::factory(), services).expect("builtin skill name is valid");
        registry.register("nexus_status", pool::NexusStatusSkill::factory(), services).expect("builtin skill name is valid");

        registry
    })
}

async fn serve_mode(cli: Cli, home: PathBuf) -> Result<(), CliError> {
    let (provider, model) = resolve_provider(&cli)?;
    let workspace_root = resolve_workspace(&cli)?;

    let token = nexus3_gateway::server::resolve_token(&home)
        .map_err(|e| CliError::Config(format!("failed to resolve server token: {e}")))?;

    let mut services = ServicesBag::new();
    services.insert("api_key", token.clone());
    services.insert("port", cli.port);
    services.insert("workspace_root", workspace_root.display().to_string());

    let persistence = Arc::new(SessionPersistence::new(home.clone()));

    let pool_config = AgentPoolConfig {
        provider,
        base_log_dir: home.join("logs"),
        log_mux: LogMultiplexer::new(),
        registry_builder: registry_builder(workspace_root),
        services,
        prompt_loader: Arc::new(StaticPromptLoader(DEFAULT_SYSTEM_PROMPT.to_string())),
        default_permission_level: PermissionLevel::Trusted,
        model,
        max_tokens: 8192,
        default_tool_timeout_ms: 30_000,
        context_config: ContextConfig::default(),
        persistence: Some(persistence.clone()),
    };

    let pool = Arc::new(AgentPool::new(pool_config));
    pool.create(&cli.agent).await.map_err(|e| CliError::Failure(e.into()))?;

    let bind_addr: SocketAddr = ([127, 0, 0, 1], cli.port).into();
    let server_config = ServerConfig { bind_addr, home, pool, persistence: Some(persistence) };

    let handle = match nexus3_gateway::server::start(server_config).await {
        Ok(handle) => handle,
        Err(e @ (nexus3_gateway::GatewayError::AlreadyRunning | nexus3_gateway::GatewayError::PortInUse)) => {
            return Err(CliError::BindConflict(e.to_string()));
        }
        Err(e) => return Err(CliError::Failure(e.into())),
    };

    tracing::info!(addr = %handle.bind_addr, "nexus3 server ready");
    handle.join().await.map_err(|e| CliError::Failure(e.into()))?;
    Ok(())
}

/// Resolves the Bearer token used against a remote server: the local
/// token file under `${NEXUS_HOME}` when the remote server happens to be
/// this machine's, or `NEXUS3_TOKEN` otherwise.
fn resolve_connect_token(home: &Path) -> Result<String, CliError> {
    if let Ok(token) = std::env::var("NEXUS3_TOKEN") {
        return Ok(token);
    }
    std::fs::read_to_string(home.join("token"))
        .map(|s| s.trim().to_string())
        .map_err(|_| CliError::Config("no server token found: set NEXUS3_TOKEN or run on the server's host".to_string()))
}

async fn connect_mode(cli: Cli, url: String) -> Result<(), CliError> {
    let home = resolve_home();
    let token = resolve_connect_token(&home)?;
    let base = url.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let create_result = rpc_call(&client, &base, &token, "create_agent", serde_json::json!({"name": cli.agent})).await?;
    if let Some(error) = create_result.get("error") {
        let code = error.get("code").and_then(serde_json::Value::as_i64);
        if code != Some(-32002) {
            return Err(CliError::Failure(anyhow::anyhow!("create_agent failed: {error}")));
        }
    }

    println!("connected to {base} as '{}'. Type 'exit' or 'quit' to leave.", cli.agent);
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        let agent_url = format!("{base}/agent/{}", cli.agent);
        let response = rpc_call_at(&client, &agent_url, &token, "send", serde_json::json!({"content": input})).await?;
        match response.get("error") {
            Some(error) => eprintln!("error: {error}"),
            None => {
                let content = response["result"]["content"].as_str().unwrap_or_default();
                println!("{content}");
            }
        }
    }

    Ok(())
}

async fn rpc_call(
    client: &reqwest::Client,
    base: &str,
    token: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, CliError> {
    rpc_call_at(client, base, token, method, params).await
}

async fn rpc_call_at(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, CliError> {
    let body = serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
    let response = client
        .post(url)
        .bearer_auth(token)
        .json(&body)
        .send()
        .await
        .map_err(|e| CliError::Failure(e.into()))?;
    response.json::<serde_json::Value>().await.map_err(|e| CliError::Failure(e.into()))
}

/// Opens this agent's `raw.jsonl`/`context.md` sinks the same way
/// `AgentPool::open_log_sinks` does, so a fully local session's logs land
/// in the same file layout as one driven through the pool.
fn open_log_sinks(base_log_dir: &Path, agent_id: &str) -> anyhow::Result<(Arc<RawWriter>, nexus3_session::MarkdownWriter)> {
    let dir = base_log_dir.join(agent_id);
    std::fs::create_dir_all(&dir)?;
    let raw = RawWriter::open(dir.join("raw.jsonl"))?;
    let markdown = nexus3_session::MarkdownWriter::open(dir.join("context.md"))?;
    Ok((Arc::new(raw), markdown))
}

struct StdinConfirmation;

#[async_trait::async_trait]
impl ConfirmationProvider for StdinConfirmation {
    async fn confirm(&self, tool_call: &ToolCall) -> ConfirmationResult {
        let name = tool_call.name.clone();
        let args = serde_json::to_string(&tool_call.arguments).unwrap_or_default();
        tokio::task::spawn_blocking(move || {
            print!("\nallow {name}({args})? [y/N] ");
            let _ = std::io::stdout().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return ConfirmationResult::Deny;
            }
            match line.trim().to_ascii_lowercase().as_str() {
                "y" | "yes" => ConfirmationResult::AllowOnce,
                _ => ConfirmationResult::Deny,
            }
        })
        .await
        .unwrap_or(ConfirmationResult::Deny)
    }
}

async fn local_mode(cli: Cli, home: PathBuf) -> Result<(), CliError> {
    let (provider, model) = resolve_provider(&cli)?;
    let workspace_root = resolve_workspace(&cli)?;

    let base_log_dir = home.join("logs");
    let storage = nexus3_session::SessionStorage::open(&base_log_dir, &cli.agent).await.map_err(|e| CliError::Failure(e.into()))?;
    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
    storage.init_markers(SessionType::Saved, None, now).await.map_err(|e| CliError::Failure(e.into()))?;

    let mut context = ContextManager::new(ContextConfig::default(), Arc::new(SimpleTokenCounter));
    context.set_system_prompt(DEFAULT_SYSTEM_PROMPT.to_string());

    let policy = PermissionPolicy::new(AgentPermissions::new(PermissionLevel::Trusted));
    let registry = Arc::new((registry_builder(workspace_root.clone()))(&ServicesBag::new()));

    let log_mux = LogMultiplexer::new();
    let (raw_sink, markdown) = open_log_sinks(&base_log_dir, &cli.agent).map_err(CliError::Failure)?;
    log_mux.register(cli.agent.clone(), raw_sink);

    let session_config = SessionConfig {
        agent_id: cli.agent.clone(),
        model,
        max_tokens: 8192,
        temperature: None,
        default_tool_timeout_ms: 30_000,
        max_tool_iterations: nexus3_session::MAX_TOOL_ITERATIONS,
    };

    let session = Session::new(session_config, provider, registry, context, policy, log_mux)
        .with_confirmation(Arc::new(StdinConfirmation))
        .with_markdown_writer(markdown);

    let persistence = SessionPersistence::new(home.clone());

    println!("nexus3 local REPL — agent '{}'. Type 'exit' or 'quit' to leave.", cli.agent);
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        std::io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let input = line.trim().to_string();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        let mut stream = session.send(input);
        while let Some(chunk) = stream.next().await {
            print!("{chunk}");
            std::io::stdout().flush().ok();
        }
        println!();
    }

    let saved = nexus3_core::types::SavedSession {
        schema_version: nexus3_core::types::SAVED_SESSION_SCHEMA_VERSION,
        agent_id: session.agent_id().to_string(),
        created_at: now,
        modified_at: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        messages: session.context_snapshot(),
        system_prompt: session.system_prompt(),
        system_prompt_path: None,
        working_directory: workspace_root.display().to_string(),
        permission_level: session.permission_level(),
        permission_preset: None,
        disabled_tools: session.disabled_tools(),
        token_usage: Some(session.token_usage().total as u64),
        provenance: "user".to_string(),
    };
    persistence.save(&cli.agent, &saved).await.map_err(|e| CliError::Failure(e.into()))?;

    Ok(())
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, Read, Write};
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use clap::Parser;
use cli::{Cli, Commands, OutputFormatArg};
use openfork_model::catalog::ModelCatalogEntry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = openfork_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::ListModels {
                provider,
                refresh,
                json,
            } => {
                let config = openfork_config::load(cli.config.as_deref())?;
                return list_models_cmd(&config, provider.as_deref(), *refresh, *json).await;
            }
            Commands::ListProviders { verbose, json } => {
                return list_providers_cmd(*verbose, *json);
            }
        }
    }

    run(cli).await
}

/// Build the agent: model provider, tool registry (built-ins + discovered MCP
/// adapters), and an `openfork_core::Agent` wired the same way regardless of
/// which front end drives it.
async fn build_agent(
    config: &Arc<openfork_config::Config>,
    model_override: Option<&str>,
    system_prompt_file: Option<&std::path::Path>,
    append_system_prompt: Option<String>,
) -> anyhow::Result<openfork_core::Agent> {
    use openfork_core::{CancellationToken, EventBus, HookPipeline, TaskTool};
    use openfork_tools::{
        ApplyPatchTool, AskQuestionTool, DeleteFileTool, EditFileTool, FindFileTool, FsTool,
        GlobFileSearchTool, GrepTool, ListDirTool, ReadFileTool, ReadImageTool, ReadLintsTool,
        RunTerminalCommandTool, SearchCodebaseTool, SwitchModeTool, TodoItem, TodoWriteTool,
        ToolEvent, ToolRegistry, UpdateMemoryTool, WebFetchTool, WebSearchTool, WriteTool,
    };
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{mpsc, Mutex};

    let model_cfg = match model_override {
        Some(m) => openfork_model::resolve_model_from_config(config, m),
        None => config.model.clone(),
    };
    let model: Arc<dyn openfork_model::ModelProvider> =
        Arc::from(openfork_model::from_config(&model_cfg)?);
    let max_ctx = model.catalog_context_window().unwrap_or(128_000) as usize;

    let mode = Arc::new(Mutex::new(config.agent.default_mode));
    let (tool_tx, tool_rx) = mpsc::channel::<ToolEvent>(64);

    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = ToolRegistry::new();
    registry.register(RunTerminalCommandTool::default());
    registry.register(ReadFileTool);
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(GlobFileSearchTool);
    registry.register(GrepTool);
    registry.register(ListDirTool);
    registry.register(DeleteFileTool);
    registry.register(FindFileTool);
    registry.register(FsTool);
    registry.register(ReadImageTool);
    registry.register(SearchCodebaseTool);
    registry.register(WebFetchTool);
    registry.register(WebSearchTool {
        api_key: config.tools.web.search.api_key.clone(),
    });
    registry.register(ApplyPatchTool);
    registry.register(ReadLintsTool);
    registry.register(UpdateMemoryTool {
        memory_file: config.tools.memory.memory_file.clone(),
    });
    registry.register(TodoWriteTool::new(todos, tool_tx.clone()));
    registry.register(SwitchModeTool::new(mode.clone(), tool_tx));
    registry.register(AskQuestionTool::new());

    for adapter in discover_mcp_adapters().await {
        registry.register(adapter);
    }

    // Shared across the top-level agent and every subagent `task` spawns, so
    // permission asks, hook firings, and lifecycle events all surface on one
    // bus regardless of nesting depth.
    let permission_engine = openfork_tools::permission::default_engine();
    let hooks = Arc::new(HookPipeline::with_builtins());
    let event_bus = EventBus::new();
    let supervisor_cancel = CancellationToken::new();
    let agent_config = Arc::new(config.agent.clone());

    registry.register(
        TaskTool::new(
            model.clone(),
            config.clone(),
            agent_config.clone(),
            Arc::new(AtomicUsize::new(0)),
        )
        .with_parent_context(
            permission_engine.clone(),
            hooks.clone(),
            event_bus.clone(),
            supervisor_cancel,
        ),
    );

    let mut runtime = openfork_core::AgentRuntimeContext::default();
    runtime.project_root = find_project_root();
    if let Some(path) = system_prompt_file {
        runtime.system_prompt_override = Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading system prompt file {}", path.display()))?,
        );
    }
    runtime.append_system_prompt = append_system_prompt;

    Ok(openfork_core::Agent::new(
        model,
        Arc::new(registry),
        agent_config,
        runtime,
        mode,
        tool_rx,
        max_ctx,
    )
    .with_permission_engine(permission_engine)
    .with_hooks(hooks)
    .with_event_bus(event_bus))
}

/// Connect to every MCP server listed under the `mcp_servers` config key.
///
/// Read out of the same merged YAML layers `openfork_config::load` used,
/// rather than as a field on `Config` itself — the MCP auth/transport
/// vocabulary only matters to `openfork-mcp`, so it stays out of the shared
/// config schema.
async fn discover_mcp_adapters() -> Vec<openfork_mcp::McpToolAdapter> {
    let raw = match openfork_config::load_raw(None) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let servers: Vec<openfork_mcp::McpServerConfig> = match raw.get("mcp_servers") {
        Some(v) => serde_yaml::from_value(v.clone()).unwrap_or_default(),
        None => Vec::new(),
    };
    if servers.is_empty() {
        return Vec::new();
    }
    openfork_mcp::discover_adapters(&servers).await
}

/// Walk up from the current directory looking for a `.git` entry.
fn find_project_root() -> Option<std::path::PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        if dir.join(".git").exists() {
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Arc::new(openfork_config::load(cli.config.as_deref())?);

    let input = read_input(&cli)?;

    if cli.dry_run {
        println!("Mode: {:?}", cli.mode);
        println!("Input: {} chars", input.chars().count());
        if let Some(f) = &cli.system_prompt_file {
            println!("System prompt override: {}", f.display());
        }
        println!("Dry run — exiting without calling the model.");
        return Ok(());
    }

    let mut agent = build_agent(
        &config,
        cli.model.as_deref(),
        cli.system_prompt_file.as_deref(),
        cli.append_system_prompt.clone(),
    )
    .await
    .context("building agent")?;
    agent.set_mode(cli.mode).await;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<openfork_core::AgentEvent>(256);

    let drive = async {
        agent.submit(&input, tx).await?;
        Ok::<_, anyhow::Error>(())
    };

    let drain = async {
        let mut final_text = String::new();
        while let Some(event) = rx.recv().await {
            render_event(&event, cli.output_format, &mut final_text);
        }
        final_text
    };

    let ((), final_text) = if let Some(secs) = cli.run_timeout.filter(|s| *s > 0) {
        tokio::time::timeout(std::time::Duration::from_secs(secs), async {
            tokio::join!(drive, drain)
        })
        .await
        .context("run timed out")?
    } else {
        tokio::join!(drive, drain)
    };

    if let Some(path) = &cli.output_last_message {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating {}", parent.display()))?;
            }
        }
        std::fs::write(path, &final_text)
            .with_context(|| format!("writing {}", path.display()))?;
    }

    Ok(())
}

/// Render one `AgentEvent` to stdout according to the chosen output format,
/// accumulating the final assistant text into `final_text` as it streams.
fn render_event(event: &openfork_core::AgentEvent, format: OutputFormatArg, final_text: &mut String) {
    use openfork_core::AgentEvent::*;
    match format {
        OutputFormatArg::Conversation | OutputFormatArg::Compact => match event {
            TextDelta(chunk) => {
                print!("{chunk}");
                let _ = io::stdout().flush();
            }
            TextComplete(text) => {
                *final_text = text.clone();
                if format == OutputFormatArg::Conversation {
                    println!();
                }
            }
            ToolCallStarted(call) if format == OutputFormatArg::Conversation => {
                println!("\n[tool] {} {}", call.name, call.args);
            }
            ToolCallFinished {
                tool_name, is_error, ..
            } if format == OutputFormatArg::Conversation => {
                let status = if *is_error { "error" } else { "ok" };
                println!("[tool:{status}] {tool_name}");
            }
            Error(msg) => eprintln!("[error] {msg}"),
            _ => {}
        },
        OutputFormatArg::Json => {
            if let TextComplete(text) = event {
                *final_text = text.clone();
            }
            if let Ok(json) = serde_json::to_string(&format!("{event:?}")) {
                println!("{json}");
            }
        }
    }
}

/// Read the initial prompt: `--file`, a piped stdin, or the positional prompt.
fn read_input(cli: &Cli) -> anyhow::Result<String> {
    if let Some(path) = &cli.file {
        return std::fs::read_to_string(path)
            .with_context(|| format!("reading input file {}", path.display()));
    }
    if cli.stdin_is_piped() {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("reading stdin")?;
        if let Some(prompt) = &cli.prompt {
            buf.push_str("\n\n");
            buf.push_str(prompt);
        }
        return Ok(buf);
    }
    Ok(cli.prompt.clone().unwrap_or_default())
}

/// List available models, optionally querying the provider API for live data.
async fn list_models_cmd(
    config: &openfork_config::Config,
    provider_filter: Option<&str>,
    refresh: bool,
    as_json: bool,
) -> anyhow::Result<()> {
    if let Some(prov) = provider_filter {
        if openfork_model::get_driver(prov).is_none() {
            eprintln!("Unknown provider: {prov:?}");
            eprintln!("\nAvailable providers (run `openfork list-providers` for details):");
            for d in openfork_model::list_drivers() {
                eprintln!("  {:20} {}", d.id, d.name);
            }
            anyhow::bail!("Invalid provider: {prov}");
        }
    }

    let entries: Vec<ModelCatalogEntry> = if refresh {
        let model_cfg = if let Some(prov) = provider_filter {
            let mut c = config.model.clone();
            c.provider = prov.to_string();
            c
        } else {
            config.model.clone()
        };
        let model = openfork_model::from_config(&model_cfg)?;
        let mut live = model.list_models().await?;
        if let Some(prov) = provider_filter {
            live.retain(|e| e.provider == prov);
        }
        live
    } else {
        let mut all = openfork_model::catalog::static_catalog();
        if let Some(prov) = provider_filter {
            all.retain(|e| e.provider == prov);
        }
        all.sort_by(|a, b| a.provider.cmp(&b.provider).then(a.id.cmp(&b.id)));
        all
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No models found.");
        return Ok(());
    }

    let id_w = entries
        .iter()
        .map(|e| e.id.len())
        .max()
        .unwrap_or(10)
        .max(10);
    let prov_w = entries
        .iter()
        .map(|e| e.provider.len())
        .max()
        .unwrap_or(8)
        .max(8);

    println!(
        "{:<id_w$}  {:<prov_w$}  {:>12}  {:>16}  DESCRIPTION",
        "ID",
        "PROVIDER",
        "CTX WINDOW",
        "MAX OUT TOKENS",
        id_w = id_w,
        prov_w = prov_w,
    );
    println!("{}", "-".repeat(id_w + prov_w + 50));

    for e in &entries {
        let ctx = if e.context_window == 0 {
            "  -".to_string()
        } else {
            format!("{:>12}", e.context_window)
        };
        let max_out = if e.max_output_tokens == 0 {
            "  -".to_string()
        } else {
            format!("{:>16}", e.max_output_tokens)
        };
        println!(
            "{:<id_w$}  {:<prov_w$}  {}  {}  {}",
            e.id,
            e.provider,
            ctx,
            max_out,
            e.description,
            id_w = id_w,
            prov_w = prov_w,
        );
    }
    println!("\nTotal: {} model(s)", entries.len());
    Ok(())
}

/// List all registered model providers.
fn list_providers_cmd(verbose: bool, as_json: bool) -> anyhow::Result<()> {
    let drivers = openfork_model::list_drivers();

    if as_json {
        #[derive(serde::Serialize)]
        struct ProviderJson {
            id: &'static str,
            name: &'static str,
            description: &'static str,
            default_api_key_env: Option<&'static str>,
            default_base_url: Option<&'static str>,
            requires_api_key: bool,
        }
        let rows: Vec<ProviderJson> = drivers
            .iter()
            .map(|d| ProviderJson {
                id: d.id,
                name: d.name,
                description: d.description,
                default_api_key_env: d.default_api_key_env,
                default_base_url: d.default_base_url,
                requires_api_key: d.requires_api_key,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("Supported Model Providers ({} total)\n", drivers.len());

    if verbose {
        for d in drivers {
            println!("  {} — {}", d.id, d.name);
            println!("    {}", d.description);
            if let Some(env) = d.default_api_key_env {
                println!("    API key env : {env}");
            }
            if let Some(url) = d.default_base_url {
                println!("    Default URL : {url}");
            }
            if !d.requires_api_key {
                println!("    Auth        : none required");
            }
            println!();
        }
    } else {
        let id_w = drivers
            .iter()
            .map(|d| d.id.len())
            .max()
            .unwrap_or(10)
            .max(10);
        let name_w = drivers
            .iter()
            .map(|d| d.name.len())
            .max()
            .unwrap_or(8)
            .max(8);
        println!("{:<id_w$}  {:<name_w$}  DESCRIPTION", "ID", "NAME");
        println!("{}", "-".repeat(id_w + name_w + 40));
        for d in drivers {
            println!("{:<id_w$}  {:<name_w$}  {}", d.id, d.name, d.description);
        }
        println!("\nUse `openfork list-providers --verbose` for API key and URL details.");
        println!("Use `openfork list-models --provider <ID>` to see models for a specific provider.");
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    // Set OPENFORK_LOG_FILE to redirect logs to a file instead of stderr —
    // useful when stderr is being consumed by something else in the pipeline.
    if let Ok(log_path) = std::env::var("OPENFORK_LOG_FILE") {
        use std::sync::Mutex;
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            let filter =
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
            let _ = tracing_subscriber::registry()
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                )
                .with(filter)
                .try_init();
            return;
        }
    }

    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}

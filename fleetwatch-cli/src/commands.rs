//! CLI subcommand handlers.

use crate::AgentAction;
use crate::Commands;
use crate::ConfigAction;
use anyhow::Context;
use chrono::Utc;
use fleetwatch_core::gateway::{GatewayState, run_gateway};
use fleetwatch_core::{
    Agent, CliSummaryModel, FleetConfig, SqliteStore, SummaryResult, SummaryService, SummaryStore,
    Summarizer, TranscriptReader,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    config: FleetConfig,
    workspace: &Path,
) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => handle_serve(config, host, port).await,
        Commands::Summarize {
            agent_id,
            project_key,
            session_id,
        } => {
            handle_summarize(
                &config,
                &agent_id,
                project_key.as_deref(),
                session_id.as_deref(),
            )
            .await
        }
        Commands::History { agent_id, limit } => handle_history(&config, &agent_id, limit).await,
        Commands::Transcript {
            project_key,
            session_id,
        } => handle_transcript(&config, &project_key, session_id.as_deref()).await,
        Commands::Agent { action } => handle_agent(action, &config).await,
        Commands::Config { action } => handle_config(action, &config, workspace),
    }
}

fn open_store(config: &FleetConfig) -> anyhow::Result<Arc<SqliteStore>> {
    let path = config.store.resolved_database_path();
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open store at {}", path.display()))?;
    Ok(Arc::new(store))
}

fn transcript_reader(config: &FleetConfig) -> TranscriptReader {
    TranscriptReader::new(
        config.summary.resolved_transcript_base(),
        config.summary.max_transcript_lines,
    )
}

fn build_service(config: &FleetConfig, store: Arc<SqliteStore>) -> SummaryService {
    let model = CliSummaryModel::new(&config.summary.model_command, &config.summary.model);
    let summarizer = Arc::new(Summarizer::new(
        Arc::new(model),
        config.summary.call_timeout(),
    ));
    SummaryService::new(
        config.summary.clone(),
        store,
        summarizer,
        Arc::new(transcript_reader(config)),
    )
}

async fn handle_serve(
    config: FleetConfig,
    host: Option<String>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let store = open_store(&config)?;
    let service = build_service(&config, store.clone());
    service.set_on_summary_generated(|event| {
        info!(
            agent_id = %event.agent_id,
            summary = %event.summary,
            delta = %event.delta,
            "Agent summary updated"
        );
    });

    let sweep = service.spawn_background_refresh();
    let state = Arc::new(GatewayState::new(service.clone(), store));
    let addr = format!(
        "{}:{}",
        host.unwrap_or(config.gateway.host),
        port.unwrap_or(config.gateway.port)
    );

    let signal_service = service.clone();
    let shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for Ctrl-C; running until killed");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
        signal_service.shutdown();
    };

    info!(
        addr = %addr,
        model = %config.summary.model,
        enabled = config.summary.enabled,
        "Starting fleetwatch"
    );
    run_gateway(state, &addr, shutdown)
        .await
        .with_context(|| format!("Gateway failed on {addr}"))?;

    service.shutdown();
    if let Err(e) = sweep.await {
        warn!(error = %e, "Background refresh task ended abnormally");
    }
    info!("fleetwatch stopped");
    Ok(())
}

async fn handle_summarize(
    config: &FleetConfig,
    agent_id: &str,
    project_key: Option<&str>,
    session_id: Option<&str>,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let service = build_service(config, store);
    let outcome = service
        .refresh_agent(agent_id, project_key, session_id)
        .await?;
    info!(agent_id, ?outcome, "Refresh finished");
    match service.cached_summary(agent_id) {
        Some(result) => print_summary(&result),
        None => println!("No summary available for {agent_id}."),
    }
    Ok(())
}

async fn handle_history(config: &FleetConfig, agent_id: &str, limit: usize) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let history = store.get_summary_history(agent_id, limit).await?;
    if history.is_empty() {
        println!("No summaries recorded for {agent_id}.");
        return Ok(());
    }
    for (i, result) in history.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print_summary(result);
    }
    Ok(())
}

async fn handle_transcript(
    config: &FleetConfig,
    project_key: &str,
    session_id: Option<&str>,
) -> anyhow::Result<()> {
    let reader = transcript_reader(config);
    let key = project_key.to_string();
    let session = session_id.map(str::to_string);
    let (session, data) = tokio::task::spawn_blocking(move || -> fleetwatch_core::Result<_> {
        let session = match session {
            Some(s) => s,
            None => reader.find_active_session(&key)?,
        };
        let data = reader.read(&key, &session)?;
        Ok((session, data))
    })
    .await??;

    println!("session:     {session}");
    println!("fingerprint: {}", data.fingerprint);
    println!("---");
    println!("{}", data.content);
    Ok(())
}

async fn handle_agent(action: AgentAction, config: &FleetConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match action {
        AgentAction::Register {
            id,
            project_key,
            session_id,
            name,
        } => {
            let agent = Agent {
                name: name.unwrap_or_else(|| id.clone()),
                id,
                project_key: Some(project_key),
                current_session_id: session_id,
                last_active_at: Utc::now(),
            };
            store.upsert_agent(&agent).await?;
            println!("Registered agent '{}'.", agent.id);
            Ok(())
        }
        AgentAction::Touch { id, session_id } => {
            store
                .touch_agent(&id, session_id.as_deref())
                .await
                .with_context(|| format!("Cannot mark agent '{id}' active"))?;
            println!("Marked agent '{id}' active.");
            Ok(())
        }
        AgentAction::List => {
            let agents = store.list_agents().await?;
            if agents.is_empty() {
                println!("No agents registered.");
                return Ok(());
            }
            println!(
                "{:<20} {:<20} {:<32} {:<38} LAST ACTIVE",
                "ID", "NAME", "PROJECT", "SESSION"
            );
            for agent in &agents {
                println!("{}", format_agent_row(agent));
            }
            Ok(())
        }
    }
}

fn handle_config(action: ConfigAction, config: &FleetConfig, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".fleetwatch");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&FleetConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            println!("{}", toml::to_string_pretty(config)?);
            Ok(())
        }
    }
}

fn print_summary(result: &SummaryResult) {
    let stale = if result.is_stale { " (stale)" } else { "" };
    println!("agent:     {}{stale}", result.agent_id);
    println!("summary:   {}", result.summary);
    println!("delta:     {}", result.delta);
    println!(
        "generated: {}",
        result.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    if let Some(cost) = result.cost_usd {
        println!("cost:      ${cost:.4}");
    }
}

fn format_agent_row(agent: &Agent) -> String {
    format!(
        "{:<20} {:<20} {:<32} {:<38} {}",
        agent.id,
        agent.name,
        agent.project_key().unwrap_or("-"),
        agent.session_id().unwrap_or("-"),
        agent.last_active_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

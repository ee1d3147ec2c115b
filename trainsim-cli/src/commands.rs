//! Subcommand handlers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use trainsim_core::config::StorageBackend;
use trainsim_core::gateway::{GatewayState, run_gateway};
use trainsim_core::{
    AllowAll, Authorizer, EngineConfig, NewRun, Principal, RolePolicy, RunController, RunEvent,
    Stores, load_config,
};

use crate::{Commands, ConfigAction};

pub(crate) async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve { host, port } => serve(workspace, host, port).await,
        Commands::Simulate {
            epochs,
            tick_ms,
            seed,
            pause_at,
            batch_size,
        } => {
            let mut config = load(workspace)?;
            config.scheduler.tick_interval_ms = tick_ms;
            config.storage.backend = StorageBackend::Memory;
            if let Some(seed) = seed {
                config.progression.seed = seed;
            }
            simulate(config, epochs, batch_size, pause_at).await
        }
        Commands::Config {
            action: ConfigAction::Show,
        } => {
            let config = load(workspace)?;
            println!("{}", render_config(&config)?);
            Ok(())
        }
    }
}

fn load(workspace: &Path) -> anyhow::Result<EngineConfig> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

fn render_config(config: &EngineConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).context("failed to render configuration")
}

async fn serve(workspace: &Path, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let mut config = load(workspace)?;
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let stores = Stores::open(&config.storage).context("failed to open stores")?;
    let authorizer: Arc<dyn Authorizer> = if config.gateway.auth_tokens.is_empty() {
        Arc::new(AllowAll)
    } else {
        Arc::new(RolePolicy)
    };
    let controller = Arc::new(RunController::new(&config, stores, authorizer));

    let report = controller
        .reconcile(config.recovery.on_restart)
        .await
        .context("restart reconciliation failed")?;
    if !report.is_empty() {
        info!(
            policy = %config.recovery.on_restart,
            failed = report.failed.len(),
            paused = report.paused.len(),
            reset = report.reset.len(),
            retracted = report.retracted_points,
            "Reconciled runs from previous process"
        );
    }

    let state = Arc::new(GatewayState::new(controller.clone(), &config.gateway));
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
        }
    };
    run_gateway(state, &config.gateway, shutdown)
        .await
        .context("gateway failed")?;

    let stopped = controller.shutdown().await;
    info!(stopped, "Gateway stopped");
    Ok(())
}

async fn simulate(
    config: EngineConfig,
    epochs: u32,
    batch_size: u32,
    pause_at: Option<u32>,
) -> anyhow::Result<()> {
    let controller = RunController::new(&config, Stores::in_memory(), Arc::new(AllowAll));
    let admin = Principal::system();
    let model = controller.register_model(&admin, "simulated")?;
    let run = controller.create_run(
        &admin,
        NewRun {
            model_id: model.id,
            dataset_id: None,
            epochs_total: epochs,
            learning_rate: 0.001,
            batch_size,
        },
    )?;

    let mut events = controller.subscribe();
    controller.start_run(&admin, run.id).await?;
    info!(run_id = %run.id, epochs, "Simulation started");

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event stream lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.run_id() != run.id {
            continue;
        }
        match event {
            RunEvent::EpochCompleted {
                epoch,
                accuracy,
                loss,
                ..
            } => {
                println!("epoch {epoch:>4}/{epochs}  accuracy {accuracy:.4}  loss {loss:.4}");
                if pause_at == Some(epoch) && epoch < epochs {
                    let paused = controller.pause_run(&admin, run.id).await?;
                    println!("paused after epoch {}", paused.epochs_completed);
                    tokio::time::sleep(Duration::from_millis(config.scheduler.tick_interval_ms))
                        .await;
                    controller.resume_run(&admin, run.id).await?;
                    println!("resumed at epoch {}", paused.epochs_completed + 1);
                }
            }
            RunEvent::Completed { .. } | RunEvent::Failed { .. } => break,
            _ => {}
        }
    }

    let snapshot = controller.snapshot(&admin, run.id, None)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    let model = controller.get_model(&admin, model.id)?;
    println!("{}", serde_json::to_string_pretty(&model)?);
    Ok(())
}

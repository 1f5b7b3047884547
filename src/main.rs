use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rustybrief::checkpoint::{CheckpointStore, FileCheckpointStore};
use rustybrief::config::{self, Config};
use rustybrief::model::{BatchSource, PageWindow, RunSettings, Sampling};
use rustybrief::orchestrator::{BatchOrchestrator, BatchReport, PassOutcome};
use rustybrief::source::drive::extract_folder_id;
use rustybrief::{api, logging, manifest};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "rustybrief",
    about = "Describe every document in a folder, resumably"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Describe the documents under a local directory.
    Local {
        root: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Describe the documents under a remote folder (id or URL).
    Drive {
        folder: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Re-attempt only the failed items of a batch.
    Retry {
        batch_id: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Show the progress of one batch, or of every stored batch.
    Status { batch_id: Option<String> },
    /// Merge manifests or checkpoint files into one de-duplicated description list.
    Consolidate {
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Serve the HTTP API.
    Serve,
}

#[derive(Args)]
struct RunArgs {
    /// Output language code.
    #[arg(long)]
    language: Option<String>,
    /// Pages rendered from the start of each document.
    #[arg(long, default_value_t = 2)]
    initial_pages: u32,
    /// Pages rendered from the end of each document.
    #[arg(long, default_value_t = 2)]
    final_pages: u32,
    /// Render every page instead of the leading and trailing window.
    #[arg(long)]
    all_pages: bool,
    #[arg(long, default_value_t = 300)]
    max_tokens: u32,
    #[arg(long, default_value_t = 0.1)]
    temperature: f32,
    #[arg(long, default_value_t = 0.9)]
    top_p: f32,
    /// Items processed concurrently; overrides BATCH_WORKERS.
    #[arg(long)]
    workers: Option<usize>,
    /// Write the manifest here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    fn settings(&self, config: &Config) -> RunSettings {
        let pages = if self.all_pages {
            PageWindow::All
        } else {
            PageWindow::Window {
                leading: self.initial_pages,
                trailing: self.final_pages,
            }
        };
        RunSettings {
            language: self
                .language
                .clone()
                .unwrap_or_else(|| config.default_language.clone()),
            pages,
            sampling: Sampling {
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    let mut config = config::load_config().context("invalid configuration")?;

    match cli.command {
        Command::Local { root, run } => {
            let source = BatchSource::Local { root };
            run_batch(&mut config, source, run).await
        }
        Command::Drive { folder, run } => {
            let source = BatchSource::Drive {
                folder_id: extract_folder_id(&folder),
            };
            run_batch(&mut config, source, run).await
        }
        Command::Retry { batch_id, output } => {
            let orchestrator = BatchOrchestrator::from_config(&config)?;
            let cancel = cancel_on_ctrl_c();
            let report = orchestrator.retry(&batch_id, &cancel).await?;
            finish_pass(&orchestrator, &report, output.as_deref()).await
        }
        Command::Status { batch_id } => {
            let store = FileCheckpointStore::new(config.checkpoint_dir.clone());
            match batch_id {
                Some(batch_id) => match store.load(&batch_id).await? {
                    Some(state) => write_json(&state.progress(), None),
                    None => bail!("no checkpoint found for batch {batch_id}"),
                },
                None => write_json(&store.list().await?, None),
            }
        }
        Command::Consolidate { inputs, output } => {
            let mut documents = Vec::with_capacity(inputs.len());
            for input in &inputs {
                let raw = std::fs::read(input)
                    .with_context(|| format!("failed to read {}", input.display()))?;
                documents.push(
                    serde_json::from_slice(&raw)
                        .with_context(|| format!("{} is not JSON", input.display()))?,
                );
            }
            let records = manifest::consolidate(documents);
            tracing::info!(
                inputs = inputs.len(),
                descriptions = records.len(),
                "Consolidated descriptions"
            );
            write_json(&records, output.as_deref())
        }
        Command::Serve => serve(&config).await,
    }
}

async fn run_batch(config: &mut Config, source: BatchSource, run: RunArgs) -> Result<()> {
    if let Some(workers) = run.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        config.batch_workers = workers;
    }
    let settings = run.settings(config);
    let orchestrator = BatchOrchestrator::from_config(config)?;
    let cancel = cancel_on_ctrl_c();
    let report = orchestrator.run(&source, settings, &cancel).await?;
    finish_pass(&orchestrator, &report, run.output.as_deref()).await
}

async fn finish_pass(
    orchestrator: &BatchOrchestrator,
    report: &BatchReport,
    output: Option<&Path>,
) -> Result<()> {
    if report.outcome == PassOutcome::Cancelled {
        tracing::warn!(
            batch_id = %report.batch_id,
            pending = report.progress.pending,
            "Pass cancelled; rerun the same command to resume"
        );
    }
    match orchestrator.manifest_for(&report.batch_id).await? {
        Some(manifest) => write_json(&manifest, output),
        None => write_json(report, output),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received; finishing in-flight items");
            token.cancel();
        }
    });
    cancel
}

fn write_json<T: Serialize + ?Sized>(value: &T, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(path = %path.display(), "Wrote output");
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn serve(config: &Config) -> Result<()> {
    let orchestrator = Arc::new(BatchOrchestrator::from_config(config)?);
    let shutdown = orchestrator.shutdown_token();
    let app = api::create_router(orchestrator.clone(), config.default_language.clone());

    let (listener, port) = bind_listener(config.server_port).await?;
    tracing::info!("Listening on http://0.0.0.0:{}", port);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down; cancelling running passes");
            shutdown.cancel();
        })
        .await;
    // Passes write their final checkpoint before they exit.
    orchestrator.shutdown_token().cancel();
    orchestrator.wait_for_background_passes().await;
    tracing::info!("Background passes stopped");
    served?;
    Ok(())
}

async fn bind_listener(server_port: Option<u16>) -> Result<(TcpListener, u16), std::io::Error> {
    use std::net::Ipv4Addr;

    if let Some(port) = server_port {
        return TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map(|listener| (listener, port));
    }

    const PORT_RANGE: std::ops::RangeInclusive<u16> = 4100..=4199;
    for port in PORT_RANGE {
        match TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(listener) => {
                tracing::debug!(port, "Bound server port");
                return Ok((listener, port));
            }
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "Port already in use; trying next");
                continue;
            }
            Err(err) => return Err(err),
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::AddrNotAvailable,
        "No available port found in range 4100-4199",
    ))
}

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use scrubline_core::ffmpeg::TranscodeProfile;
use scrubline_core::heatmap::HeatmapResult;
use scrubline_core::rpc::WorkerClient;
use scrubline_core::services::{worker_client, CoreServices};
use scrubline_core::settings::EngineSettings;
use scrubline_core::Percent;

use crate::worker::{self, HeatmapRequest, ProgressRequest, HEATMAP_MESSAGE, PROGRESS_MESSAGE};
use crate::{Cli, Commands, SettingsAction, EXIT_BUSY};

const PROGRESS_POLL: Duration = Duration::from_millis(500);

/// Headroom over the analysis timeout before the RPC call itself gives up
const ISOLATED_CALL_MARGIN_MS: u64 = 5_000;

/// Conventional exit status after SIGINT
const EXIT_INTERRUPTED: u8 = 130;

pub async fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    match &cli.command {
        Commands::Probe { input } => probe(&cli.effective_settings(), input).await,
        Commands::Heatmap {
            input,
            points,
            isolated: false,
        } => heatmap(&cli.effective_settings(), input, *points).await,
        Commands::Heatmap {
            input,
            points,
            isolated: true,
        } => heatmap_isolated(&cli.effective_settings(), input, *points).await,
        Commands::Transcode {
            input,
            profile,
            output,
        } => transcode(&cli.effective_settings(), input, profile, output.as_deref()).await,
        Commands::Worker => {
            worker::run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Settings { action } => {
            let manager = cli.settings_manager();
            let settings = match action {
                SettingsAction::Show => cli.effective_settings(),
                SettingsAction::Reset => manager.reset().context("failed to reset settings")?,
            };
            print_json(&settings)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn probe(settings: &EngineSettings, input: &Path) -> anyhow::Result<ExitCode> {
    let services = CoreServices::from_settings(settings);
    let info = services
        .ffmpeg
        .runner()?
        .probe(input)
        .await
        .with_context(|| format!("failed to probe {}", input.display()))?;
    print_json(&info)?;
    Ok(ExitCode::SUCCESS)
}

/// Logs progress when it moves.
struct ProgressLog {
    last: Option<Percent>,
}

impl ProgressLog {
    fn new() -> Self {
        Self { last: None }
    }

    fn update(&mut self, progress: Option<Percent>) {
        if let Some(p) = progress {
            if self.last != Some(p) {
                info!(progress = p, "Analyzing");
                self.last = Some(p);
            }
        }
    }
}

async fn heatmap(
    settings: &EngineSettings,
    input: &Path,
    points: Option<f64>,
) -> anyhow::Result<ExitCode> {
    let services = CoreServices::from_settings(settings);
    let engine = &services.heatmaps;

    let job = engine.generate_heatmap(input, points);
    tokio::pin!(job);
    let mut ticker = tokio::time::interval(PROGRESS_POLL);
    let mut log = ProgressLog::new();

    let result = loop {
        tokio::select! {
            result = &mut job => break result,
            _ = ticker.tick() => log.update(engine.get_progress(input)),
        }
    };
    let result =
        result.with_context(|| format!("heatmap generation failed for {}", input.display()))?;

    print_json(&result)?;
    Ok(ExitCode::SUCCESS)
}

async fn heatmap_isolated(
    settings: &EngineSettings,
    input: &Path,
    points: Option<f64>,
) -> anyhow::Result<ExitCode> {
    let mut client_settings = settings.clone();
    client_settings.worker.request_timeout_ms = client_settings
        .worker
        .request_timeout_ms
        .max(settings.heatmap.timeout_ms + ISOLATED_CALL_MARGIN_MS);

    let client = worker_client(&client_settings)?;
    let result = run_isolated(&client, settings, input, points).await?;
    print_json(&result)?;
    Ok(ExitCode::SUCCESS)
}

/// Runs one heatmap through `client`'s worker, then stops the worker.
///
/// `settings` travel in the `init` handshake, so a restarted worker is
/// configured the same way.
async fn run_isolated(
    client: &WorkerClient,
    settings: &EngineSettings,
    input: &Path,
    points: Option<f64>,
) -> anyhow::Result<HeatmapResult> {
    client
        .init(Some(serde_json::to_value(settings)?))
        .await
        .context("failed to start worker")?;

    let request = HeatmapRequest {
        path: input.to_path_buf(),
        points,
    };
    let progress_request = ProgressRequest {
        path: input.to_path_buf(),
    };

    let job = client.call::<_, HeatmapResult>(HEATMAP_MESSAGE, &request);
    tokio::pin!(job);
    let mut ticker = tokio::time::interval(PROGRESS_POLL);
    let mut log = ProgressLog::new();

    let result = loop {
        tokio::select! {
            result = &mut job => break result,
            _ = ticker.tick() => {
                match client.call::<_, Option<Percent>>(PROGRESS_MESSAGE, &progress_request).await {
                    Ok(progress) => log.update(progress),
                    Err(e) => warn!("Progress query failed: {}", e),
                }
            }
        }
    };
    client.terminate(true);

    result.with_context(|| format!("isolated heatmap generation failed for {}", input.display()))
}

async fn transcode(
    settings: &EngineSettings,
    input: &Path,
    profile: &str,
    output: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let profile = TranscodeProfile::from_name(profile).ok_or_else(|| {
        anyhow!(
            "unknown profile '{}', expected one of: {}",
            profile,
            TranscodeProfile::names().join(", ")
        )
    })?;

    let services = CoreServices::from_settings(settings);
    let mut session = match services.start_transcode(input, &profile).await {
        Ok(session) => session,
        Err(e) if e.is_retryable() => {
            eprintln!("busy: {}", e);
            return Ok(ExitCode::from(EXIT_BUSY));
        }
        Err(e) => {
            return Err(e).with_context(|| format!("failed to start transcode of {}", input.display()))
        }
    };

    let mut stream = session
        .take_stdout()
        .context("transcode output was not captured")?;
    let mut sink = open_sink(output).await?;

    let copied = tokio::select! {
        copied = tokio::io::copy(&mut stream, &mut sink) => Some(copied),
        _ = tokio::signal::ctrl_c() => None,
    };

    let Some(copied) = copied else {
        session.cancel().await;
        warn!("Transcode interrupted");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    };

    let bytes = match copied {
        Ok(bytes) => bytes,
        Err(e) => {
            session.cancel().await;
            return Err(e).context("failed to write transcode output");
        }
    };
    sink.flush().await?;
    session.wait().await.context("transcode failed")?;

    info!(bytes, profile = %profile.name, "Transcode complete");
    Ok(ExitCode::SUCCESS)
}

async fn open_sink(output: Option<&Path>) -> anyhow::Result<Box<dyn AsyncWrite + Unpin + Send>> {
    let sink: Box<dyn AsyncWrite + Unpin + Send> = match output {
        Some(path) => {
            let file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?;
            Box::new(file)
        }
        None => Box::new(tokio::io::stdout()),
    };
    Ok(sink)
}

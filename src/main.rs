use anyhow::{bail, Context};
use facecloak::cloak::{CloakError, CloakPipeline, CloakService, Gallery};
use facecloak::config::AppConfig;
use facecloak::models::{BridgeExtractor, ModelBridge};
use log::{error, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

enum Command {
    Serve,
    Once,
    Local(PathBuf),
}

fn usage() {
    eprintln!("Usage: facecloak [--once | --local <dir>]");
    eprintln!("  (no flags)     poll the queue forever");
    eprintln!("  --once         process a single batch and exit");
    eprintln!("  --local <dir>  cloak every image in <dir> without the queue");
}

fn parse_args(args: &[String]) -> anyhow::Result<Option<Command>> {
    match args.get(1).map(String::as_str) {
        None => Ok(Some(Command::Serve)),
        Some("--once") => Ok(Some(Command::Once)),
        Some("--local") => match args.get(2) {
            Some(dir) => Ok(Some(Command::Local(PathBuf::from(dir)))),
            None => bail!("--local requires a directory"),
        },
        Some("--help") | Some("-h") => Ok(None),
        Some(other) => bail!("Unknown command: {other}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let Some(command) = parse_args(&args).inspect_err(|_| usage())? else {
        usage();
        return Ok(());
    };

    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();
    let config = AppConfig::load().context("Failed to load configuration")?;

    let bridge = Arc::new(ModelBridge::new(
        config.cloak.bridge.clone(),
        config.cloak.model_dir.clone(),
        config.cloak.extractors.clone(),
    ));
    bridge.start().await.context("Failed to start model bridge")?;

    let gallery = Gallery::load(&config.cloak.model_dir, &config.cloak.extractors)?;
    let service = Arc::new(CloakService::new(
        bridge.clone(),
        BridgeExtractor::all(&bridge),
        bridge.clone(),
        gallery,
        config.cloak.seed,
    ));
    let pipeline = CloakPipeline::new(config.cloak.settings());

    let result = match command {
        Command::Local(dir) => run_local(&pipeline, &service, &dir).await,
        Command::Once => serve(config, pipeline, service, true).await,
        Command::Serve => serve(config, pipeline, service, false).await,
    };

    if let Err(e) = bridge.stop().await {
        error!("Failed to stop model bridge: {e}");
    }
    result
}

async fn run_local(pipeline: &CloakPipeline, service: &CloakService, dir: &Path) -> anyhow::Result<()> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            !p.file_name()
                .is_some_and(|n| n.to_string_lossy().contains("_cloaked"))
        })
        .collect();
    paths.sort();

    match pipeline.run(service, &paths).await {
        Ok(report) => {
            for output in &report.outputs {
                info!("{} -> {}", output.source.display(), output.output.display());
            }
            info!("Done!");
            Ok(())
        }
        Err(e @ CloakError::FaceNotFound) | Err(e @ CloakError::NoImages) => {
            info!("{e}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(all(feature = "queue", feature = "drive"))]
async fn serve(
    config: AppConfig,
    pipeline: CloakPipeline,
    service: Arc<CloakService>,
    once: bool,
) -> anyhow::Result<()> {
    use facecloak::worker::queue::SqsQueue;
    use facecloak::worker::drive::S3Drive;
    use facecloak::worker::{BatchOutcome, FetchPool, FirestoreStore, JobSource, ResultSink, Worker};
    use std::time::Duration;

    let queue = Arc::new(SqsQueue::connect(&config.queue.url, &config.queue.region).await);
    let drive = Arc::new(S3Drive::connect(&config).await);
    let store = Arc::new(FirestoreStore::new(&config.datastore));

    let worker = Worker::new(
        JobSource::new(queue, config.queue.clone()),
        FetchPool::new(
            drive.clone(),
            config.worker.fetch_concurrency,
            config.worker.fetch_retries,
            Duration::from_secs(config.worker.fetch_retry_delay_seconds),
        ),
        pipeline,
        service,
        ResultSink::new(
            drive,
            store,
            config.drive.clone(),
            config.datastore.clone(),
        ),
        config.worker.clone(),
    );

    info!(
        "Worker started (mode {}, batch size {})",
        config.cloak.mode, config.queue.batch_size
    );
    if once {
        match worker.run_once().await? {
            BatchOutcome::Idle => info!("Queue was empty"),
            BatchOutcome::Processed(summary) => info!(
                "Processed {} job(s), {} published",
                summary.outcomes.len(),
                summary.published()
            ),
        }
        return Ok(());
    }
    worker.run().await?;
    Ok(())
}

#[cfg(not(all(feature = "queue", feature = "drive")))]
async fn serve(
    _config: AppConfig,
    _pipeline: CloakPipeline,
    _service: Arc<CloakService>,
    _once: bool,
) -> anyhow::Result<()> {
    bail!("Queue mode needs the `queue` and `drive` features; use --local <dir>")
}

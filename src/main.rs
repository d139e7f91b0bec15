use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use grabbify::config::{AppConfig, CliConfig, FileConfig};
use grabbify::downloader::{ResumingDownloader, SegmentedDownloader};
use grabbify::extractor::{CatalogExtractor, Extractor, PageExtractor, PlaylistExtractor};
use grabbify::http::build_client;
use grabbify::mapper::TrackMapper;
use grabbify::orchestrator::{BatchManager, Dispatcher, RampUpTask, Watchdog};
use grabbify::resolver::StreamResolver;
use grabbify::server::{run_server, ServerState, TaskRegistry};
use grabbify::store::SqliteImportStore;
use grabbify::video_platform::VideoApiClient;

fn parse_dir(s: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.exists() {
        return Err(format!("Directory does not exist: {}", s));
    }
    if !path.is_dir() {
        return Err(format!("Path is not a directory: {}", s));
    }
    Ok(path)
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Path to TOML configuration file. Values in the file override CLI
    /// arguments.
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Directory for the database. Can also be set in the config file.
    #[clap(long, value_parser = parse_dir)]
    pub data_dir: Option<PathBuf>,

    /// Directory for downloaded audio files. Defaults to <data-dir>/Music.
    #[clap(long)]
    pub music_dir: Option<PathBuf>,

    /// The port to listen on.
    #[clap(short, long, default_value_t = 8090)]
    pub port: u16,

    /// Base URL of the video platform API instance.
    #[clap(long)]
    pub video_api_url: Option<String>,

    /// Mirror API instances, tried in order when the primary fails.
    #[clap(long = "mirror")]
    pub mirror_urls: Vec<String>,
}

impl From<&CliArgs> for CliConfig {
    fn from(args: &CliArgs) -> Self {
        CliConfig {
            data_dir: args.data_dir.clone(),
            music_dir: args.music_dir.clone(),
            port: args.port,
            video_api_url: args.video_api_url.clone(),
            mirror_urls: args.mirror_urls.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Some(FileConfig::load(path)?)
        }
        None => None,
    };
    let cli_config: CliConfig = (&cli_args).into();
    let app_config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Configuration loaded:");
    info!("  data_dir: {:?}", app_config.data_dir);
    info!("  music_dir: {:?}", app_config.music_dir);
    info!("  port: {}", app_config.port);
    info!("  video_api_url: {}", app_config.video_api_url);
    info!("  mirrors: {}", app_config.mirror_urls.len());

    tokio::fs::create_dir_all(&app_config.music_dir).await?;

    let store = Arc::new(SqliteImportStore::new(app_config.db_path())?);

    let client = build_client();
    let video_api = VideoApiClient::new(client.clone(), app_config.video_api_url.clone());
    let resolver = StreamResolver::new(
        client.clone(),
        video_api.clone(),
        app_config.mirror_urls.clone(),
    );

    let extractor = Extractor::new(
        PlaylistExtractor::new(video_api.clone()),
        CatalogExtractor::new(client.clone(), app_config.catalog.clone()),
        PageExtractor::new(client.clone()),
    );

    let manager = Arc::new(BatchManager::new(
        store,
        extractor,
        TrackMapper::new(video_api.clone()),
        resolver.clone(),
        SegmentedDownloader::new(client.clone()),
        app_config.music_dir.clone(),
    ));

    // Requeue whatever a previous process left in flight before any
    // dispatching starts.
    manager.recover().await?;

    let shutdown = CancellationToken::new();

    let dispatcher = Dispatcher::new(manager.clone());
    let dispatcher_shutdown = shutdown.clone();
    tokio::spawn(async move {
        dispatcher.run(dispatcher_shutdown).await;
    });

    let watchdog = Watchdog::new(manager.clone());
    let watchdog_shutdown = shutdown.clone();
    tokio::spawn(async move {
        watchdog.run(watchdog_shutdown).await;
    });

    let ramp_up = RampUpTask::new(manager.clone());
    let ramp_up_shutdown = shutdown.clone();
    tokio::spawn(async move {
        ramp_up.run(ramp_up_shutdown).await;
    });

    let tasks = Arc::new(TaskRegistry::new(
        resolver,
        ResumingDownloader::new(client),
        app_config.music_dir.clone(),
    ));

    let state = ServerState {
        manager,
        tasks,
        search_api: video_api,
    };

    let server_shutdown = shutdown.clone();
    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            ctrl_c_shutdown.cancel();
        }
    });

    run_server(state, app_config.port, server_shutdown).await?;
    shutdown.cancel();

    info!("Bye");
    Ok(())
}

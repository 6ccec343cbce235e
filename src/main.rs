use std::sync::Arc;

use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use s2_downloader::config::{AppConfig, Credentials};
use s2_downloader::date_generator;
use s2_downloader::downloader::{
    spawn_worker_pool, DownloadWorker, HttpUpstreamClient, Inthub2Routing,
};
use s2_downloader::fetcher::LinkFetcher;
use s2_downloader::object_store::FsObjectStore;
use s2_downloader::queue::SqliteDownloadQueue;
use s2_downloader::requeuer::requeue_missing_granules;
use s2_downloader::search::HttpCatalogClient;
use s2_downloader::store::SqliteGranuleStore;
use s2_downloader::subscription::{subscription_router, SubscriptionConfig, SubscriptionState};
use s2_downloader::tiles::load_accepted_tile_ids;

#[derive(Parser, Debug)]
#[command(name = "s2-downloader")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the push subscription endpoint and the download worker pool.
    Serve {
        /// The port to listen on.
        #[clap(short, long, default_value_t = 8080)]
        port: u16,
    },
    /// Process catalog pages for one (date, platform) work item.
    Fetch {
        /// Publication day to query, as YYYY-MM-DD.
        #[clap(long)]
        date: NaiveDate,
        /// Sentinel-2 platform to query (S2A, S2B, ...).
        #[clap(long)]
        platform: String,
        /// Keep stepping through pages until the day is complete, instead of
        /// processing a single page per invocation.
        #[clap(long)]
        run_to_completion: bool,
    },
    /// Re-admit undownloaded granules for an ingestion date.
    Requeue {
        /// Ingestion day to backfill, as YYYY-MM-DD.
        #[clap(long)]
        date: NaiveDate,
        /// Report only (true) or publish download messages (false). Must be
        /// passed explicitly; there is no default.
        #[clap(long, action = clap::ArgAction::Set)]
        dry_run: bool,
    },
    /// Print the (date, platform) work list for the discovery stage.
    Dates {
        /// How many days before today to cover.
        #[clap(long, default_value_t = date_generator::DEFAULT_LOOKBACK_DAYS)]
        lookback_days: u32,
        /// Comma-separated platform codes.
        #[clap(long, value_delimiter = ',')]
        platforms: Vec<String>,
    },
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

    let config = AppConfig::from_env()?;

    match cli_args.command {
        Command::Serve { port } => serve(config, port).await,
        Command::Fetch {
            date,
            platform,
            run_to_completion,
        } => fetch(config, date, &platform, run_to_completion).await,
        Command::Requeue { date, dry_run } => requeue(config, date, dry_run),
        Command::Dates {
            lookback_days,
            platforms,
        } => {
            let platforms = if platforms.is_empty() {
                date_generator::default_platforms()
            } else {
                platforms
            };
            let pairs = date_generator::query_dates_platforms(
                date_generator::today_utc(),
                lookback_days,
                &platforms,
            );
            println!("{}", serde_json::to_string_pretty(&pairs)?);
            Ok(())
        }
    }
}

fn open_stores(config: &AppConfig) -> Result<(Arc<SqliteGranuleStore>, Arc<SqliteDownloadQueue>)> {
    std::fs::create_dir_all(&config.db_dir)?;
    let store = Arc::new(SqliteGranuleStore::new(config.granule_db_path())?);
    let queue = Arc::new(SqliteDownloadQueue::new(config.queue_db_path())?);
    Ok((store, queue))
}

async fn serve(config: AppConfig, port: u16) -> Result<()> {
    let (store, queue) = open_stores(&config)?;
    let accepted_tile_ids = load_accepted_tile_ids(&config.accepted_tile_ids_path)?;
    info!("Loaded {} accepted tile ids", accepted_tile_ids.len());

    let shutdown = CancellationToken::new();

    if config.enable_downloading {
        let scihub = Credentials::from_env("SCIHUB")?;
        let inthub2 = if config.use_inthub2 {
            Some(Inthub2Routing {
                url: config.inthub2_url.clone(),
                credentials: Credentials::from_env("INTHUB2")?,
            })
        } else {
            None
        };
        let upstream = Arc::new(HttpUpstreamClient::new(
            config.search_url.clone(),
            scihub,
            inthub2,
            config.http_timeout_secs,
        )?);

        std::fs::create_dir_all(&config.upload_root)?;
        let object_store = Arc::new(FsObjectStore::new(
            config.upload_root.clone(),
            config.upload_bucket.clone(),
        ));

        let worker = Arc::new(DownloadWorker::new(
            store.clone(),
            queue.clone(),
            upstream,
            object_store,
            config.max_download_retries,
            config.visibility_timeout_secs,
        ));
        spawn_worker_pool(
            worker,
            config.download_concurrency,
            config.visibility_timeout_secs,
            shutdown.clone(),
        );
    } else {
        info!("Downloading is disabled, running the subscription endpoint only");
    }

    let notification = Credentials::from_env("NOTIFICATION")?;
    let state = Arc::new(SubscriptionState {
        store,
        queue,
        accepted_tile_ids,
        config: SubscriptionConfig {
            username: notification.username,
            password: notification.password,
            recency_days: config.subscription_recency_days,
        },
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Subscription endpoint listening on port {}", port);

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
            shutdown.cancel();
        }
    };

    axum::serve(listener, subscription_router(state))
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

async fn fetch(
    config: AppConfig,
    date: NaiveDate,
    platform: &str,
    run_to_completion: bool,
) -> Result<()> {
    let (store, queue) = open_stores(&config)?;
    let accepted_tile_ids = load_accepted_tile_ids(&config.accepted_tile_ids_path)?;
    let catalog = Arc::new(HttpCatalogClient::new(
        config.search_url.clone(),
        config.zipper_url.clone(),
        config.http_timeout_secs,
    )?);

    let fetcher = LinkFetcher::new(store, queue, catalog, accepted_tile_ids);

    loop {
        let outcome = fetcher.fetch_step(date, platform).await?;
        println!("{}", serde_json::to_string(&outcome)?);
        if outcome.completed || !run_to_completion {
            return Ok(());
        }
    }
}

fn requeue(config: AppConfig, date: NaiveDate, dry_run: bool) -> Result<()> {
    let (store, queue) = open_stores(&config)?;
    let report = requeue_missing_granules(store.as_ref(), queue.as_ref(), date, dry_run)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

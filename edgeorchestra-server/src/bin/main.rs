use std::{path::PathBuf, process, time::Duration};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, warn};
use tracing_subscriber::FmtSubscriber;

use edgeorchestra_server::{
    coordinator::{job::RoundPolicy, Fleet},
    events::FleetEvents,
    liveness::LivenessTracker,
    registry::DeviceRegistry,
    services,
    settings::Settings,
    storage::{self, FsModelStore, InMemoryStore, ModelStorage, Store},
    sweeper::Sweeper,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "EdgeOrchestra")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        api: api_settings,
        heartbeat: heartbeat_settings,
        round: round_settings,
        eligibility: eligibility_settings,
        model_store: model_store_settings,
        sweeper: sweeper_settings,
        jobs: job_settings,
        redis: redis_settings,
        log: log_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let rows = InMemoryStore::new();
    let liveness_store = storage::redis::Client::new(redis_settings.url)
        .await
        .unwrap_or_else(|err| {
            error!(error = %err, "failed to connect to Redis");
            process::exit(1);
        });
    let model_store = FsModelStore::new(model_store_settings.directory.clone())
        .await
        .unwrap_or_else(|err| {
            error!(error = %err, "failed to open the model store");
            process::exit(1);
        });
    let store = Store::new(rows.clone(), rows, liveness_store, model_store);

    let heartbeat_interval = Duration::from_secs(heartbeat_settings.interval_s);
    let registry = DeviceRegistry::new(store.clone());
    let liveness = LivenessTracker::new(
        store.clone(),
        heartbeat_interval,
        heartbeat_settings.miss_threshold,
    );

    let fleet_events = FleetEvents::new();
    let policy = RoundPolicy::new(&round_settings, &eligibility_settings);
    let fleet = Fleet::new(
        store.clone(),
        policy,
        job_settings.max_active,
        fleet_events.clone(),
    );
    if let Err(err) = fleet.resume_jobs().await {
        warn!(error = %err, "failed to resume interrupted jobs");
    }

    let sweeper = Sweeper::new(
        store.clone(),
        Duration::from_secs(sweeper_settings.period_s),
        fleet_events,
    );

    let retention = Duration::from_secs(model_store_settings.blob_retention_s);
    let gc_store = store.clone();
    let gc = async move {
        let mut store = gc_store;
        let period = std::cmp::max(retention / 4, Duration::from_secs(60));
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.collect_garbage(retention).await {
                Ok(collected) if !collected.is_empty() => {
                    warn!(blobs = collected.len(), "collected unreferenced model blobs");
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "model blob garbage collection failed"),
            }
        }
    };

    tokio::select! {
        _ = sweeper.run() => {
            warn!("shutting down: sweeper terminated");
        }
        _ = gc => {
            warn!("shutting down: garbage collector terminated");
        }
        result = services::serve(
            api_settings,
            registry,
            liveness,
            fleet,
            store,
            model_store_settings.chunk_size_bytes,
        ) => {
            if let Err(err) = result {
                error!(error = %err, "gRPC server terminated");
            }
            warn!("shutting down: gRPC server terminated");
        }
        _ = signal::ctrl_c() => {}
    }
}

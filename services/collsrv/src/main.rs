use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use common::sqlite::SqliteOptions;
use common::{cancel_on_shutdown, init_logging, LogOptions};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use collsrv::api::{self, ApiState};
use collsrv::config::{Args, CollectorConfig};
use collsrv::metrics::{StatusReporter, WriteStats};
use collsrv::publish::mqtt::MqttBus;
use collsrv::publish::realtime::RealtimeHub;
use collsrv::publish::{MessageBus, Publisher};
use collsrv::reader::{LinkRegistry, ReaderContext};
use collsrv::reconcile::ConfigReconciler;
use collsrv::runtime::Supervisor;
use collsrv::scheduler::GroupScheduler;
use collsrv::source::ConfigSource;
use collsrv::store::SqliteStore;
use collsrv::SERVICE_NAME;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = CollectorConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    config.apply_args(&args);

    let mut log_options = LogOptions::new(SERVICE_NAME);
    log_options.level = config.logging.level.clone();
    log_options.dir = config.logging.dir.clone();
    log_options.ansi = !args.no_color;
    let _log_guard = init_logging(&log_options)?;

    let source = ConfigSource::new(&config.config_path);
    match source.settings() {
        Ok(settings) => {
            if let Some(mqtt) = settings.mqtt {
                if let Some(host) = mqtt.host {
                    config.mqtt.host = host;
                }
                if let Some(port) = mqtt.port {
                    config.mqtt.port = port;
                }
            }
        },
        Err(e) => warn!("Ignoring unreadable settings.yml: {}", e),
    }
    config.validate()?;

    if args.validate {
        let loaded = source.load()?;
        for (file, err) in &loaded.failures {
            error!("{}: {}", file.display(), err);
        }
        if !loaded.is_complete() {
            bail!("{} definition file(s) invalid", loaded.failures.len());
        }
        info!(
            "{} machine definition(s) valid under {}",
            loaded.definitions.len(),
            source.root().display()
        );
        return Ok(());
    }

    info!(
        "Starting {} v{} (definitions: {}, database: {})",
        SERVICE_NAME,
        env!("CARGO_PKG_VERSION"),
        config.config_path.display(),
        config.database.path.display()
    );

    let store = Arc::new(
        SqliteStore::open_with(
            &config.database.path,
            SqliteOptions {
                max_connections: config.database.max_connections,
                ..Default::default()
            },
        )
        .await?,
    );

    let cancel = CancellationToken::new();
    cancel_on_shutdown(cancel.clone());

    let bus: Option<Arc<dyn MessageBus>> = if config.mqtt.enabled {
        info!("MQTT broker {}:{}", config.mqtt.host, config.mqtt.port);
        Some(Arc::new(MqttBus::start(&config.mqtt, cancel.clone())))
    } else {
        info!("MQTT disabled");
        None
    };
    let publisher = Publisher::new(bus, Arc::new(RealtimeHub::new()));
    let stats = Arc::new(WriteStats::new());
    let links = Arc::new(LinkRegistry::new());

    let ctx = ReaderContext {
        store: store.clone(),
        publisher: publisher.clone(),
        stats: stats.clone(),
        links: links.clone(),
        settings: config.reader_settings(),
    };
    let mut supervisor = Supervisor::new(
        ConfigReconciler::new(store.clone(), source),
        GroupScheduler::new(ctx, cancel.clone()),
        store.clone(),
        config.sync_interval(),
    );
    supervisor.start().await;
    if let Err(e) = store.log_roster_summary().await {
        warn!("Roster summary unavailable: {}", e);
    }

    let reporter = StatusReporter::new(
        stats.clone(),
        store.clone(),
        links.clone(),
        publisher.clone(),
        config.status_interval(),
    );
    let reporter_handle = tokio::spawn(reporter.run(cancel.clone()));
    let supervisor_handle = tokio::spawn(supervisor.run(cancel.clone()));

    let api_handle = if config.api.enabled {
        let addr = config.api_addr()?;
        let state = ApiState {
            stats,
            links,
            store: store.clone(),
            publisher,
        };
        let api_cancel = cancel.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::serve(addr, state, api_cancel.clone()).await {
                error!("{}", e);
                api_cancel.cancel();
            }
        }))
    } else {
        None
    };

    cancel.cancelled().await;
    info!("Shutting down");

    if let Err(e) = supervisor_handle.await {
        error!("Supervisor task failed: {}", e);
    }
    if let Err(e) = reporter_handle.await {
        error!("Status reporter task failed: {}", e);
    }
    if let Some(handle) = api_handle {
        if let Err(e) = handle.await {
            error!("API task failed: {}", e);
        }
    }

    store.close().await;
    info!("{} stopped", SERVICE_NAME);
    Ok(())
}

use anyhow::{Context, Result};
use common::telemetry::init_telemetry;
use event_prediction::{EventPredictionEngine, Neo4jGraphContext, PgPredictionStore};
use market_impact::{HttpMarketData, MarketDataProvider, MarketImpactAnalyzer, PgPriceHistory};
use outbox_relay::publisher::AmqpPublisher;
use outbox_relay::{BrokerConfig, BrokerKind, MessagePublisher, OutboxRelay, PgOutboxStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

mod scheduler;
mod settings;

use settings::{GraphConfig, Settings};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("EVENT_INTEL_CONFIG").ok();
    let settings = Settings::load(Some(config_path.as_deref().unwrap_or("config/intel-service")))?;

    init_telemetry(&settings.logging);

    info!("Starting event intelligence service");

    let db_pool = Arc::new(
        PgPoolOptions::new()
            .max_connections(settings.database.max_connections)
            .connect(&settings.database.url)
            .await
            .context("Failed to connect to Postgres")?,
    );

    let prediction_store = Arc::new(PgPredictionStore::new(db_pool.clone()));
    prediction_store.initialize().await?;

    let outbox_store = Arc::new(PgOutboxStore::new(db_pool.clone()));
    outbox_store.initialize().await?;

    let provider: Arc<dyn MarketDataProvider> = match &settings.market_data.base_url {
        Some(base_url) => Arc::new(HttpMarketData::new(base_url.clone(), &settings.market_data)?),
        None => {
            let history = PgPriceHistory::new(db_pool.clone());
            history.initialize().await?;
            Arc::new(history)
        }
    };
    let analyzer = Arc::new(MarketImpactAnalyzer::new(provider, settings.analyzer.clone()));

    let mut engine = EventPredictionEngine::new(prediction_store, settings.prediction.clone())
        .with_market_impact(analyzer);
    if let Some(graph) = connect_graph(&settings.graph).await {
        engine = engine.with_graph(Arc::new(graph));
    }
    let engine = Arc::new(engine);

    let publisher = connect_publisher(&settings.broker).await?;
    let relay = Arc::new(OutboxRelay::new(outbox_store, publisher, settings.relay.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay_task = tokio::spawn({
        let relay = relay.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Err(e) = relay.run(shutdown).await {
                error!("Outbox relay exited: {:#}", e);
            }
        }
    });

    let watch_task = tokio::spawn(scheduler::every(
        "watch-pass",
        settings.schedule.watch_interval(),
        shutdown_rx.clone(),
        {
            let engine = engine.clone();
            move || {
                let engine = engine.clone();
                async move {
                    match engine.process_pending_watches().await {
                        Ok(report) => debug!(?report, "Watch pass"),
                        Err(e) => error!("Watch pass failed: {:#}", e),
                    }
                }
            }
        },
    ));

    let sweep_task = tokio::spawn(scheduler::every(
        "prediction-sweep",
        settings.schedule.sweep_interval(),
        shutdown_rx.clone(),
        {
            let engine = engine.clone();
            move || {
                let engine = engine.clone();
                async move {
                    match engine.sweep().await {
                        Ok(report) => debug!(?report, "Prediction sweep"),
                        Err(e) => error!("Prediction sweep failed: {:#}", e),
                    }
                }
            }
        },
    ));

    let health_task = tokio::spawn(scheduler::every(
        "relay-health",
        settings.schedule.health_interval(),
        shutdown_rx,
        {
            let relay = relay.clone();
            move || {
                let relay = relay.clone();
                async move {
                    let health = relay.health().await;
                    if !health.healthy {
                        warn!(
                            running = health.running,
                            broker_connected = health.broker_connected,
                            "Outbox relay unhealthy"
                        );
                    }
                    if let Some(warning) = &health.warning {
                        warn!("Outbox relay: {}", warning);
                    }
                }
            }
        },
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down gracefully...");

    let _ = shutdown_tx.send(true);
    for (name, task) in [
        ("relay", relay_task),
        ("watch-pass", watch_task),
        ("prediction-sweep", sweep_task),
        ("relay-health", health_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, "Task panicked: {}", e);
        }
    }

    match engine.accuracy_report().await {
        Ok(report) => info!(
            made = report.overall.made,
            fulfilled = report.overall.fulfilled,
            accuracy = report.overall.accuracy,
            "Prediction accuracy at shutdown"
        ),
        Err(e) => warn!("Accuracy report unavailable: {:#}", e),
    }

    db_pool.close().await;
    info!("Stopped");
    Ok(())
}

async fn connect_graph(config: &GraphConfig) -> Option<Neo4jGraphContext> {
    if !config.enabled {
        return None;
    }
    let graph = match Neo4jGraphContext::connect(&config.uri, &config.user, &config.password).await {
        Ok(graph) => graph,
        Err(e) => {
            warn!("Causal graph unavailable, predicting without graph context: {:#}", e);
            return None;
        }
    };
    if let Err(e) = graph.init_schema().await {
        warn!("Failed to prepare graph schema: {:#}", e);
    }
    Some(graph)
}

async fn connect_publisher(config: &BrokerConfig) -> Result<Arc<dyn MessagePublisher>> {
    match config.kind {
        BrokerKind::Amqp => Ok(Arc::new(AmqpPublisher::connect(&config.amqp).await?)),
        #[cfg(feature = "kafka")]
        BrokerKind::Kafka => Ok(Arc::new(
            outbox_relay::publisher::KafkaPublisher::new(&config.kafka).await?,
        )),
        #[cfg(not(feature = "kafka"))]
        BrokerKind::Kafka => anyhow::bail!("broker kind kafka requires the `kafka` feature"),
    }
}

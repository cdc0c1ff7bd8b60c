//! Inventory service entry point.

use std::sync::Arc;

use api::config::Config;
use inventory_store::{InMemoryInventoryStore, InventoryStore, PostgresInventoryStore};
use metrics_exporter_prometheus::PrometheusHandle;
use reservation::{EventPublisher, LoggingEventPublisher, Reconciler};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[cfg(feature = "kafka")]
fn event_publisher(config: &Config) -> Arc<dyn EventPublisher> {
    match config.kafka_brokers.as_deref() {
        Some(brokers) => Arc::new(
            reservation::KafkaEventPublisher::new(brokers)
                .expect("failed to create Kafka producer"),
        ),
        None => Arc::new(LoggingEventPublisher),
    }
}

#[cfg(not(feature = "kafka"))]
fn event_publisher(config: &Config) -> Arc<dyn EventPublisher> {
    if config.kafka_brokers.is_some() {
        tracing::warn!("KAFKA_BROKERS is set but the kafka feature is disabled, logging events");
    }
    Arc::new(LoggingEventPublisher)
}

#[cfg(feature = "kafka")]
fn spawn_signal_listener<S: InventoryStore + 'static>(
    config: &Config,
    service: Arc<reservation::ReservationService<S>>,
    shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    use reservation::{LoggingDeadLetterSink, OrderEventListener};

    let brokers = config.kafka_brokers.clone()?;
    let listener = Arc::new(
        OrderEventListener::new(service, Arc::new(LoggingDeadLetterSink))
            .with_max_deliveries(config.signal_max_deliveries),
    );

    Some(tokio::spawn(async move {
        if let Err(e) =
            reservation::run_kafka_listener(&brokers, "inventory-service", listener, shutdown)
                .await
        {
            tracing::error!(error = %e, "order signal listener failed");
        }
    }))
}

#[cfg(not(feature = "kafka"))]
fn spawn_signal_listener<S: InventoryStore + 'static>(
    _config: &Config,
    _service: Arc<reservation::ReservationService<S>>,
    _shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    None
}

/// Serves the API and runs the background tasks over one store until shutdown.
async fn run<S: InventoryStore + Clone + 'static>(
    config: Config,
    store: S,
    metrics_handle: PrometheusHandle,
) {
    let publisher = event_publisher(&config);
    let state =
        api::create_default_state(store.clone(), Arc::clone(&publisher), config.reservation);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler =
        Reconciler::new(store, publisher, config.reconciler).spawn(shutdown_rx.clone());
    let signals = spawn_signal_listener(&config, Arc::clone(&state.service), shutdown_rx);

    let app = api::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting inventory service");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for handle in [reconciler, signals].into_iter().flatten() {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }
}

#[tokio::main]
async fn main() {
    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(log_level = %config.log_level, "configuration loaded");

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the store and serve
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresInventoryStore::new(pool).with_lock_timeout(config.lock_timeout);
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL inventory store");
            run(config, store, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory inventory store");
            let store = InMemoryInventoryStore::new().with_lock_timeout(config.lock_timeout);
            run(config, store, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}

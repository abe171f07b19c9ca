use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wind_telemetry::aggregate::{AggregationJob, AggregationSettings};
use wind_telemetry::config::Config;
use wind_telemetry::evaluator::Evaluator;
use wind_telemetry::gauge::GaugeService;
use wind_telemetry::geocode::{HttpGeocoder, NoopGeocoder, ReverseGeocoder};
use wind_telemetry::notify::{
    spawn_worker, DispatchEngine, DispatchQueue, DispatchSettings, EmailTransport,
    HttpEmailTransport, LogTransport,
};
use wind_telemetry::receiver::{bind_udp, run_receiver, PacketHandler};
use wind_telemetry::redeem::{CleanupJob, RedeemService};
use wind_telemetry::schedule::{Clock, Job, Schedule, Scheduler, SystemClock};
use wind_telemetry::state::AppState;
use wind_telemetry::stats::IngestStats;
use wind_telemetry::store::PgStore;
use wind_telemetry::types::TokenAction;
use wind_telemetry::{cli, db, routes};

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,wind_telemetry=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "wind-telemetry"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn build_transport(config: &Config) -> Result<Arc<dyn EmailTransport>> {
    match &config.email_api_key {
        Some(key) => Ok(Arc::new(HttpEmailTransport::new(
            config.email_api_url.clone(),
            key.clone(),
            config.email_from.clone(),
        )?)),
        None => {
            tracing::warn!("WIND_EMAIL_API_KEY not set; alert emails will only be logged");
            Ok(Arc::new(LogTransport))
        }
    }
}

fn build_geocoder(config: &Config) -> Result<Arc<dyn ReverseGeocoder>> {
    match &config.geocoder_url {
        Some(url) => Ok(Arc::new(HttpGeocoder::new(url.clone())?)),
        None => Ok(Arc::new(NoopGeocoder)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let mut config = Config::from_env()?;
    if let Some(bind) = args.http_bind.clone() {
        config.http_bind = bind;
    }
    if let Some(port) = args.udp_port {
        config.udp_port = port;
    }
    init_tracing(&config)?;

    let pool = db::build_pool(&config.database_url, config.db_pool_size).await?;
    if config.run_migrations {
        db::run_migrations(&pool).await?;
    }

    let store = Arc::new(PgStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let stats = Arc::new(IngestStats::new());
    let scheduler = Scheduler::new(clock.clone());

    let aggregation: Arc<dyn Job> = Arc::new(AggregationJob::new(
        store.clone(),
        AggregationSettings {
            bucket_width: chrono::Duration::minutes(config.aggregation_interval_minutes as i64),
            safety_buffer: chrono::Duration::minutes(config.safety_buffer_minutes as i64),
            retention: chrono::Duration::minutes(config.retention_minutes as i64),
        },
        stats.clone(),
    ));
    let cleanup: Arc<dyn Job> = Arc::new(CleanupJob::new(store.clone()));

    if args.one_shot() {
        if args.run_aggregation_once {
            scheduler.run_now(aggregation.as_ref()).await?;
        }
        if args.run_cleanup_once {
            scheduler.run_now(cleanup.as_ref()).await?;
        }
        return Ok(());
    }

    let transport = build_transport(&config)?;
    let engine = Arc::new(DispatchEngine::new(
        store.clone(),
        store.clone(),
        transport,
        clock.clone(),
        DispatchSettings {
            cooldown: config.cooldown(),
            token_ttl: config.token_ttl(),
            offered_actions: vec![
                TokenAction::Acknowledge,
                TokenAction::SnoozeHours(config.snooze_hours.first().copied().unwrap_or(1)),
                TokenAction::SnoozeToday,
            ],
            public_base_url: config.public_base_url.clone(),
        },
        stats.clone(),
    ));
    let (queue, dispatch_rx) = DispatchQueue::channel(config.dispatch_queue, stats.clone());
    let dispatch_handle = spawn_worker(dispatch_rx, engine, stats.clone());

    let handler = Arc::new(PacketHandler::new(
        store.clone(),
        build_geocoder(&config)?,
        Evaluator::new(store.clone(), queue, stats.clone()),
        clock.clone(),
        stats.clone(),
    ));
    let state = AppState {
        redeem: Arc::new(RedeemService::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            config.snooze_hours.clone(),
            config.timezone,
        )),
        handler: handler.clone(),
        gauge: Arc::new(GaugeService::new(
            store.clone(),
            clock.clone(),
            config.gauge_window(),
        )),
        stats: stats.clone(),
    };

    let cancel = CancellationToken::new();
    let socket = bind_udp(config.udp_port).await?;
    let mut receiver_handle = tokio::spawn(run_receiver(socket, handler, cancel.clone()));

    let aggregation_handle = scheduler.every(
        aggregation,
        Schedule::aligned(config.aggregation_interval(), config.aggregation_offset()),
        cancel.clone(),
    );
    let cleanup_handle = scheduler.every(
        cleanup,
        Schedule::every(config.cleanup_interval()),
        cancel.clone(),
    );

    let app = routes::router(state, config.http_timeout());
    let listener = TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_bind))?;
    tracing::info!(addr = %config.http_bind, "token redemption API listening");
    let shutdown = cancel.clone();
    let mut server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        res = &mut receiver_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error = %format!("{err:#}"), "telemetry receiver exited"),
                Err(err) => tracing::error!(error = %err, "telemetry receiver task failed"),
                Ok(Ok(())) => {}
            }
        }
        res = &mut server_handle => {
            match res {
                Ok(Err(err)) => tracing::error!(error = %err, "HTTP server exited"),
                Err(err) => tracing::error!(error = %err, "HTTP server task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    cancel.cancel();
    let _ = aggregation_handle.await;
    let _ = cleanup_handle.await;
    if !server_handle.is_finished() {
        let _ = server_handle.await;
    }
    if !receiver_handle.is_finished() {
        let _ = receiver_handle.await;
    }
    // The receiver owned the last queue sender; the worker drains what is left and exits.
    let _ = dispatch_handle.await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::normalize_otlp_http_endpoint;

    #[test]
    fn otlp_endpoint_gains_traces_path_once() {
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(
            normalize_otlp_http_endpoint("http://collector:4318/v1/traces"),
            "http://collector:4318/v1/traces"
        );
        assert_eq!(normalize_otlp_http_endpoint("  "), "");
    }
}

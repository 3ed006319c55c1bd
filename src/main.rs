use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, U256};
use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use pinpay::clock::SystemClock;
use pinpay::config::Config;
use pinpay::issuer::RandomIssuer;
use pinpay::lifecycle::Lifecycle;
use pinpay::models::NewRequest;
use pinpay::notification::WebhookNotifier;
use pinpay::relay::{RelaySubmitter, SponsoredRelay};
use pinpay::store::memory::MemoryStore;
use pinpay::store::postgres::PgStore;
use pinpay::store::RequestStore;
use pinpay::{api, cli, config, guard, jobs, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    // Export spans over OTLP only when a collector is configured
    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "pinpay-relay"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let json_logs = std::env::var("PINPAY_LOG_FORMAT").is_ok_and(|f| f == "json");
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "pinpay=debug,tower_http=debug".into()),
        ))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer()))
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with(telemetry_layer)
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Sweep { limit }) => {
            let services = Services::build(&cfg).await?;
            let report = guard::sweep(&services.lifecycle, limit).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Some(cli::Commands::Migrate) => {
            let url = cfg
                .database_url
                .as_deref()
                .context("DATABASE_URL must be set to run migrations")?;
            let db = PgStore::connect(url).await?;
            db.migrate().await?;
            println!("✅ Migrations applied");
            Ok(())
        }
        Some(cli::Commands::Request { command }) => {
            let services = Services::build(&cfg).await?;
            handle_request_command(command, &services).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Everything the server and operator commands share, built once.
struct Services {
    lifecycle: Lifecycle,
    submitter: RelaySubmitter,
}

impl Services {
    async fn build(cfg: &Config) -> anyhow::Result<Self> {
        let store: Arc<dyn RequestStore> = match cfg.database_url.as_deref() {
            Some(url) => {
                tracing::info!("Connecting to database...");
                let db = PgStore::connect(url).await?;
                tracing::info!("Running migrations...");
                db.migrate().await?;
                Arc::new(db)
            }
            None => {
                tracing::warn!("DATABASE_URL not set, requests live in memory only");
                Arc::new(MemoryStore::new())
            }
        };

        let lifecycle = Lifecycle::new(store, Arc::new(RandomIssuer), Arc::new(SystemClock))
            .with_webhooks(WebhookNotifier::new(cfg.webhook_targets()))
            .with_pin_attempts(cfg.pin_attempts);

        let relay = SponsoredRelay::new(cfg.relay_url.clone(), cfg.relay_api_key.clone())?;
        let submitter = RelaySubmitter::new(lifecycle.clone(), Arc::new(relay), cfg.token_domain())
            .with_policy(cfg.retry_policy())
            .with_lease(chrono::Duration::seconds(cfg.submission_lease_secs));

        Ok(Self {
            lifecycle,
            submitter,
        })
    }
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let services = Services::build(&cfg).await?;

    jobs::expiry::spawn(
        services.lifecycle.clone(),
        Duration::from_secs(cfg.sweep_interval_secs.max(1)),
    );
    tracing::info!(
        every_secs = cfg.sweep_interval_secs,
        "Background expiry job started"
    );

    let state = Arc::new(AppState::new(
        services.lifecycle,
        services.submitter,
        cfg.token_domain(),
        cfg.api_key.clone(),
    ));
    let app = api::app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(chain_id = cfg.chain_id, token = %cfg.token_address, "PinPay relay listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn handle_request_command(
    command: cli::RequestCommands,
    services: &Services,
) -> anyhow::Result<()> {
    match command {
        cli::RequestCommands::Create {
            payee,
            amount,
            valid_for,
            valid_after,
        } => {
            let payee_address = Address::from_str(payee.trim())
                .map_err(|e| anyhow::anyhow!("invalid payee address: {}", e))?;
            let amount = U256::from_str_radix(amount.trim(), 10)
                .map_err(|e| anyhow::anyhow!("invalid amount: {}", e))?;
            let now = chrono::Utc::now().timestamp();

            let record = services
                .lifecycle
                .create(&NewRequest {
                    payee_address,
                    amount,
                    valid_after,
                    valid_before: now.saturating_add(valid_for),
                })
                .await?;
            println!("✅ Request created");
            println!("   ID:  {}", record.id);
            println!("   PIN: {}", record.pin);
            println!("   Valid until: {}", record.valid_before);
        }
        cli::RequestCommands::Show { id, pin } => {
            let record = match (id, pin) {
                (Some(id), _) => {
                    let id = Uuid::parse_str(&id).context("invalid request id")?;
                    services.lifecycle.get(id).await?
                }
                (None, Some(pin)) => services.lifecycle.get_by_pin(&pin).await?,
                (None, None) => anyhow::bail!("either --id or --pin is required"),
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        cli::RequestCommands::Submit { id } => {
            let id = Uuid::parse_str(&id).context("invalid request id")?;
            let outcome = services.submitter.submit(id).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}

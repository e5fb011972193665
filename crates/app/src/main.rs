mod admin;
mod checkout;
mod maintenance;
mod problem;
mod reservation;
mod router;
mod telemetry;

use std::{net::SocketAddr, time::Duration};

use tracing::info;
use url::Url;

use cardstall_mailer::MailerClient;
use cardstall_storage::Database;
use cardstall_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;

    let mailer = match &config.mailer {
        Some(settings) => {
            let base_url = Url::parse(&settings.base_url)?;
            Some(MailerClient::new(
                base_url,
                settings.api_key.clone(),
                settings.from.clone(),
                reqwest::Client::new(),
            ))
        }
        None => None,
    };

    let worker = maintenance::MaintenanceWorker::new(
        database.clone(),
        Duration::from_secs(config.sweep_interval_seconds),
        config.sweep_grace_minutes,
    );
    let _sweeper = worker.spawn();

    let state = router::AppState::new(
        metrics,
        database,
        mailer,
        config.reservation_ttl_minutes,
        config.admin_token_digest,
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}

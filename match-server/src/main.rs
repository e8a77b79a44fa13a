use count_race::CountRaceFactory;
use engine_lib::config::ServerConfig;
use engine_lib::supervisor::Supervisor;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
/// Activates error tracing, loads the configuration (the path may be given as
/// the first argument), builds the supervisor around the stock count race
/// logic and keeps running until an operator issues the exit command.
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{}=info,engine_lib=info", env!("CARGO_CRATE_NAME")).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(true) // Thread-ID (helpful for Tokio)
                .with_thread_names(true),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ServerConfig.json".to_string());
    let config = match ServerConfig::load(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(%err, config_path, "Initial configuration load error.");
            std::process::exit(1);
        }
    };

    let supervisor = match Supervisor::new(config, Box::new(CountRaceFactory)) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            tracing::error!(%err, "Supervisor construction failed.");
            std::process::exit(1);
        }
    };

    if let Err(err) = supervisor.start().await {
        tracing::error!(%err, "Terminal endpoint failed to listen.");
        std::process::exit(1);
    }

    supervisor.run_until_stopped().await;
}

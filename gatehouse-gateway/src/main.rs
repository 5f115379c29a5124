use gatehouse_common::logging::init_logging;
use gatehouse_common::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!(
        auth_mode = ?config.auth.mode,
        backends = config.backends.len(),
        rate_limit = config.rate_limit,
        rate_window_secs = config.rate_window_secs,
        "Starting Gatehouse gateway"
    );

    gatehouse_gateway::start_server(config).await
}

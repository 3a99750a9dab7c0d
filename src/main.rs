use agentcom_hub::config::Config;
use agentcom_hub::supervisor;
use tracing::{error, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let config = Config::load()?;
    tracing::info!("starting agentcom-hub");

    if let Err(err) = supervisor::run(config).await {
        error!(%err, "agentcom-hub exited with an error");
        return Err(err.into());
    }

    Ok(())
}

use eventwire::config::{Config, DEFAULT_CONFIG_FILE};
use eventwire::wiring::InfrastructureBuilder;
use mimalloc::MiMalloc;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());
    let cfg = Config::load(&config_path)?;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.loglevel.clone()));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    info!(
        config = %config_path,
        qualifier = %cfg.qualifier.as_deref().unwrap_or("<none>"),
        url = %cfg.jpa.command.url,
        dialect = %cfg.jpa.dialect,
        ddl_auto = ?cfg.jpa.command.ddl_auto,
        loglevel = %cfg.loglevel
    );

    let infra = InfrastructureBuilder::from_config(&cfg).build().await?;
    info!(components = ?infra.component_names(), "infrastructure ready");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    infra.shutdown().await?;
    Ok(())
}

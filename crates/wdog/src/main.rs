use anyhow::Context;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};
use wdog::config::WdogConfig;
use wdog::sandbox::Sandbox;
use wdog::server::{AppState, router};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = WdogConfig::from_env().context("bad watchdog configuration")?;
    let addr = config.listen_addr();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    rt.block_on(async move {
        let sandbox = Sandbox::start(config).context("can't start sandbox")?;
        let app = router(AppState::new(sandbox));

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("can't listen on {addr}"))?;
        info!(%addr, "listening");
        axum::serve(listener, app).await?;
        Ok::<(), anyhow::Error>(())
    })
}

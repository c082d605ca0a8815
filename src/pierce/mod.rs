pub mod app;
pub mod auth;
pub mod config;
pub mod identity;
pub mod logging;
pub mod net;
pub mod tunnel;

pub use app::Mode;

pub async fn run(config_path: Option<std::path::PathBuf>, mode: Mode) -> anyhow::Result<()> {
    app::run(config_path, mode).await
}

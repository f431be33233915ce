use crate::config::{get_config_dir, get_logs_dir, AppSettings, ServerStore, TomlServerStore};
use crate::coordinator::ServerCoordinator;
use crate::error::{AppError, AppResult};
use crate::logging::LogManager;
use crate::runner::TaskRunner;
use crate::ssh::Ssh2Connector;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a running engine needs, wired from the config directory
pub struct AppState {
    pub config_dir: PathBuf,
    pub settings: Arc<AppSettings>,
    pub logs: Arc<LogManager>,
    pub coordinator: ServerCoordinator,
}

impl AppState {
    /// Load from the default config directory
    pub async fn load() -> AppResult<Self> {
        Self::load_from(get_config_dir()?, get_logs_dir()?).await
    }

    pub async fn load_from(config_dir: PathBuf, logs_dir: PathBuf) -> AppResult<Self> {
        std::fs::create_dir_all(&config_dir)?;
        tracing::info!("llmdock config dir: {:?}", config_dir);

        let settings = Arc::new(AppSettings::load(&config_dir)?);
        let logs = LogManager::new(logs_dir)
            .map_err(|e| AppError::Config(format!("Failed to initialize log manager: {}", e)))?;
        let store: Arc<dyn ServerStore> = Arc::new(TomlServerStore::open(&config_dir)?);

        let runner = TaskRunner::new(Arc::new(Ssh2Connector::new(&settings.ssh)), settings.clone());
        let coordinator = ServerCoordinator::start(runner, store, logs.clone()).await?;

        Ok(Self {
            config_dir,
            settings,
            logs,
            coordinator,
        })
    }
}

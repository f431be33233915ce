pub mod servers;
pub mod settings;

pub use servers::*;
pub use settings::*;

use crate::error::AppResult;
use std::path::PathBuf;

/// Get the llmdock config directory
pub fn get_config_dir() -> AppResult<PathBuf> {
    let config_dir = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .ok_or_else(|| crate::error::AppError::Config("Could not find config directory".into()))?
        .join("llmdock");

    Ok(config_dir)
}

/// Get the logs directory
pub fn get_logs_dir() -> AppResult<PathBuf> {
    Ok(get_config_dir()?.join("logs"))
}

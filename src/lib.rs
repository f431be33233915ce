pub mod config;
pub mod coordinator;
pub mod error;
pub mod llm;
pub mod logging;
pub mod runner;
pub mod sftp;
pub mod ssh;
pub mod state;
pub mod tunnel;
pub mod workers;

pub use coordinator::{EngineEvent, ServerCoordinator, ServerSnapshot, ServerStatus};
pub use error::{AppError, AppResult};
pub use runner::TaskRunner;
pub use state::AppState;

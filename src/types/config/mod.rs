pub mod app;
pub mod sprint;

pub use app::AppConfig;
pub use sprint::{ConfigError, SprintSettings};

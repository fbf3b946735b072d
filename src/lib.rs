pub mod api;
pub mod config;
pub mod content;
pub mod db;
pub mod import;
pub mod logger;
pub mod resource;

pub use config::{AppConfig, ConfigError};
pub use resource::{ResourceError, ResourceManager};

pub mod cancel;
pub mod config;
pub mod db;
pub mod ingest;
pub mod matcher;
pub mod pairs;
pub mod peaks;
pub mod source;
pub mod spectrum;

/// Application name for XDG paths
pub const APP_NAME: &str = "tapeid";

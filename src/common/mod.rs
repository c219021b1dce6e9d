pub mod config;
pub mod dropbox_client;
pub mod garmin_client;
pub mod logging;
pub mod metrics;
pub mod ports;
pub mod types;

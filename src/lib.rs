pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod persistence;
pub mod platform;
pub mod serial;
pub mod service;
pub mod simulator;
pub mod window;

pub use config::AppConfig;
pub use parser::{DeauthEvent, MacAddr};
pub use service::{Collector, Service};
pub use window::{RollingWindow, StatsSnapshot};

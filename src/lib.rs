pub mod agent;
pub mod auth;
pub mod config;
pub mod control;
pub mod dispatcher;
pub mod errors;
pub mod instance_lock;
pub mod loadtest;
pub mod logging;
pub mod metrics;
pub mod percentiles;
pub mod request_timer;
pub mod tasks;
pub mod topics;
pub mod transport;
pub mod utils;

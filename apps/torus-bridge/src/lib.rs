pub mod arbitration;
pub mod auth;
pub mod cloud;
pub mod config;
pub mod emitter;
pub mod http;
pub mod local;
pub mod metrics;
pub mod scheduler;
pub mod session;
pub mod units;

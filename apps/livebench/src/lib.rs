pub mod config;
pub mod forward;
pub mod instance;
pub mod ipc;
pub mod options;
pub mod session;
pub mod telemetry;

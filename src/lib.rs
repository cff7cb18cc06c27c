pub mod config;
pub mod error;
pub mod ipc;
pub mod packager;
pub mod port;
pub mod script;
pub mod server;
pub mod utils;

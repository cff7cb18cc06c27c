pub mod desktop;
pub mod script;
pub mod server;
pub mod system;

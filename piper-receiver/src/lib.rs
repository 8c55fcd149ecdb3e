pub mod config;
pub mod cursor;
pub mod handler;
pub mod poller;
pub mod server;

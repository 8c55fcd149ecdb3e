pub mod batcher;
pub mod config;
pub mod listener;
pub mod publisher;
pub mod server;

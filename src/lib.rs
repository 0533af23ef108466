pub mod adapters;
pub mod app;
pub mod chat;
pub mod config;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod routing;
pub mod upstream;
pub mod usage;
pub mod verify;

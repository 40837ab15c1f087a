pub mod cache;
pub mod config;
pub mod control;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod manager;
pub mod node;
pub mod runtime;
pub mod shutdown;
pub mod verify;

pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod files;
pub mod identity;
pub mod reconcile;
pub mod server;


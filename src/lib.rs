pub mod aggregator;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod jobs;
pub mod logging;
pub mod models;
pub mod review;
pub mod roles;
pub mod server;
pub mod settings;
pub mod store;
pub mod substrate;
pub mod trigger;
pub mod workspace;

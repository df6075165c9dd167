pub mod config;
pub mod connection;
pub mod context;
pub mod external_app;
pub mod facade;
pub mod graph;
pub mod logger;
pub mod notification;
pub mod procedures;
pub mod run_registry;
pub mod schema;

pub mod actions;
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod dashboard;
pub mod monitoring;
pub mod sources;
pub mod table;
pub mod utils;

pub mod app;
pub mod chat;
pub mod config;
pub mod model;
pub mod settings;
pub mod state;

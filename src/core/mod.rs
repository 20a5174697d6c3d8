pub mod app;
pub mod auth;
pub mod budget;
pub mod cache;
pub mod cipher;
pub mod config;
pub mod documents;
pub mod error;
pub mod events;
pub mod llm;
pub mod queue;
pub mod store;
pub mod tasks;
pub mod templates;
pub mod terminal;
pub mod worker;

pub mod config;
pub mod database;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod logger;
pub mod message;
pub mod model;
pub mod pipeline;
pub mod provider;
pub mod push;
pub mod scheduler;
pub mod store;
pub mod time;
pub mod updater;
pub mod youtube;

#[cfg(test)]
mod testing;

pub mod academy;
pub mod api;
pub mod auth;
pub mod client;
pub mod coach;
pub mod config;
pub mod database;
pub mod db;
pub mod env;
pub mod error;
pub mod models;
pub mod stats;
pub mod telemetry;
pub mod validation;

#[cfg(test)]
mod test;

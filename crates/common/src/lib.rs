//! Shared types, configuration and errors for the Herald notification outbox.

pub mod config;
pub mod db;
pub mod error;
pub mod types;

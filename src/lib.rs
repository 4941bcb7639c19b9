//! Distributed Chaffin method coordinator library
//!
//! This module exports the core components for testing and integration.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod perms;
pub mod server;
pub mod types;

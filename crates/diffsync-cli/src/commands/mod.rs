//! Command handlers

pub mod config;
pub mod doc;
pub mod serve;

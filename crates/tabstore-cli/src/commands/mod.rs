//! Command handlers

pub mod bucket;
pub mod config;
pub mod rows;

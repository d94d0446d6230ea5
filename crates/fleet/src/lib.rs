//! Hollow fleet daemon
//!
//! Runs a fleet of simulated agents against one control plane and exposes
//! health, metrics and placement admission over HTTP.

pub mod api;
pub mod config;

//! Multi-tier cache consistency and warming engine.
//!
//! [`cache`] holds the engine itself; [`config`] loads layered settings;
//! [`infra`] wires telemetry and the HTTP surface.

pub mod cache;
pub mod config;
pub mod error;
pub mod infra;

//! HTTP server exposing cache diagnostics and controls.
//!
//! - [`admin_api`]: Request/response types and route handlers

pub mod admin_api;

//! HTTP server providing the admin API.
//!
//! - [`admin_api`]: request/response types and route handlers

pub mod admin_api;

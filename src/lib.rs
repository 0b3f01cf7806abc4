//! Roof estimate pipeline service.
//!
//! Turns uploaded roofing documents (blueprints, inspection reports, vendor
//! measurement reports, photos) into cost estimates. Each document is run
//! through a staged pipeline by background workers; results are persisted
//! once per job and served over HTTP.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod services;

//! Punto Seguro lead API library
//!
//! Scores security-risk questionnaires (IEI), stores leads, routes them to
//! service providers and notifies both sides.
//!
//! # Modules
//!
//! - `api`: HTTP handlers and error mapping.
//! - `core`: Scoring, provider selection and the lead pipeline.
//! - `data`: Repository traits with JSON-file and PostgreSQL backends.
//! - `integrations`: Email delivery and phone verification.
//! - `obs`: Logging setup.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

// Re-export primary modules for shared use in tests and other binaries
pub mod assignment;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod json_store;
pub mod models;
pub mod notifications;
pub mod orchestrator;
pub mod repository;
pub mod scoring;
pub mod validation;
pub mod verification;

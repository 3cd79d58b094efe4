//! Core media-sync library
//!
//! This crate provides the data model shared by the sync engine, the daemon
//! and its clients, the push channel event types, and a typed client for the
//! daemon's control surface.

pub mod api;
pub mod events;
pub mod model;

pub use events::MediaEvent;
pub use model::*;

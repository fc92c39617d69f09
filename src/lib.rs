//! DevOps controller manager
//!
//! Lifecycle orchestration for the KubeSphere DevOps controllers: layered
//! configuration, client construction, leader election, cache warm-up,
//! controller registration, and bounded shutdown.

pub mod app;
pub mod cache;
pub mod cli;
pub mod clients;
pub mod controllers;
pub mod error;
pub mod leader;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod shutdown;

pub use error::{Error, Result};

//! # cnet-core
//!
//! Core types, traits, and abstractions for cnet, the cluster dispatch layer
//! of the control-network pipeline.
//!
//! This crate provides the run configuration, the job message model and its
//! wire codec, the error type, and the trait definitions for the broker,
//! relational store and image graph that other cnet crates depend on.

pub mod codec;
pub mod config;
pub mod defaults;
pub mod error;
pub mod logging;
pub mod models;
pub mod records;
pub mod traits;

// Re-export commonly used types at crate root
pub use codec::{decode, decode_message, encode_message, Geometry, NdArray, WireEncode};
pub use config::{ClusterConfig, DatabaseConfig, EnvConfig, RedisConfig, RunConfig};
pub use error::{Error, Result};
pub use models::*;
pub use records::{MeasureRecord, PointRecord};
pub use traits::*;

//! Hopscope - flow enrichment service
//!
//! Consumes flow records from a message queue, classifies each flow as
//! internal or external, discovers the hops of boundary-crossing flows,
//! geolocates every address through a cache, a persistent store and an
//! external API, and republishes the augmented records.

pub mod cache;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod error;
pub mod flow;
pub mod geo;
pub mod pipeline;
pub mod trace;

pub use error::{HopscopeError, Result};

//! Model Module - Serialized model state
//!
//! This module contains the checkpoint data model:
//! - Role: encoder or decoder stack
//! - LayerBlock: one layer's parameter set, identified by role and index
//! - StateMetadata: architecture tag, per-role depth and progress counters
//! - ModelState: everything a checkpoint holds
//! - keys: the dotted parameter key grammar

pub mod block;
pub mod config;
pub mod keys;
pub mod state;

pub use block::{LayerBlock, Role};
pub use config::{retag_architecture, StateMetadata};
pub use keys::ParamKey;
pub use state::{ModelState, TensorMap};

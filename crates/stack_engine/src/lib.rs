//! Stack Engine
//!
//! Checkpoint data model, storage and the layer stacking transform used to
//! grow a trained encoder/decoder translation model into a deeper one.

pub mod checkpoint;
pub mod error;
pub mod model;
pub mod stack;

pub use checkpoint::{CheckpointManifest, CheckpointStore};
pub use error::{StackError, StackResult};
pub use model::{LayerBlock, ModelState, Role, StateMetadata, TensorMap};
pub use stack::{stack_layers, LayerStackTransform, StackPolicy};

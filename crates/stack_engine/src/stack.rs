//! Layer stacking - grow a trained checkpoint into a deeper initializer
//!
//! Given a state with `L` layers per role and a growth increment `k`, builds a
//! state with `L + k` layers per role whose new layers are copies of trained
//! ones. Every source layer survives unchanged, indices stay contiguous, and
//! the output only depends on the input.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StackError, StackResult};
use crate::model::{retag_architecture, LayerBlock, ModelState, Role, StateMetadata};

/// Where duplicated layers go in the grown stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackPolicy {
    /// Repeat the top `min(k, L)` layers above the existing stack.
    #[default]
    Top,
    /// Follow source layers with their duplicates, spread evenly over depth.
    Interleave,
}

impl StackPolicy {
    /// Source layer index for every position of the grown stack.
    ///
    /// `depth` must be non-zero when `growth` is non-zero.
    pub fn source_order(&self, depth: usize, growth: usize) -> Vec<usize> {
        let mut order = Vec::with_capacity(depth + growth);
        if growth == 0 {
            order.extend(0..depth);
            return order;
        }
        match self {
            StackPolicy::Top => {
                let window = growth.min(depth);
                order.extend(0..depth);
                order.extend((0..growth).map(|i| depth - window + i % window));
            }
            StackPolicy::Interleave => {
                for j in 0..depth {
                    let copies = (j + 1) * growth / depth - j * growth / depth;
                    order.extend(std::iter::repeat(j).take(copies + 1));
                }
            }
        }
        order
    }
}

impl fmt::Display for StackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackPolicy::Top => f.write_str("top"),
            StackPolicy::Interleave => f.write_str("interleave"),
        }
    }
}

impl FromStr for StackPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "top" => Ok(StackPolicy::Top),
            "interleave" => Ok(StackPolicy::Interleave),
            other => Err(format!(
                "unknown stack policy '{}' (expected 'top' or 'interleave')",
                other
            )),
        }
    }
}

/// The stacking transform. Holds only its placement policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct LayerStackTransform {
    pub policy: StackPolicy,
}

impl LayerStackTransform {
    pub fn new(policy: StackPolicy) -> Self {
        Self { policy }
    }

    /// Grows every role of `source` by `growth_increment` layers.
    ///
    /// Shared parameters pass through, optimizer state is dropped, progress
    /// counters restart at zero and the architecture tag names the new depth.
    /// When growing, the encoder's last history norm is repeated at a new
    /// growth boundary; decoder history norms are duplicated with their layers.
    pub fn apply(&self, source: &ModelState, growth_increment: i64) -> StackResult<ModelState> {
        if growth_increment < 0 {
            return Err(StackError::invalid_depth(format!(
                "growth increment {} is negative",
                growth_increment
            )));
        }
        let growth = usize::try_from(growth_increment).map_err(|_| {
            StackError::invalid_depth(format!("growth increment {} is too large", growth_increment))
        })?;
        source.validate()?;

        let mut metadata = StateMetadata {
            epoch: 0,
            step: 0,
            ..source.metadata.clone()
        };
        let mut layers = Vec::with_capacity(source.layers.len() + 2 * growth);
        let mut history_norms = Vec::with_capacity(source.history_norms.len() + 2);

        for role in Role::ALL {
            let depth = source.metadata.depth(role);
            if growth > 0 && depth == 0 {
                return Err(StackError::invalid_depth(format!(
                    "cannot grow {} by {}: it has no trained layers to duplicate",
                    role, growth
                )));
            }

            let by_index: Vec<&LayerBlock> = {
                let mut blocks: Vec<&LayerBlock> = source.layers_of(role).collect();
                blocks.sort_by_key(|b| b.index);
                blocks
            };
            let order = self.policy.source_order(depth, growth);
            for (target, &src) in order.iter().enumerate() {
                layers.push(by_index[src].relocated(target));
            }
            metadata.set_depth(role, depth + growth);

            let mut history: Vec<&LayerBlock> = source.history_of(role).collect();
            history.sort_by_key(|b| b.index);
            match role {
                _ if history.is_empty() => {}
                // one norm per encoder growth boundary
                Role::Encoder => {
                    history_norms.extend(history.iter().map(|b| (*b).clone()));
                    if growth > 0 {
                        if let Some(last) = history.last() {
                            history_norms.push(last.relocated(history.len()));
                        }
                    }
                }
                // one norm per decoder layer, duplicated with its layer
                Role::Decoder => {
                    if history.len() != depth {
                        return Err(StackError::corrupt(format!(
                            "decoder has {} history norms for {} layers",
                            history.len(),
                            depth
                        )));
                    }
                    for (target, &src) in order.iter().enumerate() {
                        history_norms.push(history[src].relocated(target));
                    }
                }
            }

            if growth > 0 {
                debug!(
                    "stacking {}: {} -> {} layers ({} policy)",
                    role,
                    depth,
                    depth + growth,
                    self.policy
                );
            }
        }

        if growth > 0 {
            metadata.architecture =
                retag_architecture(&source.metadata.architecture, metadata.headline_depth());
        }

        let grown = ModelState {
            layers,
            history_norms,
            shared_params: source.shared_params.clone(),
            optimizer_state: None,
            metadata,
        };
        grown.validate()?;
        Ok(grown)
    }
}

/// Grows `source` with the default (`Top`) policy.
pub fn stack_layers(source: &ModelState, growth_increment: i64) -> StackResult<ModelState> {
    LayerStackTransform::default().apply(source, growth_increment)
}

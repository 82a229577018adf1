//! ModelState - Everything a checkpoint holds

use std::collections::{BTreeMap, HashMap};

use candle_core::Tensor;

use super::keys::{history_key, layer_key, ParamKey};
use super::{LayerBlock, Role, StateMetadata};
use crate::error::{StackError, StackResult};

/// Ordered name -> tensor map.
pub type TensorMap = BTreeMap<String, Tensor>;

/// Serialized form of a trained network at one point in time.
#[derive(Clone, Debug)]
pub struct ModelState {
    /// Encoder blocks first, then decoder blocks, each in index order
    pub layers: Vec<LayerBlock>,
    /// Normalization blocks at the growth boundaries of the layer history
    pub history_norms: Vec<LayerBlock>,
    /// Depth-invariant parameters (embeddings, output projection, final norms)
    pub shared_params: TensorMap,
    pub optimizer_state: Option<TensorMap>,
    pub metadata: StateMetadata,
}

impl ModelState {
    pub fn new(metadata: StateMetadata) -> Self {
        Self {
            layers: Vec::new(),
            history_norms: Vec::new(),
            shared_params: TensorMap::new(),
            optimizer_state: None,
            metadata,
        }
    }

    /// Builds a state from a flat checkpoint, classifying every key.
    ///
    /// The result is validated against `metadata`.
    pub fn from_flat<I>(tensors: I, metadata: StateMetadata) -> StackResult<Self>
    where
        I: IntoIterator<Item = (String, Tensor)>,
    {
        let mut layers: BTreeMap<(Role, usize), LayerBlock> = BTreeMap::new();
        let mut history: BTreeMap<(Role, usize), LayerBlock> = BTreeMap::new();
        let mut shared = TensorMap::new();

        for (name, tensor) in tensors {
            match ParamKey::classify(&name) {
                ParamKey::Layer {
                    role,
                    index,
                    suffix,
                } => layers
                    .entry((role, index))
                    .or_insert_with(|| LayerBlock::new(role, index))
                    .insert(suffix, tensor),
                ParamKey::History {
                    role,
                    index,
                    suffix,
                } => history
                    .entry((role, index))
                    .or_insert_with(|| LayerBlock::new(role, index))
                    .insert(suffix, tensor),
                ParamKey::Shared => {
                    shared.insert(name, tensor);
                }
            }
        }

        let state = Self {
            layers: layers.into_values().collect(),
            history_norms: history.into_values().collect(),
            shared_params: shared,
            optimizer_state: None,
            metadata,
        };
        state.validate()?;
        Ok(state)
    }

    /// Flattens back into the dotted key layout (optimizer state excluded).
    pub fn to_flat(&self) -> HashMap<String, Tensor> {
        let mut flat = HashMap::with_capacity(self.tensor_count());
        for block in &self.layers {
            for (suffix, t) in &block.params {
                flat.insert(layer_key(block.role, block.index, suffix), t.clone());
            }
        }
        for block in &self.history_norms {
            for (suffix, t) in &block.params {
                flat.insert(history_key(block.role, block.index, suffix), t.clone());
            }
        }
        for (name, t) in &self.shared_params {
            flat.insert(name.clone(), t.clone());
        }
        flat
    }

    /// Number of model tensors (optimizer state excluded).
    pub fn tensor_count(&self) -> usize {
        self.layers.iter().map(|b| b.params.len()).sum::<usize>()
            + self.history_norms.iter().map(|b| b.params.len()).sum::<usize>()
            + self.shared_params.len()
    }

    /// Number of scalar parameters (optimizer state excluded).
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(LayerBlock::element_count).sum::<usize>()
            + self
                .history_norms
                .iter()
                .map(LayerBlock::element_count)
                .sum::<usize>()
            + self
                .shared_params
                .values()
                .map(|t| t.elem_count())
                .sum::<usize>()
    }

    /// Layer count actually present for `role`.
    pub fn depth(&self, role: Role) -> usize {
        self.layers.iter().filter(|b| b.role == role).count()
    }

    pub fn layers_of(&self, role: Role) -> impl Iterator<Item = &LayerBlock> {
        self.layers.iter().filter(move |b| b.role == role)
    }

    pub fn history_of(&self, role: Role) -> impl Iterator<Item = &LayerBlock> {
        self.history_norms.iter().filter(move |b| b.role == role)
    }

    pub fn layer(&self, role: Role, index: usize) -> Option<&LayerBlock> {
        self.layers
            .iter()
            .find(|b| b.role == role && b.index == index)
    }

    /// Checks the structural invariants of a checkpoint:
    /// per role, layer indices are unique and contiguous from 0, the count
    /// equals the declared depth, and the architecture tag agrees with it.
    pub fn validate(&self) -> StackResult<()> {
        if let Some(tagged) = self.metadata.tagged_depth() {
            let declared = self.metadata.headline_depth();
            if tagged != declared {
                return Err(StackError::invalid_depth(format!(
                    "architecture '{}' names {} layers but metadata declares {}",
                    self.metadata.architecture, tagged, declared
                )));
            }
        }

        for role in Role::ALL {
            let declared = self.metadata.depth(role);
            let indices: Vec<usize> = self.layers_of(role).map(|b| b.index).collect();
            check_contiguous(role, "layer", &indices)?;
            if indices.len() != declared {
                return Err(StackError::corrupt(format!(
                    "{} has {} layers but metadata declares {}",
                    role,
                    indices.len(),
                    declared
                )));
            }
            if let Some(empty) = self.layers_of(role).find(|b| b.is_empty()) {
                return Err(StackError::corrupt(format!(
                    "{} layer {} has no parameters",
                    role, empty.index
                )));
            }

            let history: Vec<usize> = self.history_of(role).map(|b| b.index).collect();
            check_contiguous(role, "history norm", &history)?;
        }
        Ok(())
    }
}

fn check_contiguous(role: Role, what: &str, indices: &[usize]) -> StackResult<()> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    for pair in sorted.windows(2) {
        if pair[0] == pair[1] {
            return Err(StackError::corrupt(format!(
                "{} {} {} appears more than once",
                role, what, pair[0]
            )));
        }
    }
    for (expected, &found) in sorted.iter().enumerate() {
        if expected != found {
            return Err(StackError::corrupt(format!(
                "{} {} {} is missing (found {} instead)",
                role, what, expected, found
            )));
        }
    }
    Ok(())
}

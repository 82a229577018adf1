//! LayerBlock - One stacked layer's parameters

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Result, Tensor};
use serde::{Deserialize, Serialize};

/// Which stack a layer belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Encoder,
    Decoder,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Encoder, Role::Decoder];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Encoder => "encoder",
            Role::Decoder => "decoder",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "encoder" => Ok(Role::Encoder),
            "decoder" => Ok(Role::Decoder),
            other => Err(format!("unknown role '{}'", other)),
        }
    }
}

/// Parameter set of a single layer (attention, feed-forward and norm weights).
///
/// The contents are opaque to the stacking transform; only `role` and
/// `index` matter. Keys of `params` are the parameter suffixes, e.g.
/// `self_attn.k_proj.weight`.
#[derive(Clone, Debug)]
pub struct LayerBlock {
    pub role: Role,
    pub index: usize,
    pub params: BTreeMap<String, Tensor>,
}

impl LayerBlock {
    pub fn new(role: Role, index: usize) -> Self {
        Self {
            role,
            index,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, suffix: impl Into<String>, tensor: Tensor) -> Self {
        self.params.insert(suffix.into(), tensor);
        self
    }

    pub fn insert(&mut self, suffix: impl Into<String>, tensor: Tensor) {
        self.params.insert(suffix.into(), tensor);
    }

    /// Same parameters placed at another position of the stack.
    ///
    /// Tensors share storage with `self`, so the copy is exact.
    pub fn relocated(&self, index: usize) -> Self {
        Self {
            role: self.role,
            index,
            params: self.params.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn element_count(&self) -> usize {
        self.params.values().map(|t| t.elem_count()).sum()
    }

    /// Compares parameter names, shapes, dtypes and values bit for bit.
    /// Identity (role, index) is not compared.
    pub fn same_params(&self, other: &LayerBlock) -> Result<bool> {
        if self.params.len() != other.params.len() {
            return Ok(false);
        }
        for ((ka, a), (kb, b)) in self.params.iter().zip(other.params.iter()) {
            if ka != kb || !tensors_identical(a, b)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Bitwise tensor comparison (NaN payloads compare equal to themselves).
pub fn tensors_identical(a: &Tensor, b: &Tensor) -> Result<bool> {
    if a.dtype() != b.dtype() || a.shape() != b.shape() {
        return Ok(false);
    }
    let va = a.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    let vb = b.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()?;
    Ok(va
        .iter()
        .zip(vb.iter())
        .all(|(x, y)| x.to_bits() == y.to_bits()))
}

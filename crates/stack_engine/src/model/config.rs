//! StateMetadata - Architecture and progress metadata

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::Role;

/// Architecture and progress information stored with every checkpoint.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    /// Architecture tag, e.g. `transformer_t2t_wmt_en_de_18l`
    #[serde(alias = "arch")]
    pub architecture: String,
    #[serde(alias = "n_encoder_layers")]
    pub encoder_layers: usize,
    #[serde(alias = "n_decoder_layers")]
    pub decoder_layers: usize,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub step: u64,
}

impl StateMetadata {
    pub fn new(architecture: impl Into<String>, encoder_layers: usize, decoder_layers: usize) -> Self {
        Self {
            architecture: architecture.into(),
            encoder_layers,
            decoder_layers,
            epoch: 0,
            step: 0,
        }
    }

    pub fn with_progress(mut self, epoch: u64, step: u64) -> Self {
        self.epoch = epoch;
        self.step = step;
        self
    }

    pub fn depth(&self, role: Role) -> usize {
        match role {
            Role::Encoder => self.encoder_layers,
            Role::Decoder => self.decoder_layers,
        }
    }

    pub fn set_depth(&mut self, role: Role, depth: usize) {
        match role {
            Role::Encoder => self.encoder_layers = depth,
            Role::Decoder => self.decoder_layers = depth,
        }
    }

    /// Depth named by the architecture tag (`..._18l` -> 18), if any.
    pub fn tagged_depth(&self) -> Option<usize> {
        depth_suffix()
            .captures(&self.architecture)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    /// Depth the architecture tag refers to: the encoder stack, or the decoder
    /// stack for decoder-only models.
    pub fn headline_depth(&self) -> usize {
        if self.encoder_layers > 0 {
            self.encoder_layers
        } else {
            self.decoder_layers
        }
    }
}

fn depth_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(\d+)l$").expect("static regex"))
}

/// Rewrites the trailing `_<N>l` depth suffix of an architecture tag, or
/// appends one when the tag has none.
pub fn retag_architecture(tag: &str, depth: usize) -> String {
    let re = depth_suffix();
    if re.is_match(tag) {
        re.replace(tag, format!("_{}l", depth).as_str()).into_owned()
    } else if tag.is_empty() {
        format!("{}l", depth)
    } else {
        format!("{}_{}l", tag, depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retag_rewrites_suffix() {
        assert_eq!(
            retag_architecture("transformer_t2t_wmt_en_de_6l", 12),
            "transformer_t2t_wmt_en_de_12l"
        );
        assert_eq!(retag_architecture("sdt_transformer_18l", 24), "sdt_transformer_24l");
    }

    #[test]
    fn test_retag_appends_when_missing() {
        assert_eq!(retag_architecture("transformer_big", 12), "transformer_big_12l");
        assert_eq!(retag_architecture("", 6), "6l");
        // `l` must follow the digits directly
        assert_eq!(retag_architecture("model_6", 9), "model_6_9l");
    }

    #[test]
    fn test_tagged_depth() {
        let meta = StateMetadata::new("transformer_t2t_wmt_en_de_18l", 18, 6);
        assert_eq!(meta.tagged_depth(), Some(18));
        assert_eq!(meta.headline_depth(), 18);

        let untagged = StateMetadata::new("transformer", 6, 6);
        assert_eq!(untagged.tagged_depth(), None);
    }

    #[test]
    fn test_metadata_accepts_aliases() {
        let json = r#"{"arch": "t_6l", "n_encoder_layers": 6, "n_decoder_layers": 6}"#;
        let meta: StateMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.architecture, "t_6l");
        assert_eq!(meta.depth(Role::Decoder), 6);
        assert_eq!(meta.epoch, 0);
    }
}

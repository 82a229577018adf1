//! Parameter key grammar of a flat checkpoint.
//!
//! - `<role>.layers.<i>.<suffix>`              layer block (role, i)
//! - `<role>.history.layer_norms.<j>.<suffix>` history norm at growth boundary j
//! - anything else                             shared, depth-invariant

use super::Role;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamKey<'a> {
    Layer {
        role: Role,
        index: usize,
        suffix: &'a str,
    },
    History {
        role: Role,
        index: usize,
        suffix: &'a str,
    },
    Shared,
}

impl<'a> ParamKey<'a> {
    pub fn classify(key: &'a str) -> Self {
        let mut parts = key.splitn(3, '.');
        let (Some(role), Some(section), Some(rest)) = (parts.next(), parts.next(), parts.next())
        else {
            return ParamKey::Shared;
        };
        let Ok(role) = role.parse::<Role>() else {
            return ParamKey::Shared;
        };

        match section {
            "layers" => match split_index(rest) {
                Some((index, suffix)) => ParamKey::Layer {
                    role,
                    index,
                    suffix,
                },
                None => ParamKey::Shared,
            },
            "history" => match rest
                .strip_prefix("layer_norms.")
                .and_then(split_index)
            {
                Some((index, suffix)) => ParamKey::History {
                    role,
                    index,
                    suffix,
                },
                None => ParamKey::Shared,
            },
            _ => ParamKey::Shared,
        }
    }
}

/// `"3.fc1.weight"` -> `(3, "fc1.weight")`
fn split_index(rest: &str) -> Option<(usize, &str)> {
    let (index, suffix) = rest.split_once('.')?;
    if suffix.is_empty() {
        return None;
    }
    index.parse().ok().map(|i| (i, suffix))
}

pub fn layer_key(role: Role, index: usize, suffix: &str) -> String {
    format!("{}.layers.{}.{}", role, index, suffix)
}

pub fn history_key(role: Role, index: usize, suffix: &str) -> String {
    format!("{}.history.layer_norms.{}.{}", role, index, suffix)
}

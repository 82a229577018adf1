//! Growth Presets - predefined depth schedules
//!
//! Each preset names the final depth; the schedule lists the depth trained
//! at every stage.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrowthPreset {
    L12,
    L15,
    L16,
    /// 6 -> 12 -> 18
    L18,
    L21,
    L24,
    L27,
    L30,
    L33,
    L36,
    L39,
}

impl GrowthPreset {
    pub const ALL: [GrowthPreset; 11] = [
        GrowthPreset::L12,
        GrowthPreset::L15,
        GrowthPreset::L16,
        GrowthPreset::L18,
        GrowthPreset::L21,
        GrowthPreset::L24,
        GrowthPreset::L27,
        GrowthPreset::L30,
        GrowthPreset::L33,
        GrowthPreset::L36,
        GrowthPreset::L39,
    ];

    /// Depth of every stage, shallowest first.
    pub fn depths(&self) -> &'static [usize] {
        match self {
            GrowthPreset::L12 => &[6, 12],
            GrowthPreset::L15 => &[6, 9, 12, 15],
            GrowthPreset::L16 => &[8, 16],
            GrowthPreset::L18 => &[6, 12, 18],
            GrowthPreset::L21 => &[6, 12, 21],
            GrowthPreset::L24 => &[6, 12, 18, 24],
            GrowthPreset::L27 => &[9, 18, 27],
            GrowthPreset::L30 => &[6, 12, 18, 24, 30],
            GrowthPreset::L33 => &[6, 12, 21, 33],
            GrowthPreset::L36 => &[6, 12, 18, 24, 30, 36],
            GrowthPreset::L39 => &[6, 9, 12, 15, 18, 21, 24, 27, 30, 33, 36, 39],
        }
    }

    pub fn target_depth(&self) -> usize {
        self.depths().last().copied().unwrap_or(0)
    }

    pub fn display_name(&self) -> String {
        format!("{}l", self.target_depth())
    }
}

impl fmt::Display for GrowthPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let depths: Vec<String> = self.depths().iter().map(|d| d.to_string()).collect();
        write!(f, "{} ({})", self.display_name(), depths.join(" -> "))
    }
}

impl FromStr for GrowthPreset {
    type Err = ConfigError;

    /// Accepts `18l`, `18L` or `18`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(['l', 'L']);
        let depth: usize = trimmed
            .parse()
            .map_err(|_| ConfigError::UnknownPreset(s.to_string()))?;
        GrowthPreset::ALL
            .into_iter()
            .find(|p| p.target_depth() == depth)
            .ok_or_else(|| ConfigError::UnknownPreset(s.to_string()))
    }
}

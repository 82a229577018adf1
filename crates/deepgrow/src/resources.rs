//! Compute resources handed to the training engine.

use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Devices a stage may use. An empty list means CPU only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub devices: Vec<usize>,
}

impl ResourceDescriptor {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn gpus(devices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            devices: devices.into_iter().collect(),
        }
    }

    pub fn is_cpu(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of workers; CPU counts as one.
    pub fn worker_count(&self) -> usize {
        self.devices.len().max(1)
    }

    /// Value for `CUDA_VISIBLE_DEVICES` on the engine process.
    pub fn visible_devices(&self) -> Option<String> {
        if self.is_cpu() {
            return None;
        }
        let ids: Vec<String> = self.devices.iter().map(|d| d.to_string()).collect();
        Some(ids.join(","))
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.visible_devices() {
            Some(ids) => write!(f, "cuda:{}", ids),
            None => f.write_str("cpu"),
        }
    }
}

impl FromStr for ResourceDescriptor {
    type Err = ConfigError;

    /// Parses `cpu` or a comma separated list of device ids such as `0,1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("cpu") {
            return Ok(Self::cpu());
        }
        let mut devices = Vec::new();
        for part in s.split(',') {
            let id: usize = part
                .trim()
                .parse()
                .map_err(|_| ConfigError::Devices(s.to_string()))?;
            if devices.contains(&id) {
                return Err(ConfigError::Devices(s.to_string()));
            }
            devices.push(id);
        }
        Ok(Self { devices })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_lists() {
        let r: ResourceDescriptor = "0, 1,3".parse().unwrap();
        assert_eq!(r.devices, vec![0, 1, 3]);
        assert_eq!(r.visible_devices().as_deref(), Some("0,1,3"));
        assert_eq!(r.worker_count(), 3);
        assert_eq!(r.to_string(), "cuda:0,1,3");

        let cpu: ResourceDescriptor = "CPU".parse().unwrap();
        assert!(cpu.is_cpu());
        assert_eq!(cpu.visible_devices(), None);
        assert_eq!(cpu.worker_count(), 1);
    }

    #[test]
    fn test_rejects_bad_device_lists() {
        assert!("0,x".parse::<ResourceDescriptor>().is_err());
        assert!("1,1".parse::<ResourceDescriptor>().is_err());
        assert!("-1".parse::<ResourceDescriptor>().is_err());
    }
}

use json::{object, JsonValue};
use std::fs::{read_to_string, File};
use std::io::BufWriter;

/// Largest supported branching factor of the distributed spanning tree
pub const MAX_BRANCHING_FACTOR: usize = 8;
/// Smallest slot able to hold a header and one hexahedron record
pub const MIN_SLOT_SIZE: usize = 1024;

/// The Error Type for invalid ordering configuration files
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read configuration file: {0}")]
    Io(String),
    #[error("unable to parse configuration as JSON: {0}")]
    Json(String),
    #[error("configuration entry {0:?} has the wrong type")]
    WrongType(&'static str),
    #[error("configuration entry {0:?} is out of range")]
    OutOfRange(&'static str),
}

/// Tunable constants of the ordering engine
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingConfig {
    /// Depth differences below this never decide an occlusion test
    pub depth_epsilon: f64,
    /// Largest in-degree the cycle breaker searches for on the coarse grid
    pub coarse_cycle_bound: u32,
    /// Largest in-degree the cycle breaker searches for among the sons of one father
    pub son_cycle_bound: u32,
    /// Maximum number of graph entries (back-edges and table slots) a single pass may allocate
    pub arena_capacity: usize,
    /// Number of children per process in the distributed spanning tree
    pub branching_factor: usize,
    /// Size of one message slot in bytes
    pub slot_size: usize,
    /// Number of slots that can be in flight on one link
    pub channel_capacity: usize,
}

impl Default for OrderingConfig {
    fn default() -> Self {
        Self {
            depth_epsilon: 1e-10,
            coarse_cycle_bound: 10,
            son_cycle_bound: 5,
            arena_capacity: 1 << 24,
            branching_factor: 4,
            slot_size: 4096,
            channel_capacity: 8,
        }
    }
}

impl OrderingConfig {
    /// Load a configuration from a JSON file
    ///
    /// Every entry is optional; missing entries keep their default value:
    /// ```JSON
    /// {
    ///     "depth_epsilon": 1e-10,
    ///     "coarse_cycle_bound": 10,
    ///     "son_cycle_bound": 5,
    ///     "arena_capacity": 16777216,
    ///     "branching_factor": 4,
    ///     "slot_size": 4096,
    ///     "channel_capacity": 8
    /// }
    /// ```
    pub fn from_file(path: impl AsRef<str>) -> Result<Self, ConfigError> {
        let contents =
            read_to_string(path.as_ref()).map_err(|err| ConfigError::Io(err.to_string()))?;
        Self::from_json(&contents)
    }

    /// Parse a configuration from the contents of a JSON document (see [`OrderingConfig::from_file`])
    pub fn from_json(contents: &str) -> Result<Self, ConfigError> {
        let config_json =
            json::parse(contents).map_err(|err| ConfigError::Json(err.to_string()))?;
        if !config_json.is_object() {
            return Err(ConfigError::Json(String::from("expected a JSON object")));
        }

        let defaults = Self::default();
        let config = Self {
            depth_epsilon: float_entry(&config_json, "depth_epsilon", defaults.depth_epsilon)?,
            coarse_cycle_bound: int_entry(
                &config_json,
                "coarse_cycle_bound",
                defaults.coarse_cycle_bound,
            )?,
            son_cycle_bound: int_entry(&config_json, "son_cycle_bound", defaults.son_cycle_bound)?,
            arena_capacity: int_entry(&config_json, "arena_capacity", defaults.arena_capacity)?,
            branching_factor: int_entry(
                &config_json,
                "branching_factor",
                defaults.branching_factor,
            )?,
            slot_size: int_entry(&config_json, "slot_size", defaults.slot_size)?,
            channel_capacity: int_entry(
                &config_json,
                "channel_capacity",
                defaults.channel_capacity,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check that every entry is usable by the ordering engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.depth_epsilon.is_finite() && self.depth_epsilon >= 0.0) {
            return Err(ConfigError::OutOfRange("depth_epsilon"));
        }
        if self.coarse_cycle_bound > u16::MAX as u32 {
            return Err(ConfigError::OutOfRange("coarse_cycle_bound"));
        }
        if self.son_cycle_bound > u16::MAX as u32 {
            return Err(ConfigError::OutOfRange("son_cycle_bound"));
        }
        if self.branching_factor == 0 || self.branching_factor > MAX_BRANCHING_FACTOR {
            return Err(ConfigError::OutOfRange("branching_factor"));
        }
        if self.slot_size < MIN_SLOT_SIZE || self.slot_size > u16::MAX as usize {
            return Err(ConfigError::OutOfRange("slot_size"));
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::OutOfRange("channel_capacity"));
        }
        Ok(())
    }

    pub fn to_json(&self) -> JsonValue {
        object! {
            "depth_epsilon": self.depth_epsilon,
            "coarse_cycle_bound": self.coarse_cycle_bound,
            "son_cycle_bound": self.son_cycle_bound,
            "arena_capacity": self.arena_capacity,
            "branching_factor": self.branching_factor,
            "slot_size": self.slot_size,
            "channel_capacity": self.channel_capacity,
        }
    }

    /// Print the configuration to a JSON file specified by path.
    pub fn export_to_json(&self, path: impl AsRef<str>) -> std::io::Result<()> {
        let f = File::create(path.as_ref())?;
        let mut w = BufWriter::new(&f);
        self.to_json().write_pretty(&mut w, 4)?;
        Ok(())
    }
}

fn float_entry(config: &JsonValue, key: &'static str, default: f64) -> Result<f64, ConfigError> {
    let entry = &config[key];
    if entry.is_null() {
        Ok(default)
    } else {
        entry.as_f64().ok_or(ConfigError::WrongType(key))
    }
}

fn int_entry<T: TryFrom<u64>>(
    config: &JsonValue,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    let entry = &config[key];
    if entry.is_null() {
        Ok(default)
    } else {
        let value = entry.as_u64().ok_or(ConfigError::WrongType(key))?;
        T::try_from(value).map_err(|_| ConfigError::OutOfRange(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip() {
        let defaults = OrderingConfig::default();
        let parsed = OrderingConfig::from_json(&defaults.to_json().dump()).unwrap();
        assert_eq!(parsed, defaults);
        assert!(defaults.validate().is_ok());
    }

    #[test]
    fn partial_config() {
        let config =
            OrderingConfig::from_json(r#"{ "son_cycle_bound": 7, "depth_epsilon": 0.001 }"#)
                .unwrap();
        assert_eq!(config.son_cycle_bound, 7);
        assert_eq!(config.depth_epsilon, 0.001);
        assert_eq!(config.coarse_cycle_bound, 10);
        assert_eq!(config.slot_size, 4096);
    }

    #[test]
    fn bad_config() {
        assert!(matches!(
            OrderingConfig::from_json("[1, 2"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            OrderingConfig::from_json("[1, 2]"),
            Err(ConfigError::Json(_))
        ));
        assert_eq!(
            OrderingConfig::from_json(r#"{ "slot_size": "big" }"#).unwrap_err(),
            ConfigError::WrongType("slot_size")
        );
        assert_eq!(
            OrderingConfig::from_json(r#"{ "branching_factor": 9 }"#).unwrap_err(),
            ConfigError::OutOfRange("branching_factor")
        );
        assert_eq!(
            OrderingConfig::from_json(r#"{ "slot_size": 16 }"#).unwrap_err(),
            ConfigError::OutOfRange("slot_size")
        );
        assert_eq!(
            OrderingConfig::from_json(r#"{ "depth_epsilon": -1.0 }"#).unwrap_err(),
            ConfigError::OutOfRange("depth_epsilon")
        );
    }

    #[test]
    fn oversized_integers() {
        // 2^32 + 3 doesn't fit a cycle bound
        assert_eq!(
            OrderingConfig::from_json(r#"{ "coarse_cycle_bound": 4294967299 }"#).unwrap_err(),
            ConfigError::OutOfRange("coarse_cycle_bound")
        );
        assert_eq!(
            OrderingConfig::from_json(r#"{ "son_cycle_bound": -2 }"#).unwrap_err(),
            ConfigError::WrongType("son_cycle_bound")
        );
        assert_eq!(
            OrderingConfig::from_json(r#"{ "coarse_cycle_bound": 65535 }"#)
                .unwrap()
                .coarse_cycle_bound,
            65535
        );
    }
}

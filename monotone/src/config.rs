/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Configuration for the monotonicity job.
//!
//! A [`Config`] is a set of optional overrides. Layers (YAML file,
//! environment, command line) are combined with [`Config::merge`],
//! later layers taking precedence, and the result is checked and
//! completed with defaults by [`Config::resolve`], which yields the
//! [`JobConfig`] a job actually runs with.

use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Environment variable for [`Config::input_location`].
pub const INPUT_ENV: &str = "MONOTONE_INPUT";
/// Environment variable for [`Config::output_location`].
pub const OUTPUT_ENV: &str = "MONOTONE_OUTPUT";
/// Environment variable for [`Config::parse_mode`].
pub const PARSE_MODE_ENV: &str = "MONOTONE_PARSE_MODE";
/// Environment variable for [`Config::partitions`].
pub const PARTITIONS_ENV: &str = "MONOTONE_PARTITIONS";
/// Environment variable for [`Config::timestamp_field`].
pub const TIMESTAMP_FIELD_ENV: &str = "MONOTONE_TIMESTAMP_FIELD";
/// Environment variable for [`Config::key_field`].
pub const KEY_FIELD_ENV: &str = "MONOTONE_KEY_FIELD";
/// Environment variable for [`Config::value_field`].
pub const VALUE_FIELD_ENV: &str = "MONOTONE_VALUE_FIELD";

/// The type of error for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("missing required setting `{name}`")]
    Missing { name: &'static str },

    #[error("`partitions` must be at least 1")]
    ZeroPartitions,

    #[error("field name for `{role}` is empty")]
    EmptyFieldName { role: &'static str },

    #[error("field name `{name}` is used for more than one role")]
    DuplicateFieldName { name: String },

    #[error("invalid parse mode `{0}`: expected `strict` or `lenient`")]
    InvalidParseMode(String),

    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// What to do with a record that fails to parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Fail the job on the first malformed record.
    #[default]
    Strict,
    /// Skip malformed records, log them and count them.
    Lenient,
}

impl FromStr for ParseMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(ParseMode::Strict),
            "lenient" => Ok(ParseMode::Lenient),
            _ => Err(ConfigError::InvalidParseMode(s.to_string())),
        }
    }
}

/// Names of the JSON fields that carry the observation schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNames {
    pub timestamp: String,
    pub key: String,
    pub value: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            timestamp: "timestamp".to_string(),
            key: "website".to_string(),
            value: "users".to_string(),
        }
    }
}

impl FieldNames {
    fn validate(&self) -> Result<(), ConfigError> {
        let roles = [
            ("timestamp", &self.timestamp),
            ("key", &self.key),
            ("value", &self.value),
        ];
        for (role, name) in roles {
            if name.is_empty() {
                return Err(ConfigError::EmptyFieldName { role });
            }
        }
        for (i, (_, a)) in roles.iter().enumerate() {
            if roles[i + 1..].iter().any(|(_, b)| a == b) {
                return Err(ConfigError::DuplicateFieldName {
                    name: a.to_string(),
                });
            }
        }
        // The output record uses `monotonic` next to the key field.
        if self.key == "monotonic" {
            return Err(ConfigError::DuplicateFieldName {
                name: self.key.clone(),
            });
        }
        Ok(())
    }
}

/// Layerable job configuration. Unset settings fall back to defaults
/// in [`Config::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub input_location: Option<PathBuf>,
    pub output_location: Option<PathBuf>,
    pub parse_mode: Option<ParseMode>,
    pub partitions: Option<usize>,
    pub timestamp_field: Option<String>,
    pub key_field: Option<String>,
    pub value_field: Option<String>,
}

/// A complete, validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    pub input_location: PathBuf,
    pub output_location: PathBuf,
    pub parse_mode: ParseMode,
    pub partitions: usize,
    pub fields: FieldNames,
}

impl JobConfig {
    /// A configuration with default settings for the given locations.
    pub fn new(input_location: impl Into<PathBuf>, output_location: impl Into<PathBuf>) -> Self {
        Self {
            input_location: input_location.into(),
            output_location: output_location.into(),
            parse_mode: ParseMode::default(),
            partitions: default_partitions(),
            fields: FieldNames::default(),
        }
    }
}

/// One partition per available core.
pub fn default_partitions() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Config {
    /// Create an empty configuration (all defaults).
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from `MONOTONE_*` environment variables.
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        config.input_location = lookup(INPUT_ENV).map(PathBuf::from);
        config.output_location = lookup(OUTPUT_ENV).map(PathBuf::from);

        if let Some(val) = lookup(PARSE_MODE_ENV) {
            match val.parse::<ParseMode>() {
                Ok(mode) => config.parse_mode = Some(mode),
                Err(e) => tracing::error!("ignoring ${}: {}", PARSE_MODE_ENV, e),
            }
        }

        if let Some(val) = lookup(PARTITIONS_ENV) {
            match val.trim().parse::<usize>() {
                Ok(n) => config.partitions = Some(n),
                Err(e) => tracing::error!(
                    "ignoring ${}: invalid value \"{}\": {}",
                    PARTITIONS_ENV,
                    val,
                    e
                ),
            }
        }

        config.timestamp_field = lookup(TIMESTAMP_FIELD_ENV);
        config.key_field = lookup(KEY_FIELD_ENV);
        config.value_field = lookup(VALUE_FIELD_ENV);

        config
    }

    /// Load configuration from a YAML file
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let io_error = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(io_error)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(io_error)?;
        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Save configuration to a YAML file
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), anyhow::Error> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Merge with another configuration, with the other taking precedence
    pub fn merge(&mut self, other: &Self) {
        fn take<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if let Some(value) = other {
                *slot = Some(value.clone());
            }
        }
        take(&mut self.input_location, &other.input_location);
        take(&mut self.output_location, &other.output_location);
        take(&mut self.parse_mode, &other.parse_mode);
        take(&mut self.partitions, &other.partitions);
        take(&mut self.timestamp_field, &other.timestamp_field);
        take(&mut self.key_field, &other.key_field);
        take(&mut self.value_field, &other.value_field);
    }

    /// Check that this configuration resolves.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.resolve().map(|_| ())
    }

    /// Fill in defaults and validate.
    pub fn resolve(&self) -> Result<JobConfig, ConfigError> {
        let input_location = self
            .input_location
            .clone()
            .ok_or(ConfigError::Missing {
                name: "input_location",
            })?;
        let output_location = self
            .output_location
            .clone()
            .ok_or(ConfigError::Missing {
                name: "output_location",
            })?;

        let partitions = self.partitions.unwrap_or_else(default_partitions);
        if partitions == 0 {
            return Err(ConfigError::ZeroPartitions);
        }

        let defaults = FieldNames::default();
        let fields = FieldNames {
            timestamp: self.timestamp_field.clone().unwrap_or(defaults.timestamp),
            key: self.key_field.clone().unwrap_or(defaults.key),
            value: self.value_field.clone().unwrap_or(defaults.value),
        };
        fields.validate()?;

        Ok(JobConfig {
            input_location,
            output_location,
            parse_mode: self.parse_mode.unwrap_or_default(),
            partitions,
            fields,
        })
    }
}

//! Option snapshots
//!
//! An [`EngineOptions`] value is a flat `key -> value` map handed to
//! [`EngineConfig::load`](super::config::EngineConfig::load). Every
//! recognised key has a default, so an empty snapshot is valid. Unknown keys
//! and ill-typed values are rejected.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Typed option value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl OptionValue {
    fn type_name(&self) -> &'static str {
        match self {
            OptionValue::Bool(_) => "bool",
            OptionValue::Int(_) => "int",
            OptionValue::Float(_) => "float",
            OptionValue::Str(_) => "string",
        }
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Bool(b)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Int(n)
    }
}

impl From<f64> for OptionValue {
    fn from(x: f64) -> Self {
        OptionValue::Float(x)
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::Str(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::Str(s)
    }
}

/// Option keys understood by the engine
pub mod keys {
    pub const COMPILATION: &str = "compilation";
    pub const COMPILE_ONLY: &str = "compile_only";
    pub const COMPILE_IMMEDIATELY: &str = "compile_immediately";
    pub const BACKGROUND_COMPILATION: &str = "background_compilation";
    pub const COMPILE_AOT_ON_CREATE: &str = "compile_aot_on_create";
    pub const MULTI_TIER: &str = "multi_tier";
    pub const MIN_INVOKE_THRESHOLD: &str = "min_invoke_threshold";
    pub const FIRST_TIER_MIN_INVOKE_THRESHOLD: &str = "first_tier_min_invoke_threshold";
    pub const FIRST_TIER_COMPILATION_THRESHOLD: &str = "first_tier_compilation_threshold";
    pub const SINGLE_TIER_COMPILATION_THRESHOLD: &str = "single_tier_compilation_threshold";
    pub const LAST_TIER_COMPILATION_THRESHOLD: &str = "last_tier_compilation_threshold";
    pub const OSR: &str = "osr";
    pub const OSR_COMPILATION_THRESHOLD: &str = "osr_compilation_threshold";
    pub const OSR_MAX_COMPILATION_REATTEMPTS: &str = "osr_max_compilation_reattempts";
    pub const TRAVERSING_COMPILATION_QUEUE: &str = "traversing_compilation_queue";
    pub const TRAVERSING_QUEUE_WEIGHTING_BOTH_TIERS: &str = "traversing_queue_weighting_both_tiers";
    pub const TRAVERSING_QUEUE_FIRST_TIER_PRIORITY: &str = "traversing_queue_first_tier_priority";
    pub const TRAVERSING_QUEUE_FIRST_TIER_BONUS: &str = "traversing_queue_first_tier_bonus";
    pub const SPLITTING: &str = "splitting";
    pub const SPLITTING_ALLOW_FORCED_SPLITS: &str = "splitting_allow_forced_splits";
    pub const SPLITTING_MAX_CALLEE_SIZE: &str = "splitting_max_callee_size";
    pub const SPLITTING_GROWTH_LIMIT: &str = "splitting_growth_limit";
    pub const SPLITTING_MAX_PROPAGATION_DEPTH: &str = "splitting_max_propagation_depth";
    pub const COMPILER_THREADS: &str = "compiler_threads";
    pub const COMPILATION_FAILURE_ACTION: &str = "compilation_failure_action";
    pub const TRACE_COMPILATION: &str = "trace_compilation";

    /// Every recognised key
    pub const ALL: &[&str] = &[
        COMPILATION,
        COMPILE_ONLY,
        COMPILE_IMMEDIATELY,
        BACKGROUND_COMPILATION,
        COMPILE_AOT_ON_CREATE,
        MULTI_TIER,
        MIN_INVOKE_THRESHOLD,
        FIRST_TIER_MIN_INVOKE_THRESHOLD,
        FIRST_TIER_COMPILATION_THRESHOLD,
        SINGLE_TIER_COMPILATION_THRESHOLD,
        LAST_TIER_COMPILATION_THRESHOLD,
        OSR,
        OSR_COMPILATION_THRESHOLD,
        OSR_MAX_COMPILATION_REATTEMPTS,
        TRAVERSING_COMPILATION_QUEUE,
        TRAVERSING_QUEUE_WEIGHTING_BOTH_TIERS,
        TRAVERSING_QUEUE_FIRST_TIER_PRIORITY,
        TRAVERSING_QUEUE_FIRST_TIER_BONUS,
        SPLITTING,
        SPLITTING_ALLOW_FORCED_SPLITS,
        SPLITTING_MAX_CALLEE_SIZE,
        SPLITTING_GROWTH_LIMIT,
        SPLITTING_MAX_PROPAGATION_DEPTH,
        COMPILER_THREADS,
        COMPILATION_FAILURE_ACTION,
        TRACE_COMPILATION,
    ];
}

// =============================================================================
// ConfigResult and ConfigError
// =============================================================================

/// Errors that make an option snapshot unusable
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Key is not an engine option
    UnknownKey(String),

    /// Value has the wrong type for the key
    TypeMismatch {
        key: String,
        expected: &'static str,
        got: &'static str,
    },

    /// Numeric value outside the accepted range
    OutOfRange { key: String, value: String },

    /// String value not among the accepted choices
    InvalidChoice { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnknownKey(key) => write!(f, "Unknown engine option: {}", key),
            ConfigError::TypeMismatch { key, expected, got } => {
                write!(f, "Option {}: expected {}, got {}", key, expected, got)
            }
            ConfigError::OutOfRange { key, value } => {
                write!(f, "Option {}: value {} is out of range", key, value)
            }
            ConfigError::InvalidChoice { key, value } => {
                write!(f, "Option {}: invalid value '{}'", key, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Result type for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// EngineOptions
// =============================================================================

/// Flat option snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EngineOptions {
    values: BTreeMap<String, OptionValue>,
}

impl EngineOptions {
    /// Empty snapshot (all defaults)
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value
    pub fn set(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Raw value for a key
    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.values.get(key)
    }

    /// Number of explicitly set options
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no option is set
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Reject keys the engine does not know
    pub(crate) fn check_keys(&self) -> ConfigResult<()> {
        match self.values.keys().find(|k| !keys::ALL.contains(&k.as_str())) {
            Some(unknown) => Err(ConfigError::UnknownKey(unknown.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn bool_or(&self, key: &str, default: bool) -> ConfigResult<bool> {
        match self.values.get(key) {
            None => Ok(default),
            Some(OptionValue::Bool(b)) => Ok(*b),
            Some(other) => Err(mismatch(key, "bool", other)),
        }
    }

    /// Non-negative integer that fits in `u32`
    pub(crate) fn threshold_or(&self, key: &str, default: u32) -> ConfigResult<u32> {
        match self.values.get(key) {
            None => Ok(default),
            Some(OptionValue::Int(n)) => u32::try_from(*n).map_err(|_| ConfigError::OutOfRange {
                key: key.to_string(),
                value: n.to_string(),
            }),
            Some(other) => Err(mismatch(key, "int", other)),
        }
    }

    /// Finite float; integers are widened
    pub(crate) fn float_or(&self, key: &str, default: f64) -> ConfigResult<f64> {
        let value = match self.values.get(key) {
            None => return Ok(default),
            Some(OptionValue::Float(x)) => *x,
            Some(OptionValue::Int(n)) => *n as f64,
            Some(other) => return Err(mismatch(key, "float", other)),
        };
        if value.is_finite() && value >= 0.0 {
            Ok(value)
        } else {
            Err(ConfigError::OutOfRange {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
    }

    pub(crate) fn str_opt(&self, key: &str) -> ConfigResult<Option<String>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(OptionValue::Str(s)) => Ok(Some(s.clone())),
            Some(other) => Err(mismatch(key, "string", other)),
        }
    }
}

fn mismatch(key: &str, expected: &'static str, got: &OptionValue) -> ConfigError {
    ConfigError::TypeMismatch {
        key: key.to_string(),
        expected,
        got: got.type_name(),
    }
}

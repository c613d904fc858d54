use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::registry::DEFAULT_ALIGNMENT;

/// Environment variable consulted by [`PlannerOptions::with_env_overrides`]
///
/// An integer; values `<= 0` disable memory sharing. Intended for debugging
/// reuse-related bugs only.
pub const MEM_REUSE_ENV: &str = "MEMPLAN_ENABLE_MEM_REUSE";

/// Default size-match window of both buffer assigners
pub const DEFAULT_MATCH_RANGE: usize = 16;

/// Options for the memory planner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerOptions {
    /// Reuse buffers between values with disjoint lifetimes
    pub enable_memory_sharing: bool,
    /// Size-match window of the buffer assigners (0 = never reuse)
    pub match_range: usize,
    /// Alignment of every entry in the temporary and persistent arenas
    pub alignment: usize,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            enable_memory_sharing: true,
            match_range: DEFAULT_MATCH_RANGE,
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl PlannerOptions {
    /// Create a new options object with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable memory sharing
    pub fn enable_memory_sharing(mut self, enable: bool) -> Self {
        self.enable_memory_sharing = enable;
        self
    }

    /// Set the size-match window
    pub fn set_match_range(mut self, match_range: usize) -> Self {
        self.match_range = match_range;
        self
    }

    /// Set the arena alignment
    pub fn set_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Apply the debug-only reuse switch from the process environment
    ///
    /// Nothing reads the environment unless the caller asks for it here.
    pub fn with_env_overrides(self) -> Self {
        match std::env::var(MEM_REUSE_ENV) {
            Ok(raw) => self.with_reuse_override(&raw),
            Err(_) => self,
        }
    }

    fn with_reuse_override(self, raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(value) => self.enable_memory_sharing(value > 0),
            Err(_) => {
                warn!("Ignoring non-integer {}={:?}", MEM_REUSE_ENV, raw);
                self
            }
        }
    }

    /// Match range the assigners are actually built with
    pub fn effective_match_range(&self) -> usize {
        if self.enable_memory_sharing {
            self.match_range
        } else {
            0
        }
    }

    /// Check option values for consistency
    pub fn validate(&self) -> Result<()> {
        if !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfig(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        Ok(())
    }

    /// Parse options from a JSON document, missing fields take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

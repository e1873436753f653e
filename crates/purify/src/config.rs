//! User-facing knobs that steer how functionalization rewrites programs.
//!
//! Defaults are resolved from the environment (see `PURIFY_REAPPLY_VIEWS`) and can be overridden
//! by JSON documents, mirroring how functional overrides are deserialized elsewhere in the stack.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::env;

/// Settings consumed by [`FunctionalTensorMode`](crate::functional::FunctionalTensorMode) and the
/// native functionalize transform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionalizeConfig {
    /// Re-apply view operations on top of functionalized programs instead of emitting `_copy`
    /// variants.
    pub reapply_views: bool,
}

impl Default for FunctionalizeConfig {
    fn default() -> Self {
        FunctionalizeConfig {
            reapply_views: env::reapply_views_default(),
        }
    }
}

impl FunctionalizeConfig {
    /// Parses a config from JSON; missing fields fall back to the environment defaults.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).context("failed to parse functionalize config")
    }

    /// Loads a JSON config file from disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read functionalize config {}", path.display()))?;
        Self::from_json_str(&raw)
    }

    pub fn with_reapply_views(mut self, enabled: bool) -> Self {
        self.reapply_views = enabled;
        self
    }
}

/// Which aliasing constructs a functionalize transform strips from the traced program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalPolicy {
    /// Remove in-place mutations; views are re-applied.
    Mutations,
    /// Remove mutations and replace views with their copying variants.
    MutationsAndViews,
}

impl RemovalPolicy {
    /// View re-application implied by the policy.
    pub fn reapply_views(self) -> bool {
        matches!(self, RemovalPolicy::Mutations)
    }

    /// Policy used by a transform that does or does not add views back after functionalizing.
    pub fn from_add_back_views(add_back_views: bool) -> Self {
        if add_back_views {
            RemovalPolicy::MutationsAndViews
        } else {
            RemovalPolicy::Mutations
        }
    }
}

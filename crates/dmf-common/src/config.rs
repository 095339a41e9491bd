use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MfError, Result};

/// Top-level configuration for one factorization run.
///
/// Shaped after `risingwave_common::config::ComputeNodeConfig`: a tree of
/// small `#[serde(default = "...")]` structs, each independently
/// `Default`-able via an empty-TOML round trip so unit tests can build a
/// config without touching the filesystem.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RunConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub sgd: SgdConfig,

    #[serde(default)]
    pub balance: BalanceConfig,
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| MfError::Config(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default::world_size")]
    pub world_size: usize,

    #[serde(default = "default::tasks_per_rank")]
    pub tasks_per_rank: usize,

    /// Micro-delay between economic-wait polls, in microseconds (spec §5).
    #[serde(default = "default::poll_delay_us")]
    pub poll_delay_us: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SgdConfig {
    #[serde(default = "default::epochs")]
    pub epochs: usize,

    #[serde(default = "default::rank")]
    pub rank: usize,

    #[serde(default = "default::seed")]
    pub seed: u64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BalanceKind {
    #[default]
    None,
    L2,
    Nzl2,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BalanceMethod {
    // The CLI default (spec §9 open question: the source sets
    // BALANCE_OPTIMAL in some drivers but defaults to Simple in others,
    // with the CLI surface defaulting to Simple. We take the CLI surface
    // as canonical since it is the one the spec fixes as a contract.)
    #[default]
    Simple,
    Optimal,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceConfig {
    #[serde(default)]
    pub kind: BalanceKind,
    #[serde(default)]
    pub method: BalanceMethod,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

mod default {
    pub fn world_size() -> usize {
        1
    }
    pub fn tasks_per_rank() -> usize {
        1
    }
    pub fn poll_delay_us() -> u64 {
        0
    }
    pub fn epochs() -> usize {
        20
    }
    pub fn rank() -> usize {
        10
    }
    pub fn seed() -> u64 {
        0
    }
}

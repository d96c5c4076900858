//! Backend selection.
//!
//! This module defines the compute backends a [`Runtime`](crate::Runtime) can
//! be created on.
//!
//! # Supported Backends
//!
//! - `Cpu`: host buffers with kernels run through `rayon` (default).
//! - `Wgpu`: GPU buffers and WGSL compute pipelines (requires the `wgpu` feature).
//!
//! The backend is chosen once per runtime through
//! [`RuntimeConfig`](crate::config::RuntimeConfig) and never changes afterwards;
//! there is no process-wide backend state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Enumeration of supported computation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Backend {
    /// Host backend (default).
    #[default]
    Cpu = 0,
    /// GPU backend using `wgpu`.
    Wgpu,
}

impl Backend {
    /// Returns whether this build can create a runtime on the backend.
    pub const fn is_available(self) -> bool {
        match self {
            Self::Cpu => true,
            Self::Wgpu => cfg!(feature = "wgpu"),
        }
    }
}

impl TryFrom<u8> for Backend {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Cpu),
            1 => Ok(Self::Wgpu),
            other => Err(other),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(format!("unknown backend `{other}`")),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Wgpu => f.write_str("wgpu"),
        }
    }
}

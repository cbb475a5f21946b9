// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Compute device selection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::config::DevicePreference;

/// Concrete device a model is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
    Mps,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accelerators visible to this process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceAvailability {
    pub mps: bool,
    pub cuda: bool,
}

impl DeviceAvailability {
    /// Probe the host
    pub fn detect() -> Self {
        Self {
            mps: cfg!(all(target_os = "macos", target_arch = "aarch64")),
            cuda: cuda_visible(),
        }
    }

    /// No accelerators
    pub fn cpu_only() -> Self {
        Self::default()
    }
}

fn cuda_visible() -> bool {
    match std::env::var("CUDA_VISIBLE_DEVICES") {
        Ok(v) if v.trim().is_empty() || v.trim() == "-1" => return false,
        Ok(_) => return true,
        Err(_) => {}
    }
    Path::new("/proc/driver/nvidia/version").exists()
}

/// Pick a device: explicit preference, then Apple silicon, then CUDA, then CPU
pub fn select_device(preference: DevicePreference, available: DeviceAvailability) -> Device {
    match preference {
        DevicePreference::Cpu => Device::Cpu,
        DevicePreference::Cuda => Device::Cuda,
        DevicePreference::Mps => Device::Mps,
        DevicePreference::Auto => {
            if available.mps {
                Device::Mps
            } else if available.cuda {
                Device::Cuda
            } else {
                Device::Cpu
            }
        }
    }
}

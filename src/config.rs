// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bluetooth::ble_constants::config::DEFAULT_MTU;
use crate::protocol::{codec_for, DeviceFamily};
use crate::session::SessionConfig;

const APP_DIR: &str = "bplink";
const CONFIG_FILE: &str = "config.toml";

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,

    /// KD5811BT session settings.
    #[serde(deserialize_with = "kd5811bt_section")]
    pub kd5811bt: FamilyConfig,

    /// KN550LT session settings.
    #[serde(deserialize_with = "kn550lt_section")]
    pub kn550lt: FamilyConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name such as "hci0"; the default adapter when unset.
    pub adapter: Option<String>,

    /// Connect and service discovery timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// MTU assumed when the stack cannot report one.
    pub fallback_mtu: usize,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            connect_timeout_ms: 15_000,
            fallback_mtu: DEFAULT_MTU,
        }
    }
}

impl BluetoothConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyConfig {
    /// Wait for each device response in milliseconds.
    pub command_timeout_ms: u64,

    /// Records requested per page during transfer.
    pub page_size: u8,
}

impl FamilyConfig {
    /// Defaults published by the family codec.
    pub fn for_family(family: DeviceFamily) -> Self {
        let descriptor = codec_for(family).descriptor();
        Self {
            command_timeout_ms: descriptor.command_timeout.as_millis() as u64,
            page_size: descriptor.page_size,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            command_timeout: Duration::from_millis(self.command_timeout_ms.max(1)),
            page_size: self.page_size.max(1),
        }
    }
}

/// A family section as written; missing keys fall back to the family defaults.
#[derive(Deserialize)]
struct FamilySection {
    command_timeout_ms: Option<u64>,
    page_size: Option<u8>,
}

impl FamilySection {
    fn resolve(self, family: DeviceFamily) -> FamilyConfig {
        let defaults = FamilyConfig::for_family(family);
        FamilyConfig {
            command_timeout_ms: self.command_timeout_ms.unwrap_or(defaults.command_timeout_ms),
            page_size: self.page_size.unwrap_or(defaults.page_size),
        }
    }
}

fn kd5811bt_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FamilyConfig, D::Error> {
    FamilySection::deserialize(deserializer).map(|section| section.resolve(DeviceFamily::Kd5811bt))
}

fn kn550lt_section<'de, D: Deserializer<'de>>(deserializer: D) -> Result<FamilyConfig, D::Error> {
    FamilySection::deserialize(deserializer).map(|section| section.resolve(DeviceFamily::Kn550lt))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// tracing filter directive; `RUST_LOG` takes precedence.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "bplink=info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bluetooth: BluetoothConfig::default(),
            kd5811bt: FamilyConfig::for_family(DeviceFamily::Kd5811bt),
            kn550lt: FamilyConfig::for_family(DeviceFamily::Kn550lt),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn family(&self, family: DeviceFamily) -> &FamilyConfig {
        match family {
            DeviceFamily::Kd5811bt => &self.kd5811bt,
            DeviceFamily::Kn550lt => &self.kn550lt,
        }
    }
}

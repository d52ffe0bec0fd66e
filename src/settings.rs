use std::collections::HashSet;
use std::{fs, path::Path, path::PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::device::{EndpointConfig, ReconnectSettings};
use crate::models::Channel;
use crate::recording::Throttle;

pub const CONFIG_ENV: &str = "OVEN_TRACKER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "oven-tracker.json";

/// Binding of a channel id to the field carrying its value in device lines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSettings {
    pub id: String,
    pub device_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSettings {
    pub serial: EndpointConfig,
    pub channels: Vec<ChannelSettings>,
    pub throttle_secs: u64,
    pub database_path: PathBuf,
    pub persist_queue_capacity: usize,
    pub reconnect: ReconnectSettings,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            serial: EndpointConfig::default(),
            channels: vec![
                ChannelSettings {
                    id: "oven1".into(),
                    device_key: "temp1".into(),
                },
                ChannelSettings {
                    id: "oven2".into(),
                    device_key: "temp2".into(),
                },
            ],
            throttle_secs: 60,
            database_path: PathBuf::from("oven_tracker.sqlite3"),
            persist_queue_capacity: 64,
            reconnect: ReconnectSettings::default(),
        }
    }
}

impl TrackerSettings {
    /// Reads the config file named by `OVEN_TRACKER_CONFIG`, applies the
    /// environment overrides and validates the result.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut settings = Self::from_path(Path::new(&path))?;
        settings.apply_overrides(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// A missing file yields the defaults; so does an unparsable one, with a
    /// warning.
    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(settings) => Ok(settings),
            Err(err) => {
                warn!(
                    "Ignoring unparsable settings file {}: {err}",
                    path.display()
                );
                Ok(Self::default())
            }
        }
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("OVEN_TRACKER_SERIAL_PORT") {
            self.serial.port = port;
        }
        if let Some(baud_rate) = lookup("OVEN_TRACKER_BAUD_RATE") {
            self.serial.baud_rate = baud_rate
                .trim()
                .parse()
                .with_context(|| format!("OVEN_TRACKER_BAUD_RATE is not a number: {baud_rate}"))?;
        }
        if let Some(path) = lookup("OVEN_TRACKER_DB") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(secs) = lookup("OVEN_TRACKER_THROTTLE_SECS") {
            self.throttle_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("OVEN_TRACKER_THROTTLE_SECS is not a number: {secs}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.throttle_secs == 0 {
            bail!("throttle_secs must be greater than zero");
        }
        if self.persist_queue_capacity == 0 {
            bail!("persist_queue_capacity must be greater than zero");
        }
        if self.channels.is_empty() {
            bail!("at least one channel must be configured");
        }

        let mut ids = HashSet::new();
        let mut keys = HashSet::new();
        for channel in &self.channels {
            if channel.device_key.trim().is_empty() {
                bail!("channel {} has an empty device key", channel.id);
            }
            if !ids.insert(channel.id.to_ascii_lowercase()) {
                bail!("duplicate channel id {} (ids are compared without case)", channel.id);
            }
            if !keys.insert(channel.device_key.as_str()) {
                bail!("duplicate device key {}", channel.device_key);
            }
        }
        self.channels()?;
        Ok(())
    }

    pub fn channels(&self) -> Result<Vec<Channel>> {
        self.channels
            .iter()
            .map(|channel| {
                Channel::new(&channel.id, &channel.device_key)
                    .map_err(|err| anyhow!("invalid channel {:?}: {err}", channel.id))
            })
            .collect()
    }

    pub fn throttle(&self) -> Throttle {
        Throttle::from_secs(self.throttle_secs)
    }
}

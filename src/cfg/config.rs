// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Typed configuration for the IPC client, loaded from the flat,
/// dotted-key YAML the recognized configuration keys use (§6): each field
/// maps to one external key via `serde(rename)`, the same way the dotted
/// wire keys are handled elsewhere in this codebase.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// `ipc.client.connection.maxidletime` — idle eviction window.
    #[serde(
        rename = "ipc.client.connection.maxidletime",
        with = "millis_duration",
        default = "default_max_idle_time"
    )]
    pub max_idle_time: Duration,

    /// `ipc.client.connect.max.retries` — non-timeout connect retry cap.
    #[serde(rename = "ipc.client.connect.max.retries", default = "default_max_retries")]
    pub max_retries: u32,

    /// `ipc.client.tcpnodelay` — disable Nagle on every connection.
    #[serde(rename = "ipc.client.tcpnodelay", default)]
    pub tcp_nodelay: bool,

    /// `ipc.ping.interval` — read-timeout / ping cadence.
    #[serde(
        rename = "ipc.ping.interval",
        with = "millis_duration",
        default = "default_ping_interval"
    )]
    pub ping_interval: Duration,
}

fn default_max_idle_time() -> Duration {
    Duration::from_millis(10_000)
}

fn default_max_retries() -> u32 {
    10
}

fn default_ping_interval() -> Duration {
    Duration::from_millis(60_000)
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_time: default_max_idle_time(),
            max_retries: default_max_retries(),
            tcp_nodelay: false,
            ping_interval: default_ping_interval(),
        }
    }
}

impl ClientConfig {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: ClientConfig =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants. There are no derived/normalized fields today —
    /// this mirrors the shape of a richer config loader so the crate grows
    /// in the direction every other config key already takes.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(!self.max_idle_time.is_zero(), "ipc.client.connection.maxidletime must be > 0");
        ensure!(!self.ping_interval.is_zero(), "ipc.ping.interval must be > 0");
        Ok(())
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod millis_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! Broker tunables. Config loading itself (file discovery, CLI overrides)
//! is an external collaborator per the design doc, but the broker still
//! needs somewhere to read its knobs from, so this follows the same
//! raw-then-validated shape as a full config loader without the
//! multi-file merge machinery -- there's nothing here to merge, just
//! defaults overridable by a single file.

use std::{path::Path, time::Duration};

use anyhow::{bail, Context};
use serde::Deserialize;

use monado_broker_types::DEFAULT_MAX_LAYERS_PER_FRAME;

const DEFAULT_MAX_CLIENTS: usize = 32;
const DEFAULT_FENCE_WAIT_TIMEOUT_MS: u64 = 100;
const DEFAULT_PICKUP_SPIN_INTERVAL_MS: u64 = 1;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawConfig {
    max_layers_per_frame: usize,
    max_clients: usize,
    fence_wait_timeout_ms: u64,
    pickup_spin_interval_ms: u64,
    /// Overrides the "half a display period" pickup-displacement window
    /// with an absolute value. Left unset, the broker uses half of
    /// whatever period the native compositor predicts for a given cycle.
    /// See the design doc's note on the half-window being a tunable.
    half_window_ns: Option<u64>,
    do_warm_start: bool,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            max_layers_per_frame: DEFAULT_MAX_LAYERS_PER_FRAME,
            max_clients: DEFAULT_MAX_CLIENTS,
            fence_wait_timeout_ms: DEFAULT_FENCE_WAIT_TIMEOUT_MS,
            pickup_spin_interval_ms: DEFAULT_PICKUP_SPIN_INTERVAL_MS,
            half_window_ns: None,
            do_warm_start: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub max_layers_per_frame: usize,
    pub max_clients: usize,
    pub fence_wait_timeout: Duration,
    pub pickup_spin_interval: Duration,
    pub half_window_ns: Option<u64>,
    pub do_warm_start: bool,
}

impl Config {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let raw = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .context(format!("reading config file {}", path.display()))?;
                toml::from_str(&content)
                    .context(format!("parsing config file {}", path.display()))?
            }
            None => RawConfig::default(),
        };

        let this = Self::from_raw(raw);
        this.validate()?;
        Ok(this)
    }

    fn from_raw(raw: RawConfig) -> Self {
        Self {
            max_layers_per_frame: raw.max_layers_per_frame,
            max_clients: raw.max_clients,
            fence_wait_timeout: Duration::from_millis(raw.fence_wait_timeout_ms),
            pickup_spin_interval: Duration::from_millis(raw.pickup_spin_interval_ms),
            half_window_ns: raw.half_window_ns,
            do_warm_start: raw.do_warm_start,
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_layers_per_frame == 0 {
            bail!("max_layers_per_frame must be at least 1");
        }

        if self.max_clients == 0 {
            bail!("max_clients must be at least 1");
        }

        if self.fence_wait_timeout.is_zero() {
            bail!("fence_wait_timeout_ms must be nonzero");
        }

        Ok(())
    }

    /// The displacement window used by the pickup rule in
    /// `ClientProxy::deliver_from_worker`: a newly-signalled frame within
    /// this many nanoseconds of the broker's next announced display time
    /// displaces whatever's already scheduled.
    pub fn half_window_ns(&self, predicted_period_ns: u64) -> u64 {
        self.half_window_ns.unwrap_or(predicted_period_ns / 2)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawConfig::default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().expect("default config is valid");
        assert_eq!(cfg.max_layers_per_frame, DEFAULT_MAX_LAYERS_PER_FRAME);
    }

    #[test]
    fn half_window_defaults_to_half_period() {
        let cfg = Config::default();
        assert_eq!(cfg.half_window_ns(16_000_000), 8_000_000);
    }

    #[test]
    fn half_window_override() {
        let mut raw = RawConfig::default();
        raw.half_window_ns = Some(500_000);
        let cfg = Config::from_raw(raw);
        assert_eq!(cfg.half_window_ns(16_000_000), 500_000);
    }

    #[test]
    fn rejects_zero_max_layers() {
        let mut raw = RawConfig::default();
        raw.max_layers_per_frame = 0;
        let cfg = Config::from_raw(raw);
        assert!(cfg.validate().is_err());
    }
}

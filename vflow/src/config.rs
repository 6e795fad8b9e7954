/*
Copyright (c) 2022 VMware, Inc.
SPDX-License-Identifier: MIT
Permission is hereby granted, free of charge, to any person obtaining a copy
of this software and associated documentation files (the "Software"), to deal
in the Software without restriction, including without limitation the rights
to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
copies of the Software, and to permit persons to whom the Software is
furnished to do so, subject to the following conditions:
The above copyright notice and this permission notice shall be included in all
copies or substantial portions of the Software.
THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
SOFTWARE.
*/

//! Tunables for the flow pipeline.
//!
//! Every field has a default, so an empty JSON object is a complete configuration.  Durations are
//! in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::types::FlowId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{path}: could not read configuration")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse configuration")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration ({0})")]
    Invalid(String),
}

/// The range flow IDs are allocated from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowIdRange {
    pub min: u64,
    pub max: u64,

    /// First ID tried when no next-ID counter has been persisted yet.
    pub initial: u64,
}

impl Default for FlowIdRange {
    fn default() -> Self {
        FlowIdRange { min: 1, max: (1 << 48) - 1, initial: 1000001 }
    }
}

impl FlowIdRange {
    pub fn contains(&self, id: FlowId) -> bool {
        (self.min..=self.max).contains(&id.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowConfig {
    /// Shared deadline for every non-ingress entry of one flow.
    pub bulk_timeout_ms: u64,

    /// Deadline for the ingress entry, once the others are in place.
    pub ingress_timeout_ms: u64,

    /// Deadline for each best-effort removal (rollback and purges).
    pub remove_timeout_ms: u64,

    /// Deadline for installing a switch's table-miss entry.
    pub table_miss_timeout_ms: u64,

    /// Number of flows whose entries may be installed or purged at once.
    pub max_workers: usize,

    /// Capacity of the transaction queue.
    pub queue_capacity: usize,

    /// Attempts per transaction before a conflict is reported to the caller.
    pub txn_attempts: usize,

    /// How long shutdown waits for in-flight operations.
    pub shutdown_timeout_ms: u64,

    /// How long a removed cookie is remembered to absorb duplicate notifications.
    pub cookie_expiry_ms: u64,

    pub flow_id: FlowIdRange,
}

impl Default for FlowConfig {
    fn default() -> Self {
        FlowConfig {
            bulk_timeout_ms: 10_000,
            ingress_timeout_ms: 3_000,
            remove_timeout_ms: 3_000,
            table_miss_timeout_ms: 3_000,
            max_workers: 8,
            queue_capacity: 1024,
            txn_attempts: 10,
            shutdown_timeout_ms: 10_000,
            cookie_expiry_ms: 5_000,
            flow_id: FlowIdRange::default(),
        }
    }
}

impl FlowConfig {
    pub fn from_json(s: &str) -> Result<FlowConfig, ConfigError> {
        let config: FlowConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<FlowConfig, ConfigError> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.into(), source })?;
        Self::from_json(&s)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let FlowIdRange { min, max, initial } = self.flow_id;
        if min == 0 {
            return Err(ConfigError::Invalid("flow ID 0 is reserved for the table-miss cookie".into()));
        }
        if min > max || max > crate::types::Cookie::FLOW_ID_MASK {
            return Err(ConfigError::Invalid(format!("bad flow ID range [{min}, {max}]")));
        }
        if !(min..=max).contains(&initial) {
            return Err(ConfigError::Invalid(format!("initial flow ID {initial} outside [{min}, {max}]")));
        }
        if self.max_workers == 0 || self.queue_capacity == 0 || self.txn_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_workers, queue_capacity and txn_attempts must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_millis(self.bulk_timeout_ms)
    }

    pub fn ingress_timeout(&self) -> Duration {
        Duration::from_millis(self.ingress_timeout_ms)
    }

    pub fn remove_timeout(&self) -> Duration {
        Duration::from_millis(self.remove_timeout_ms)
    }

    pub fn table_miss_timeout(&self) -> Duration {
        Duration::from_millis(self.table_miss_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn cookie_expiry(&self) -> Duration {
        Duration::from_millis(self.cookie_expiry_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_is_default() {
        assert_eq!(FlowConfig::from_json("{}").unwrap(), FlowConfig::default());
    }

    #[test]
    fn partial_config() {
        let config = FlowConfig::from_json(r#"{"bulk_timeout_ms": 250, "flow_id": {"max": 2000000}}"#).unwrap();
        assert_eq!(config.bulk_timeout(), Duration::from_millis(250));
        assert_eq!(config.flow_id.min, 1);
        assert_eq!(config.flow_id.max, 2000000);
        assert_eq!(config.ingress_timeout_ms, FlowConfig::default().ingress_timeout_ms);
    }

    #[test]
    fn bad_configs() {
        assert!(matches!(FlowConfig::from_json(r#"{"bulk_timeout": 1}"#), Err(ConfigError::Parse(_))));
        assert!(matches!(
            FlowConfig::from_json(r#"{"flow_id": {"min": 0}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            FlowConfig::from_json(r#"{"flow_id": {"min": 10, "max": 20, "initial": 5}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(FlowConfig::from_json(r#"{"max_workers": 0}"#), Err(ConfigError::Invalid(_))));
    }
}

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

use crate::types::{FlowId, MatchKey, SwitchId};
use thiserror::Error;

/// Failure of a single request to a switch.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("{switch}: request timed out")]
    Timeout { switch: SwitchId },

    #[error("{switch}: request rejected ({reason})")]
    Rejected { switch: SwitchId, reason: String },

    #[error("{switch}: switch is not connected")]
    Disconnected { switch: SwitchId },

    #[error("{switch}: request was aborted")]
    Aborted { switch: SwitchId },
}

impl DeviceError {
    pub fn switch(&self) -> SwitchId {
        match self {
            DeviceError::Timeout { switch }
            | DeviceError::Rejected { switch, .. }
            | DeviceError::Disconnected { switch }
            | DeviceError::Aborted { switch } => *switch,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Another writer committed between this transaction's first read and its commit.
    #[error("transaction conflict")]
    Conflict,

    #[error("datastore unavailable ({0})")]
    Unavailable(String),

    #[error("{path}: unexpected record type")]
    Corrupt { path: String },
}

/// Error returned by the operations of [`crate::FlowManager`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlowError {
    #[error("transaction gave up after {attempts} conflicting attempts")]
    Conflict { attempts: usize },

    #[error("no free flow ID in range [{min}, {max}]")]
    IdExhausted { min: u64, max: u64 },

    #[error("{match_key}: target switch {switch} not found")]
    TargetNotFound { switch: SwitchId, match_key: MatchKey },

    #[error("{match_key}: flow {flow_id} could not be installed on {switch}")]
    Install {
        flow_id: FlowId,
        match_key: MatchKey,
        switch: SwitchId,
        #[source]
        source: DeviceError,
    },

    #[error("datastore error")]
    Store(#[from] StoreError),

    #[error("invalid flow ({0})")]
    InvalidFlow(String),

    #[error("could not start flow manager ({0})")]
    Config(String),

    #[error("flow manager is shutting down")]
    ShuttingDown,

    #[error("operation was cancelled")]
    Cancelled,
}

impl FlowError {
    /// True for a commit conflict, whether or not retries ran out.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FlowError::Conflict { .. } | FlowError::Store(StoreError::Conflict))
    }
}

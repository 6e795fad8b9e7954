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

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::ofp::Version;
use crate::types::{PortId, SwitchId};

/// The controller's view of which switches exist.
pub trait Inventory: Send + Sync {
    fn contains(&self, switch: SwitchId) -> bool;

    /// The protocol version negotiated with `switch`, if it is known and negotiation finished.
    fn version(&self, switch: SwitchId) -> Option<Version>;
}

/// Topology changes the flow pipeline reacts to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeEvent {
    /// A switch appeared or changed.  `version` is `None` until protocol negotiation completes.
    NodeUpdated { switch: SwitchId, version: Option<Version> },
    NodeRemoved { switch: SwitchId },
    PortRemoved { port: PortId },
    PortDisabled { port: PortId },

    /// The inter-switch link on `port` came up or went down.
    LinkChanged { port: PortId },
}

impl Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::NodeUpdated { switch, version: Some(v) } => write!(f, "{switch} updated ({v})"),
            NodeEvent::NodeUpdated { switch, version: None } => write!(f, "{switch} updated"),
            NodeEvent::NodeRemoved { switch } => write!(f, "{switch} removed"),
            NodeEvent::PortRemoved { port } => write!(f, "port {port} removed"),
            NodeEvent::PortDisabled { port } => write!(f, "port {port} disabled"),
            NodeEvent::LinkChanged { port } => write!(f, "link on {port} changed"),
        }
    }
}

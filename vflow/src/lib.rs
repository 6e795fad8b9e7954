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

//! Flow transaction pipeline for an OpenFlow controller.
//!
//! A flow is a forwarding decision that spans several switches, one flow entry per switch.
//! [`FlowManager`] records each flow in a datastore together with lookup indices, installs its
//! entries with the ingress entry last, and rolls everything back if any switch fails.  It also
//! removes flows when switches, ports or links go away or when a switch reports an entry gone, and
//! keeps a table-miss entry on every switch whose protocol version needs one.
//!
//! The datastore, the switches and the topology are reached through the [`Datastore`],
//! [`SwitchClient`] and [`Inventory`] traits.  The [`sim`] module implements the latter two in
//! memory and [`store::MemStore`] the first.

pub mod config;
pub mod cookie_cache;
pub mod counter;
pub mod device;
pub mod error;
pub mod flowid;
pub mod index;
pub mod install;
pub mod inventory;
pub mod manager;
pub mod ofp;
pub mod removal;
pub mod sim;
pub mod store;
pub mod table_miss;
pub mod txq;
pub mod types;

pub use config::{ConfigError, FlowConfig, FlowIdRange};
pub use device::SwitchClient;
pub use error::{DeviceError, FlowError, StoreError};
pub use inventory::{Inventory, NodeEvent};
pub use manager::{AddFlowOutcome, FlowManager, NotificationOutcome};
pub use ofp::{Version, Versions};
pub use removal::RemovalSelector;
pub use store::Datastore;
pub use table_miss::TableMissState;
pub use types::{
    Action, Cookie, DataFlow, FlowDescription, FlowEntry, FlowFilter, FlowId, FlowRemovedEvent, HostKey, MacAddr,
    MatchKey, PortId, RemovedReason, SwitchId,
};

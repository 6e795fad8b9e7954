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

//! Identifiers and records that flow through the pipeline.

use crate::error::FlowError;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::str::FromStr;

/// An OpenFlow datapath ID.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SwitchId(pub u64);

impl Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "openflow:{}", self.0)
    }
}

impl FromStr for SwitchId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("openflow:").unwrap_or(s);
        digits
            .parse()
            .map(SwitchId)
            .map_err(|e| format!("{s}: bad switch id ({e})"))
    }
}

/// A physical port on a switch.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId {
    pub switch: SwitchId,
    pub port: u32,
}

impl PortId {
    pub fn new(switch: SwitchId, port: u32) -> PortId {
        PortId { switch, port }
    }
}

impl Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.switch, self.port)
    }
}

/// Identifier of an installed [`DataFlow`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub u64);

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque value the switch keeps alongside an entry and hands back when it reports the entry
/// removed.
///
/// Cookies minted here carry [`Cookie::TAG`] in their upper 16 bits and a flow ID in the lower
/// 48.  Flow ID 0 is never allocated, so the tag alone is the table-miss cookie.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cookie(pub u64);

impl Cookie {
    pub const TAG: u64 = 0x7f56 << 48;
    pub const TAG_MASK: u64 = 0xffff << 48;
    pub const FLOW_ID_MASK: u64 = !Self::TAG_MASK;
    pub const TABLE_MISS: Cookie = Cookie(Self::TAG);

    pub fn for_flow(id: FlowId) -> Cookie {
        Cookie(Self::TAG | (id.0 & Self::FLOW_ID_MASK))
    }

    /// Returns the flow ID this cookie was minted for, or `None` if it wasn't minted by us or
    /// belongs to the table-miss entry.
    pub fn flow_id(self) -> Option<FlowId> {
        if self.0 & Self::TAG_MASK != Self::TAG {
            return None;
        }
        match self.0 & Self::FLOW_ID_MASK {
            0 => None,
            id => Some(FlowId(id)),
        }
    }

    pub fn is_table_miss(self) -> bool {
        self == Self::TABLE_MISS
    }
}

impl Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.iter().map(|b| format!("{b:02x}")).join(":"))
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<u8> = s
            .split(':')
            .map(|x| u8::from_str_radix(x, 16))
            .collect::<Result<_, _>>()
            .map_err(|e| format!("{s}: bad MAC address ({e})"))?;
        let octets: [u8; 6] = octets
            .try_into()
            .map_err(|_| format!("{s}: MAC address must have 6 octets"))?;
        Ok(MacAddr(octets))
    }
}

/// A host as the virtual network learned it: MAC address plus VLAN ID (0 for untagged).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey {
    pub mac: MacAddr,
    pub vlan: u16,
}

impl Display for HostKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.mac, self.vlan)
    }
}

/// Stable string form of a flow's ingress match.  Two flows with the same key in the same tenant
/// are the same flow.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey(pub String);

impl Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MatchKey {
    fn from(s: &str) -> MatchKey {
        MatchKey(s.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Output(u32),
    Controller,
    SetVlan(u16),
    StripVlan,
    SetDlSrc(MacAddr),
    SetDlDst(MacAddr),
    Drop,
}

impl Action {
    pub fn output_port(&self) -> Option<u32> {
        match self {
            Action::Output(port) => Some(*port),
            _ => None,
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Output(port) => write!(f, "output:{port}"),
            Action::Controller => write!(f, "controller"),
            Action::SetVlan(vid) => write!(f, "mod_vlan_vid:{vid}"),
            Action::StripVlan => write!(f, "strip_vlan"),
            Action::SetDlSrc(mac) => write!(f, "mod_dl_src:{mac}"),
            Action::SetDlDst(mac) => write!(f, "mod_dl_dst:{mac}"),
            Action::Drop => write!(f, "drop"),
        }
    }
}

/// One switch's share of a [`DataFlow`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub switch: SwitchId,

    /// Position in the flow's path.  The entry with the lowest order is the ingress entry.
    pub order: u32,

    #[serde(default)]
    pub table: u8,
    #[serde(default)]
    pub priority: u16,
    #[serde(default)]
    pub idle_timeout: u16,
    #[serde(default)]
    pub hard_timeout: u16,
    #[serde(default)]
    pub in_port: Option<u32>,
    #[serde(default)]
    pub matches: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<Action>,

    /// Assigned when the flow gets its ID.
    #[serde(default)]
    pub cookie: Cookie,
}

impl FlowEntry {
    pub fn new(switch: SwitchId, order: u32) -> FlowEntry {
        FlowEntry {
            switch,
            order,
            table: 0,
            priority: 0,
            idle_timeout: 0,
            hard_timeout: 0,
            in_port: None,
            matches: BTreeMap::new(),
            actions: Vec::new(),
            cookie: Cookie::default(),
        }
    }

    pub fn with_priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn with_match(mut self, field: &str, value: &str) -> Self {
        self.matches.insert(field.into(), value.into());
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Ports this entry receives from or sends to.
    pub fn ports(&self) -> impl Iterator<Item = PortId> + '_ {
        self.in_port
            .into_iter()
            .chain(self.actions.iter().filter_map(Action::output_port))
            .map(|port| PortId::new(self.switch, port))
    }

    /// True if `other` is the same rule on the same switch, that is, a strict delete of one
    /// removes the other.
    pub fn same_rule(&self, other: &FlowEntry) -> bool {
        self.switch == other.switch
            && self.table == other.table
            && self.priority == other.priority
            && self.in_port == other.in_port
            && self.matches == other.matches
    }
}

impl Display for FlowEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} table={} priority={} cookie={}", self.switch, self.table, self.priority, self.cookie)?;
        if let Some(port) = self.in_port {
            write!(f, " in_port={port}")?;
        }
        for (field, value) in &self.matches {
            write!(f, " {field}={value}")?;
        }
        write!(f, " actions={}", self.actions.iter().join(","))
    }
}

/// What the virtual network layer asks us to install.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowDescription {
    pub tenant: String,
    pub match_key: MatchKey,
    pub entries: Vec<FlowEntry>,
    #[serde(default)]
    pub source_host: Option<HostKey>,
    #[serde(default)]
    pub idle_timeout: u16,
    #[serde(default)]
    pub hard_timeout: u16,
}

impl FlowDescription {
    pub fn new(tenant: &str, match_key: &str, entries: Vec<FlowEntry>) -> FlowDescription {
        FlowDescription {
            tenant: tenant.into(),
            match_key: match_key.into(),
            entries,
            source_host: None,
            idle_timeout: 0,
            hard_timeout: 0,
        }
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.tenant.is_empty() {
            return Err(FlowError::InvalidFlow("empty tenant name".into()));
        }
        if self.match_key.0.is_empty() {
            return Err(FlowError::InvalidFlow(format!("{}: empty match key", self.tenant)));
        }
        let min_order = match self.entries.iter().map(|e| e.order).min() {
            Some(order) => order,
            None => {
                return Err(FlowError::InvalidFlow(format!("{}: flow has no entries", self.match_key)));
            }
        };
        let ingress = self.entries.iter().filter(|e| e.order == min_order).count();
        if ingress != 1 {
            return Err(FlowError::InvalidFlow(format!(
                "{}: {ingress} entries share the ingress order {min_order}",
                self.match_key
            )));
        }
        Ok(())
    }
}

/// A flow as recorded in the datastore.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFlow {
    pub id: FlowId,
    pub tenant: String,
    pub match_key: MatchKey,
    pub entries: Vec<FlowEntry>,
    pub nodes: BTreeSet<SwitchId>,
    pub ports: BTreeSet<PortId>,
    pub source_host: Option<HostKey>,
    pub idle_timeout: u16,
    pub hard_timeout: u16,

    /// Milliseconds since the UNIX epoch.
    pub created: u64,
}

impl DataFlow {
    /// Builds the record for `desc` under flow ID `id`.  Every entry gets the flow's cookie, and
    /// the flow's timeouts go on the ingress entry so that its expiry takes the whole flow down.
    pub fn new(id: FlowId, desc: FlowDescription, created: u64) -> DataFlow {
        let FlowDescription { tenant, match_key, mut entries, source_host, idle_timeout, hard_timeout } = desc;
        let cookie = Cookie::for_flow(id);
        let min_order = entries.iter().map(|e| e.order).min();
        for entry in entries.iter_mut() {
            entry.cookie = cookie;
            if Some(entry.order) == min_order {
                if idle_timeout != 0 {
                    entry.idle_timeout = idle_timeout;
                }
                if hard_timeout != 0 {
                    entry.hard_timeout = hard_timeout;
                }
            }
        }
        let nodes = entries.iter().map(|e| e.switch).collect();
        let ports = entries.iter().flat_map(FlowEntry::ports).collect();
        DataFlow {
            id,
            tenant,
            match_key,
            entries,
            nodes,
            ports,
            source_host,
            idle_timeout,
            hard_timeout,
            created,
        }
    }

    pub fn cookie(&self) -> Cookie {
        Cookie::for_flow(self.id)
    }

    /// Splits the entries into the ingress entry and the rest, keeping the rest in path order.
    /// Returns `None` for a flow without entries.
    pub fn split_ingress(&self) -> Option<(&FlowEntry, Vec<&FlowEntry>)> {
        let ingress = self.entries.iter().min_by_key(|e| e.order)?;
        let rest = self
            .entries
            .iter()
            .filter(|e| !std::ptr::eq(*e, ingress))
            .sorted_by_key(|e| e.order)
            .collect();
        Some((ingress, rest))
    }
}

/// Selects flows for [`crate::FlowManager::list_flows`].  Unset fields match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowFilter {
    pub tenant: Option<String>,
    pub flow_id: Option<FlowId>,
    pub switch: Option<SwitchId>,
    pub port: Option<PortId>,
    pub source_host: Option<HostKey>,
}

impl FlowFilter {
    pub fn tenant(tenant: &str) -> FlowFilter {
        FlowFilter { tenant: Some(tenant.into()), ..Default::default() }
    }

    pub fn switch(switch: SwitchId) -> FlowFilter {
        FlowFilter { switch: Some(switch), ..Default::default() }
    }

    pub fn port(port: PortId) -> FlowFilter {
        FlowFilter { port: Some(port), ..Default::default() }
    }

    pub fn matches(&self, flow: &DataFlow) -> bool {
        self.tenant.as_ref().map_or(true, |t| *t == flow.tenant)
            && self.flow_id.map_or(true, |id| id == flow.id)
            && self.switch.map_or(true, |s| flow.nodes.contains(&s))
            && self.port.map_or(true, |p| flow.ports.contains(&p))
            && self.source_host.map_or(true, |h| flow.source_host == Some(h))
    }
}

/// Why a switch dropped an entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    GroupDelete,
    MeterDelete,
}

/// A switch's report that one of its entries is gone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRemovedEvent {
    pub switch: SwitchId,
    pub cookie: Cookie,
    pub reason: RemovedReason,
    #[serde(default)]
    pub table: u8,
    #[serde(default)]
    pub priority: u16,
}

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

//! Which flows a removal applies to.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display};

use crate::error::StoreError;
use crate::store::{Path, Transaction};
use crate::types::{DataFlow, FlowId, PortId, SwitchId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovalSelector {
    /// Every flow with an entry on the switch.
    Switch(SwitchId),

    /// Every flow that receives from or sends to the port.
    Port(PortId),

    /// The flow whose entry `switch` reported removed.
    Notification { switch: SwitchId, flow_id: FlowId },

    Tenant(String),

    /// One flow, if it belongs to `tenant`.
    Flow { tenant: String, id: FlowId },

    All,
}

/// Which switches still hold entries of the selected flows once their records are gone.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Purge {
    /// The switches dropped the entries themselves, or went away with them.
    None,

    /// Every switch but the one that reported the removal.
    Except(SwitchId),

    All,
}

impl RemovalSelector {
    /// Reads the selected flows.  Index entries whose flow record is already gone are skipped.
    pub fn select(&self, txn: &Transaction) -> Result<Vec<DataFlow>, StoreError> {
        let ids: Vec<FlowId> = match self {
            RemovalSelector::Switch(switch) => set(txn, Path::NodeIndex(*switch))?,
            RemovalSelector::Port(port) => set(txn, Path::PortIndex(*port))?,
            RemovalSelector::Notification { flow_id, .. } => vec![*flow_id],
            RemovalSelector::Tenant(tenant) => set(txn, Path::TenantIndex(tenant.clone()))?,
            RemovalSelector::Flow { id, .. } => vec![*id],
            RemovalSelector::All => txn.committed_flow_ids()?,
        };

        let mut flows = Vec::with_capacity(ids.len());
        for id in ids {
            match txn.read_flow(id)? {
                Some(flow) if self.admits(&flow) => flows.push(flow),
                _ => (),
            }
        }
        Ok(flows)
    }

    fn admits(&self, flow: &DataFlow) -> bool {
        match self {
            RemovalSelector::Flow { tenant, .. } => *tenant == flow.tenant,
            _ => true,
        }
    }

    pub fn purge(&self) -> Purge {
        match self {
            RemovalSelector::Switch(_) | RemovalSelector::Port(_) => Purge::None,
            RemovalSelector::Notification { switch, .. } => Purge::Except(*switch),
            RemovalSelector::Tenant(_) | RemovalSelector::Flow { .. } | RemovalSelector::All => Purge::All,
        }
    }
}

fn set(txn: &Transaction, path: Path) -> Result<Vec<FlowId>, StoreError> {
    Ok(txn.read_flow_set(&path)?.into_iter().collect())
}

impl Display for RemovalSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalSelector::Switch(switch) => write!(f, "flows on {switch}"),
            RemovalSelector::Port(port) => write!(f, "flows through {port}"),
            RemovalSelector::Notification { switch, flow_id } => {
                write!(f, "flow {flow_id} (removed by {switch})")
            }
            RemovalSelector::Tenant(tenant) => write!(f, "flows of tenant {tenant}"),
            RemovalSelector::Flow { tenant, id } => write!(f, "flow {id} of tenant {tenant}"),
            RemovalSelector::All => write!(f, "all flows"),
        }
    }
}

impl Purge {
    /// The switches among `nodes` to purge.
    pub fn targets(self, nodes: &BTreeSet<SwitchId>) -> Vec<SwitchId> {
        match self {
            Purge::None => Vec::new(),
            Purge::Except(reporter) => nodes.iter().copied().filter(|s| *s != reporter).collect(),
            Purge::All => nodes.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::write_flow;
    use crate::store::{Datastore, MemStore};
    use crate::types::{Action, FlowDescription, FlowEntry};

    fn flow(id: u64, tenant: &str, key: &str, switches: &[u64]) -> DataFlow {
        let entries = switches
            .iter()
            .enumerate()
            .map(|(i, s)| FlowEntry::new(SwitchId(*s), i as u32).with_in_port(1).with_action(Action::Output(2)))
            .collect();
        DataFlow::new(FlowId(id), FlowDescription::new(tenant, key, entries), 0)
    }

    #[test]
    fn selectors() {
        let store = MemStore::new();
        store.create_containers().unwrap();
        let mut txn = Transaction::new(&store).unwrap();
        write_flow(&mut txn, &flow(10, "a", "k1", &[1, 2])).unwrap();
        write_flow(&mut txn, &flow(11, "a", "k2", &[2, 3])).unwrap();
        write_flow(&mut txn, &flow(12, "b", "k1", &[3])).unwrap();
        txn.commit().unwrap();

        let txn = Transaction::new(&store).unwrap();
        let ids = |selector: RemovalSelector| -> Vec<u64> {
            selector.select(&txn).unwrap().iter().map(|f| f.id.0).collect()
        };
        assert_eq!(ids(RemovalSelector::Switch(SwitchId(2))), vec![10, 11]);
        assert_eq!(ids(RemovalSelector::Port(PortId::new(SwitchId(3), 1))), vec![11, 12]);
        assert_eq!(ids(RemovalSelector::Tenant("a".into())), vec![10, 11]);
        assert_eq!(ids(RemovalSelector::All), vec![10, 11, 12]);
        assert_eq!(ids(RemovalSelector::Flow { tenant: "b".into(), id: FlowId(12) }), vec![12]);
        assert!(ids(RemovalSelector::Flow { tenant: "a".into(), id: FlowId(12) }).is_empty());
        assert!(ids(RemovalSelector::Notification { switch: SwitchId(1), flow_id: FlowId(99) }).is_empty());
        assert!(ids(RemovalSelector::Switch(SwitchId(9))).is_empty());
    }

    #[test]
    fn purge_targets() {
        let nodes = BTreeSet::from([SwitchId(1), SwitchId(2), SwitchId(3)]);
        assert!(RemovalSelector::Switch(SwitchId(1)).purge().targets(&nodes).is_empty());
        assert_eq!(
            RemovalSelector::Notification { switch: SwitchId(2), flow_id: FlowId(1) }
                .purge()
                .targets(&nodes),
            vec![SwitchId(1), SwitchId(3)]
        );
        assert_eq!(RemovalSelector::All.purge().targets(&nodes).len(), 3);
    }
}

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

//! Lookup indices kept next to each flow record.
//!
//! Besides the flow record itself at [`Path::Flow`], each flow is listed in:
//!
//!   - the node index of every switch it has an entry on,
//!   - the port index of every port its entries receive from or send to,
//!   - the host index of its source host, if it has one,
//!   - the tenant index of its tenant,
//!   - the match index, which maps (tenant, ingress match key) to the flow ID.
//!
//! The set-valued indices are merged, never overwritten, since many flows share a switch or a
//! port.

use std::collections::BTreeSet;

use crate::error::StoreError;
use crate::store::{Datastore, Path, Record, Transaction};
use crate::types::{DataFlow, FlowFilter, FlowId, MatchKey};

fn match_path(tenant: &str, key: &MatchKey) -> Path {
    Path::MatchIndex { tenant: tenant.into(), key: key.clone() }
}

fn set_paths(flow: &DataFlow) -> Vec<Path> {
    let mut paths = Vec::with_capacity(flow.nodes.len() + flow.ports.len() + 2);
    paths.extend(flow.nodes.iter().copied().map(Path::NodeIndex));
    paths.extend(flow.ports.iter().copied().map(Path::PortIndex));
    paths.extend(flow.source_host.map(Path::HostIndex));
    paths.push(Path::TenantIndex(flow.tenant.clone()));
    paths
}

/// Returns the flow installed in `tenant` for ingress match `key`, if any.
pub fn find_by_match(txn: &Transaction, tenant: &str, key: &MatchKey) -> Result<Option<DataFlow>, StoreError> {
    match txn.read_flow_id(&match_path(tenant, key))? {
        Some(id) => txn.read_flow(id),
        None => Ok(None),
    }
}

/// Writes `flow` and all of its index records.
pub fn write_flow(txn: &mut Transaction, flow: &DataFlow) -> Result<(), StoreError> {
    txn.put(Path::Flow(flow.id), Record::Flow(flow.clone()));
    txn.put(match_path(&flow.tenant, &flow.match_key), Record::FlowId(flow.id));
    for path in set_paths(flow) {
        txn.merge(path, BTreeSet::from([flow.id]))?;
    }
    Ok(())
}

/// Deletes `flow` and takes it out of every index.  Index sets that become empty are deleted.
pub fn retract_flow(txn: &mut Transaction, flow: &DataFlow) -> Result<(), StoreError> {
    txn.delete(Path::Flow(flow.id));

    let match_path = match_path(&flow.tenant, &flow.match_key);
    if txn.read_flow_id(&match_path)? == Some(flow.id) {
        txn.delete(match_path);
    }

    for path in set_paths(flow) {
        let mut set = txn.read_flow_set(&path)?;
        if set.remove(&flow.id) {
            if set.is_empty() {
                txn.delete(path);
            } else {
                txn.put(path, Record::FlowSet(set));
            }
        }
    }
    Ok(())
}

/// Returns the flows that match `filter`, in flow ID order.  Starts from the most selective
/// index the filter names and only falls back to listing every flow when it names none.
pub fn query(store: &dyn Datastore, filter: &FlowFilter) -> Result<Vec<DataFlow>, StoreError> {
    let txn = Transaction::new(store)?;
    let candidates: Vec<FlowId> = if let Some(id) = filter.flow_id {
        vec![id]
    } else if let Some(port) = filter.port {
        txn.read_flow_set(&Path::PortIndex(port))?.into_iter().collect()
    } else if let Some(switch) = filter.switch {
        txn.read_flow_set(&Path::NodeIndex(switch))?.into_iter().collect()
    } else if let Some(host) = filter.source_host {
        txn.read_flow_set(&Path::HostIndex(host))?.into_iter().collect()
    } else if let Some(tenant) = &filter.tenant {
        txn.read_flow_set(&Path::TenantIndex(tenant.clone()))?.into_iter().collect()
    } else {
        txn.committed_flow_ids()?
    };

    let mut flows = Vec::with_capacity(candidates.len());
    for id in candidates {
        if let Some(flow) = txn.read_flow(id)? {
            if filter.matches(&flow) {
                flows.push(flow);
            }
        }
    }
    Ok(flows)
}

pub fn count_tenant(store: &dyn Datastore, tenant: &str) -> Result<usize, StoreError> {
    let txn = Transaction::new(store)?;
    Ok(txn.read_flow_set(&Path::TenantIndex(tenant.into()))?.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use crate::types::{Action, FlowDescription, FlowEntry, HostKey, MacAddr, PortId, SwitchId};

    fn flow(id: u64, tenant: &str, key: &str, switches: &[u64]) -> DataFlow {
        let entries = switches
            .iter()
            .enumerate()
            .map(|(i, &sw)| FlowEntry::new(SwitchId(sw), i as u32).with_in_port(1).with_action(Action::Output(2)))
            .collect();
        let desc = FlowDescription {
            source_host: Some(HostKey { mac: MacAddr([0, 0, 0, 0, 0, id as u8]), vlan: 0 }),
            ..FlowDescription::new(tenant, key, entries)
        };
        DataFlow::new(FlowId(id), desc, 0)
    }

    fn write(store: &MemStore, flow: &DataFlow) {
        let mut txn = Transaction::new(store).unwrap();
        write_flow(&mut txn, flow).unwrap();
        txn.commit().unwrap();
    }

    fn retract(store: &MemStore, flow: &DataFlow) {
        let mut txn = Transaction::new(store).unwrap();
        retract_flow(&mut txn, flow).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn write_query_retract() {
        let store = MemStore::new();
        store.create_containers().unwrap();
        let a = flow(1, "vtn1", "a", &[1, 2]);
        let b = flow(2, "vtn1", "b", &[2, 3]);
        let c = flow(3, "vtn2", "a", &[3]);
        for f in [&a, &b, &c] {
            write(&store, f);
        }

        let txn = Transaction::new(&store).unwrap();
        assert_eq!(find_by_match(&txn, "vtn1", &"a".into()).unwrap(), Some(a.clone()));
        assert_eq!(find_by_match(&txn, "vtn2", &"a".into()).unwrap(), Some(c.clone()));
        assert_eq!(find_by_match(&txn, "vtn2", &"b".into()).unwrap(), None);

        let ids = |flows: Vec<DataFlow>| flows.into_iter().map(|f| f.id.0).collect::<Vec<_>>();
        assert_eq!(ids(query(&store, &FlowFilter::switch(SwitchId(2))).unwrap()), vec![1, 2]);
        assert_eq!(ids(query(&store, &FlowFilter::port(PortId::new(SwitchId(3), 2))).unwrap()), vec![2, 3]);
        assert_eq!(ids(query(&store, &FlowFilter::tenant("vtn1")).unwrap()), vec![1, 2]);
        assert_eq!(ids(query(&store, &FlowFilter::default()).unwrap()), vec![1, 2, 3]);
        let filter = FlowFilter { tenant: Some("vtn2".into()), ..FlowFilter::switch(SwitchId(3)) };
        assert_eq!(ids(query(&store, &filter).unwrap()), vec![3]);
        assert_eq!(count_tenant(&store, "vtn1").unwrap(), 2);
        let host = FlowFilter {
            source_host: Some(HostKey { mac: MacAddr([0, 0, 0, 0, 0, 2]), vlan: 0 }),
            ..FlowFilter::default()
        };
        assert_eq!(ids(query(&store, &host).unwrap()), vec![2]);
        let other_tenant = FlowFilter { tenant: Some("vtn2".into()), ..host.clone() };
        assert!(query(&store, &other_tenant).unwrap().is_empty());

        retract(&store, &b);
        assert!(query(&store, &host).unwrap().is_empty());
        assert_eq!(ids(query(&store, &FlowFilter::switch(SwitchId(2))).unwrap()), vec![1]);
        assert_eq!(count_tenant(&store, "vtn1").unwrap(), 1);

        retract(&store, &a);
        retract(&store, &c);
        assert!(store.is_empty());
    }
}

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

use tracing::{event, Level};

use crate::config::FlowIdRange;
use crate::error::FlowError;
use crate::store::{Path, Record, Transaction};
use crate::types::FlowId;

/// Hands out flow IDs from a bounded range, persisting the next candidate in the datastore.
///
/// Allocation must happen inside the transaction that writes the new flow: the search for a free
/// ID and the write that claims it then commit together, and a concurrent allocation of the same
/// ID fails the commit.
#[derive(Clone, Debug)]
pub struct FlowIdAllocator {
    range: FlowIdRange,
}

impl FlowIdAllocator {
    pub fn new(range: FlowIdRange) -> FlowIdAllocator {
        FlowIdAllocator { range }
    }

    fn successor(&self, id: FlowId) -> FlowId {
        if id.0 >= self.range.max {
            FlowId(self.range.min)
        } else {
            FlowId(id.0 + 1)
        }
    }

    /// Claims the first free ID at or after the persisted next ID, wrapping around at the top of
    /// the range, and persists its successor.  Probing uses direct lookups of flow records.
    pub fn allocate(&self, txn: &mut Transaction) -> Result<FlowId, FlowError> {
        let start = match txn.read_flow_id(&Path::NextFlowId)? {
            None => FlowId(self.range.initial),
            Some(id) if self.range.contains(id) => id,
            Some(id) => {
                event!(Level::WARN, "persisted next flow ID {id} is out of range, restarting at {}",
                       self.range.min);
                FlowId(self.range.min)
            }
        };

        let mut candidate = start;
        loop {
            if !txn.exists(&Path::Flow(candidate))? {
                txn.put(Path::NextFlowId, Record::FlowId(self.successor(candidate)));
                return Ok(candidate);
            }
            candidate = self.successor(candidate);
            if candidate == start {
                return Err(FlowError::IdExhausted { min: self.range.min, max: self.range.max });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Datastore, MemStore};
    use crate::types::{DataFlow, FlowDescription, FlowEntry, SwitchId};

    fn occupy(store: &MemStore, ids: &[u64]) {
        let mut txn = Transaction::new(store).unwrap();
        for &id in ids {
            let desc = FlowDescription::new("t", &format!("m{id}"), vec![FlowEntry::new(SwitchId(1), 0)]);
            txn.put(Path::Flow(FlowId(id)), Record::Flow(DataFlow::new(FlowId(id), desc, 0)));
        }
        txn.commit().unwrap();
    }

    fn allocate(store: &MemStore, allocator: &FlowIdAllocator) -> Result<FlowId, FlowError> {
        let mut txn = Transaction::new(store).unwrap();
        let id = allocator.allocate(&mut txn)?;
        occupy_in(&mut txn, id);
        txn.commit().unwrap();
        Ok(id)
    }

    fn occupy_in(txn: &mut Transaction, id: FlowId) {
        let desc = FlowDescription::new("t", "m", vec![FlowEntry::new(SwitchId(1), 0)]);
        txn.put(Path::Flow(id), Record::Flow(DataFlow::new(id, desc, 0)));
    }

    fn new_store() -> MemStore {
        let store = MemStore::new();
        store.create_containers().unwrap();
        store
    }

    #[test]
    fn starts_at_initial_id() {
        let store = new_store();
        let allocator = FlowIdAllocator::new(FlowIdRange::default());
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(1000001)));
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(1000002)));
        assert_eq!(store.read(&Path::NextFlowId).unwrap(), Some(Record::FlowId(FlowId(1000003))));
    }

    #[test]
    fn skips_ids_in_use() {
        let store = new_store();
        occupy(&store, &[10, 11, 13]);
        let allocator = FlowIdAllocator::new(FlowIdRange { min: 1, max: 100, initial: 10 });
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(12)));
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(14)));
    }

    #[test]
    fn wraps_around() {
        let store = new_store();
        let allocator = FlowIdAllocator::new(FlowIdRange { min: 1, max: 5, initial: 5 });
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(5)));
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(1)));

        // The maximum is occupied too: wrap past it.
        let store = new_store();
        occupy(&store, &[5]);
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(1)));
    }

    #[test]
    fn reports_exhaustion() {
        let store = new_store();
        occupy(&store, &[1, 2, 3]);
        let allocator = FlowIdAllocator::new(FlowIdRange { min: 1, max: 3, initial: 2 });
        assert_eq!(allocate(&store, &allocator), Err(FlowError::IdExhausted { min: 1, max: 3 }));
        assert_eq!(store.read(&Path::NextFlowId).unwrap(), None);
    }

    #[test]
    fn out_of_range_counter_restarts_at_min() {
        let store = new_store();
        let mut txn = Transaction::new(&store).unwrap();
        txn.put(Path::NextFlowId, Record::FlowId(FlowId(500)));
        txn.commit().unwrap();

        let allocator = FlowIdAllocator::new(FlowIdRange { min: 1, max: 100, initial: 50 });
        assert_eq!(allocate(&store, &allocator), Ok(FlowId(1)));
    }
}

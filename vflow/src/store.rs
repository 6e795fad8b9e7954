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

//! The datastore the pipeline keeps its records in.
//!
//! The real store lives outside this crate; [`Datastore`] is the narrow interface the pipeline
//! needs from it.  Writes are grouped into a [`Transaction`] and committed with optimistic
//! concurrency control: the commit fails with [`StoreError::Conflict`] if anyone else committed
//! after the transaction started, and the caller retries.  [`MemStore`] is an in-process
//! implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display};
use std::sync::Mutex;

use crate::error::StoreError;
use crate::types::{DataFlow, FlowId, HostKey, MatchKey, PortId, SwitchId};

/// Location of a record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Path {
    NextFlowId,
    Flow(FlowId),
    NodeIndex(SwitchId),
    PortIndex(PortId),
    HostIndex(HostKey),
    TenantIndex(String),
    MatchIndex { tenant: String, key: MatchKey },
}

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Path::NextFlowId => write!(f, "/next-flow-id"),
            Path::Flow(id) => write!(f, "/flows/{id}"),
            Path::NodeIndex(switch) => write!(f, "/index/node/{switch}"),
            Path::PortIndex(port) => write!(f, "/index/port/{port}"),
            Path::HostIndex(host) => write!(f, "/index/host/{host}"),
            Path::TenantIndex(tenant) => write!(f, "/index/tenant/{tenant}"),
            Path::MatchIndex { tenant, key } => write!(f, "/index/match/{tenant}/{key}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    FlowId(FlowId),
    Flow(DataFlow),
    FlowSet(BTreeSet<FlowId>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put(Path, Record),
    /// Adds flow IDs to the set at the path, creating it if needed.
    Merge(Path, BTreeSet<FlowId>),
    Delete(Path),
}

pub trait Datastore: Send + Sync {
    /// Creates the empty containers if they don't exist yet.  Returns true if it created them,
    /// that is, on the first start against this store.
    fn create_containers(&self) -> Result<bool, StoreError>;

    /// Number of commits so far.  A transaction remembers this when it starts.
    fn generation(&self) -> Result<u64, StoreError>;

    fn read(&self, path: &Path) -> Result<Option<Record>, StoreError>;

    /// IDs of all committed flows, in ascending order.
    fn flow_ids(&self) -> Result<Vec<FlowId>, StoreError>;

    /// Applies `ops` atomically, unless another commit happened since generation `base`.
    fn commit(&self, base: u64, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}

/// A read-write transaction.  Reads see the transaction's own writes.
pub struct Transaction<'a> {
    store: &'a dyn Datastore,
    base: u64,
    pending: BTreeMap<Path, Option<Record>>,
    ops: Vec<WriteOp>,
}

impl<'a> Transaction<'a> {
    pub fn new(store: &'a dyn Datastore) -> Result<Transaction<'a>, StoreError> {
        let base = store.generation()?;
        Ok(Transaction { store, base, pending: BTreeMap::new(), ops: Vec::new() })
    }

    pub fn read(&self, path: &Path) -> Result<Option<Record>, StoreError> {
        match self.pending.get(path) {
            Some(record) => Ok(record.clone()),
            None => self.store.read(path),
        }
    }

    pub fn exists(&self, path: &Path) -> Result<bool, StoreError> {
        Ok(self.read(path)?.is_some())
    }

    pub fn read_flow(&self, id: FlowId) -> Result<Option<DataFlow>, StoreError> {
        let path = Path::Flow(id);
        match self.read(&path)? {
            None => Ok(None),
            Some(Record::Flow(flow)) => Ok(Some(flow)),
            Some(_) => Err(StoreError::Corrupt { path: path.to_string() }),
        }
    }

    pub fn read_flow_id(&self, path: &Path) -> Result<Option<FlowId>, StoreError> {
        match self.read(path)? {
            None => Ok(None),
            Some(Record::FlowId(id)) => Ok(Some(id)),
            Some(_) => Err(StoreError::Corrupt { path: path.to_string() }),
        }
    }

    /// Reads the flow ID set at `path`; a missing set reads as empty.
    pub fn read_flow_set(&self, path: &Path) -> Result<BTreeSet<FlowId>, StoreError> {
        match self.read(path)? {
            None => Ok(BTreeSet::new()),
            Some(Record::FlowSet(set)) => Ok(set),
            Some(_) => Err(StoreError::Corrupt { path: path.to_string() }),
        }
    }

    /// IDs of all flows committed before this transaction started.
    pub fn committed_flow_ids(&self) -> Result<Vec<FlowId>, StoreError> {
        self.store.flow_ids()
    }

    pub fn put(&mut self, path: Path, record: Record) {
        self.pending.insert(path.clone(), Some(record.clone()));
        self.ops.push(WriteOp::Put(path, record));
    }

    pub fn merge(&mut self, path: Path, ids: BTreeSet<FlowId>) -> Result<(), StoreError> {
        let mut set = self.read_flow_set(&path)?;
        set.extend(ids.iter().copied());
        self.pending.insert(path.clone(), Some(Record::FlowSet(set)));
        self.ops.push(WriteOp::Merge(path, ids));
        Ok(())
    }

    pub fn delete(&mut self, path: Path) {
        self.pending.insert(path.clone(), None);
        self.ops.push(WriteOp::Delete(path));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn commit(self) -> Result<(), StoreError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.store.commit(self.base, self.ops)
    }
}

#[derive(Debug, Default)]
struct Tables {
    generation: u64,
    records: BTreeMap<Path, Record>,
}

impl Tables {
    fn apply(&mut self, op: WriteOp) -> Result<(), StoreError> {
        match op {
            WriteOp::Put(path, record) => {
                self.records.insert(path, record);
            }
            WriteOp::Merge(path, ids) => match self.records.get_mut(&path) {
                None => {
                    self.records.insert(path, Record::FlowSet(ids));
                }
                Some(Record::FlowSet(set)) => set.extend(ids),
                Some(_) => return Err(StoreError::Corrupt { path: path.to_string() }),
            },
            WriteOp::Delete(path) => {
                self.records.remove(&path);
            }
        }
        Ok(())
    }
}

/// A [`Datastore`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemStore {
    tables: Mutex<Option<Tables>>,
}

impl MemStore {
    pub fn new() -> MemStore {
        Self::default()
    }

    fn with_tables<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Tables) -> Result<T, StoreError>,
    {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        match tables.as_mut() {
            Some(tables) => f(tables),
            None => Err(StoreError::Unavailable("flow containers have not been created".into())),
        }
    }

    /// Number of records of every kind.
    pub fn len(&self) -> usize {
        self.with_tables(|t| Ok(t.records.len())).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Datastore for MemStore {
    fn create_containers(&self) -> Result<bool, StoreError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        if tables.is_some() {
            return Ok(false);
        }
        *tables = Some(Tables::default());
        Ok(true)
    }

    fn generation(&self) -> Result<u64, StoreError> {
        self.with_tables(|t| Ok(t.generation))
    }

    fn read(&self, path: &Path) -> Result<Option<Record>, StoreError> {
        self.with_tables(|t| Ok(t.records.get(path).cloned()))
    }

    fn flow_ids(&self) -> Result<Vec<FlowId>, StoreError> {
        self.with_tables(|t| {
            Ok(t.records
                .range(Path::Flow(FlowId(0))..=Path::Flow(FlowId(u64::MAX)))
                .map(|(path, _)| match path {
                    Path::Flow(id) => *id,
                    _ => unreachable!(),
                })
                .collect())
        })
    }

    fn commit(&self, base: u64, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.with_tables(|t| {
            if t.generation != base {
                return Err(StoreError::Conflict);
            }

            // Apply to a copy so that a bad op leaves nothing half-written.
            let mut scratch = Tables { generation: t.generation + 1, records: t.records.clone() };
            for op in ops {
                scratch.apply(op)?;
            }
            *t = scratch;
            Ok(())
        })
    }
}

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

//! The transaction queue.
//!
//! All writes to the datastore go through one task, so that flow records and their indices are
//! only ever changed by one writer in this process.  Callers talk to it through [`TxnQueue`],
//! a cheap handle that sends a request and waits for the reply on a oneshot channel.  Commits can
//! still conflict with writers outside this process; those are retried.

use std::fmt::Display;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::config::FlowConfig;
use crate::error::{FlowError, StoreError};
use crate::flowid::FlowIdAllocator;
use crate::index::{find_by_match, retract_flow, write_flow};
use crate::removal::RemovalSelector;
use crate::store::{Datastore, Transaction};
use crate::types::{DataFlow, FlowDescription, FlowId};

/// Result of the transaction that records a new flow.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstallTxn {
    /// The flow was recorded and its entries should now be installed.
    Created(DataFlow),

    /// A flow with the same ingress match is already recorded in the tenant.
    Exists(FlowId),
}

#[derive(Debug)]
enum TxnRequest {
    Install {
        desc: FlowDescription,
        respond_to: oneshot::Sender<Result<InstallTxn, FlowError>>,
    },
    Remove {
        selector: RemovalSelector,
        respond_to: oneshot::Sender<Result<Vec<DataFlow>, FlowError>>,
    },
    Close,
}

#[derive(Clone, Debug)]
pub struct TxnQueue {
    sender: mpsc::Sender<TxnRequest>,
}

impl TxnQueue {
    /// Spawns the writer task.  It runs until [`TxnQueue::close`] or until every handle is gone.
    pub fn start(store: Arc<dyn Datastore>, config: &FlowConfig) -> (TxnQueue, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let mut actor = TxnActor {
            receiver,
            store,
            allocator: FlowIdAllocator::new(config.flow_id.clone()),
            attempts: config.txn_attempts,
        };
        let handle = tokio::spawn(async move { actor.run().await });
        (TxnQueue { sender }, handle)
    }

    async fn request<T>(&self, request: TxnRequest, recv: oneshot::Receiver<T>) -> Result<T, FlowError> {
        self.sender.send(request).await.map_err(|_| FlowError::ShuttingDown)?;
        recv.await.map_err(|_| FlowError::Cancelled)
    }

    /// Records the flow described by `desc`, unless its tenant already has a flow with the same
    /// ingress match.
    pub async fn install(&self, desc: FlowDescription) -> Result<InstallTxn, FlowError> {
        let (respond_to, recv) = oneshot::channel();
        self.request(TxnRequest::Install { desc, respond_to }, recv).await?
    }

    /// Deletes the flows `selector` picks, with their indices, and returns them.
    pub async fn remove(&self, selector: RemovalSelector) -> Result<Vec<DataFlow>, FlowError> {
        let (respond_to, recv) = oneshot::channel();
        self.request(TxnRequest::Remove { selector, respond_to }, recv).await?
    }

    /// Asks the writer task to stop.  Requests already queued behind this one are dropped, so
    /// their callers see [`FlowError::Cancelled`].
    pub async fn close(&self) {
        // A failure means the task already stopped.
        let _ = self.sender.send(TxnRequest::Close).await;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

struct TxnActor {
    receiver: mpsc::Receiver<TxnRequest>,
    store: Arc<dyn Datastore>,
    allocator: FlowIdAllocator,
    attempts: usize,
}

impl TxnActor {
    async fn run(&mut self) {
        while let Some(request) = self.receiver.recv().await {
            match request {
                TxnRequest::Install { desc, respond_to } => {
                    let result = self.install(&desc);
                    if respond_to.send(result).is_err() {
                        event!(Level::DEBUG, "{}: caller went away before the flow was recorded", desc.match_key);
                    }
                }
                TxnRequest::Remove { selector, respond_to } => {
                    let result = self.remove(&selector);
                    if respond_to.send(result).is_err() {
                        event!(Level::DEBUG, "{selector}: caller went away before removal finished");
                    }
                }
                TxnRequest::Close => {
                    self.receiver.close();
                    let mut dropped = 0;
                    while self.receiver.recv().await.is_some() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        event!(Level::WARN, "transaction queue closed with {dropped} requests pending");
                    }
                    break;
                }
            }
        }
        event!(Level::DEBUG, "transaction queue stopped");
    }

    fn install(&self, desc: &FlowDescription) -> Result<InstallTxn, FlowError> {
        self.run_txn(&desc.match_key, |txn| {
            if let Some(flow) = find_by_match(txn, &desc.tenant, &desc.match_key)? {
                return Ok(InstallTxn::Exists(flow.id));
            }
            let id = self.allocator.allocate(txn)?;
            let flow = DataFlow::new(id, desc.clone(), now_ms());
            write_flow(txn, &flow)?;
            Ok(InstallTxn::Created(flow))
        })
    }

    fn remove(&self, selector: &RemovalSelector) -> Result<Vec<DataFlow>, FlowError> {
        self.run_txn(selector, |txn| {
            let flows = selector.select(txn)?;
            for flow in &flows {
                retract_flow(txn, flow)?;
            }
            Ok(flows)
        })
    }

    /// Runs `body` in a fresh transaction and commits it, starting over on a conflict.
    fn run_txn<T, F>(&self, what: &dyn Display, mut body: F) -> Result<T, FlowError>
    where
        F: FnMut(&mut Transaction) -> Result<T, FlowError>,
    {
        for attempt in 1..=self.attempts {
            let mut txn = Transaction::new(&*self.store)?;
            let value = body(&mut txn)?;
            match txn.commit() {
                Ok(()) => return Ok(value),
                Err(StoreError::Conflict) => {
                    event!(Level::DEBUG, "{what}: transaction conflict on attempt {attempt}, retrying");
                }
                Err(error) => return Err(error.into()),
            }
        }
        event!(Level::WARN, "{what}: giving up after {} conflicting attempts", self.attempts);
        Err(FlowError::Conflict { attempts: self.attempts })
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemStore, Path, Record, WriteOp};
    use crate::types::{Action, FlowEntry, SwitchId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `conflicts` commits as if another writer got in first.
    struct ConflictingStore {
        inner: MemStore,
        conflicts: AtomicUsize,
    }

    impl Datastore for ConflictingStore {
        fn create_containers(&self) -> Result<bool, StoreError> {
            self.inner.create_containers()
        }
        fn generation(&self) -> Result<u64, StoreError> {
            self.inner.generation()
        }
        fn read(&self, path: &Path) -> Result<Option<Record>, StoreError> {
            self.inner.read(path)
        }
        fn flow_ids(&self) -> Result<Vec<FlowId>, StoreError> {
            self.inner.flow_ids()
        }
        fn commit(&self, base: u64, ops: Vec<WriteOp>) -> Result<(), StoreError> {
            let left = self.conflicts.load(Ordering::SeqCst);
            if left > 0 {
                self.conflicts.store(left - 1, Ordering::SeqCst);
                return Err(StoreError::Conflict);
            }
            self.inner.commit(base, ops)
        }
    }

    fn conflicting(conflicts: usize) -> Arc<ConflictingStore> {
        let store = ConflictingStore { inner: MemStore::new(), conflicts: AtomicUsize::new(conflicts) };
        store.create_containers().unwrap();
        Arc::new(store)
    }

    fn desc(key: &str) -> FlowDescription {
        let entry = FlowEntry::new(SwitchId(1), 0).with_in_port(1).with_action(Action::Output(2));
        FlowDescription::new("vtn", key, vec![entry])
    }

    #[tokio::test]
    async fn install_then_exists() {
        let store = Arc::new(MemStore::new());
        store.create_containers().unwrap();
        let (txq, _task) = TxnQueue::start(store.clone(), &FlowConfig::default());

        let flow = match txq.install(desc("a")).await.unwrap() {
            InstallTxn::Created(flow) => flow,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(flow.id, FlowId(1000001));
        assert_eq!(txq.install(desc("a")).await.unwrap(), InstallTxn::Exists(flow.id));

        let removed = txq.remove(RemovalSelector::Switch(SwitchId(1))).await.unwrap();
        assert_eq!(removed, vec![flow]);
        assert!(store.flow_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let config = FlowConfig { txn_attempts: 3, ..FlowConfig::default() };

        let (txq, _task) = TxnQueue::start(conflicting(2), &config);
        assert!(matches!(txq.install(desc("a")).await, Ok(InstallTxn::Created(_))));

        let (txq, _task) = TxnQueue::start(conflicting(3), &config);
        let error = txq.install(desc("a")).await.unwrap_err();
        assert_eq!(error, FlowError::Conflict { attempts: 3 });
        assert!(error.is_conflict());
    }

    #[tokio::test]
    async fn closed_queue_rejects() {
        let store = Arc::new(MemStore::new());
        store.create_containers().unwrap();
        let (txq, task) = TxnQueue::start(store, &FlowConfig::default());
        txq.close().await;
        task.await.unwrap();
        assert!(txq.is_closed());
        assert_eq!(txq.remove(RemovalSelector::All).await, Err(FlowError::ShuttingDown));
    }

    #[tokio::test]
    async fn requests_behind_close_are_cancelled() {
        let store = Arc::new(MemStore::new());
        store.create_containers().unwrap();
        let (txq, task) = TxnQueue::start(store.clone(), &FlowConfig::default());
        let other = txq.clone();

        // The writer task hasn't run yet, so the install lands behind the close.
        txq.close().await;
        assert_eq!(other.install(desc("a")).await, Err(FlowError::Cancelled));
        task.await.unwrap();
        assert!(store.flow_ids().unwrap().is_empty());
    }
}

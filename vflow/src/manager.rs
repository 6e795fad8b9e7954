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

use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::config::FlowConfig;
use crate::cookie_cache::RemovedCookieCache;
use crate::counter::{TxnCounter, TxnGuard};
use crate::device::{SwitchClient, WorkerPool};
use crate::error::FlowError;
use crate::index;
use crate::install::Installer;
use crate::inventory::{Inventory, NodeEvent};
use crate::removal::{Purge, RemovalSelector};
use crate::store::Datastore;
use crate::table_miss::{TableMissMaintainer, TableMissState};
use crate::txq::{InstallTxn, TxnQueue};
use crate::types::{DataFlow, FlowDescription, FlowEntry, FlowFilter, FlowId, FlowRemovedEvent, SwitchId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum AddFlowOutcome {
    Installed(FlowId),

    /// The tenant already had a flow for the same ingress match.  Nothing was sent to the
    /// switches.
    AlreadyInstalled(FlowId),
}

impl AddFlowOutcome {
    pub fn flow_id(&self) -> FlowId {
        match self {
            AddFlowOutcome::Installed(id) | AddFlowOutcome::AlreadyInstalled(id) => *id,
        }
    }
}

/// What [`FlowManager::flow_removed`] did with a notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum NotificationOutcome {
    /// The flows whose records were removed.
    Removed(Vec<FlowId>),

    /// Another switch already reported the same flow gone.
    Duplicate,

    TableMiss { reinstalled: bool },

    /// The cookie isn't one of ours.
    Unresolved,
}

struct Pipeline {
    config: FlowConfig,
    store: Arc<dyn Datastore>,
    inventory: Arc<dyn Inventory>,
    pool: WorkerPool,
    txq: TxnQueue,
    installer: Installer,
    table_miss: TableMissMaintainer,
    cookies: RemovedCookieCache,
    counter: Arc<TxnCounter>,
}

impl Pipeline {
    async fn remove(&self, selector: RemovalSelector, purge: Purge) -> Result<Vec<FlowId>, FlowError> {
        let flows = self.txq.remove(selector.clone()).await?;
        if flows.is_empty() {
            event!(Level::DEBUG, "{selector}: nothing to remove");
            return Ok(Vec::new());
        }
        for flow in &flows {
            event!(Level::INFO, "{}: removed flow {} from {}", flow.match_key, flow.id, flow.tenant);
        }

        let stale: Vec<&FlowEntry> = flows
            .iter()
            .flat_map(|flow| {
                let targets = purge.targets(&flow.nodes);
                flow.entries.iter().filter(move |e| targets.contains(&e.switch))
            })
            .filter(|e| self.inventory.contains(e.switch))
            .collect();
        if !stale.is_empty() {
            let failures = self.installer.remove_entries(stale).await;
            if failures > 0 {
                event!(Level::WARN, "{selector}: {failures} entries could not be purged");
            }
        }
        Ok(flows.iter().map(|f| f.id).collect())
    }
}

/// The flow pipeline.
///
/// All operations may run concurrently.  Each one that changes flows counts as in flight from the
/// moment it is accepted until its entries are installed, purged or rolled back, which
/// [`FlowManager::shutdown`] waits for.
#[derive(Clone)]
pub struct FlowManager {
    inner: Arc<Pipeline>,
    txq_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FlowManager {
    /// Starts a pipeline on `store`, creating its containers if this is the first start against
    /// it.  Fails with [`FlowError::Config`] if `config` doesn't pass [`FlowConfig::validate`].
    /// Must be called from within a tokio runtime.
    pub fn init(
        config: FlowConfig,
        store: Arc<dyn Datastore>,
        inventory: Arc<dyn Inventory>,
        client: Arc<dyn SwitchClient>,
    ) -> Result<FlowManager, FlowError> {
        config.validate().map_err(|error| FlowError::Config(error.to_string()))?;
        if store.create_containers()? {
            event!(Level::INFO, "created flow containers");
        } else {
            event!(Level::DEBUG, "flow containers already exist");
        }

        let pool = WorkerPool::new(client, config.max_workers);
        let (txq, txq_task) = TxnQueue::start(store.clone(), &config);
        let installer = Installer::new(pool.clone(), inventory.clone(), txq.clone(), &config);
        let table_miss = TableMissMaintainer::new(pool.clone(), config.table_miss_timeout());
        let cookies = RemovedCookieCache::new(config.cookie_expiry());
        let inner = Pipeline {
            config,
            store,
            inventory,
            pool,
            txq,
            installer,
            table_miss,
            cookies,
            counter: Arc::new(TxnCounter::new()),
        };
        Ok(FlowManager { inner: Arc::new(inner), txq_task: Arc::new(Mutex::new(Some(txq_task))) })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.inner.config
    }

    /// Records the flow described by `desc` and installs its entries.
    pub async fn add_flow(&self, desc: FlowDescription) -> Result<AddFlowOutcome, FlowError> {
        desc.validate()?;
        let guard = self.inner.counter.begin()?;
        match self.inner.txq.install(desc).await? {
            InstallTxn::Exists(id) => {
                event!(Level::DEBUG, "flow {id} is already installed");
                Ok(AddFlowOutcome::AlreadyInstalled(id))
            }
            InstallTxn::Created(flow) => {
                let installer = self.inner.installer.clone();
                let work = self.inner.pool.spawn(async move {
                    let _guard = guard;
                    installer.install_or_rollback(flow).await
                });
                work.await.map_err(|_| FlowError::Cancelled)?.map(AddFlowOutcome::Installed)
            }
        }
    }

    /// Removes the flows `selector` picks and returns their IDs.
    pub async fn remove_flows(&self, selector: RemovalSelector) -> Result<Vec<FlowId>, FlowError> {
        let guard = self.inner.counter.begin()?;
        let purge = selector.purge();
        self.run_removal(selector, purge, guard).await
    }

    async fn run_removal(
        &self,
        selector: RemovalSelector,
        purge: Purge,
        guard: TxnGuard,
    ) -> Result<Vec<FlowId>, FlowError> {
        let inner = self.inner.clone();
        let work = self.inner.pool.spawn(async move {
            let _guard = guard;
            inner.remove(selector, purge).await
        });
        work.await.map_err(|_| FlowError::Cancelled)?
    }

    /// Handles a switch's report that it dropped an entry.
    pub async fn flow_removed(&self, removed: FlowRemovedEvent) -> Result<NotificationOutcome, FlowError> {
        let guard = self.inner.counter.begin()?;
        let id = match removed.cookie.flow_id() {
            Some(id) => id,
            None => {
                let reinstalled = self.inner.table_miss.handle_removed(&removed).await;
                return Ok(if removed.cookie.is_table_miss() {
                    NotificationOutcome::TableMiss { reinstalled }
                } else {
                    NotificationOutcome::Unresolved
                });
            }
        };

        if !self.inner.cookies.remember(removed.cookie, id) {
            event!(Level::DEBUG, "{}: flow {id} is already being removed", removed.switch);
            return Ok(NotificationOutcome::Duplicate);
        }
        event!(Level::DEBUG, "{}: entry of flow {id} removed ({:?})", removed.switch, removed.reason);
        let selector = RemovalSelector::Notification { switch: removed.switch, flow_id: id };
        let purge = selector.purge();
        let ids = self.run_removal(selector, purge, guard).await?;
        Ok(NotificationOutcome::Removed(ids))
    }

    /// Reacts to a topology change.  Returns the flows it removed.
    ///
    /// A switch that joins with a version needing a table-miss entry gets its table cleared, so
    /// the flows recorded through it before then are removed first and purged from the other
    /// switches on their paths.
    pub async fn handle_node_event(&self, node_event: NodeEvent) -> Result<Vec<FlowId>, FlowError> {
        let guard = self.inner.counter.begin()?;
        event!(Level::DEBUG, "{node_event}");
        let selector = match node_event {
            NodeEvent::NodeUpdated { switch, version } => {
                let mut removed = Vec::new();
                if self.inner.table_miss.clears_table(switch, version) {
                    let selector = RemovalSelector::Switch(switch);
                    removed = self.inner.remove(selector, Purge::Except(switch)).await?;
                }
                self.inner.table_miss.node_updated(switch, version).await;
                return Ok(removed);
            }
            NodeEvent::NodeRemoved { switch } => {
                self.inner.table_miss.node_removed(switch);
                RemovalSelector::Switch(switch)
            }
            NodeEvent::PortRemoved { port } | NodeEvent::PortDisabled { port } | NodeEvent::LinkChanged { port } => {
                RemovalSelector::Port(port)
            }
        };
        let purge = selector.purge();
        self.run_removal(selector, purge, guard).await
    }

    pub fn list_flows(&self, filter: &FlowFilter) -> Result<Vec<DataFlow>, FlowError> {
        Ok(index::query(&*self.inner.store, filter)?)
    }

    pub fn count_flows(&self, tenant: &str) -> Result<usize, FlowError> {
        Ok(index::count_tenant(&*self.inner.store, tenant)?)
    }

    pub fn get_flow(&self, tenant: &str, id: FlowId) -> Result<Option<DataFlow>, FlowError> {
        let filter = FlowFilter { flow_id: Some(id), ..FlowFilter::tenant(tenant) };
        Ok(index::query(&*self.inner.store, &filter)?.pop())
    }

    /// Number of flow operations in flight.
    pub fn pending_operations(&self) -> usize {
        self.inner.counter.active()
    }

    pub fn table_miss_state(&self, switch: SwitchId) -> Option<TableMissState> {
        self.inner.table_miss.state(switch)
    }

    /// Stops accepting operations, waits for the ones in flight up to the configured shutdown
    /// timeout, then stops the transaction queue.  Returns the number of operations that were
    /// still in flight and got abandoned.
    pub async fn shutdown(&self) -> usize {
        let stuck = match self.inner.counter.drain(self.inner.config.shutdown_timeout()).await {
            Ok(()) => 0,
            Err(stuck) => {
                event!(Level::WARN, "shutting down with {stuck} flow operations still in flight");
                stuck
            }
        };

        self.inner.txq.close().await;
        let task = self.txq_task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                event!(Level::ERROR, "transaction queue task failed ({error})");
            }
        }
        event!(Level::INFO, "flow manager stopped");
        stuck
    }
}

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

//! Puts a recorded flow's entries on its switches, or takes the flow back out.
//!
//! The ingress entry goes last.  Until it is in place no packet can match any other entry of the
//! flow, so a flow is never half-usable: either every entry is installed, or the installer removes
//! whatever it sent and retracts the flow's record.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{event, Level};

use crate::config::FlowConfig;
use crate::device::{DeviceTask, Pending, WorkerPool};
use crate::error::{DeviceError, FlowError};
use crate::inventory::Inventory;
use crate::removal::RemovalSelector;
use crate::txq::TxnQueue;
use crate::types::{DataFlow, FlowEntry, FlowId};

#[derive(Clone)]
pub struct Installer {
    pool: WorkerPool,
    inventory: Arc<dyn Inventory>,
    txq: TxnQueue,
    bulk_timeout: Duration,
    ingress_timeout: Duration,
    remove_timeout: Duration,
}

impl Installer {
    pub fn new(pool: WorkerPool, inventory: Arc<dyn Inventory>, txq: TxnQueue, config: &FlowConfig) -> Installer {
        Installer {
            pool,
            inventory,
            txq,
            bulk_timeout: config.bulk_timeout(),
            ingress_timeout: config.ingress_timeout(),
            remove_timeout: config.remove_timeout(),
        }
    }

    /// Installs `flow`, rolling it back on failure.  The error is the one that made installation
    /// fail; rollback problems are only logged.
    pub async fn install_or_rollback(&self, flow: DataFlow) -> Result<FlowId, FlowError> {
        match self.install(&flow).await {
            Ok(()) => {
                event!(Level::INFO, "{}: installed flow {} in {}", flow.match_key, flow.id, flow.tenant);
                Ok(flow.id)
            }
            Err(error) => {
                event!(Level::WARN, "{}: rolling back flow {} ({error})", flow.match_key, flow.id);
                self.rollback(&flow, &error).await;
                Err(error)
            }
        }
    }

    /// Installs every entry of `flow`, ingress last.
    pub async fn install(&self, flow: &DataFlow) -> Result<(), FlowError> {
        if let Some(entry) = flow.entries.iter().find(|e| !self.inventory.contains(e.switch)) {
            return Err(FlowError::TargetNotFound { switch: entry.switch, match_key: flow.match_key.clone() });
        }
        let (ingress, rest) = flow
            .split_ingress()
            .ok_or_else(|| FlowError::InvalidFlow(format!("{}: flow has no entries", flow.match_key)))?;

        let deadline = Instant::now() + self.bulk_timeout;
        let pending: Vec<Pending> = rest
            .into_iter()
            .map(|entry| self.pool.issue(DeviceTask::AddEntry(entry.clone())))
            .collect();
        let mut first_error = None;
        for request in pending {
            let switch = request.task().switch();
            match request.wait_until(deadline).await {
                Ok(()) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    event!(Level::DEBUG, "{}: entry installed on {switch} ({} ms left)", flow.match_key, left.as_millis());
                }
                Err(error) => {
                    event!(Level::WARN, "{}: entry not installed ({error})", flow.match_key);
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(install_error(flow, error));
        }

        let deadline = Instant::now() + self.ingress_timeout;
        self.pool
            .submit(DeviceTask::AddEntry(ingress.clone()), deadline)
            .await
            .map_err(|error| install_error(flow, error))
    }

    /// Removes `entries` from their switches, best effort.  Returns how many removals failed.
    pub async fn remove_entries<'a, I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = &'a FlowEntry>,
    {
        let deadline = Instant::now() + self.remove_timeout;
        let pending: Vec<Pending> = entries
            .into_iter()
            .map(|entry| self.pool.issue(DeviceTask::RemoveEntry(entry.clone())))
            .collect();
        let mut failures = 0;
        for request in pending {
            let task = request.task().to_string();
            if let Err(error) = request.wait_until(deadline).await {
                event!(Level::WARN, "could not {task} ({error})");
                failures += 1;
            }
        }
        failures
    }

    async fn rollback(&self, flow: &DataFlow, error: &FlowError) {
        // Nothing reached the switches if one of them was missing.
        if !matches!(error, FlowError::TargetNotFound { .. }) {
            self.remove_entries(&flow.entries).await;
        }

        let selector = RemovalSelector::Flow { tenant: flow.tenant.clone(), id: flow.id };
        match self.txq.remove(selector).await {
            Ok(_) => event!(Level::DEBUG, "{}: retracted flow {}", flow.match_key, flow.id),
            Err(error @ (FlowError::ShuttingDown | FlowError::Cancelled)) => event!(
                Level::ERROR,
                "{}: flow {} stays recorded after failed install, unrecoverable inconsistency ({error})",
                flow.match_key,
                flow.id
            ),
            Err(error) => event!(Level::ERROR, "{}: could not retract flow {} ({error})", flow.match_key, flow.id),
        }
    }
}

fn install_error(flow: &DataFlow, source: DeviceError) -> FlowError {
    FlowError::Install { flow_id: flow.id, match_key: flow.match_key.clone(), switch: source.switch(), source }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceCall, Fabric, Fault, FaultKind, Op};
    use crate::store::{Datastore, MemStore};
    use crate::txq::InstallTxn;
    use crate::types::{Action, FlowDescription, SwitchId};
    use tracing_test::traced_test;

    struct Setup {
        fabric: Arc<Fabric>,
        store: Arc<MemStore>,
        txq: TxnQueue,
        installer: Installer,
    }

    fn setup(config: FlowConfig, switches: &[u64]) -> Setup {
        let fabric = Arc::new(Fabric::new());
        for &sw in switches {
            fabric.add_switch(SwitchId(sw), None);
        }
        let store = Arc::new(MemStore::new());
        store.create_containers().unwrap();
        let (txq, _task) = TxnQueue::start(store.clone(), &config);
        let pool = WorkerPool::new(fabric.clone(), config.max_workers);
        let installer = Installer::new(pool, fabric.clone(), txq.clone(), &config);
        Setup { fabric, store, txq, installer }
    }

    /// Only the next-ID counter may be left.
    fn assert_no_flows(store: &MemStore) {
        assert!(store.flow_ids().unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    /// A flow through switches 1, 2 and 3, entering at switch 1.
    async fn record(txq: &TxnQueue) -> DataFlow {
        let entries = (1..=3)
            .map(|sw| FlowEntry::new(SwitchId(sw), sw as u32).with_in_port(1).with_action(Action::Output(2)))
            .collect();
        match txq.install(FlowDescription::new("vtn", "in_port=1", entries)).await.unwrap() {
            InstallTxn::Created(flow) => flow,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn ingress_goes_last() {
        let s = setup(FlowConfig::default(), &[1, 2, 3]);
        let flow = record(&s.txq).await;
        assert_eq!(s.installer.install_or_rollback(flow.clone()).await, Ok(flow.id));

        let calls = s.fabric.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2], DeviceCall::Add(SwitchId(1), flow.cookie()));
        assert_eq!(s.store.flow_ids().unwrap(), vec![flow.id]);
    }

    #[tokio::test]
    async fn partial_failure_rolls_back() {
        let s = setup(FlowConfig::default(), &[1, 2, 3]);
        s.fabric.inject(Fault::new(SwitchId(2), Op::Add, FaultKind::Reject));
        let flow = record(&s.txq).await;

        let error = s.installer.install_or_rollback(flow.clone()).await.unwrap_err();
        assert!(matches!(error, FlowError::Install { switch: SwitchId(2), .. }));

        // The ingress entry is never sent, but rollback removes every entry anyway.
        assert_eq!(s.fabric.count_calls(|c| *c == DeviceCall::Add(SwitchId(1), flow.cookie())), 0);
        for sw in 1..=3 {
            assert_eq!(s.fabric.count_calls(|c| *c == DeviceCall::Remove(SwitchId(sw), flow.cookie())), 1);
            assert!(s.fabric.entries(SwitchId(sw)).is_empty());
        }
        assert_no_flows(&s.store);
    }

    #[tokio::test]
    async fn first_error_wins() {
        let s = setup(FlowConfig::default(), &[1, 2, 3]);
        s.fabric.inject(Fault::new(SwitchId(2), Op::Add, FaultKind::Disconnect));
        s.fabric.inject(Fault::new(SwitchId(3), Op::Add, FaultKind::Reject));
        s.fabric.inject(Fault::new(SwitchId(3), Op::Remove, FaultKind::Reject));
        let flow = record(&s.txq).await;

        let error = s.installer.install_or_rollback(flow).await.unwrap_err();
        match error {
            FlowError::Install { switch, source, .. } => {
                assert_eq!(switch, SwitchId(2));
                assert_eq!(source, DeviceError::Disconnected { switch: SwitchId(2) });
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_no_flows(&s.store);
    }

    #[tokio::test(start_paused = true)]
    async fn ingress_timeout() {
        let config = FlowConfig { ingress_timeout_ms: 50, ..FlowConfig::default() };
        let s = setup(config, &[1, 2, 3]);
        s.fabric.inject(Fault::new(SwitchId(1), Op::Add, FaultKind::Hang));
        let flow = record(&s.txq).await;

        let error = s.installer.install_or_rollback(flow).await.unwrap_err();
        assert!(matches!(
            error,
            FlowError::Install { source: DeviceError::Timeout { switch: SwitchId(1) }, .. }
        ));
        assert!(s.fabric.entries(SwitchId(2)).is_empty());
        assert_no_flows(&s.store);
    }

    #[tokio::test]
    async fn missing_target_sends_nothing() {
        let s = setup(FlowConfig::default(), &[1, 2]);
        let flow = record(&s.txq).await;

        assert_eq!(
            s.installer.install_or_rollback(flow).await,
            Err(FlowError::TargetNotFound { switch: SwitchId(3), match_key: "in_port=1".into() })
        );
        assert!(s.fabric.calls().is_empty());
        assert_no_flows(&s.store);
    }

    #[tokio::test]
    #[traced_test]
    async fn rollback_after_close() {
        let s = setup(FlowConfig::default(), &[1, 2, 3]);
        s.fabric.inject(Fault::new(SwitchId(3), Op::Add, FaultKind::Reject));
        let flow = record(&s.txq).await;
        s.txq.close().await;

        assert!(s.installer.install_or_rollback(flow.clone()).await.is_err());
        assert_eq!(s.store.flow_ids().unwrap(), vec![flow.id]);
        assert!(logs_contain("unrecoverable inconsistency"));
    }
}

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

//! Keeps a table-miss entry on every switch that needs one.
//!
//! OpenFlow 1.0 switches send unmatched packets to the controller on their own.  Later versions
//! drop them unless the flow table has a lowest-priority entry that says otherwise, so once such
//! a switch has negotiated its version we clear its table and install that entry, and we put it
//! back whenever the switch reports it gone.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{event, Level};

use crate::device::{DeviceTask, WorkerPool};
use crate::error::DeviceError;
use crate::ofp::Version;
use crate::types::{Action, Cookie, FlowEntry, FlowRemovedEvent, RemovedReason, SwitchId};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum TableMissState {
    /// The switch's protocol version isn't known yet.
    Unknown,

    /// The switch doesn't need a table-miss entry.
    ClearPending,

    Installing,
    Installed,

    /// Installation failed.  The next update for the switch tries again.
    Failed,
}

impl Display for TableMissState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TableMissState::Unknown => "unknown",
            TableMissState::ClearPending => "clear-pending",
            TableMissState::Installing => "installing",
            TableMissState::Installed => "installed",
            TableMissState::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub fn table_miss_entry(switch: SwitchId) -> FlowEntry {
    FlowEntry { cookie: Cookie::TABLE_MISS, ..FlowEntry::new(switch, 0).with_priority(0).with_action(Action::Controller) }
}

pub struct TableMissMaintainer {
    pool: WorkerPool,
    timeout: Duration,
    states: Mutex<HashMap<SwitchId, TableMissState>>,
}

impl TableMissMaintainer {
    pub fn new(pool: WorkerPool, timeout: Duration) -> TableMissMaintainer {
        TableMissMaintainer { pool, timeout, states: Mutex::new(HashMap::new()) }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<SwitchId, TableMissState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, switch: SwitchId) -> Option<TableMissState> {
        self.states().get(&switch).copied()
    }

    /// True if bringing `switch` up to `version` starts by clearing its flow table, that is,
    /// if this is the first time it reports a version that needs a table-miss entry.  Entries
    /// installed on the switch before then do not survive the update.
    pub fn clears_table(&self, switch: SwitchId, version: Option<Version>) -> bool {
        version.map_or(false, Version::needs_table_miss) && joining(self.state(switch))
    }

    /// Brings `switch` up to date after it connected or changed.  Returns its new state.
    ///
    /// The table is only cleared when the switch joins.  A retry after a failed install only
    /// adds the table-miss entry, so that flows installed meanwhile stay in place.
    pub async fn node_updated(&self, switch: SwitchId, version: Option<Version>) -> TableMissState {
        let version = match version {
            Some(version) => version,
            None => return *self.states().entry(switch).or_insert(TableMissState::Unknown),
        };
        if !version.needs_table_miss() {
            self.states().insert(switch, TableMissState::ClearPending);
            return TableMissState::ClearPending;
        }

        let clear = {
            let mut states = self.states();
            let previous = states.get(&switch).copied();
            if let Some(state @ (TableMissState::Installing | TableMissState::Installed)) = previous {
                return state;
            }
            states.insert(switch, TableMissState::Installing);
            joining(previous)
        };

        event!(Level::DEBUG, "{switch}: {version}, installing table-miss entry");
        let result = self.install(switch, clear).await;
        self.finish(switch, result)
    }

    /// Handles a switch's report that an entry we can't map to a flow is gone.  Returns true if
    /// that put the table-miss entry back.
    pub async fn handle_removed(&self, removed: &FlowRemovedEvent) -> bool {
        let switch = removed.switch;
        if !removed.cookie.is_table_miss() {
            event!(Level::DEBUG, "{switch}: ignoring removal of unknown entry with cookie {}", removed.cookie);
            return false;
        }
        if removed.reason == RemovedReason::Delete {
            return false;
        }

        {
            let mut states = self.states();
            match states.get_mut(&switch) {
                Some(state) if *state == TableMissState::Installed => *state = TableMissState::Installing,
                _ => return false,
            }
        }

        event!(Level::WARN, "{switch}: table-miss entry removed ({:?}), reinstalling", removed.reason);
        let result = self.install(switch, false).await;
        self.finish(switch, result) == TableMissState::Installed
    }

    pub fn node_removed(&self, switch: SwitchId) {
        self.states().remove(&switch);
    }

    async fn install(&self, switch: SwitchId, clear: bool) -> Result<(), DeviceError> {
        let deadline = Instant::now() + self.timeout;
        if clear {
            self.pool.submit(DeviceTask::ClearEntries(switch), deadline).await?;
        }
        self.pool.submit(DeviceTask::AddEntry(table_miss_entry(switch)), deadline).await?;
        self.pool.submit(DeviceTask::Barrier(switch), deadline).await
    }

    fn finish(&self, switch: SwitchId, result: Result<(), DeviceError>) -> TableMissState {
        let state = match result {
            Ok(()) => TableMissState::Installed,
            Err(error) => {
                event!(Level::ERROR, "{switch}: could not install table-miss entry ({error})");
                TableMissState::Failed
            }
        };

        // The switch may have gone away meanwhile.
        if let Some(current) = self.states().get_mut(&switch) {
            *current = state;
        }
        state
    }
}

fn joining(state: Option<TableMissState>) -> bool {
    matches!(state, None | Some(TableMissState::Unknown | TableMissState::ClearPending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceCall, Fabric, Fault, FaultKind, Op};
    use crate::types::FlowId;
    use std::sync::Arc;

    fn maintainer() -> (Arc<Fabric>, TableMissMaintainer) {
        let fabric = Arc::new(Fabric::new());
        let pool = WorkerPool::new(fabric.clone(), 4);
        (fabric, TableMissMaintainer::new(pool, Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn legacy_and_unknown() {
        let (fabric, tm) = maintainer();
        let sw = SwitchId(1);
        fabric.add_switch(sw, None);

        assert_eq!(tm.node_updated(sw, None).await, TableMissState::Unknown);
        assert_eq!(tm.node_updated(sw, Some(Version::OFP10)).await, TableMissState::ClearPending);
        assert!(fabric.calls().is_empty());

        tm.node_removed(sw);
        assert_eq!(tm.state(sw), None);
    }

    #[tokio::test]
    async fn modern_switch_gets_entry() {
        let (fabric, tm) = maintainer();
        let sw = SwitchId(1);
        fabric.add_switch(sw, Some(Version::OFP13));
        fabric.preload(FlowEntry::new(sw, 0).with_priority(5));

        assert_eq!(tm.node_updated(sw, Some(Version::OFP13)).await, TableMissState::Installed);
        assert_eq!(
            fabric.calls(),
            vec![DeviceCall::Clear(sw), DeviceCall::Add(sw, Cookie::TABLE_MISS), DeviceCall::Barrier(sw)]
        );
        assert_eq!(fabric.entries(sw), vec![table_miss_entry(sw)]);

        assert_eq!(tm.node_updated(sw, Some(Version::OFP13)).await, TableMissState::Installed);
        assert_eq!(fabric.calls().len(), 3);
    }

    #[tokio::test]
    async fn reinstall_once() {
        let (fabric, tm) = maintainer();
        let sw = SwitchId(1);
        fabric.add_switch(sw, Some(Version::OFP14));
        tm.node_updated(sw, Some(Version::OFP14)).await;
        fabric.clear_calls();

        let removed = fabric.expire(sw, Cookie::TABLE_MISS).unwrap();
        assert!(tm.handle_removed(&removed).await);
        assert_eq!(tm.state(sw), Some(TableMissState::Installed));
        assert_eq!(fabric.count_calls(|c| matches!(c, DeviceCall::Add(..))), 1);
        assert_eq!(fabric.count_calls(|c| matches!(c, DeviceCall::Clear(_))), 0);
        assert_eq!(fabric.entries(sw), vec![table_miss_entry(sw)]);

        let deleted = FlowRemovedEvent { reason: RemovedReason::Delete, ..removed.clone() };
        assert!(!tm.handle_removed(&deleted).await);
        let foreign = FlowRemovedEvent { cookie: Cookie(42), ..removed };
        assert!(!tm.handle_removed(&foreign).await);
        assert_eq!(fabric.count_calls(|c| matches!(c, DeviceCall::Add(..))), 1);
    }

    #[tokio::test]
    async fn failed_install_retries() {
        let (fabric, tm) = maintainer();
        let sw = SwitchId(1);
        fabric.add_switch(sw, Some(Version::OFP13));
        fabric.inject(Fault::new(sw, Op::Add, FaultKind::Reject).times(1));

        assert_eq!(tm.node_updated(sw, Some(Version::OFP13)).await, TableMissState::Failed);
        assert_eq!(fabric.count_calls(|c| matches!(c, DeviceCall::Barrier(_))), 0);

        assert_eq!(tm.node_updated(sw, Some(Version::OFP13)).await, TableMissState::Installed);
        assert_eq!(fabric.entries(sw), vec![table_miss_entry(sw)]);
    }

    #[tokio::test]
    async fn retry_keeps_existing_entries() {
        let (fabric, tm) = maintainer();
        let sw = SwitchId(1);
        fabric.add_switch(sw, Some(Version::OFP13));
        fabric.inject(Fault::new(sw, Op::Add, FaultKind::Reject).for_cookie(Cookie::TABLE_MISS).times(1));

        assert!(tm.clears_table(sw, Some(Version::OFP13)));
        assert_eq!(tm.node_updated(sw, Some(Version::OFP13)).await, TableMissState::Failed);
        assert_eq!(fabric.count_calls(|c| matches!(c, DeviceCall::Clear(_))), 1);

        // Installed while the table-miss entry was missing.
        let flow = FlowEntry { cookie: Cookie::for_flow(FlowId(7)), ..FlowEntry::new(sw, 1).with_priority(10) };
        fabric.preload(flow.clone());
        fabric.clear_calls();

        assert!(!tm.clears_table(sw, Some(Version::OFP13)));
        assert_eq!(tm.node_updated(sw, Some(Version::OFP13)).await, TableMissState::Installed);
        assert_eq!(fabric.calls(), vec![DeviceCall::Add(sw, Cookie::TABLE_MISS), DeviceCall::Barrier(sw)]);
        let entries = fabric.entries(sw);
        assert!(entries.contains(&flow));
        assert!(entries.contains(&table_miss_entry(sw)));
    }

    #[tokio::test]
    async fn clears_only_on_join() {
        let (fabric, tm) = maintainer();
        let sw = SwitchId(1);
        fabric.add_switch(sw, Some(Version::OFP13));

        assert!(!tm.clears_table(sw, None));
        assert!(!tm.clears_table(sw, Some(Version::OFP10)));
        tm.node_updated(sw, None).await;
        assert!(tm.clears_table(sw, Some(Version::OFP13)));
        tm.node_updated(sw, Some(Version::OFP13)).await;
        assert!(!tm.clears_table(sw, Some(Version::OFP13)));

        tm.node_removed(sw);
        assert!(tm.clears_table(sw, Some(Version::OFP13)));
    }
}

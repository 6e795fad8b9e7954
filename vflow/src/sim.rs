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

//! A switch fabric simulated in process memory.
//!
//! [`Fabric`] implements both [`SwitchClient`] and [`Inventory`], keeps each switch's entries,
//! records every request it receives, and fails requests on demand through injected [`Fault`]s.
//! The tests and the `vflow-sim` tool run the pipeline against it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;

use crate::device::{DeviceFuture, SwitchClient};
use crate::error::DeviceError;
use crate::inventory::Inventory;
use crate::ofp::Version;
use crate::types::{Cookie, FlowEntry, FlowRemovedEvent, RemovedReason, SwitchId};

/// A request as the fabric saw it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeviceCall {
    Add(SwitchId, Cookie),
    Remove(SwitchId, Cookie),
    Clear(SwitchId),
    Barrier(SwitchId),
}

impl DeviceCall {
    pub fn switch(&self) -> SwitchId {
        match *self {
            DeviceCall::Add(switch, _)
            | DeviceCall::Remove(switch, _)
            | DeviceCall::Clear(switch)
            | DeviceCall::Barrier(switch) => switch,
        }
    }

    fn op(&self) -> Op {
        match self {
            DeviceCall::Add(..) => Op::Add,
            DeviceCall::Remove(..) => Op::Remove,
            DeviceCall::Clear(_) => Op::Clear,
            DeviceCall::Barrier(_) => Op::Barrier,
        }
    }

    fn cookie(&self) -> Option<Cookie> {
        match *self {
            DeviceCall::Add(_, cookie) | DeviceCall::Remove(_, cookie) => Some(cookie),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Add,
    Remove,
    Clear,
    Barrier,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultKind {
    /// The switch refuses the request.
    Reject,

    /// The request never completes.
    Hang,

    /// The connection drops.
    Disconnect,
}

/// Makes matching requests fail.
#[derive(Clone, Debug)]
pub struct Fault {
    switch: SwitchId,
    op: Op,
    kind: FaultKind,
    cookie: Option<Cookie>,
    remaining: Option<usize>,
}

impl Fault {
    pub fn new(switch: SwitchId, op: Op, kind: FaultKind) -> Fault {
        Fault { switch, op, kind, cookie: None, remaining: None }
    }

    /// Only fail requests for entries with `cookie`.
    pub fn for_cookie(mut self, cookie: Cookie) -> Fault {
        self.cookie = Some(cookie);
        self
    }

    /// Only fail the next `n` matching requests.
    pub fn times(mut self, n: usize) -> Fault {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, call: &DeviceCall) -> bool {
        self.switch == call.switch()
            && self.op == call.op()
            && (self.cookie.is_none() || self.cookie == call.cookie())
    }
}

#[derive(Debug, Default)]
struct SimSwitch {
    version: Option<Version>,
    entries: Vec<FlowEntry>,
}

#[derive(Debug, Default)]
struct FabricState {
    switches: BTreeMap<SwitchId, SimSwitch>,
    calls: Vec<DeviceCall>,
    faults: Vec<Fault>,
    latency: Duration,
}

impl FabricState {
    fn take_fault(&mut self, call: &DeviceCall) -> Option<FaultKind> {
        let index = self.faults.iter().position(|f| f.matches(call))?;
        let fault = &mut self.faults[index];
        let kind = fault.kind;
        let used_up = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if used_up {
            self.faults.remove(index);
        }
        Some(kind)
    }
}

#[derive(Debug, Default)]
pub struct Fabric {
    state: Mutex<FabricState>,
}

impl Fabric {
    pub fn new() -> Fabric {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects `switch`, or updates its version if it is already connected.
    pub fn add_switch(&self, switch: SwitchId, version: Option<Version>) {
        self.state().switches.entry(switch).or_default().version = version;
    }

    pub fn remove_switch(&self, switch: SwitchId) {
        self.state().switches.remove(&switch);
    }

    pub fn switches(&self) -> Vec<SwitchId> {
        self.state().switches.keys().copied().collect()
    }

    pub fn entries(&self, switch: SwitchId) -> Vec<FlowEntry> {
        self.state().switches.get(&switch).map(|s| s.entries.clone()).unwrap_or_default()
    }

    /// Puts `entry` on its switch without going through a request, as if it had been there
    /// before the switch connected.
    pub fn preload(&self, entry: FlowEntry) {
        if let Some(switch) = self.state().switches.get_mut(&entry.switch) {
            switch.entries.push(entry);
        }
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state().calls.clone()
    }

    pub fn count_calls<F: Fn(&DeviceCall) -> bool>(&self, predicate: F) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push(fault);
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    /// Delays the completion of every later request by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Drops the entries with `cookie` from `switch` as if they had timed out, and returns the
    /// notification the switch would send, if it had such an entry.
    pub fn expire(&self, switch: SwitchId, cookie: Cookie) -> Option<FlowRemovedEvent> {
        let mut state = self.state();
        let sim = state.switches.get_mut(&switch)?;
        let index = sim.entries.iter().position(|e| e.cookie == cookie)?;
        let entry = sim.entries.remove(index);
        Some(FlowRemovedEvent {
            switch,
            cookie,
            reason: RemovedReason::IdleTimeout,
            table: entry.table,
            priority: entry.priority,
        })
    }

    fn request<F>(&self, call: DeviceCall, apply: F) -> DeviceFuture
    where
        F: FnOnce(&mut SimSwitch),
    {
        let mut state = self.state();
        state.calls.push(call);
        let switch = call.switch();
        let latency = state.latency;
        let outcome = match state.take_fault(&call) {
            Some(FaultKind::Hang) => return futures::future::pending().boxed(),
            Some(FaultKind::Reject) => Err(DeviceError::Rejected { switch, reason: "injected fault".into() }),
            Some(FaultKind::Disconnect) => Err(DeviceError::Disconnected { switch }),
            None => match state.switches.get_mut(&switch) {
                Some(sim) => {
                    apply(sim);
                    Ok(())
                }
                None => Err(DeviceError::Disconnected { switch }),
            },
        };
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            outcome
        }
        .boxed()
    }
}

impl SwitchClient for Fabric {
    fn add_entry(&self, entry: &FlowEntry) -> DeviceFuture {
        let entry = entry.clone();
        self.request(DeviceCall::Add(entry.switch, entry.cookie), move |sim| {
            sim.entries.retain(|e| !e.same_rule(&entry));
            sim.entries.push(entry);
        })
    }

    fn remove_entry(&self, entry: &FlowEntry) -> DeviceFuture {
        let entry = entry.clone();
        self.request(DeviceCall::Remove(entry.switch, entry.cookie), move |sim| {
            sim.entries.retain(|e| !e.same_rule(&entry));
        })
    }

    fn clear_entries(&self, switch: SwitchId) -> DeviceFuture {
        self.request(DeviceCall::Clear(switch), |sim| sim.entries.clear())
    }

    fn send_barrier(&self, switch: SwitchId) -> DeviceFuture {
        self.request(DeviceCall::Barrier(switch), |_| ())
    }
}

impl Inventory for Fabric {
    fn contains(&self, switch: SwitchId) -> bool {
        self.state().switches.contains_key(&switch)
    }

    fn version(&self, switch: SwitchId) -> Option<Version> {
        self.state().switches.get(&switch).and_then(|s| s.version)
    }
}

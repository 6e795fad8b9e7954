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

//! Requests to switches.
//!
//! The switch protocol client is outside this crate.  [`SwitchClient`] is what the pipeline needs
//! from it: each call starts a request and returns a future for its outcome.  Every kind of
//! request is a [`DeviceTask`] so that one function, [`WorkerPool::submit`], can issue and await
//! any of them under a deadline.

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{event, Level};

use crate::error::DeviceError;
use crate::types::{FlowEntry, SwitchId};

pub type DeviceFuture = BoxFuture<'static, Result<(), DeviceError>>;

pub trait SwitchClient: Send + Sync {
    fn add_entry(&self, entry: &FlowEntry) -> DeviceFuture;

    /// Removes the entry that [`FlowEntry::same_rule`] matches.  Removing an entry the switch
    /// doesn't have succeeds.
    fn remove_entry(&self, entry: &FlowEntry) -> DeviceFuture;

    /// Removes every entry on `switch`.
    fn clear_entries(&self, switch: SwitchId) -> DeviceFuture;

    /// Completes once `switch` has processed every earlier request.
    fn send_barrier(&self, switch: SwitchId) -> DeviceFuture;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceTask {
    AddEntry(FlowEntry),
    RemoveEntry(FlowEntry),
    ClearEntries(SwitchId),
    Barrier(SwitchId),
}

impl DeviceTask {
    pub fn switch(&self) -> SwitchId {
        match self {
            DeviceTask::AddEntry(entry) | DeviceTask::RemoveEntry(entry) => entry.switch,
            DeviceTask::ClearEntries(switch) | DeviceTask::Barrier(switch) => *switch,
        }
    }

    fn start(&self, client: &dyn SwitchClient) -> DeviceFuture {
        match self {
            DeviceTask::AddEntry(entry) => client.add_entry(entry),
            DeviceTask::RemoveEntry(entry) => client.remove_entry(entry),
            DeviceTask::ClearEntries(switch) => client.clear_entries(*switch),
            DeviceTask::Barrier(switch) => client.send_barrier(*switch),
        }
    }
}

impl Display for DeviceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTask::AddEntry(entry) => write!(f, "add entry {entry}"),
            DeviceTask::RemoveEntry(entry) => write!(f, "remove entry {entry}"),
            DeviceTask::ClearEntries(switch) => write!(f, "clear entries on {switch}"),
            DeviceTask::Barrier(switch) => write!(f, "barrier on {switch}"),
        }
    }
}

/// A request in flight.
pub struct Pending {
    task: DeviceTask,
    handle: JoinHandle<Result<(), DeviceError>>,
}

impl Pending {
    pub fn task(&self) -> &DeviceTask {
        &self.task
    }

    /// Waits for the request until `deadline`.  A request that is still running at the deadline
    /// is abandoned and reported as timed out.
    pub async fn wait_until(mut self, deadline: Instant) -> Result<(), DeviceError> {
        let switch = self.task.switch();
        match timeout_at(deadline, &mut self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(error)) => {
                event!(Level::ERROR, "{}: request task failed ({error})", self.task);
                Err(DeviceError::Aborted { switch })
            }
            Err(_) => {
                self.handle.abort();
                Err(DeviceError::Timeout { switch })
            }
        }
    }
}

/// Issues device requests and bounds how many flows work on switches at once.
#[derive(Clone)]
pub struct WorkerPool {
    client: Arc<dyn SwitchClient>,
    workers: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(client: Arc<dyn SwitchClient>, max_workers: usize) -> WorkerPool {
        WorkerPool { client, workers: Arc::new(Semaphore::new(max_workers)) }
    }

    /// Starts `task` without waiting for it.
    pub fn issue(&self, task: DeviceTask) -> Pending {
        let handle = tokio::spawn(task.start(&*self.client));
        Pending { task, handle }
    }

    /// Starts `task` and waits for it until `deadline`.
    pub async fn submit(&self, task: DeviceTask, deadline: Instant) -> Result<(), DeviceError> {
        self.issue(task).wait_until(deadline).await
    }

    /// Runs `work` on a worker once one is free.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let workers = self.workers.clone();
        tokio::spawn(async move {
            // Never fails: the semaphore is never closed.
            let _permit = workers.acquire_owned().await;
            work.await
        })
    }

    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DeviceCall, Fabric, Fault, FaultKind, Op};
    use std::time::Duration;

    #[tokio::test]
    async fn submit_and_time_out() {
        let fabric = Arc::new(Fabric::new());
        fabric.add_switch(SwitchId(1), None);
        let pool = WorkerPool::new(fabric.clone(), 2);
        let entry = FlowEntry::new(SwitchId(1), 0);

        let deadline = Instant::now() + Duration::from_secs(1);
        pool.submit(DeviceTask::AddEntry(entry.clone()), deadline).await.unwrap();
        assert_eq!(fabric.entries(SwitchId(1)), vec![entry.clone()]);

        fabric.inject(Fault::new(SwitchId(1), Op::Remove, FaultKind::Hang));
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(
            pool.submit(DeviceTask::RemoveEntry(entry.clone()), deadline).await,
            Err(DeviceError::Timeout { switch: SwitchId(1) })
        );
        assert_eq!(fabric.calls().last(), Some(&DeviceCall::Remove(SwitchId(1), entry.cookie)));

        let deadline = Instant::now() + Duration::from_secs(1);
        assert_eq!(
            pool.submit(DeviceTask::Barrier(SwitchId(2)), deadline).await,
            Err(DeviceError::Disconnected { switch: SwitchId(2) })
        );
    }

    #[tokio::test]
    async fn spawn_bounds_workers() {
        let fabric = Arc::new(Fabric::new());
        let pool = WorkerPool::new(fabric, 1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let first = pool.spawn(async move {
            let _ = rx.await;
        });
        while pool.idle_workers() != 0 {
            tokio::task::yield_now().await;
        }
        let second = pool.spawn(async { 42 });
        tx.send(()).unwrap();
        first.await.unwrap();
        assert_eq!(second.await.unwrap(), 42);
        assert_eq!(pool.idle_workers(), 1);
    }
}

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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::error::FlowError;

#[derive(Debug)]
struct CounterState {
    active: usize,
    accepting: bool,
}

/// Counts flow operations in flight so that shutdown can wait for them.
#[derive(Debug)]
pub struct TxnCounter {
    state: Mutex<CounterState>,
    idle: Notify,
}

impl Default for TxnCounter {
    fn default() -> Self {
        TxnCounter { state: Mutex::new(CounterState { active: 0, accepting: true }), idle: Notify::new() }
    }
}

impl TxnCounter {
    pub fn new() -> TxnCounter {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts a new operation, which ends when the returned guard is dropped.  Fails once
    /// [`TxnCounter::drain`] has been called.
    pub fn begin(self: &Arc<Self>) -> Result<TxnGuard, FlowError> {
        let mut state = self.lock();
        if !state.accepting {
            return Err(FlowError::ShuttingDown);
        }
        state.active += 1;
        Ok(TxnGuard { counter: self.clone() })
    }

    pub fn active(&self) -> usize {
        self.lock().active
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    /// Stops accepting operations and waits up to `timeout` for the ones in flight.  On timeout,
    /// returns the number still in flight.
    pub async fn drain(&self, timeout: Duration) -> Result<(), usize> {
        self.lock().accepting = false;
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            let active = self.active();
            if active == 0 {
                return Ok(());
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Err(self.active());
            }
        }
    }

    fn end(&self) {
        let mut state = self.lock();
        state.active -= 1;
        if state.active == 0 {
            self.idle.notify_one();
        }
    }
}

/// An operation in flight.
#[derive(Debug)]
pub struct TxnGuard {
    counter: Arc<TxnCounter>,
}

impl Drop for TxnGuard {
    fn drop(&mut self) {
        self.counter.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let counter = Arc::new(TxnCounter::new());
        let first = counter.begin().unwrap();
        let second = counter.begin().unwrap();
        assert_eq!(counter.active(), 2);

        let draining = {
            let counter = counter.clone();
            tokio::spawn(async move { counter.drain(Duration::from_secs(10)).await })
        };
        drop(first);
        tokio::task::yield_now().await;
        drop(second);

        assert_eq!(draining.await.unwrap(), Ok(()));
        assert_eq!(counter.active(), 0);
        assert_eq!(counter.begin().unwrap_err(), FlowError::ShuttingDown);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out() {
        let counter = Arc::new(TxnCounter::new());
        let _stuck = counter.begin().unwrap();
        assert_eq!(counter.drain(Duration::from_secs(1)).await, Err(1));
        assert!(!counter.is_accepting());
    }

    #[tokio::test]
    async fn drain_when_idle() {
        let counter = Arc::new(TxnCounter::new());
        drop(counter.begin().unwrap());
        assert_eq!(counter.drain(Duration::from_millis(1)).await, Ok(()));
    }
}

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

//! Remembers recently removed cookies.
//!
//! A flow with entries on several switches can expire on all of them at once, and each switch
//! reports its own removal.  Only the first report should remove the flow; the cache absorbs the
//! rest until the entry expires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{event, Level};

use crate::types::{Cookie, FlowId};

#[derive(Clone, Debug)]
pub struct RemovedCookieCache {
    inner: Arc<Mutex<HashMap<Cookie, FlowId>>>,
    expiry: Duration,
}

impl RemovedCookieCache {
    pub fn new(expiry: Duration) -> RemovedCookieCache {
        RemovedCookieCache { inner: Arc::new(Mutex::new(HashMap::new())), expiry }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Cookie, FlowId>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remembers that the flow with `cookie` is being removed.  Returns true if the cookie was
    /// not already remembered, in which case it is forgotten again after the expiry delay.
    ///
    /// Must be called from within a tokio runtime.
    pub fn remember(&self, cookie: Cookie, id: FlowId) -> bool {
        if self.lock().insert(cookie, id).is_some() {
            return false;
        }

        let inner = Arc::downgrade(&self.inner);
        let expiry = self.expiry;
        tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            if let Some(inner) = inner.upgrade() {
                inner.lock().unwrap_or_else(PoisonError::into_inner).remove(&cookie);
                event!(Level::TRACE, "forgot removed cookie {cookie}");
            }
        });
        true
    }

    pub fn contains(&self, cookie: Cookie) -> bool {
        self.lock().contains_key(&cookie)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn remember_once_until_expiry() {
        let cache = RemovedCookieCache::new(Duration::from_secs(5));
        let cookie = Cookie::for_flow(FlowId(7));

        assert!(cache.remember(cookie, FlowId(7)));
        assert!(!cache.remember(cookie, FlowId(7)));
        assert!(cache.contains(cookie));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(cache.contains(cookie));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!cache.contains(cookie));
        assert!(cache.is_empty());

        assert!(cache.remember(cookie, FlowId(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn cookies_expire_independently() {
        let cache = RemovedCookieCache::new(Duration::from_millis(100));
        cache.remember(Cookie::for_flow(FlowId(1)), FlowId(1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        cache.remember(Cookie::for_flow(FlowId(2)), FlowId(2));
        assert_eq!(cache.len(), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!cache.contains(Cookie::for_flow(FlowId(1))));
        assert!(cache.contains(Cookie::for_flow(FlowId(2))));
    }
}

// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

// Cache idle connections to reuse them across queries.

use super::conn::PooledConn;
use log::*;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A LIFO cache of idle connections with TTL eviction.
///
/// `put` appends to the tail and `get` pops it, so entries sit in non-decreasing `last_io` order:
/// if the tail is stale, everything underneath it is stale too. No other insertion path may
/// exist, or that assumption falls apart.
///
/// The lock is sync and never held across I/O.
pub(super) struct ConnPool {
    max_size: usize,
    ttl: Duration,
    gc_interval: Duration,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    entries: Vec<PooledConn>,
    last_clean: Instant,
}

impl ConnPool {
    pub(super) fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            max_size,
            ttl,
            gc_interval: ttl / 2,
            inner: Mutex::new(PoolInner {
                entries: Vec::new(),
                last_clean: Instant::now(),
            }),
        }
    }

    fn enabled(&self) -> bool {
        self.max_size > 0 && !self.ttl.is_zero()
    }

    /// Pop the most recently returned connection, or nothing if the pool has run dry.
    pub(super) fn get(&self) -> Option<PooledConn> {
        if !self.enabled() {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        self.clean(&mut inner, false, now);

        let conn = inner.entries.pop()?;
        if now.duration_since(conn.last_io()) > self.ttl {
            // The freshest entry has expired, so the whole stack has.
            drop(conn);
            self.clean(&mut inner, true, now);
            return None;
        }
        Some(conn)
    }

    /// Return a connection for later reuse. Connections with unrecoverable framing are closed
    /// instead, as is everything when the pool is disabled or full.
    pub(super) fn put(&self, conn: PooledConn) {
        if conn.is_broken() || !self.enabled() {
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        self.clean(&mut inner, false, now);

        if inner.entries.len() >= self.max_size {
            debug!("connection pool is full, closing the returned connection");
            return;
        }
        inner.entries.push(conn);
    }

    fn clean(&self, inner: &mut PoolInner, force: bool, now: Instant) {
        if !force && now.duration_since(inner.last_clean) < self.gc_interval {
            return;
        }

        // Relief valve: under a hot burst where churn outpaces natural expiry, shed the oldest
        // half outright so the sweep below stays bounded.
        if inner.entries.len() >= self.max_size {
            let shed = inner.entries.len() / 2;
            inner.entries.drain(..shed);
            debug!("connection pool at capacity, shed {} oldest entries", shed);
        }

        let before = inner.entries.len();
        inner
            .entries
            .retain(|conn| now.duration_since(conn.last_io()) <= self.ttl);
        let evicted = before - inner.entries.len();
        if evicted > 0 {
            debug!("evicted {} idle connections past their TTL", evicted);
        }
        inner.last_clean = now;
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::stream::conn::Transport;
    use tokio::io::duplex;
    use tokio::time::{advance, Instant};

    fn conn() -> PooledConn {
        let (near, _far) = duplex(64);
        // The far end is dropped; these connections only exist to sit in the pool.
        PooledConn::new(Transport::Stream(Box::new(near)))
    }

    #[tokio::test(start_paused = true)]
    async fn pool_is_lifo() {
        let pool = ConnPool::new(8, Duration::from_secs(10));
        let (a, b) = (conn(), conn());
        let (id_a, id_b) = (a.msg_id(), b.msg_id());
        pool.put(a);
        pool.put(b);

        assert_eq!(pool.get().unwrap().msg_id(), id_b);
        assert_eq!(pool.get().unwrap().msg_id(), id_a);
        assert!(pool.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn size_cap_is_respected() {
        let pool = ConnPool::new(2, Duration::from_secs(10));
        for _ in 0..5 {
            pool.put(conn());
        }
        assert!(pool.len() <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_tail_empties_the_pool() {
        let pool = ConnPool::new(8, Duration::from_secs(10));
        let t0 = Instant::now();
        pool.put(conn());

        // A second put late enough to reset the clean timer, but with an entry as old as the
        // first, so that the get below pops a stale tail while the periodic sweep is still gated.
        advance(Duration::from_secs(8)).await;
        let mut old = conn();
        old.set_last_io(t0);
        pool.put(old);

        advance(Duration::from_secs(4)).await;
        // The freshest entry is already past its TTL; get must close everything and dial anew.
        assert!(pool.get().is_none());
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entries_survive_a_clean() {
        let pool = ConnPool::new(8, Duration::from_secs(10));
        let mut old = conn();
        old.set_last_io(Instant::now());
        pool.put(old);

        advance(Duration::from_secs(6)).await;
        let fresh = conn();
        let fresh_id = fresh.msg_id();
        pool.put(fresh);

        advance(Duration::from_secs(5)).await;
        // 11s have passed for the old entry, 5s for the fresh one.
        assert_eq!(pool.get().unwrap().msg_id(), fresh_id);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_framing_never_enters_the_pool() {
        use crate::upstream::stream::conn::Framing;

        let pool = ConnPool::new(8, Duration::from_secs(10));
        let mut broken = conn();
        broken.set_framing(Framing::Broken);
        pool.put(broken);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_pool_accepts_nothing() {
        let pool = ConnPool::new(8, Duration::ZERO);
        pool.put(conn());
        assert_eq!(pool.len(), 0);
        assert!(pool.get().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn at_capacity_clean_sheds_the_oldest_half() {
        let pool = ConnPool::new(4, Duration::from_secs(100));
        let mut ids = Vec::new();
        for _ in 0..4 {
            let c = conn();
            ids.push(c.msg_id());
            pool.put(c);
        }

        // Past the GC interval the next put runs a clean, which finds the pool at capacity and
        // sheds the front (oldest) half before admitting the newcomer.
        advance(Duration::from_secs(51)).await;
        let newest = conn();
        let newest_id = newest.msg_id();
        pool.put(newest);

        assert_eq!(pool.len(), 3);
        assert_eq!(pool.get().unwrap().msg_id(), newest_id);
        assert_eq!(pool.get().unwrap().msg_id(), ids[3]);
        assert_eq!(pool.get().unwrap().msg_id(), ids[2]);
    }
}

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

mod conn;
mod dial;
mod pool;

pub(crate) use dial::{TcpDialer, TlsDialer, UdpDialer};

use self::{conn::PooledConn, dial::Dialer, pool::ConnPool};
use super::QHandle;
use crate::{
    error::{Result, UpstreamError},
    HEADER_LEN,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use log::*;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The upstream serving the three socket transports: plain UDP, plain TCP, and DNS over TLS. The
/// dialer supplies fresh transports; everything else, reuse included, is transport-agnostic.
pub(super) struct StreamUpstream<T: Dialer> {
    dialer: T,
    pool: ConnPool,
}

impl<T: Dialer> StreamUpstream<T> {
    pub(super) fn new(dialer: T, max_pool_size: usize, pool_ttl: Duration) -> Self {
        Self {
            dialer,
            pool: ConnPool::new(max_pool_size, pool_ttl),
        }
    }

    /// Obtain a connection, preferring the pool over the dialer. The boolean is true iff the
    /// connection was dialed here.
    async fn acquire(
        &self,
        ctx: &CancellationToken,
        force_new_conn: bool,
    ) -> Result<(PooledConn, bool)> {
        if !force_new_conn {
            if let Some(mut conn) = self.pool.get() {
                debug!("reusing a pooled {} connection", self.dialer.conn_type());
                conn.bump_msg_id();
                return Ok((conn, false));
            }
        }

        let conn = PooledConn::new(self.dialer.dial().await?);
        // The dial may have outlived the caller's interest. The fresh connection is perfectly
        // usable for whoever queries next, so it goes to the pool rather than to waste.
        if ctx.is_cancelled() {
            self.pool.put(conn);
            return Err(UpstreamError::Cancelled);
        }
        Ok((conn, true))
    }

    /// Run one query over one connection: write, drain leftovers of the previous exchange, then
    /// read until the reply with our wire ID comes back.
    async fn exchange_on(
        &self,
        ctx: &CancellationToken,
        mut conn: PooledConn,
        is_new: bool,
        query: &[u8],
    ) -> Result<BytesMut> {
        // The caller's bytes stay untouched: the ID swap happens on a scratch copy.
        let mut buf = BytesMut::from(query);
        let orig_id = [buf[0], buf[1]];
        let wire_id = conn.msg_id().to_be_bytes();
        buf[..2].copy_from_slice(&wire_id);

        let res = {
            let mut io = Box::pin(async {
                conn.write_msg(&buf).await?;
                conn.drain_residue().await?;
                loop {
                    let reply = conn.read_msg().await?;
                    if reply[..2] == wire_id {
                        return Ok(reply);
                    }
                    if is_new {
                        // Nothing else was ever sent down this connection, so a foreign ID can
                        // only mean the remote is confused.
                        return Err(UpstreamError::IdMismatch {
                            expected: u16::from_be_bytes(wire_id),
                            got: u16::from_be_bytes([reply[0], reply[1]]),
                        });
                    }
                    // A reply to an earlier query that landed after its exchange moved on. The
                    // frame has been consumed whole, framing stays clean; read again.
                    debug!(
                        "discarding a stale reply on a reused {} connection",
                        self.dialer.conn_type()
                    );
                }
            });
            tokio::select! {
                biased;
                r = &mut io => Some(r),
                _ = ctx.cancelled() => None,
            }
        };

        match res {
            Some(Ok(mut reply)) => {
                self.pool.put(conn);
                reply[..2].copy_from_slice(&orig_id);
                Ok(reply)
            }
            // Dropping the connection closes it.
            Some(Err(e)) => Err(e),
            None => {
                // Interrupted mid-I/O. `put` keeps the connection only if its framing is still
                // accounted for; one cut mid-prefix is closed instead.
                self.pool.put(conn);
                Err(UpstreamError::Cancelled)
            }
        }
    }

    async fn exchange_inner(&self, ctx: &CancellationToken, query: &[u8]) -> Result<BytesMut> {
        if ctx.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }

        let mut force_new_conn = false;
        loop {
            let (conn, is_new) = self.acquire(ctx, force_new_conn).await?;
            match self.exchange_on(ctx, conn, is_new, query).await {
                Ok(reply) => return Ok(reply),
                // A connection that sat in the pool may have been torn down by the remote in the
                // meantime; that earns one redial on a connection known to be fresh.
                Err(e) if !is_new && is_io_failure(&e) => {
                    debug!(
                        "exchange over a reused {} connection failed ({}), redialing",
                        self.dialer.conn_type(),
                        e
                    );
                    force_new_conn = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    #[cfg(test)]
    pub(super) fn pooled(&self) -> usize {
        self.pool.len()
    }
}

fn is_io_failure(e: &UpstreamError) -> bool {
    matches!(
        e,
        UpstreamError::IoError(_) | UpstreamError::ShortRead(_) | UpstreamError::TimeError(_)
    )
}

#[async_trait]
impl<T: Dialer> QHandle for StreamUpstream<T> {
    async fn exchange(&self, ctx: &CancellationToken, query: &[u8]) -> Result<(Bytes, Duration)> {
        if query.len() < HEADER_LEN {
            return Err(UpstreamError::ShortRead(query.len()));
        }

        let start = Instant::now();
        let reply = self.exchange_inner(ctx, query).await?;
        Ok((reply.freeze(), start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{StreamMode, TcpServer};
    use tokio::{net::UdpSocket, time::sleep};

    const QUERY: &[u8] = &[
        0x00, 0x2A, 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03, b'w', b'w',
        b'w', 0x07, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 0x03, b'c', b'o', b'm', 0x00, 0x00,
        0x01, 0x00, 0x01,
    ];

    fn cancel_after(ctx: &CancellationToken, delay: Duration) {
        let canceller = ctx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            canceller.cancel();
        });
    }

    #[tokio::test]
    async fn cancellation_with_clean_framing_repools_the_connection() {
        // A silent UDP peer: the interrupted recv consumed nothing, so the socket is still
        // perfectly reusable and must survive the cancellation.
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = StreamUpstream::new(
            UdpDialer::new(peer.local_addr().unwrap()),
            8,
            Duration::from_secs(30),
        );

        let ctx = CancellationToken::new();
        cancel_after(&ctx, Duration::from_millis(50));
        assert!(matches!(
            upstream.exchange(&ctx, QUERY).await,
            Err(UpstreamError::Cancelled)
        ));
        assert_eq!(upstream.pooled(), 1);
    }

    #[tokio::test]
    async fn cancellation_mid_prefix_closes_the_connection() {
        // A mute TCP peer: the exchange is interrupted while the reply's length prefix is
        // outstanding, which leaves the framing unrecoverable.
        let (server, addr) = TcpServer::bind(StreamMode::Mute, [1, 2, 3, 4]).await.unwrap();
        tokio::spawn(server.run());
        let upstream = StreamUpstream::new(TcpDialer::new(addr), 8, Duration::from_secs(30));

        let ctx = CancellationToken::new();
        cancel_after(&ctx, Duration::from_millis(50));
        assert!(matches!(
            upstream.exchange(&ctx, QUERY).await,
            Err(UpstreamError::Cancelled)
        ));
        assert_eq!(upstream.pooled(), 0);
    }
}

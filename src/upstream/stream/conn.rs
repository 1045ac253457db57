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

// One wire-message in, one wire-message out. UDP ships bare datagrams; TCP and TLS enclose each
// message in the RFC 1035 section 4.2.2 two-byte big-endian length prefix.

use crate::{
    error::{Result, UpstreamError},
    HEADER_LEN, MAX_LEN,
};
use bytes::{BufMut, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::UdpSocket,
    time::Instant,
};

pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// The owned transport underneath a pooled connection. TCP and TLS share the stream codec, so
/// they collapse into one variant here.
pub(crate) enum Transport {
    Udp(UdpSocket),
    Stream(Box<dyn AsyncStream>),
}

/// What we know about the stream's position relative to message boundaries.
///
/// The codec keeps this in step with every chunk of bytes moved, so an exchange interrupted
/// mid-I/O (its future dropped by the cancellation race) still leaves an accurate record behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Framing {
    /// The stream sits at a clean message boundary.
    Clean,
    /// A reply frame was cut short; this many bytes of it are still unread.
    Residue(usize),
    /// The framing is unrecoverable. Such connections never re-enter the pool.
    Broken,
}

/// A stream connection as the pool sees it: the transport itself, the framing record, the 16-bit
/// ID the next query will carry on the wire, and the time of the last successful I/O.
///
/// Exactly one exchange holds a `PooledConn` at any moment; mutual exclusion is by removal from
/// the pool, not by locking.
pub(super) struct PooledConn {
    transport: Transport,
    framing: Framing,
    msg_id: u16,
    last_io: Instant,
}

impl PooledConn {
    pub(super) fn new(transport: Transport) -> Self {
        Self {
            transport,
            framing: Framing::Clean,
            msg_id: rand::random(),
            last_io: Instant::now(),
        }
    }

    pub(super) fn msg_id(&self) -> u16 {
        self.msg_id
    }

    /// Called once per reuse, before the outgoing query's ID is rewritten.
    pub(super) fn bump_msg_id(&mut self) {
        self.msg_id = self.msg_id.wrapping_add(1);
    }

    pub(super) fn is_broken(&self) -> bool {
        self.framing == Framing::Broken
    }

    pub(super) fn last_io(&self) -> Instant {
        self.last_io
    }

    /// Write one wire-message. A partial write is an error: the connection must be discarded by
    /// the caller, which the `Broken` marker enforces should the error path forget.
    pub(super) async fn write_msg(&mut self, msg: &[u8]) -> Result<()> {
        if msg.len() > MAX_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "message exceeds the DNS maximum size",
            )
            .into());
        }

        match &mut self.transport {
            Transport::Udp(socket) => {
                let sent = socket.send(msg).await?;
                self.last_io = Instant::now();
                if sent != msg.len() {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "datagram truncated on send",
                    )
                    .into());
                }
            }
            Transport::Stream(stream) => {
                let mut frame = BytesMut::with_capacity(2 + msg.len());
                frame.put_u16(msg.len() as u16);
                frame.extend_from_slice(msg);

                // While our own frame is in flight the stream is unaccounted for; the prior
                // reply's residue (if any) becomes relevant again once the write completes.
                let resume = self.framing;
                self.framing = Framing::Broken;
                stream.write_all(&frame).await?;
                self.last_io = Instant::now();
                self.framing = resume;
            }
        }
        Ok(())
    }

    /// Read one wire-message. Replies shorter than the DNS header are rejected after the frame
    /// has been consumed, so they don't poison the framing.
    pub(super) async fn read_msg(&mut self) -> Result<BytesMut> {
        match &mut self.transport {
            Transport::Udp(socket) => {
                let mut buf = BytesMut::zeroed(MAX_LEN);
                let len = match socket.recv(&mut buf).await {
                    Ok(len) => len,
                    Err(e) => {
                        self.framing = Framing::Broken;
                        return Err(e.into());
                    }
                };
                self.last_io = Instant::now();
                if len < HEADER_LEN {
                    return Err(UpstreamError::ShortRead(len));
                }
                buf.truncate(len);
                Ok(buf)
            }
            Transport::Stream(stream) => {
                // Until both prefix bytes arrive we cannot tell where the next message starts.
                self.framing = Framing::Broken;
                let mut len_buf = [0u8; 2];
                let mut filled = 0;
                while filled < len_buf.len() {
                    let n = stream.read(&mut len_buf[filled..]).await?;
                    if n == 0 {
                        return Err(closed_by_remote().into());
                    }
                    filled += n;
                    self.last_io = Instant::now();
                }

                let len = u16::from_be_bytes(len_buf) as usize;
                let mut buf = BytesMut::zeroed(len);
                self.framing = match len {
                    0 => Framing::Clean,
                    n => Framing::Residue(n),
                };
                let mut filled = 0;
                while filled < len {
                    // An I/O error here leaves `Residue` standing: the remainder count is still
                    // accurate and decides whether a cancelled exchange may pool the connection.
                    let n = stream.read(&mut buf[filled..]).await?;
                    if n == 0 {
                        self.framing = Framing::Broken;
                        return Err(closed_by_remote().into());
                    }
                    filled += n;
                    self.last_io = Instant::now();
                    self.framing = match len - filled {
                        0 => Framing::Clean,
                        left => Framing::Residue(left),
                    };
                }

                if len < HEADER_LEN {
                    return Err(UpstreamError::ShortRead(len));
                }
                Ok(buf)
            }
        }
    }

    /// Read and discard the unread remainder of a partially-read frame, bringing the stream back
    /// to a message boundary before it is written to again.
    pub(super) async fn drain_residue(&mut self) -> Result<()> {
        let mut scratch = [0u8; 512];
        while let Framing::Residue(left) = self.framing {
            let stream = match &mut self.transport {
                Transport::Stream(stream) => stream,
                // Datagram sockets never carry residue.
                Transport::Udp(_) => unreachable!(),
            };
            let chunk_len = left.min(scratch.len());
            let n = stream.read(&mut scratch[..chunk_len]).await?;
            if n == 0 {
                self.framing = Framing::Broken;
                return Err(closed_by_remote().into());
            }
            self.last_io = Instant::now();
            self.framing = match left - n {
                0 => Framing::Clean,
                left => Framing::Residue(left),
            };
        }
        Ok(())
    }

    #[cfg(test)]
    pub(super) fn framing(&self) -> Framing {
        self.framing
    }

    #[cfg(test)]
    pub(super) fn set_framing(&mut self, framing: Framing) {
        self.framing = framing;
    }

    #[cfg(test)]
    pub(super) fn set_last_io(&mut self, at: Instant) {
        self.last_io = at;
    }
}

fn closed_by_remote() -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed by the remote",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn stream_conn() -> (PooledConn, tokio::io::DuplexStream) {
        let (near, far) = duplex(MAX_LEN * 2);
        (PooledConn::new(Transport::Stream(Box::new(near))), far)
    }

    fn frame(msg: &[u8]) -> Vec<u8> {
        let mut out = (msg.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(msg);
        out
    }

    #[tokio::test]
    async fn stream_write_is_length_prefixed() {
        let (mut conn, mut far) = stream_conn();
        let msg = [0u8; HEADER_LEN];
        conn.write_msg(&msg).await.unwrap();
        assert_eq!(conn.framing(), Framing::Clean);

        let mut wire = vec![0u8; 2 + msg.len()];
        far.read_exact(&mut wire).await.unwrap();
        assert_eq!(wire, frame(&msg));
    }

    #[tokio::test]
    async fn stream_read_consumes_one_frame() {
        let (mut conn, mut far) = stream_conn();
        let msg: Vec<u8> = (0..HEADER_LEN as u8).collect();
        far.write_all(&frame(&msg)).await.unwrap();
        far.write_all(&frame(&msg)).await.unwrap();

        assert_eq!(conn.read_msg().await.unwrap().as_ref(), &msg[..]);
        assert_eq!(conn.framing(), Framing::Clean);
        // The second frame is still intact on the wire.
        assert_eq!(conn.read_msg().await.unwrap().as_ref(), &msg[..]);
    }

    #[tokio::test]
    async fn short_frame_is_rejected_with_clean_framing() {
        let (mut conn, mut far) = stream_conn();
        far.write_all(&frame(&[0u8; 4])).await.unwrap();

        assert!(matches!(
            conn.read_msg().await,
            Err(UpstreamError::ShortRead(4))
        ));
        assert_eq!(conn.framing(), Framing::Clean);
    }

    #[tokio::test]
    async fn residue_is_drained_before_the_next_frame() {
        let (mut conn, mut far) = stream_conn();
        let msg: Vec<u8> = (0..HEADER_LEN as u8).rev().collect();
        far.write_all(&[0xAB; 7]).await.unwrap();
        far.write_all(&frame(&msg)).await.unwrap();

        conn.set_framing(Framing::Residue(7));
        conn.drain_residue().await.unwrap();
        assert_eq!(conn.framing(), Framing::Clean);
        assert_eq!(conn.read_msg().await.unwrap().as_ref(), &msg[..]);
    }

    #[tokio::test]
    async fn eof_mid_frame_breaks_the_framing() {
        let (mut conn, mut far) = stream_conn();
        far.write_all(&[0u8, 40, 1, 2, 3]).await.unwrap();
        drop(far);

        assert!(conn.read_msg().await.is_err());
        assert_eq!(conn.framing(), Framing::Broken);
    }

    #[tokio::test]
    async fn oversized_query_is_refused() {
        let (mut conn, _far) = stream_conn();
        let msg = vec![0u8; MAX_LEN + 1];
        assert!(conn.write_msg(&msg).await.is_err());
    }
}

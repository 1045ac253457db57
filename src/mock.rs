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

//! This module is NOT intended to be used by regular users. It is used for mocking purpose only.

use std::net::SocketAddr;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, UdpSocket},
};

/// Assemble a minimal response to `query`: the query's ID and question echoed back, the response
/// bit set, and a single A record pointing at `ip`.
pub fn a_record_reply(query: &[u8], ip: [u8; 4]) -> Vec<u8> {
    let mut reply = Vec::with_capacity(query.len() + 16);
    // ID, flags (QR + RD + RA), QDCOUNT from the query, ANCOUNT 1.
    reply.extend_from_slice(&query[..2]);
    reply.extend_from_slice(&[0x81, 0x80]);
    reply.extend_from_slice(&query[4..6]);
    reply.extend_from_slice(&[0, 1, 0, 0, 0, 0]);
    // Question section, verbatim.
    reply.extend_from_slice(&query[12..]);
    // One A record: pointer to the question name, IN A, TTL 60, the address itself.
    reply.extend_from_slice(&[0xC0, 0x0C, 0, 1, 0, 1, 0, 0, 0, 60, 0, 4]);
    reply.extend_from_slice(&ip);
    reply
}

/// How a [`TcpServer`] treats each query frame.
#[derive(Clone, Copy)]
pub enum StreamMode {
    /// Reply to every query.
    Answer,
    /// Reply to every query, but first re-send the reply to the previous one, mimicking a late
    /// reply that arrives ahead of the current exchange's.
    StaleThenAnswer,
    /// Reply with this fixed ID no matter what the query carried.
    WrongId(u16),
    /// Accept queries and never reply.
    Mute,
    /// Reply to one query, then close the connection.
    OneShot,
}

/// Mock UDP resolver answering every query with an A record.
pub struct UdpServer {
    socket: UdpSocket,
    ip: [u8; 4],
}

impl UdpServer {
    /// Bind a new mock server on a loopback port.
    pub async fn bind(ip: [u8; 4]) -> std::io::Result<(Self, SocketAddr)> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        Ok((Self { socket, ip }, addr))
    }

    /// Run it
    pub async fn run(self) -> std::io::Result<()> {
        let mut buf = vec![0u8; 65535];
        loop {
            let (len, peer) = self.socket.recv_from(&mut buf).await?;
            if len < 12 {
                continue;
            }
            self.socket
                .send_to(&a_record_reply(&buf[..len], self.ip), peer)
                .await?;
        }
    }
}

/// Mock TCP resolver speaking the RFC 1035 length-prefixed framing, with scriptable behavior per
/// query.
pub struct TcpServer {
    listener: TcpListener,
    mode: StreamMode,
    ip: [u8; 4],
}

impl TcpServer {
    /// Bind a new mock server on a loopback port.
    pub async fn bind(mode: StreamMode, ip: [u8; 4]) -> std::io::Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok((Self { listener, mode, ip }, addr))
    }

    /// Run it
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let (mode, ip) = (self.mode, self.ip);
            tokio::spawn(async move {
                let _ = serve_stream(stream, mode, ip).await;
            });
        }
    }
}

/// Serve length-prefixed DNS frames on an accepted stream. Exposed so tests can run the same
/// script underneath a TLS acceptor.
pub async fn serve_stream<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    mode: StreamMode,
    ip: [u8; 4],
) -> std::io::Result<()> {
    let mut prev: Option<Vec<u8>> = None;
    loop {
        let mut len_buf = [0u8; 2];
        if stream.read_exact(&mut len_buf).await.is_err() {
            // The client hung up between queries.
            return Ok(());
        }
        let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
        stream.read_exact(&mut query).await?;

        match mode {
            StreamMode::Mute => continue,
            StreamMode::Answer => {
                write_frame(&mut stream, &a_record_reply(&query, ip)).await?;
            }
            StreamMode::StaleThenAnswer => {
                let reply = a_record_reply(&query, ip);
                if let Some(stale) = prev.take() {
                    write_frame(&mut stream, &stale).await?;
                }
                write_frame(&mut stream, &reply).await?;
                prev = Some(reply);
            }
            StreamMode::WrongId(id) => {
                let mut reply = a_record_reply(&query, ip);
                reply[..2].copy_from_slice(&id.to_be_bytes());
                write_frame(&mut stream, &reply).await?;
            }
            StreamMode::OneShot => {
                write_frame(&mut stream, &a_record_reply(&query, ip)).await?;
                return Ok(());
            }
        }
    }
}

async fn write_frame<S: AsyncWrite + Unpin>(stream: &mut S, msg: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(msg.len() as u16).to_be_bytes()).await?;
    stream.write_all(msg).await
}

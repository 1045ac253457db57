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

use super::conn::Transport;
use crate::error::{Result, UpstreamError};
use async_trait::async_trait;
use rustls::{ClientConfig, ServerName};
use socket2::{Socket, TcpKeepalive};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpStream, UdpSocket},
    time::timeout,
};
use tokio_rustls::TlsConnector;

const DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

/// How a stream upstream opens a fresh transport when the pool comes up empty.
#[async_trait]
pub(crate) trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> Result<Transport>;

    /// Connection type. e.g. UDP, TCP.
    fn conn_type(&self) -> &'static str;
}

/// Dialer for plain UDP upstreams. The socket is connected so only the remote's datagrams reach
/// the exchange.
pub(crate) struct UdpDialer {
    addr: SocketAddr,
}

impl UdpDialer {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self) -> Result<Transport> {
        let socket = UdpSocket::bind(bind_addr(self.addr.is_ipv4()))
            .await
            .map_err(UpstreamError::DialFailed)?;
        socket
            .connect(self.addr)
            .await
            .map_err(UpstreamError::DialFailed)?;
        Ok(Transport::Udp(socket))
    }

    fn conn_type(&self) -> &'static str {
        "UDP"
    }
}

/// Dialer for plain TCP upstreams.
pub(crate) struct TcpDialer {
    addr: SocketAddr,
}

impl TcpDialer {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<Transport> {
        Ok(Transport::Stream(Box::new(connect_tcp(self.addr).await?)))
    }

    fn conn_type(&self) -> &'static str {
        "TCP"
    }
}

/// Dialer for DNS-over-TLS upstreams.
pub(crate) struct TlsDialer {
    addr: SocketAddr,
    server_name: ServerName,
    connector: TlsConnector,
}

impl TlsDialer {
    pub(crate) fn new(
        addr: SocketAddr,
        server_name: &str,
        config: Arc<ClientConfig>,
    ) -> Result<Self> {
        Ok(Self {
            addr,
            server_name: ServerName::try_from(server_name)
                .map_err(|_| UpstreamError::InvalidServerName(server_name.to_string()))?,
            connector: TlsConnector::from(config),
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    async fn dial(&self) -> Result<Transport> {
        let stream = connect_tcp(self.addr).await?;
        // The TCP socket is dropped, hence closed, whenever the handshake fails or times out.
        let stream = match timeout(
            TLS_HANDSHAKE_TIMEOUT,
            self.connector.connect(self.server_name.clone(), stream),
        )
        .await
        {
            Ok(handshake) => handshake.map_err(UpstreamError::TlsHandshakeFailed)?,
            Err(_) => {
                return Err(UpstreamError::TlsHandshakeFailed(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake didn't complete in time",
                )))
            }
        };
        Ok(Transport::Stream(Box::new(stream)))
    }

    fn conn_type(&self) -> &'static str {
        "TLS"
    }
}

async fn connect_tcp(addr: SocketAddr) -> Result<TcpStream> {
    let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await?
        .map_err(UpstreamError::DialFailed)?;

    // Good default as reqwest also sets this.
    let keepalive = TcpKeepalive::new().with_time(Duration::from_secs(60));
    let socket: Socket = stream.into_std()?.into();
    socket.set_tcp_keepalive(&keepalive)?;
    Ok(TcpStream::from_std(socket.into())?)
}

fn bind_addr(is_ipv4: bool) -> SocketAddr {
    if is_ipv4 {
        ([0u8; 4], 0).into()
    } else {
        ([0u16; 8], 0).into()
    }
}

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

//! Configuration for a single upstream and the factory turning it into an exchange capability.

use super::{
    https::HttpsUpstream,
    stream::{StreamUpstream, TcpDialer, TlsDialer, UdpDialer},
    tls::create_client_config,
    QHandle,
};
use crate::error::{Result, UpstreamError};
use rustls::RootCertStore;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};

// One pool per upstream; the cap only exists to bound the cleaner's work.
const DEFAULT_MAX_POOL_SIZE: usize = 65535;

// Connected UDP sockets are cheap but not free; half a minute of reuse covers bursts without
// holding ports hostage.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration of one upstream. Field names double as the configuration file keys.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub struct UpstreamConfig {
    /// The transport protocol: `udp` (or empty, its alias), `tcp`, `dot`, or `doh`.
    #[serde(default)]
    pub protocol: String,
    /// The `host:port` address dialed for every connection. For DoH this pins dialing to the
    /// given address instead of resolving the URL hostname.
    #[serde(default)]
    pub addr: Option<SocketAddr>,
    /// Plain-TCP specific options.
    #[serde(default)]
    pub tcp: TcpConfig,
    /// DNS-over-TLS specific options.
    #[serde(default)]
    pub dot: DotConfig,
    /// DNS-over-HTTPS specific options.
    #[serde(default)]
    pub doh: DohConfig,
    /// Skip TLS certificate verification. For testing only.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Options for plain TCP upstreams.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub struct TcpConfig {
    /// Seconds an idle connection may wait in the pool for reuse. Zero disables pooling.
    #[serde(default)]
    pub idle_timeout: u64,
}

/// Options for DNS-over-TLS upstreams.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub struct DotConfig {
    /// The name the server's certificate is verified against, also sent as SNI.
    #[serde(default)]
    pub server_name: String,
    /// Seconds an idle connection may wait in the pool for reuse. Zero disables pooling.
    #[serde(default)]
    pub idle_timeout: u64,
}

/// Options for DNS-over-HTTPS upstreams.
#[derive(Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub struct DohConfig {
    /// The full `https` URL of the DoH endpoint. e.g. `https://cloudflare-dns.com/dns-query`
    #[serde(default)]
    pub url: String,
    /// Use the lighter single-host HTTP/1.1 engine instead of the general pooled one.
    #[serde(default)]
    pub fasthttp: bool,
}

/// Build the exchange capability described by `config`.
///
/// `root_cas` supplies the TLS trust anchors for `dot` and `doh`; when absent the bundled
/// webpki roots are used.
pub fn new_upstream(
    config: &UpstreamConfig,
    root_cas: Option<RootCertStore>,
) -> Result<Arc<dyn QHandle>> {
    Ok(match config.protocol.as_str() {
        "udp" | "" => Arc::new(StreamUpstream::new(
            UdpDialer::new(stream_addr(config)?),
            DEFAULT_MAX_POOL_SIZE,
            UDP_IDLE_TIMEOUT,
        )),
        "tcp" => Arc::new(StreamUpstream::new(
            TcpDialer::new(stream_addr(config)?),
            DEFAULT_MAX_POOL_SIZE,
            Duration::from_secs(config.tcp.idle_timeout),
        )),
        "dot" => {
            let dialer = TlsDialer::new(
                stream_addr(config)?,
                &config.dot.server_name,
                Arc::new(create_client_config(root_cas, config.insecure_skip_verify)),
            )?;
            Arc::new(StreamUpstream::new(
                dialer,
                DEFAULT_MAX_POOL_SIZE,
                Duration::from_secs(config.dot.idle_timeout),
            ))
        }
        "doh" => {
            if config.doh.url.is_empty() {
                return Err(UpstreamError::MissingUrl);
            }
            Arc::new(HttpsUpstream::new(
                &config.doh.url,
                config.addr,
                config.doh.fasthttp,
                create_client_config(root_cas, config.insecure_skip_verify),
            )?)
        }
        other => return Err(UpstreamError::UnsupportedProtocol(other.to_string())),
    })
}

fn stream_addr(config: &UpstreamConfig) -> Result<SocketAddr> {
    config.addr.ok_or(UpstreamError::MissingAddr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_tags_are_rejected() {
        let config = UpstreamConfig {
            protocol: "doq".to_string(),
            addr: Some("127.0.0.1:853".parse().unwrap()),
            ..Default::default()
        };
        assert!(matches!(
            new_upstream(&config, None),
            Err(UpstreamError::UnsupportedProtocol(tag)) if tag == "doq"
        ));
    }

    #[test]
    fn empty_tag_aliases_udp() {
        let config = UpstreamConfig {
            addr: Some("127.0.0.1:53".parse().unwrap()),
            ..Default::default()
        };
        assert!(new_upstream(&config, None).is_ok());
    }

    #[test]
    fn doh_without_url_is_rejected() {
        let config = UpstreamConfig {
            protocol: "doh".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            new_upstream(&config, None),
            Err(UpstreamError::MissingUrl)
        ));
    }

    #[test]
    fn stream_protocols_require_an_address() {
        let config = UpstreamConfig {
            protocol: "tcp".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            new_upstream(&config, None),
            Err(UpstreamError::MissingAddr)
        ));
    }
}

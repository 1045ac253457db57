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

use super::QHandle;
use crate::{
    error::{Result, UpstreamError},
    HEADER_LEN, MAX_LEN,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::{Client, StatusCode, Url};
use rustls::ClientConfig;
use std::{net::SocketAddr, str::FromStr, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ALPN_H2: &[u8] = b"h2";
const ALPN_HTTP11: &[u8] = b"http/1.1";

/// The DNS-over-HTTPS upstream, RFC 8484 GET flavor.
///
/// HTTP connection reuse is the engine's own business; this upstream never touches the stream
/// pool.
pub(super) struct HttpsUpstream {
    client: Client,
    // Already terminated by `?dns=` or `&dns=`, so a query only has to be appended.
    url_prefix: String,
}

impl HttpsUpstream {
    /// Build the upstream from a full `https` URL. When `addr` is given, every dial goes to that
    /// address and the URL hostname is informational only. `fasthttp` selects the lighter
    /// single-host HTTP/1.1 engine over the general pooled one.
    pub(super) fn new(
        url: &str,
        addr: Option<SocketAddr>,
        fasthttp: bool,
        mut tls_config: ClientConfig,
    ) -> Result<Self> {
        let parsed = Url::from_str(url).map_err(|_| UpstreamError::InvalidUri(url.to_string()))?;
        if parsed.scheme() != "https" {
            return Err(UpstreamError::InvalidUri(url.to_string()));
        }

        let url_prefix = if parsed.query().is_some() {
            format!("{}&dns=", parsed)
        } else {
            format!("{}?dns=", parsed)
        };

        tls_config.alpn_protocols = if fasthttp {
            vec![ALPN_HTTP11.to_vec()]
        } else {
            vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
        };

        let mut builder = Client::builder()
            .use_preconfigured_tls(tls_config)
            .https_only(true);

        if let Some(addr) = addr {
            // The URL hostname keeps governing TLS verification; dialing is pinned to the
            // configured address, bypassing any resolution of the hostname.
            let domain = parsed
                .domain()
                .ok_or_else(|| UpstreamError::InvalidUri(url.to_string()))?;
            builder = builder.resolve(domain, addr);
        }

        builder = if fasthttp {
            builder.tcp_nodelay(true).timeout(Duration::from_secs(3))
        } else {
            builder
                .connect_timeout(Duration::from_secs(3))
                .pool_idle_timeout(Duration::from_secs(60))
        };

        Ok(Self {
            client: builder.build()?,
            url_prefix,
        })
    }

    async fn fetch(&self, url: String) -> Result<BytesMut> {
        let res = self
            .client
            .get(&url)
            .header("accept", "application/dns-message")
            .send()
            .await?;

        if res.status() != StatusCode::OK {
            return Err(UpstreamError::FailedHttp(res.status()));
        }
        if let Some(announced) = res.content_length() {
            if announced > MAX_LEN as u64 {
                return Err(UpstreamError::OversizedBody(announced));
            }
        }

        let mut body = BytesMut::new();
        let mut chunks = res.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > MAX_LEN {
                return Err(UpstreamError::OversizedBody((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

#[async_trait]
impl QHandle for HttpsUpstream {
    async fn exchange(&self, ctx: &CancellationToken, query: &[u8]) -> Result<(Bytes, Duration)> {
        if query.len() < HEADER_LEN {
            return Err(UpstreamError::ShortRead(query.len()));
        }
        if ctx.is_cancelled() {
            return Err(UpstreamError::Cancelled);
        }

        let start = Instant::now();

        // Per RFC 8484, the ID is zeroed on the wire to better facilitate HTTPS caching. The
        // caller's bytes stay untouched.
        let orig_id = [query[0], query[1]];
        let mut msg = BytesMut::from(query);
        msg[..2].copy_from_slice(&[0, 0]);

        // RFC 8484 section 6 mandates unpadded base64url.
        let mut url = String::with_capacity(self.url_prefix.len() + (msg.len() * 4 + 2) / 3);
        url.push_str(&self.url_prefix);
        base64::encode_config_buf(&msg, base64::URL_SAFE_NO_PAD, &mut url);

        let mut reply = {
            let mut fetch = Box::pin(self.fetch(url));
            tokio::select! {
                biased;
                r = &mut fetch => r?,
                _ = ctx.cancelled() => return Err(UpstreamError::Cancelled),
            }
        };

        if reply.len() < HEADER_LEN {
            return Err(UpstreamError::ShortRead(reply.len()));
        }
        if reply[..2] != [0, 0] {
            return Err(UpstreamError::IdMismatch {
                expected: 0,
                got: u16::from_be_bytes([reply[0], reply[1]]),
            });
        }
        reply[..2].copy_from_slice(&orig_id);
        Ok((reply.freeze(), start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::tls::create_client_config;

    #[test]
    fn url_prefix_accounts_for_an_existing_query_string() {
        let plain = HttpsUpstream::new(
            "https://dns.example/dns-query",
            None,
            false,
            create_client_config(None, false),
        )
        .unwrap();
        assert_eq!(plain.url_prefix, "https://dns.example/dns-query?dns=");

        let with_query = HttpsUpstream::new(
            "https://dns.example/resolve?foo=bar",
            None,
            false,
            create_client_config(None, false),
        )
        .unwrap();
        assert_eq!(with_query.url_prefix, "https://dns.example/resolve?foo=bar&dns=");
    }

    #[test]
    fn non_https_urls_are_rejected() {
        assert!(matches!(
            HttpsUpstream::new(
                "http://dns.example/dns-query",
                None,
                false,
                create_client_config(None, false),
            ),
            Err(UpstreamError::InvalidUri(_))
        ));
    }
}

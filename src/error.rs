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

//! This module provides the universal error type used in the library. The error type uses `thiserror`.

use crate::{HEADER_LEN, MAX_LEN};
use reqwest::StatusCode;
use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// UpstreamError enumerates all possible errors returned by this library.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The query was cancelled by the caller before a reply arrived.
    #[error("the query has been cancelled")]
    Cancelled,

    /// Failed to establish a connection to the remote server.
    #[error("failed to dial the remote server")]
    DialFailed(#[source] std::io::Error),

    /// The TLS handshake with the remote server failed or timed out.
    #[error("TLS handshake with the remote server failed")]
    TlsHandshakeFailed(#[source] std::io::Error),

    /// IO Error
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Error forwarded from `tokio::time::error`. This indicates a timeout probably.
    #[error(transparent)]
    TimeError(#[from] tokio::time::error::Elapsed),

    /// A message shorter than the DNS header was supplied or received.
    #[error("the message is only {0} bytes long, shorter than the DNS header ({HEADER_LEN} bytes)")]
    ShortRead(usize),

    /// The reply carried a transaction ID other than the one sent on the wire.
    #[error("reply ID {got:#06x} doesn't match the query ID {expected:#06x}")]
    IdMismatch {
        /// The ID written on the wire.
        expected: u16,
        /// The ID the remote echoed back.
        got: u16,
    },

    /// Unsuccessful HTTP status code.
    #[error("unsuccessful HTTP code: {0}")]
    FailedHttp(StatusCode),

    /// The HTTP response body exceeded the DNS maximum message size.
    #[error("HTTP response body of {0} bytes exceeds the DNS maximum of {MAX_LEN} bytes")]
    OversizedBody(u64),

    /// Error forwarded from `reqwest`.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// The URL is not a valid `https` URL.
    #[error("the URL '{0}' is invalid")]
    InvalidUri(String),

    /// The configured TLS server name is not a valid DNS name.
    #[error("'{0}' is not a valid TLS server name")]
    InvalidServerName(String),

    /// The protocol tag is not one of `udp`, `tcp`, `dot`, or `doh`.
    #[error("unsupported protocol: '{0}'")]
    UnsupportedProtocol(String),

    /// DoH was selected but no URL was configured.
    #[error("no URL configured for the DoH upstream")]
    MissingUrl,

    /// A stream protocol was selected but no remote address was configured.
    #[error("no remote address configured for the upstream")]
    MissingAddr,
}

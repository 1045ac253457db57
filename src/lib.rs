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

#![deny(missing_docs)]
#![deny(unsafe_code)]
// Documentation
//! This is the upstream exchange library for dcompass. It ships DNS wire-messages to remote
//! resolvers over plain UDP, plain TCP, DNS over TLS, or DNS over HTTPS, pooling long-lived
//! stream connections across concurrent queries and honoring per-query cancellation.
//!
//! Messages are treated as opaque byte sequences: only the 16-bit transaction ID in the header
//! is ever inspected or rewritten, and the caller's original ID is always restored on the reply.
pub mod error;
#[doc(hidden)]
pub mod mock;
mod upstream;

pub use self::upstream::{
    builder::{new_upstream, DohConfig, DotConfig, TcpConfig, UpstreamConfig},
    QHandle,
};

/// Maximum length of a DNS wire-message as per RFC 1035.
pub const MAX_LEN: usize = 65535;

/// Length of the fixed DNS message header. Messages shorter than this are not valid queries or
/// replies.
pub const HEADER_LEN: usize = 12;

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

pub mod builder;
mod https;
mod stream;
mod tls;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The capability every upstream provides: ship one DNS wire-message to the remote resolver and
/// hand back its wire-message reply.
///
/// The query must be an intact DNS message of at least [`HEADER_LEN`](crate::HEADER_LEN) bytes.
/// The reply's transaction ID always equals the query's original ID, no matter what the transport
/// put on the wire. The returned [`Duration`] is the wall-clock time of the call, dial inclusive.
#[async_trait]
pub trait QHandle: Send + Sync {
    /// Exchange one query for one reply.
    ///
    /// Cancelling `ctx` aborts the exchange promptly; the call then fails with
    /// [`UpstreamError::Cancelled`](crate::error::UpstreamError::Cancelled).
    async fn exchange(&self, ctx: &CancellationToken, query: &[u8]) -> Result<(Bytes, Duration)>;
}

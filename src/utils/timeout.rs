//! Async deadline helpers and shared timing constants.

use std::future::Future;
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Default per-byte-class read deadline.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Quiescence delay after a panic package, letting the peer flush its
/// buffer before the recovery handshake starts.
pub const PANIC_QUIESCENCE: Duration = Duration::from_millis(100);

/// Overall budget for one join pass. The first byte of each handshake
/// frame has no per-byte deadline, so the pass as a whole gets one; a
/// silent peer cannot pin a session in the handshake forever.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future under a deadline, mapping expiry to
/// [`TransportError::ReadTimeout`].
pub async fn with_deadline<F, T>(deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::ReadTimeout),
    }
}

use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
};

/// Pause between redial attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Redial ceiling for tunnel dials: roughly 24 hours of attempts at the
/// retry interval, i.e. "keep trying while the process runs".
pub const MAX_REDIALS: u32 = 24 * 60 * 60 / RETRY_INTERVAL.as_secs() as u32;

const COPY_BUF_SIZE: usize = 32 * 1024;

/// Connect to `addr`, retrying on failure every [`RETRY_INTERVAL`].
///
/// `max_retries` bounds the retries after the first failed attempt
/// (`Some(0)` = exactly one attempt); `None` retries forever. Exhausting
/// the budget returns `None`.
pub async fn dial(addr: &str, max_retries: Option<u32>) -> Option<TcpStream> {
    let mut failures = 0u32;
    loop {
        match TcpStream::connect(addr).await {
            Ok(conn) => return Some(conn),
            Err(err) => {
                failures += 1;
                if max_retries.is_some_and(|max| failures > max) {
                    tracing::warn!(addr, err = %err, "dial: giving up");
                    return None;
                }
                tracing::debug!(
                    addr,
                    attempt = failures,
                    retry_in = %humantime::format_duration(RETRY_INTERVAL),
                    err = %err,
                    "dial: retrying"
                );
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

/// Bind a listener on all interfaces. Bind failure logs and returns `None`;
/// it never aborts the caller.
pub async fn listen(port: u16) -> Option<TcpListener> {
    match TcpListener::bind(("0.0.0.0", port)).await {
        Ok(ln) => Some(ln),
        Err(err) => {
            tracing::warn!(port, err = %err, "listen: bind failed, port may be in use");
            None
        }
    }
}

/// Copy bytes between two connections until both directions terminate.
///
/// Peer disconnects are the normal way a bridge ends, so the outcome is not
/// surfaced to the caller.
pub async fn forward<A, B>(mut a: A, mut b: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::io::copy_bidirectional_with_sizes(&mut a, &mut b, COPY_BUF_SIZE, COPY_BUF_SIZE)
        .await;
}

use std::time::Duration;

use bytes::Bytes;
use metrics::counter;
use piper_common::metrics::RECORDS_RECEIVED;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Accept connections until `shutdown` is cancelled, reading newline
/// terminated records from each one into `queue`.
///
/// Returns once every connection reader has stopped, so that all clones of
/// `queue` are dropped by then.
pub async fn listen(
    listener: TcpListener,
    queue: mpsc::Sender<Bytes>,
    shutdown: CancellationToken,
) {
    let mut readers = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "accepted connection");
                    let queue = queue.clone();
                    let shutdown = shutdown.clone();
                    readers.spawn(async move {
                        let reader = BufReader::new(socket);
                        match read_records(reader, &queue, &shutdown).await {
                            Ok(count) => debug!(%peer, count, "connection closed"),
                            Err(e) => warn!(%peer, "connection read failed: {}", e),
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some(_) = readers.join_next(), if !readers.is_empty() => {}
            _ = shutdown.cancelled() => break,
        }
    }

    drop(queue);
    while readers.join_next().await.is_some() {}
    info!("listener stopped");
}

/// Forward every `\n` terminated record of `reader` to `queue`, newline
/// included. A trailing fragment without terminator is dropped.
pub async fn read_records<R>(
    mut reader: R,
    queue: &mpsc::Sender<Bytes>,
    shutdown: &CancellationToken,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
{
    let mut forwarded = 0;

    loop {
        let mut line = Vec::new();
        let read = tokio::select! {
            read = reader.read_until(b'\n', &mut line) => read?,
            _ = shutdown.cancelled() => break,
        };

        if read == 0 {
            break;
        }
        if line.last() != Some(&b'\n') {
            debug!(bytes = line.len(), "dropping unterminated trailing fragment");
            break;
        }

        counter!(RECORDS_RECEIVED).increment(1);
        tokio::select! {
            sent = queue.send(Bytes::from(line)) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
        forwarded += 1;
    }

    Ok(forwarded)
}

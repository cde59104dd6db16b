use crate::error::TandemError;
use crate::metrics::{gauges, histograms};
use crate::notify::ActionQueue;
use crate::server::ServerState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tandem_common::wire::{GatewayAction, GatewayEvent, WireError, MAX_LINE_LEN};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Replies addressed to one connection (pong, error lines).
const REPLY_BUFFER: usize = 64;

/// Releases the gateway slot taken by the accept loop.
struct GatewayGuard {
    state: Arc<ServerState>,
}

impl Drop for GatewayGuard {
    fn drop(&mut self) {
        self.state.health.detach();
        gauges::dec_gateways_active();
    }
}

/// Serve one gateway adapter until it disconnects.
///
/// The caller must already hold a slot from
/// [`HealthState::try_attach`](crate::metrics::HealthState::try_attach); the
/// slot is released on return.
///
/// # Errors
///
/// Returns an error if reading from the adapter fails.
pub async fn handle_gateway<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), TandemError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _guard = GatewayGuard {
        state: state.clone(),
    };
    gauges::inc_gateways_active();
    debug!(peer = %peer, "gateway attached");

    let (reader, writer) = tokio::io::split(stream);
    let (reply_tx, reply_rx) = mpsc::channel(REPLY_BUFFER);

    let writer_task = tokio::spawn(write_actions(writer, state.queue.clone(), reply_rx));
    let result = read_events(reader, &state, reply_tx).await;

    if let Err(e) = writer_task.await {
        debug!(peer = %peer, "gateway writer aborted: {}", e);
    }
    debug!(peer = %peer, "gateway detached");
    result
}

async fn read_events<R>(
    reader: R,
    state: &ServerState,
    replies: mpsc::Sender<GatewayAction>,
) -> Result<(), TandemError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_LEN as u64 + 2);
        if limited.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }

        let reply = if buf.len() > MAX_LINE_LEN && buf.last() != Some(&b'\n') {
            debug!("rejecting oversized gateway line");
            discard_rest_of_line(&mut reader).await?;
            Some(error_reply(WireError::TooLong(MAX_LINE_LEN)))
        } else {
            match std::str::from_utf8(&buf) {
                Ok(line) if line.trim().is_empty() => continue,
                Ok(line) => dispatch(line, state).await,
                Err(e) => {
                    debug!("rejecting gateway line: {}", e);
                    Some(error_reply("line is not valid UTF-8"))
                }
            }
        };

        if let Some(reply) = reply {
            if replies.send(reply).await.is_err() {
                break;
            }
        }
    }
    Ok(())
}

/// Act on one decoded line, returning the reply for this connection if any.
async fn dispatch(line: &str, state: &ServerState) -> Option<GatewayAction> {
    match GatewayEvent::parse(line) {
        Ok(GatewayEvent::Ping) => Some(GatewayAction::Pong),
        Ok(GatewayEvent::DeliveryFailed {
            kind,
            message_ref,
            reason,
        }) => {
            state
                .router
                .handle_delivery_failure(kind, message_ref, &reason)
                .await;
            None
        }
        Ok(event) => {
            if let Some(msg) = event.into_inbound() {
                let started = Instant::now();
                state.router.handle_inbound(&msg).await;
                histograms::event_latency_seconds(started.elapsed().as_secs_f64());
            }
            None
        }
        Err(e) => {
            debug!("rejecting gateway line: {}", e);
            Some(error_reply(e))
        }
    }
}

fn error_reply(error: impl ToString) -> GatewayAction {
    GatewayAction::Error {
        error: error.to_string(),
    }
}

/// Skip input up to and including the next newline.
async fn discard_rest_of_line<R>(reader: &mut BufReader<R>) -> Result<(), TandemError>
where
    R: AsyncRead + Unpin,
{
    loop {
        let (used, found) = {
            let buf = reader.fill_buf().await?;
            if buf.is_empty() {
                return Ok(());
            }
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => (pos + 1, true),
                None => (buf.len(), false),
            }
        };
        reader.consume(used);
        if found {
            return Ok(());
        }
    }
}

async fn write_actions<W>(
    mut writer: W,
    queue: ActionQueue,
    mut replies: mpsc::Receiver<GatewayAction>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let action = tokio::select! {
            reply = replies.recv() => match reply {
                Some(action) => action,
                None => break,
            },
            action = next_action(&queue) => match action {
                Some(action) => action,
                None => break,
            },
        };
        if let Err(e) = writer.write_all(action.to_line().as_bytes()).await {
            warn!(recipient = ?action.recipient(), "gateway write failed, action lost: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Take the next queued action once this writer holds the queue.
async fn next_action(queue: &ActionQueue) -> Option<GatewayAction> {
    queue.lock().await.recv().await
}

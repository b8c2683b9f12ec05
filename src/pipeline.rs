//! Response body pipeline.
//!
//! We return response headers to the client as soon as the origin does, and
//! produce the body in a background task: origin body → rewriter →
//! compressor → channel → client. If the client goes away, the channel
//! closes, the task stops, and everything it holds is released.

use std::{error, io, sync::Arc};

use anyhow::{format_err, Context};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hyper::Body;
use metrics::{counter, describe_counter};
use tokio::sync::mpsc::{self, Sender};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::task::TaskTracker;
use tracing::{debug, instrument, warn, Instrument};

use crate::{
    buffer_pool::{BufferPool, PooledBuffer},
    compression::CompressionSession,
    dictionaries::DictionaryPin,
    rewrite::Rewriter,
    Result,
};

/// The number of chunks to buffer between our task and the client.
const CHANNEL_BUFFER: usize = 8;

/// What to do to a body on its way through.
#[derive(Default)]
pub struct Stages {
    /// Rewrite hostnames, if present.
    pub rewriter: Option<Rewriter>,
    /// Compress, if present.
    pub compressor: Option<Compressor>,
}

/// Everything a compression session needs, reserved up front so that we can
/// still fall back to an uncompressed response if buffers are short.
pub struct Compressor {
    pin: DictionaryPin,
    input: PooledBuffer,
    output: PooledBuffer,
}

impl Compressor {
    /// Check out buffers from `pool` for compressing against `pin`.
    pub fn reserve(pin: DictionaryPin, pool: &Arc<BufferPool>) -> Result<Compressor> {
        let input = pool.checkout()?;
        let output = pool.checkout()?;
        Ok(Compressor { pin, input, output })
    }
}

/// A chunk sent to the client.
type BodyChunk = std::result::Result<Bytes, io::Error>;

/// Register our metrics. Called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "dictproxy.body_pipelines.total",
        "Response body pipelines, labeled by outcome"
    );
}

/// Start transforming `body` in a task tracked by `tasks`, and return a body
/// which streams the result.
pub fn spawn_body_pipeline<S, E>(
    tasks: &TaskTracker,
    body: S,
    stages: Stages,
) -> Body
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin + 'static,
    E: error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel::<BodyChunk>(CHANNEL_BUFFER);
    tasks.spawn(
        async move {
            match run_body_pipeline(body, stages, &tx).await {
                Ok(()) => {
                    counter!("dictproxy.body_pipelines.total", 1, "outcome" => "complete");
                }
                Err(_) if tx.is_closed() => {
                    counter!("dictproxy.body_pipelines.total", 1, "outcome" => "client_gone");
                    debug!("client went away before the body was finished");
                }
                Err(err) => {
                    counter!("dictproxy.body_pipelines.total", 1, "outcome" => "failed");
                    warn!("response body failed: {:#}", err);
                    // Make sure the client sees a truncated body, not a
                    // short-but-complete one.
                    let err = io::Error::new(io::ErrorKind::Other, "upstream body failed");
                    let _ = tx.send(Err(err)).await;
                }
            }
        }
        .in_current_span(),
    );
    Body::wrap_stream(ReceiverStream::new(rx))
}

/// Run our stages over `body`, sending output to `tx`.
#[instrument(
    level = "debug",
    skip_all,
    fields(
        rewrite = stages.rewriter.is_some(),
        compress = stages.compressor.is_some(),
    )
)]
async fn run_body_pipeline<S, E>(
    mut body: S,
    stages: Stages,
    tx: &Sender<BodyChunk>,
) -> Result<()>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + Unpin,
    E: error::Error + Send + Sync + 'static,
{
    let Stages {
        mut rewriter,
        compressor,
    } = stages;

    // The session borrows the pinned dictionary, so `pin` must outlive it.
    let (pin, buffers) = match compressor {
        Some(Compressor { pin, input, output }) => (Some(pin), Some((input, output))),
        None => (None, None),
    };
    let mut session = match (&pin, buffers) {
        (Some(pin), Some((input, output))) => Some(CompressionSession::new(
            pin.entry(),
            input,
            output,
        )?),
        _ => None,
    };

    let mut out = Vec::new();
    loop {
        // A stalled origin must not keep our pin and buffers alive after the
        // client is gone.
        let chunk = tokio::select! {
            chunk = body.next() => chunk,
            _ = tx.closed() => return Err(format_err!("client closed the response body")),
        };
        let chunk = match chunk {
            Some(chunk) => chunk.context("error reading origin body")?,
            None => break,
        };
        let chunk = match &mut rewriter {
            Some(rewriter) => Bytes::from(rewriter.push(&chunk)),
            None => chunk,
        };
        stage_output(&mut session, chunk, &mut out)?;
        send_all(tx, &mut out).await?;
    }

    if let Some(rewriter) = &mut rewriter {
        let rest = Bytes::from(rewriter.finish());
        stage_output(&mut session, rest, &mut out)?;
    }
    if let Some(session) = session.take() {
        session.finish(&mut out)?;
    }
    send_all(tx, &mut out).await?;

    if let Some(pin) = &pin {
        pin.maybe_sweep();
    }
    Ok(())
}

/// Pass `data` through the compressor, if any, and queue the result.
fn stage_output(
    session: &mut Option<CompressionSession<'_>>,
    data: Bytes,
    out: &mut Vec<Bytes>,
) -> Result<()> {
    match session {
        Some(session) => session.write(&data, out),
        None => {
            if !data.is_empty() {
                out.push(data);
            }
            Ok(())
        }
    }
}

/// Send everything in `out` to the client, in order.
async fn send_all(tx: &Sender<BodyChunk>, out: &mut Vec<Bytes>) -> Result<()> {
    for chunk in out.drain(..) {
        tx.send(Ok(chunk))
            .await
            .map_err(|_| format_err!("client closed the response body"))?;
    }
    Ok(())
}

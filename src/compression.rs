//! Streaming dictionary compression (`dcz`).
//!
//! Output is a zstd skippable frame carrying the dictionary hash, followed by
//! an ordinary zstd frame compressed against that dictionary. We feed the
//! encoder in pool-sized sub-chunks and decide after each one whether to
//! flush, so the client sees bytes early without us flushing so often that we
//! ruin the compression ratio.

use anyhow::Context;
use bytes::Bytes;
use metrics::{counter, describe_counter, Unit};
use tracing::trace;
use zstd::{
    stream::raw::{Encoder, Operation},
    zstd_safe::{CParameter, InBuffer, OutBuffer},
};

use crate::{
    buffer_pool::PooledBuffer,
    dictionaries::{DictionaryEntry, DictionaryHash, HASH_LEN},
    Result,
};

/// The `Content-Encoding` token for dictionary-compressed zstd.
pub const CONTENT_ENCODING: &str = "dcz";

/// Skippable frame magic number plus a 32-byte frame length.
pub const MAGIC: [u8; 8] = [0x5E, 0x2A, 0x4D, 0x18, 0x20, 0x00, 0x00, 0x00];

/// Length of the framing header: magic plus hash.
pub const HEADER_LEN: usize = MAGIC.len() + HASH_LEN;

/// Log2 of our compression window. 4 MiB covers a dictionary plus a typical
/// page.
pub const WINDOW_LOG: u32 = 22;

/// Force a flush after this many sub-chunks in a row produce no output.
pub const EMPTY_CHUNKS_BEFORE_FLUSH: usize = 5;

/// Build the framing header for a dictionary.
pub fn framing_header(hash: &DictionaryHash) -> [u8; HEADER_LEN] {
    let mut header = [0; HEADER_LEN];
    header[..MAGIC.len()].copy_from_slice(&MAGIC);
    header[MAGIC.len()..].copy_from_slice(hash.as_bytes());
    header
}

/// Register our metrics. Called once at startup.
pub fn describe_metrics() {
    describe_counter!(
        "dictproxy.compressor_input.bytes_total",
        Unit::Bytes,
        "Bytes input to compressor"
    );
    describe_counter!(
        "dictproxy.compressor_output.bytes_total",
        Unit::Bytes,
        "Bytes output by compressor"
    );
    describe_counter!(
        "dictproxy.compressor_flushes.total",
        "Flushes forced by the compressor, labeled by reason"
    );
}

/// Writes the framing header in front of the first non-empty output.
struct Framer {
    hash: DictionaryHash,
    header_written: bool,
    bytes_out: u64,
}

impl Framer {
    fn emit(&mut self, data: &[u8], out: &mut Vec<Bytes>) {
        if data.is_empty() {
            return;
        }
        if !self.header_written {
            out.push(Bytes::copy_from_slice(&framing_header(&self.hash)));
            self.bytes_out += HEADER_LEN as u64;
            self.header_written = true;
        }
        out.push(Bytes::copy_from_slice(data));
        self.bytes_out += data.len() as u64;
    }
}

/// Compression state for one response.
///
/// Holds two pooled buffers and a zstd context bound to a prepared
/// dictionary. Everything is released when the session is dropped, whether
/// or not it finished.
pub struct CompressionSession<'d> {
    /// The zstd context. It borrows the dictionary, it doesn't own it.
    encoder: Encoder<'d>,

    /// Staging buffer for input sub-chunks.
    input: PooledBuffer,

    /// Buffer zstd writes into.
    output: PooledBuffer,

    /// Number of sub-chunks fed so far.
    chunks: u64,

    /// Is the next sub-chunk our first?
    first_chunk: bool,

    /// Consecutive sub-chunks which produced no output.
    empty_run: usize,

    /// Header and output accounting.
    framer: Framer,

    /// Total input bytes.
    bytes_in: u64,
}

impl<'d> CompressionSession<'d> {
    /// Start a session compressing against `dictionary`, using buffers the
    /// caller has checked out of our pool.
    pub fn new(
        dictionary: &'d DictionaryEntry,
        input: PooledBuffer,
        output: PooledBuffer,
    ) -> Result<CompressionSession<'d>> {
        let mut encoder = Encoder::with_prepared_dictionary(dictionary.prepared())
            .context("could not create compression context")?;
        encoder
            .set_parameter(CParameter::WindowLog(WINDOW_LOG))
            .context("could not set compression window")?;
        Ok(CompressionSession {
            encoder,
            input,
            output,
            chunks: 0,
            first_chunk: true,
            empty_run: 0,
            framer: Framer {
                hash: *dictionary.hash(),
                header_written: false,
                bytes_out: 0,
            },
            bytes_in: 0,
        })
    }

    /// Compress `data`, appending any output chunks to `out`.
    pub fn write(&mut self, data: &[u8], out: &mut Vec<Bytes>) -> Result<()> {
        let sub_chunk_size = self.input.len();
        for sub_chunk in data.chunks(sub_chunk_size) {
            self.write_sub_chunk(sub_chunk, out)?;
        }
        Ok(())
    }

    /// Feed one sub-chunk and apply our flush heuristic.
    fn write_sub_chunk(&mut self, sub_chunk: &[u8], out: &mut Vec<Bytes>) -> Result<()> {
        self.bytes_in += sub_chunk.len() as u64;
        self.chunks += 1;

        let len = sub_chunk.len();
        self.input[..len].copy_from_slice(sub_chunk);
        let mut produced = 0;
        let mut src = InBuffer::around(&self.input[..len]);
        loop {
            let written = {
                let mut dst = OutBuffer::around(&mut self.output[..]);
                self.encoder
                    .run(&mut src, &mut dst)
                    .context("compression failed")?;
                dst.pos()
            };
            let full = written == self.output.len();
            self.framer.emit(&self.output[..written], out);
            produced += written;
            if src.pos() == len && !full {
                break;
            }
        }

        if self.first_chunk {
            // Get something to the client as soon as we can.
            self.first_chunk = false;
            counter!("dictproxy.compressor_flushes.total", 1, "reason" => "first_chunk");
            self.flush(out)?;
        } else if produced == 0 {
            self.empty_run += 1;
            if self.empty_run >= EMPTY_CHUNKS_BEFORE_FLUSH {
                counter!("dictproxy.compressor_flushes.total", 1, "reason" => "empty_run");
                self.flush(out)?;
            }
        } else {
            self.empty_run = 0;
        }
        Ok(())
    }

    /// Force zstd to emit everything it has buffered.
    pub fn flush(&mut self, out: &mut Vec<Bytes>) -> Result<()> {
        trace!(chunks = self.chunks, "flushing compressor");
        self.empty_run = 0;
        loop {
            let mut dst = OutBuffer::around(&mut self.output[..]);
            let remaining = self
                .encoder
                .flush(&mut dst)
                .context("compression flush failed")?;
            let written = dst.pos();
            drop(dst);
            self.framer.emit(&self.output[..written], out);
            if remaining == 0 {
                return Ok(());
            }
        }
    }

    /// End the zstd frame and emit everything that's left.
    pub fn finish(mut self, out: &mut Vec<Bytes>) -> Result<()> {
        loop {
            let mut dst = OutBuffer::around(&mut self.output[..]);
            let remaining = self
                .encoder
                .finish(&mut dst, true)
                .context("could not finish compression")?;
            let written = dst.pos();
            drop(dst);
            self.framer.emit(&self.output[..written], out);
            if remaining == 0 {
                break;
            }
        }
        trace!(
            chunks = self.chunks,
            bytes_in = self.bytes_in,
            bytes_out = self.framer.bytes_out,
            "finished compression"
        );
        Ok(())
    }
}

impl<'d> Drop for CompressionSession<'d> {
    fn drop(&mut self) {
        // Our buffers go back to the pool on their own, and the encoder frees
        // its context. All we need to do is report.
        counter!(
            "dictproxy.compressor_input.bytes_total",
            self.bytes_in,
            "compressor" => "dcz"
        );
        counter!(
            "dictproxy.compressor_output.bytes_total",
            self.framer.bytes_out,
            "compressor" => "dcz"
        );
    }
}

//! In-memory byte pipe with a fixed number of in-flight chunks.
//!
//! The writer blocks once `capacity` chunks are queued, so a slow reader
//! throttles the writer and memory stays bounded by
//! `capacity * MAX_CHUNK_SIZE` no matter how much data flows through.

use crossbeam::channel::{self, Receiver, Sender};
use std::io;
use std::io::{Read, Write};
use std::sync::{Arc, OnceLock};

/// Largest chunk a single `write` call queues.
pub static MAX_CHUNK_SIZE: usize = 64 * 1024;
pub static DEFAULT_CAPACITY: usize = 16;

#[derive(Debug)]
enum PipeEnd {
    Closed,
    Aborted(String),
}

pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = channel::bounded(capacity.max(1));
    let end = Arc::new(OnceLock::new());
    (
        PipeWriter {
            tx: Some(tx),
            end: end.clone(),
        },
        PipeReader {
            rx,
            end,
            chunk: Vec::new(),
            pos: 0,
        },
    )
}

/// Sending half. Must be finished with [`PipeWriter::close`]; a writer that is
/// dropped or aborted makes the reader fail instead of seeing a clean EOF.
#[derive(Debug)]
pub struct PipeWriter {
    tx: Option<Sender<Vec<u8>>>,
    end: Arc<OnceLock<PipeEnd>>,
}

impl PipeWriter {
    pub fn close(mut self) {
        let _ = self.end.set(PipeEnd::Closed);
        self.tx.take();
    }

    pub fn abort<S: Into<String>>(mut self, reason: S) {
        let _ = self.end.set(PipeEnd::Aborted(reason.into()));
        self.tx.take();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "pipe writer closed"))?;
        let len = buf.len().min(MAX_CHUNK_SIZE);
        tx.send(buf[..len].to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader dropped"))?;
        Ok(len)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct PipeReader {
    rx: Receiver<Vec<u8>>,
    end: Arc<OnceLock<PipeEnd>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => {
                    return match self.end.get() {
                        Some(PipeEnd::Closed) => Ok(0),
                        Some(PipeEnd::Aborted(reason)) => Err(io::Error::other(reason.clone())),
                        None => Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "pipe writer dropped without closing",
                        )),
                    }
                }
            }
        }

        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

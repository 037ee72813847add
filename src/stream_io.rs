//! # Stream Adapter
//!
//! Remote stream sessions only offer "send a chunk" and "receive a chunk".
//! [`StreamIo`] presents a borrowed session as a `std::io::Read` /
//! `std::io::Write` so volume transfers can use `std::io::copy` like any
//! other byte stream.
//!
//! ## Contract
//!
//! - `read` forwards to `recv`; a zero-byte receive is end-of-stream.
//! - `write` forwards to `send`; a short send is an error and is never retried.
//! - Nothing is buffered between calls.
//! - The worker's [`WorkerContext`] is checked before every remote call, so a
//!   cancelled or overdue worker stops at the next chunk boundary.
//!
//! The adapter never opens, finishes, aborts or frees the session. That is
//! the job of [`ScopedSession`], which owns the session for the duration of a
//! transfer and aborts it on every path that did not finish cleanly.

use crate::hypervisor::{BackendError, StreamSession};
use crate::worker::{Interrupt, WorkerContext};
use std::io::{self, Read, Write};
use thiserror::Error;
use tracing::{debug, warn};

/// The remote side accepted fewer bytes than it was handed
#[derive(Debug, Error)]
#[error("short write: stream accepted {written} of {requested} bytes")]
pub struct ShortWrite {
    pub written: usize,
    pub requested: usize,
}

/// `Read`/`Write` view of a borrowed stream session
pub struct StreamIo<'a, S: StreamSession> {
    session: &'a mut S,
    ctx: &'a WorkerContext,
}

impl<'a, S: StreamSession> StreamIo<'a, S> {
    pub fn new(session: &'a mut S, ctx: &'a WorkerContext) -> Self {
        Self { session, ctx }
    }
}

fn interrupted(interrupt: Interrupt) -> io::Error {
    let kind = match interrupt {
        Interrupt::DeadlineExceeded(_) => io::ErrorKind::TimedOut,
        // Not ErrorKind::Interrupted: io::copy retries those.
        Interrupt::Cancelled => io::ErrorKind::Other,
    };
    io::Error::new(kind, interrupt)
}

fn backend(err: BackendError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

/// Recover the interrupt carried by an adapter error, if any
pub fn interrupt_of(err: &io::Error) -> Option<Interrupt> {
    err.get_ref()
        .and_then(|inner| inner.downcast_ref::<Interrupt>())
        .copied()
}

impl<S: StreamSession> Read for StreamIo<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ctx.check().map_err(interrupted)?;
        self.session.recv(buf).map_err(backend)
    }
}

impl<S: StreamSession> Write for StreamIo<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.ctx.check().map_err(interrupted)?;
        let written = self.session.send(buf).map_err(backend)?;
        if written < buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                ShortWrite {
                    written,
                    requested: buf.len(),
                },
            ));
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Owns a stream session for one transfer
///
/// Dropping a session that was not [finished](ScopedSession::finish) aborts
/// it first; the session itself is freed when the guard goes away.
pub struct ScopedSession<S: StreamSession> {
    session: S,
    finished: bool,
}

impl<S: StreamSession> ScopedSession<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            finished: false,
        }
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Complete the transfer. On failure the session is aborted on drop.
    pub fn finish(mut self) -> Result<(), BackendError> {
        self.session.finish()?;
        self.finished = true;
        Ok(())
    }
}

impl<S: StreamSession> Drop for ScopedSession<S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        debug!("Aborting unfinished stream session");
        if let Err(e) = self.session.abort() {
            warn!("Failed to abort stream session: {}", e);
        }
    }
}

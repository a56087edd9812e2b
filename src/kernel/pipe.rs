//! In-memory pipe
//!
//! A flow-controlled byte channel used for stdio plumbing and
//! process-to-process data. Writes land immediately; the writer is parked
//! once the buffered total passes the cutoff and released when a reader
//! drains back under it. Closing is reference-counted so several holders
//! can share one pipe; the last release wakes a pending reader with EOF.

use crate::kernel::error::{ApiError, ErrorKind};
use pin_project_lite::pin_project;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// Buffered-byte cutoff above which writers block
pub const PIPE_BUFFER_CUTOFF: usize = 8192;

struct PipeState {
    /// Queued chunks, oldest first
    chunks: VecDeque<Vec<u8>>,
    /// Total bytes across all chunks
    buffered: usize,
    closed: bool,
    refs: u32,
    reader: Option<Waker>,
    writer: Option<Waker>,
}

pub struct InMemoryPipe {
    state: RefCell<PipeState>,
}

impl InMemoryPipe {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: RefCell::new(PipeState {
                chunks: VecDeque::new(),
                buffered: 0,
                closed: false,
                refs: 1,
                reader: None,
                writer: None,
            }),
        })
    }

    /// Take another reference to the pipe
    pub fn add_ref(&self) {
        self.state.borrow_mut().refs += 1;
    }

    /// Release one reference; the last release closes the pipe
    pub fn unref(&self) {
        let refs = {
            let mut state = self.state.borrow_mut();
            state.refs = state.refs.saturating_sub(1);
            state.refs
        };
        if refs == 0 {
            self.close();
        }
    }

    /// Mark the pipe closed and wake both waiter kinds
    pub fn close(&self) {
        let (reader, writer) = {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            (state.reader.take(), state.writer.take())
        };
        if let Some(w) = reader {
            w.wake();
        }
        if let Some(w) = writer {
            w.wake();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub fn buffered(&self) -> usize {
        self.state.borrow().buffered
    }

    /// Queue bytes for readers. The bytes land immediately; the returned
    /// future resolves with the full write length once the buffered total
    /// is back under the cutoff.
    pub fn write_buffer(self: &Rc<Self>, bytes: &[u8]) -> WriteBuffer {
        let waiting_reader = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return WriteBuffer {
                    pipe: self.clone(),
                    len: bytes.len(),
                    rejected: true,
                };
            }
            state.buffered += bytes.len();
            state.chunks.push_back(bytes.to_vec());
            state.reader.take()
        };
        if let Some(w) = waiting_reader {
            w.wake();
        }
        WriteBuffer {
            pipe: self.clone(),
            len: bytes.len(),
            rejected: false,
        }
    }

    /// Read up to `len` bytes. Resolves immediately when data is queued or
    /// the pipe is closed (empty result is EOF); otherwise parks until a
    /// write or close arrives.
    pub fn read_buffer(self: &Rc<Self>, len: usize) -> ReadBuffer {
        ReadBuffer {
            pipe: self.clone(),
            len,
        }
    }

    /// Queue bytes without waiting out backpressure; fails once closed.
    /// The sync-op path uses this, the async path goes through
    /// [`write_buffer`](Self::write_buffer).
    pub fn push_now(&self, bytes: &[u8]) -> Result<usize, ApiError> {
        let waiting_reader = {
            let mut state = self.state.borrow_mut();
            if state.closed {
                return Err(ApiError::new(
                    ErrorKind::BrokenPipe,
                    "write on closed pipe",
                ));
            }
            state.buffered += bytes.len();
            state.chunks.push_back(bytes.to_vec());
            state.reader.take()
        };
        if let Some(w) = waiting_reader {
            w.wake();
        }
        Ok(bytes.len())
    }

    /// Pull whole chunks in order, splitting the last one if it overruns
    pub fn drain_now(&self, len: usize) -> Vec<u8> {
        let mut state = self.state.borrow_mut();
        let mut out = Vec::with_capacity(len.min(state.buffered));
        while out.len() < len {
            let Some(mut chunk) = state.chunks.pop_front() else {
                break;
            };
            let want = len - out.len();
            if chunk.len() > want {
                let rest = chunk.split_off(want);
                state.chunks.push_front(rest);
            }
            out.extend_from_slice(&chunk);
        }
        state.buffered -= out.len();
        let writer = if state.buffered <= PIPE_BUFFER_CUTOFF {
            state.writer.take()
        } else {
            None
        };
        drop(state);
        if let Some(w) = writer {
            w.wake();
        }
        out
    }
}

pin_project! {
    /// Future returned by [`InMemoryPipe::write_buffer`]
    pub struct WriteBuffer {
        pipe: Rc<InMemoryPipe>,
        len: usize,
        rejected: bool,
    }
}

impl Future for WriteBuffer {
    type Output = Result<usize, ApiError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if *this.rejected {
            return Poll::Ready(Err(ApiError::new(
                ErrorKind::BrokenPipe,
                "write on closed pipe",
            )));
        }
        let mut state = this.pipe.state.borrow_mut();
        if state.closed || state.buffered <= PIPE_BUFFER_CUTOFF {
            return Poll::Ready(Ok(*this.len));
        }
        // One blocked writer at a time; a second one is a caller bug.
        if let Some(prev) = &state.writer
            && !prev.will_wake(cx.waker())
        {
            crate::klog!("pipe: second writer blocked behind a full pipe");
        }
        state.writer = Some(cx.waker().clone());
        Poll::Pending
    }
}

pin_project! {
    /// Future returned by [`InMemoryPipe::read_buffer`]
    pub struct ReadBuffer {
        pipe: Rc<InMemoryPipe>,
        len: usize,
    }
}

impl Future for ReadBuffer {
    type Output = Vec<u8>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let ready = {
            let state = this.pipe.state.borrow();
            state.buffered > 0 || state.closed
        };
        if ready {
            return Poll::Ready(this.pipe.drain_now(*this.len));
        }
        this.pipe.state.borrow_mut().reader = Some(cx.waker().clone());
        Poll::Pending
    }
}

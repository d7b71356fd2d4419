//! Per-connection request state machine, component 4.G.
//!
//! Grounded on `request.c`/`request.h`: a request moves through parsing,
//! (optionally) receiving a body, waiting on a dispatched disk job, and
//! writing a response, one state at a time. The master thread drives state
//! transitions from socket readiness and worker results; no state here
//! blocks or touches a disk fd — that's the worker pool's job
//! ([`crate::worker`]).

use olivehc_core::server::ItemHandle;
use olivehc_proto::{Method, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

/// Where a request currently sits in its lifecycle.
#[derive(Debug)]
pub enum Phase {
    /// Waiting for `\r\n\r\n`; `olivehc-proto::request_parse` is re-run on
    /// every readable event until it reports `Complete`.
    ReadingHeaders,
    /// A `PUT`/`POST` body is still arriving. `received` counts bytes
    /// already appended to the in-flight write buffer.
    ReadingBody { received: u64, total: u64 },
    /// Handed to the worker pool; waiting for a [`crate::worker::DiskResult`].
    AwaitingDisk,
    /// Writing the in-memory header prefix before `sendfile` takes over
    /// (or before closing out a bodyless response).
    WritingHeader { buf: Vec<u8>, pos: usize },
    /// Streaming a stored item's body via `sendfile`, `remaining` bytes
    /// left to send from `offset`.
    WritingBody { offset: u64, remaining: u64 },
    Done,
    Failed(StatusCode),
}

pub struct Request {
    pub id: u64,
    pub method: Method,
    pub path: Vec<u8>,
    pub phase: Phase,
    pub item: Option<ItemHandle>,
    pub range: Option<ResolvedRange>,
    /// Set once a `PUT`/`POST` commits; `server_item_put` data waiting on
    /// the disk write to land before the item is visible to lookups.
    pub putting: bool,
}

impl Request {
    pub fn new(id: u64) -> Self {
        Request {
            id,
            method: Method::Get,
            path: Vec::new(),
            phase: Phase::ReadingHeaders,
            item: None,
            range: None,
            putting: false,
        }
    }

    pub fn begin_body(&mut self, total: u64) {
        self.phase = Phase::ReadingBody { received: 0, total };
    }

    /// Records `n` freshly-read body bytes, transitioning to
    /// `AwaitingDisk` once the whole body has arrived.
    pub fn body_progress(&mut self, n: u64) {
        if let Phase::ReadingBody { received, total } = &mut self.phase {
            *received += n;
            if *received >= *total {
                self.phase = Phase::AwaitingDisk;
            }
        }
    }

    pub fn dispatch(&mut self) {
        self.phase = Phase::AwaitingDisk;
    }

    pub fn begin_response(&mut self, header: Vec<u8>) {
        self.phase = Phase::WritingHeader { buf: header, pos: 0 };
    }

    /// Advances the header-write cursor; once the whole buffer has gone
    /// out, moves on to the body phase if one was set up via
    /// [`Request::begin_body_stream`], otherwise finishes.
    pub fn header_progress(&mut self, n: usize, body: Option<(u64, u64)>) {
        if let Phase::WritingHeader { buf, pos } = &mut self.phase {
            *pos += n;
            if *pos >= buf.len() {
                self.phase = match body {
                    Some((offset, remaining)) => Phase::WritingBody { offset, remaining },
                    None => Phase::Done,
                };
            }
        }
    }

    pub fn body_write_progress(&mut self, n: u64) {
        if let Phase::WritingBody { offset, remaining } = &mut self.phase {
            *offset += n;
            *remaining = remaining.saturating_sub(n);
            if *remaining == 0 {
                self.phase = Phase::Done;
            }
        }
    }

    pub fn fail(&mut self, status: StatusCode) {
        self.phase = Phase::Failed(status);
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done | Phase::Failed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_progress_transitions_once_total_is_reached() {
        let mut req = Request::new(1);
        req.begin_body(10);
        req.body_progress(4);
        assert!(matches!(req.phase, Phase::ReadingBody { received: 4, total: 10 }));
        req.body_progress(6);
        assert!(matches!(req.phase, Phase::AwaitingDisk));
    }

    #[test]
    fn header_progress_moves_to_body_stream_when_present() {
        let mut req = Request::new(1);
        req.begin_response(vec![0u8; 20]);
        req.header_progress(20, Some((1000, 50)));
        assert!(matches!(req.phase, Phase::WritingBody { offset: 1000, remaining: 50 }));
    }

    #[test]
    fn header_progress_finishes_when_no_body_follows() {
        let mut req = Request::new(1);
        req.begin_response(vec![0u8; 5]);
        req.header_progress(5, None);
        assert!(req.is_done());
    }

    #[test]
    fn body_write_progress_counts_down_to_done() {
        let mut req = Request::new(1);
        req.phase = Phase::WritingBody { offset: 0, remaining: 30 };
        req.body_write_progress(10);
        assert!(matches!(req.phase, Phase::WritingBody { offset: 10, remaining: 20 }));
        req.body_write_progress(20);
        assert!(req.is_done());
    }

    #[test]
    fn fail_marks_request_done() {
        let mut req = Request::new(1);
        req.fail(StatusCode::NOT_FOUND);
        assert!(req.is_done());
    }
}

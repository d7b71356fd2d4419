//! Worker pool, component 4.H (worker half).
//!
//! Grounded on `worker.c`: the master thread never touches a disk fd
//! directly. It hands a read or write job to a worker over one channel
//! and the worker hands the result back over another — `worker.c`'s two
//! pipes per worker, here a [`std::sync::mpsc::sync_channel`] pair per
//! worker for the dispatch direction and one shared results channel for
//! the return direction. `sync_channel`'s bounded queue and `try_send`
//! stand in for the pipe's `O_NONBLOCK` + `EAGAIN`/short-write semantics
//! the original leans on to apply backpressure without blocking the
//! master's event loop.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::Bytes;

/// A unit of disk work dispatched to a worker thread.
#[derive(Debug)]
pub struct DiskJob {
    pub request_id: u64,
    pub op: DiskOp,
}

#[derive(Debug)]
pub enum DiskOp {
    Read { file: Arc<File>, offset: u64, length: u32 },
    Write { file: Arc<File>, offset: u64, data: Bytes },
}

#[derive(Debug)]
pub enum DiskResult {
    Read { request_id: u64, data: Bytes },
    Write { request_id: u64, written: usize },
    Error { request_id: u64, message: String },
}

/// Depth of each worker's inbound job queue. `worker.c` sizes its pipes to
/// the kernel default; a bounded channel of modest depth gives the same
/// "back off, don't block" behavior without relying on OS pipe buffering.
const QUEUE_DEPTH: usize = 256;

pub struct WorkerPool {
    senders: Vec<SyncSender<DiskJob>>,
    results_rx: Receiver<DiskResult>,
    cursor: usize,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// `worker_create` for `count` workers, each an OS thread running
    /// [`worker_entry`].
    pub fn spawn(count: usize) -> Self {
        let (results_tx, results_rx) = mpsc::channel();
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (job_tx, job_rx) = mpsc::sync_channel(QUEUE_DEPTH);
            let results_tx = results_tx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("olivehc-worker-{id}"))
                .spawn(move || worker_entry(job_rx, results_tx))
                .expect("failed to spawn worker thread");
            senders.push(job_tx);
            handles.push(handle);
        }

        WorkerPool {
            senders,
            results_rx,
            cursor: 0,
            handles,
        }
    }

    /// Round-robin dispatch starting from the cursor after the last
    /// dispatch, matching `worker_dispatch`'s rotation so load spreads
    /// evenly rather than favoring worker 0. Returns the job back to the
    /// caller if every worker's queue is full or disconnected.
    pub fn dispatch(&mut self, mut job: DiskJob) -> Result<(), DiskJob> {
        let n = self.senders.len();
        if n == 0 {
            return Err(job);
        }
        for _ in 0..n {
            let idx = self.cursor;
            self.cursor = (self.cursor + 1) % n;
            match self.senders[idx].try_send(job) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(returned)) => job = returned,
                Err(TrySendError::Disconnected(returned)) => job = returned,
            }
        }
        Err(job)
    }

    /// Drains one completed job's result, if any are ready. The master
    /// loop calls this after every `poll` wakeup alongside socket events.
    pub fn try_recv_result(&self) -> Option<DiskResult> {
        self.results_rx.try_recv().ok()
    }

    /// `worker_delete` for every worker: dropping the senders closes each
    /// worker's inbound channel, which ends its `recv` loop; `join`s wait
    /// for in-flight jobs to finish before returning.
    pub fn shutdown(mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

/// `worker_entry`: pull jobs until the dispatch channel closes, performing
/// positioned reads/writes so no worker needs to seek a shared fd (every
/// device fd is opened independently per the server's own handle to it).
fn worker_entry(jobs: Receiver<DiskJob>, results: mpsc::Sender<DiskResult>) {
    while let Ok(job) = jobs.recv() {
        let result = match job.op {
            DiskOp::Read { file, offset, length } => {
                let mut buf = vec![0u8; length as usize];
                match file.read_at(&mut buf, offset) {
                    Ok(n) => {
                        buf.truncate(n);
                        DiskResult::Read { request_id: job.request_id, data: Bytes::from(buf) }
                    }
                    Err(e) => io_error(job.request_id, e),
                }
            }
            DiskOp::Write { file, offset, data } => match file.write_at(&data, offset) {
                Ok(n) => DiskResult::Write { request_id: job.request_id, written: n },
                Err(e) => io_error(job.request_id, e),
            },
        };
        // A disconnected results channel means the master has shut down;
        // nothing further to do but let the worker exit on the next recv.
        if results.send(result).is_err() {
            break;
        }
    }
}

fn io_error(request_id: u64, e: io::Error) -> DiskResult {
    DiskResult::Error { request_id, message: e.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn tempfile_with(contents: &[u8]) -> Arc<File> {
        let path = std::env::temp_dir().join(format!(
            "olivehc-worker-test-{:?}-{}",
            std::thread::current().id(),
            contents.len()
        ));
        let mut f = File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        drop(f);
        Arc::new(File::open(&path).unwrap())
    }

    #[test]
    fn dispatch_round_robins_across_workers() {
        let mut pool = WorkerPool::spawn(2);
        let file = tempfile_with(b"hello world");

        for i in 0..4 {
            pool.dispatch(DiskJob {
                request_id: i,
                op: DiskOp::Read { file: file.clone(), offset: 0, length: 5 },
            })
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            loop {
                if let Some(r) = pool.try_recv_result() {
                    seen.push(r);
                    break;
                }
                std::thread::yield_now();
            }
        }
        assert_eq!(seen.len(), 4);
        pool.shutdown();
    }

    #[test]
    fn read_returns_requested_slice() {
        let mut pool = WorkerPool::spawn(1);
        let file = tempfile_with(b"0123456789");
        pool.dispatch(DiskJob {
            request_id: 7,
            op: DiskOp::Read { file, offset: 3, length: 4 },
        })
        .unwrap();

        let result = loop {
            if let Some(r) = pool.try_recv_result() {
                break r;
            }
            std::thread::yield_now();
        };
        match result {
            DiskResult::Read { request_id, data } => {
                assert_eq!(request_id, 7);
                assert_eq!(&data[..], b"3456");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        pool.shutdown();
    }
}

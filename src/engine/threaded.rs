//! Thread-pool queue backend
//!
//! Always-available fallback: one worker thread per queue-depth slot runs
//! blocking pread/pwrite and reports completions over a channel. Partial
//! transfers are retried in place (as is EINTR), so a completion carries
//! either the full requested length, a short count at end-of-file, or an
//! error.

use super::{IoCompletion, IoOp, IoQueue, IoRequest};
use crate::Result;
use anyhow::Context;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::thread::JoinHandle;

pub struct ThreadedQueue {
    req_tx: Option<Sender<IoRequest>>,
    done_rx: Receiver<IoCompletion>,
    workers: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl ThreadedQueue {
    pub fn new(depth: usize) -> Self {
        let (req_tx, req_rx) = unbounded::<IoRequest>();
        let (done_tx, done_rx) = unbounded::<IoCompletion>();

        let workers = (0..depth.max(1))
            .map(|i| {
                let rx = req_rx.clone();
                let tx = done_tx.clone();
                std::thread::Builder::new()
                    .name(format!("io-worker-{}", i))
                    .spawn(move || worker_loop(rx, tx))
                    .expect("failed to spawn io worker")
            })
            .collect();

        Self {
            req_tx: Some(req_tx),
            done_rx,
            workers,
            in_flight: 0,
        }
    }
}

fn worker_loop(rx: Receiver<IoRequest>, tx: Sender<IoCompletion>) {
    while let Ok(req) = rx.recv() {
        let result = match req.op {
            IoOp::Read => do_read(req.fd, req.buffer, req.length, req.offset),
            IoOp::Write => do_write(req.fd, req.buffer as *const u8, req.length, req.offset),
        };
        let completion = IoCompletion {
            token: req.token,
            op: req.op,
            result,
        };
        if tx.send(completion).is_err() {
            // Queue dropped mid-flight; nothing left to report to.
            return;
        }
    }
}

/// Positioned read, retrying partial transfers and EINTR. A short return
/// only happens at end-of-file.
fn do_read(fd: i32, buffer: *mut u8, length: usize, offset: u64) -> Result<usize> {
    let mut total_read = 0;
    let mut current_offset = offset;

    while total_read < length {
        let remaining = length - total_read;
        let buf_ptr = unsafe { buffer.add(total_read) };

        // SAFETY: the submit contract guarantees the buffer outlives the
        // operation and covers `length` bytes.
        let result = unsafe {
            libc::pread(
                fd,
                buf_ptr as *mut libc::c_void,
                remaining,
                current_offset as libc::off_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "pread failed: fd={}, offset={}, length={}",
                fd, current_offset, remaining
            ));
        }

        if result == 0 {
            break;
        }

        let bytes_read = result as usize;
        total_read += bytes_read;
        current_offset += bytes_read as u64;
    }

    Ok(total_read)
}

/// Positioned write, retrying partial transfers and EINTR.
fn do_write(fd: i32, buffer: *const u8, length: usize, offset: u64) -> Result<usize> {
    let mut total_written = 0;
    let mut current_offset = offset;

    while total_written < length {
        let remaining = length - total_written;
        let buf_ptr = unsafe { buffer.add(total_written) };

        // SAFETY: see do_read.
        let result = unsafe {
            libc::pwrite(
                fd,
                buf_ptr as *const libc::c_void,
                remaining,
                current_offset as libc::off_t,
            )
        };

        if result < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).context(format!(
                "pwrite failed: fd={}, offset={}, length={}",
                fd, current_offset, remaining
            ));
        }

        let bytes_written = result as usize;
        total_written += bytes_written;
        current_offset += bytes_written as u64;
    }

    Ok(total_written)
}

impl IoQueue for ThreadedQueue {
    fn submit(&mut self, req: IoRequest) -> Result<()> {
        let tx = self
            .req_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("queue already shut down"))?;
        tx.send(req).map_err(|_| anyhow::anyhow!("io workers gone"))?;
        self.in_flight += 1;
        Ok(())
    }

    fn wait_completions(&mut self) -> Result<Vec<IoCompletion>> {
        let mut completions = Vec::new();
        if self.in_flight == 0 {
            return Ok(completions);
        }

        let first = self
            .done_rx
            .recv()
            .map_err(|_| anyhow::anyhow!("io workers gone"))?;
        completions.push(first);
        while let Ok(more) = self.done_rx.try_recv() {
            completions.push(more);
        }
        self.in_flight -= completions.len();

        Ok(completions)
    }

    fn shutdown(&mut self) -> Result<()> {
        while self.in_flight > 0 {
            let _ = self.wait_completions()?;
        }
        // Closing the request channel ends the worker loops.
        self.req_tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "thread-pool"
    }
}

impl Drop for ThreadedQueue {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

//! io_uring queue backend
//!
//! Uses the kernel's native async I/O interface. Submission pushes an SQE;
//! `wait_completions` submits the queued entries and blocks for at least one
//! CQE, then drains everything already finished. Requires Linux 5.1+; the
//! caller falls back to the thread pool when ring creation fails.

use super::{IoCompletion, IoOp, IoQueue, IoRequest};
use crate::Result;
use anyhow::Context;
use io_uring::{opcode, types, IoUring};
use std::collections::HashMap;

pub struct UringQueue {
    ring: IoUring,
    /// token -> operation type, for completion mapping
    pending: HashMap<u64, IoOp>,
}

impl UringQueue {
    pub fn new(depth: usize) -> Result<Self> {
        let ring = IoUring::new(depth.max(1) as u32)
            .context("Failed to create io_uring instance")?;
        Ok(Self {
            ring,
            pending: HashMap::with_capacity(depth),
        })
    }

    fn drain_ready(&mut self, completions: &mut Vec<IoCompletion>) {
        for cqe in self.ring.completion() {
            let token = cqe.user_data();
            let code = cqe.result();
            let op = self.pending.remove(&token).unwrap_or(IoOp::Read);

            let result = if code >= 0 {
                Ok(code as usize)
            } else {
                Err(std::io::Error::from_raw_os_error(-code))
                    .context(format!("{} operation failed", op))
            };

            completions.push(IoCompletion { token, op, result });
        }
    }
}

impl IoQueue for UringQueue {
    fn submit(&mut self, req: IoRequest) -> Result<()> {
        self.pending.insert(req.token, req.op);

        let entry = match req.op {
            IoOp::Read => opcode::Read::new(types::Fd(req.fd), req.buffer, req.length as u32)
                .offset(req.offset)
                .build()
                .user_data(req.token),
            IoOp::Write => {
                opcode::Write::new(types::Fd(req.fd), req.buffer as *const u8, req.length as u32)
                    .offset(req.offset)
                    .build()
                    .user_data(req.token)
            }
        };

        // SAFETY: the entry references a buffer the caller keeps alive until
        // the completion is returned.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                // Submission queue full: flush it and retry once.
                self.ring.submit().context("io_uring submit failed")?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| anyhow::anyhow!("Submission queue full"))?;
            }
        }

        Ok(())
    }

    fn wait_completions(&mut self) -> Result<Vec<IoCompletion>> {
        let mut completions = Vec::new();
        if self.pending.is_empty() {
            return Ok(completions);
        }

        self.ring
            .submit_and_wait(1)
            .context("io_uring submit_and_wait failed")?;
        self.drain_ready(&mut completions);

        // A woken wait with an empty CQ can happen; keep waiting until at
        // least one completion materializes.
        while completions.is_empty() && !self.pending.is_empty() {
            self.ring
                .submit_and_wait(1)
                .context("io_uring submit_and_wait failed")?;
            self.drain_ready(&mut completions);
        }

        Ok(completions)
    }

    fn shutdown(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            let _ = self.wait_completions()?;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "io_uring"
    }
}

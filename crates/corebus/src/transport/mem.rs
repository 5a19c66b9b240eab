// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-process paired transport.
//!
//! [`pair`] returns two connected endpoints backed by shared queues. Delivery
//! is atomic (a message is queued whole or not at all), which makes the pair
//! the in-tree analog of a kernel transport, and the workhorse of the test
//! suites: one end goes into a connection, the other drives the far side.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::id::ServerId;
use crate::message::Message;
use crate::transport::{Transport, WriteStatus};

/// Messages buffered per direction before writes report `Blocked`.
const PAIR_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Lane {
    queue: Mutex<VecDeque<Message>>,
    closed: AtomicBool,
}

/// One endpoint of an in-process transport pair.
#[derive(Debug)]
pub struct PairTransport {
    /// Messages we send; the peer reads from it.
    tx: Arc<Lane>,
    /// Messages the peer sent; we read from it.
    rx: Arc<Lane>,
    server_id: Option<ServerId>,
    closed: bool,
}

/// Create a connected transport pair.
pub fn pair() -> (PairTransport, PairTransport) {
    pair_with_server_id(None)
}

/// Create a connected pair whose endpoints present `server_id` as the peer
/// identity, for tests that pin a `guid=`.
pub fn pair_with_server_id(server_id: Option<ServerId>) -> (PairTransport, PairTransport) {
    let ab = Arc::new(Lane::default());
    let ba = Arc::new(Lane::default());

    let a = PairTransport {
        tx: ab.clone(),
        rx: ba.clone(),
        server_id,
        closed: false,
    };
    let b = PairTransport {
        tx: ba,
        rx: ab,
        server_id,
        closed: false,
    };
    (a, b)
}

impl PairTransport {
    fn lock(lane: &Lane) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        // A poisoned lane means a peer test thread panicked; the messages
        // themselves are still intact.
        match lane.queue.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of messages waiting for the peer to read.
    pub fn outbound_len(&self) -> usize {
        Self::lock(&self.tx).len()
    }
}

impl Transport for PairTransport {
    fn continue_connect(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn continue_auth(&mut self) -> Result<bool> {
        Ok(true)
    }

    fn auth_needs_write(&self) -> bool {
        false
    }

    fn read_message(&mut self) -> Result<Option<Message>> {
        if self.closed {
            return Err(Error::NotConnected);
        }

        let mut queue = Self::lock(&self.rx);
        if let Some(m) = queue.pop_front() {
            return Ok(Some(m));
        }

        if self.rx.closed.load(Ordering::Acquire) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer endpoint closed",
            )));
        }
        Ok(None)
    }

    fn write_message(&mut self, message: &Message, _windex: &mut usize) -> Result<WriteStatus> {
        if self.closed {
            return Err(Error::NotConnected);
        }
        if self.tx.closed.load(Ordering::Acquire) {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer endpoint closed",
            )));
        }

        let mut queue = Self::lock(&self.tx);
        if queue.len() >= PAIR_CAPACITY {
            return Ok(WriteStatus::Blocked);
        }
        queue.push_back(message.clone());
        Ok(WriteStatus::Complete)
    }

    fn atomic_delivery(&self) -> bool {
        true
    }

    fn supports_fds(&self) -> bool {
        true
    }

    fn input_fd(&self) -> Option<RawFd> {
        None
    }

    fn output_fd(&self) -> Option<RawFd> {
        None
    }

    fn server_id(&self) -> Option<ServerId> {
        self.server_id
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.tx.closed.store(true, Ordering::Release);
            self.rx.closed.store(true, Ordering::Release);
        }
    }
}

impl Drop for PairTransport {
    fn drop(&mut self) {
        self.close();
    }
}

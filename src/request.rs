// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! USB transfers and the arena that keeps track of the streaming requests.

use thiserror::Error;

/// Completion status of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    /// The device stalled the endpoint.
    IoRefused,
    /// The transfer was malformed or rejected by the host controller.
    IoInvalid,
    /// The transfer has been cancelled before completion.
    Cancelled,
    /// Any other failure.
    Failed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("the device refused the transfer")]
    IoRefused,
    #[error("invalid transfer")]
    IoInvalid,
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer returned {actual} bytes, expected at least {expected}")]
    ShortTransfer { actual: usize, expected: usize },
    #[error("transfer failed")]
    Failed,
}

impl TransferError {
    /// Whether this error leaves the endpoint halted and needing a reset.
    pub fn needs_reset(&self) -> bool {
        matches!(self, TransferError::IoRefused | TransferError::IoInvalid)
    }

    pub fn errno(&self) -> i32 {
        match self {
            TransferError::IoRefused => libc::EPIPE,
            TransferError::IoInvalid => libc::EINVAL,
            TransferError::Cancelled => libc::ECANCELED,
            TransferError::ShortTransfer { .. } => libc::EPROTO,
            TransferError::Failed => libc::EIO,
        }
    }
}

/// Setup packet of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// A streaming transfer and its data buffer.
#[derive(Debug)]
pub struct UsbRequest {
    /// Slot of this request in the arena of the stream that owns it.
    pub index: usize,
    pub endpoint: u8,
    /// Length of the transfer to submit.
    pub length: usize,
    pub data: Vec<u8>,
    /// Bytes actually transferred, valid after completion.
    pub actual: usize,
    pub status: TransferStatus,
}

impl UsbRequest {
    pub fn new(endpoint: u8, length: usize) -> Self {
        Self {
            index: 0,
            endpoint,
            length,
            data: vec![0u8; length],
            actual: 0,
            status: TransferStatus::Ok,
        }
    }

    /// Data received by a completed transfer.
    pub fn received(&self) -> &[u8] {
        &self.data[..self.actual.min(self.data.len())]
    }
}

/// Indexed pool of the streaming requests.
///
/// Every request has a stable slot. A slot is either filled, meaning the request is owned by the
/// stream and can be queued, or empty while the request is in flight.
#[derive(Debug, Default)]
pub struct RequestPool {
    slots: Vec<Option<UsbRequest>>,
    free: Vec<usize>,
}

impl RequestPool {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of requests managed by the pool, in flight or not.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of requests currently owned by the pool.
    pub fn num_free(&self) -> usize {
        self.free.len()
    }

    /// Whether every request is back in the pool.
    pub fn all_free(&self) -> bool {
        self.free.len() == self.slots.len()
    }

    /// Whether the pool can be reused for `count` requests of `size` bytes on `endpoint`.
    pub fn fits(&self, endpoint: u8, size: usize, count: usize) -> bool {
        self.all_free()
            && self.slots.len() >= count
            && self
                .slots
                .iter()
                .flatten()
                .all(|req| req.endpoint == endpoint && req.data.len() >= size)
    }

    /// Replaces the content of the pool with `requests`, which all become free.
    ///
    /// Returns the previous requests.
    pub fn replace(&mut self, requests: Vec<UsbRequest>) -> Vec<UsbRequest> {
        let old = self.slots.drain(..).flatten().collect();
        self.free.clear();
        for (index, mut request) in requests.into_iter().enumerate() {
            request.index = index;
            self.slots.push(Some(request));
            self.free.push(index);
        }
        old
    }

    /// Sets the transfer length of all free requests to `length`.
    pub fn set_length(&mut self, length: usize) {
        for request in self.slots.iter_mut().flatten() {
            request.length = length.min(request.data.len());
        }
    }

    /// Takes a free request out of the pool.
    pub fn take(&mut self) -> Option<UsbRequest> {
        let index = self.free.pop()?;
        self.slots[index].take()
    }

    /// Takes all free requests out of the pool.
    pub fn take_all(&mut self) -> Vec<UsbRequest> {
        std::iter::from_fn(|| self.take()).collect()
    }

    /// Returns a request previously taken from the pool.
    ///
    /// Requests that do not belong to the pool, or whose slot is already filled, are dropped and
    /// `false` is returned.
    pub fn put(&mut self, request: UsbRequest) -> bool {
        let index = request.index;
        match self.slots.get_mut(index) {
            Some(slot) if slot.is_none() => {
                *slot = Some(request);
                self.free.push(index);
                true
            }
            _ => false,
        }
    }
}

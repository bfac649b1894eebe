// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Heap-backed implementation of [`FrameBufferPool`].

use thiserror::Error;

use crate::FrameBufferPool;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no buffer with index {0}")]
    InvalidIndex(u32),
    #[error("buffer {0} is not held by the consumer")]
    NotReading(u32),
}

impl PoolError {
    pub fn errno(&self) -> i32 {
        match self {
            PoolError::InvalidIndex(_) => libc::EINVAL,
            PoolError::NotReading(_) => libc::EALREADY,
        }
    }
}

/// Ownership of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Available for the next frame.
    Free,
    /// A frame is being written into the buffer.
    Writing,
    /// The buffer holds a frame and is owned by the consumer.
    Reading,
}

#[derive(Debug)]
struct FrameBuffer {
    data: Vec<u8>,
    state: BufferState,
}

/// Fixed set of equally-sized buffers living on the heap.
///
/// The consumer index of a buffer is its index in the pool.
#[derive(Debug)]
pub struct VecFramePool {
    buffers: Vec<FrameBuffer>,
    buffer_size: usize,
}

impl VecFramePool {
    pub fn new(count: usize, buffer_size: usize) -> Self {
        Self {
            buffers: (0..count)
                .map(|_| FrameBuffer {
                    data: vec![0u8; buffer_size],
                    state: BufferState::Free,
                })
                .collect(),
            buffer_size,
        }
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn state(&self, index: usize) -> Option<BufferState> {
        self.buffers.get(index).map(|buffer| buffer.state)
    }

    /// Returns the content of buffer `index`, whatever its state.
    pub fn buffer(&self, index: usize) -> Option<&[u8]> {
        self.buffers.get(index).map(|buffer| buffer.data.as_slice())
    }
}

impl FrameBufferPool for VecFramePool {
    fn try_acquire_for_write(&mut self) -> Option<usize> {
        let index = self
            .buffers
            .iter()
            .position(|buffer| buffer.state == BufferState::Free)?;
        self.buffers[index].state = BufferState::Writing;
        Some(index)
    }

    fn buffer_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        match self.buffers.get_mut(index) {
            Some(buffer) if buffer.state == BufferState::Writing => Some(&mut buffer.data),
            _ => None,
        }
    }

    fn release_write_lock(&mut self, index: usize) -> u32 {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.state = BufferState::Reading;
        }
        index as u32
    }

    fn release_unused(&mut self, index: usize) {
        if let Some(buffer) = self.buffers.get_mut(index) {
            buffer.state = BufferState::Free;
        }
    }

    fn release_frame(&mut self, consumer_index: u32) -> Result<(), PoolError> {
        let buffer = self
            .buffers
            .get_mut(consumer_index as usize)
            .ok_or(PoolError::InvalidIndex(consumer_index))?;
        if buffer.state != BufferState::Reading {
            return Err(PoolError::NotReading(consumer_index));
        }
        buffer.state = BufferState::Free;
        Ok(())
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_lifecycle() {
        let mut pool = VecFramePool::new(2, 16);
        assert_eq!(pool.buffer_size(), 16);

        let first = pool.try_acquire_for_write().unwrap();
        let second = pool.try_acquire_for_write().unwrap();
        assert_ne!(first, second);
        assert_eq!(pool.try_acquire_for_write(), None);

        pool.buffer_mut(first).unwrap()[0] = 42;
        let consumer_index = pool.release_write_lock(first);
        assert_eq!(pool.state(first), Some(BufferState::Reading));
        assert!(pool.buffer_mut(first).is_none());
        assert_eq!(pool.buffer(first).unwrap()[0], 42);

        pool.release_unused(second);
        assert_eq!(pool.state(second), Some(BufferState::Free));

        assert_eq!(pool.release_frame(consumer_index), Ok(()));
        assert_eq!(pool.state(first), Some(BufferState::Free));
    }

    #[test]
    fn release_errors() {
        let mut pool = VecFramePool::new(1, 16);
        assert_eq!(pool.release_frame(3), Err(PoolError::InvalidIndex(3)));
        assert_eq!(pool.release_frame(0), Err(PoolError::NotReading(0)));

        let index = pool.try_acquire_for_write().unwrap();
        // Still being written.
        assert_eq!(
            pool.release_frame(index as u32),
            Err(PoolError::NotReading(0))
        );
        let consumer_index = pool.release_write_lock(index);
        pool.release_frame(consumer_index).unwrap();
        assert_eq!(
            pool.release_frame(consumer_index).unwrap_err().errno(),
            libc::EALREADY
        );
    }
}

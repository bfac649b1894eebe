// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate contains the host-independent core of a USB Video Class (UVC) camera driver.
//!
//! It takes care of discovering what a camera can stream from its descriptors, of negotiating a
//! stream with it, and of turning the raw payloads it sends back into complete, timestamped video
//! frames. Everything that depends on the host (USB transfers, clocks, frame memory, and the
//! destination of the frames) is reached through a handful of traits, so the same driver core can
//! run on top of any USB stack.
//!
//! # Traits to implement by the host
//!
//! * USB transfers are submitted through [`UsbIoProvider`], which also exposes the host clocks via
//!   its [`HostClock`] supertrait.
//! * Frames are assembled into buffers handed out by a [`FrameBufferPool`]. [`pool::VecFramePool`]
//!   is a ready-to-use heap-backed implementation.
//! * Completed frames, errors and buffer exhaustion are reported to a [`StreamConsumer`].
//!
//! # Anatomy of a stream
//!
//! The configuration descriptor of the device is first parsed with
//! [`descriptors::parse_streaming_settings`]. The result is used to create a
//! [`stream::UvcStream`], which lets the client enumerate the supported formats, select one (this
//! runs the Probe/Commit negotiation with the device), and start and stop streaming.
//!
//! While streaming, every completed transfer goes through the [`frame::FrameAssembler`], which
//! splits payloads into frames and asks the [`timestamp`] module to compute their capture time.
//!
//! A software camera implementing [`UsbIoProvider`] is available in the `devices::fake_camera`
//! module, behind the `fake-camera` feature.

pub mod builder;
pub mod descriptors;
pub mod devices;
pub mod format;
pub mod frame;
pub mod io;
pub mod negotiate;
pub mod pool;
pub mod protocol;
pub mod request;
pub mod stream;
pub mod timestamp;

pub use descriptors::parse_streaming_settings;
pub use descriptors::StreamingSettings;
pub use format::VideoFormat;
pub use frame::FrameEvent;
pub use frame::FrameStatus;
pub use request::ControlSetup;
pub use request::TransferError;
pub use request::UsbRequest;
pub use stream::StreamError;
pub use stream::StreamOptions;
pub use stream::UvcStream;

use pool::PoolError;

/// Closure invoked by a [`UsbIoProvider`] when a queued request completes.
pub type CompletionCallback = Box<dyn FnOnce(UsbRequest) + Send>;

/// Clocks of the host the device is attached to.
pub trait HostClock {
    /// Returns the current start-of-frame counter of the bus the device is on.
    ///
    /// Only the 11 least significant bits are used.
    fn current_host_sof(&self) -> u64;

    /// Returns the current time of the monotonic clock, in nanoseconds, or 0 if it cannot be read.
    fn monotonic_time_ns(&self) -> i64 {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid, writable timespec.
        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } < 0 {
            log::error!(
                "failed to read the monotonic clock: {}",
                std::io::Error::last_os_error()
            );
            // Reported to consumers as an unknown capture time.
            return 0;
        }
        ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
    }
}

/// Trait for performing USB transfers with the device.
pub trait UsbIoProvider: HostClock + Send + Sync {
    /// Allocates `count` requests of `size` bytes for `endpoint`.
    fn allocate_requests(
        &self,
        endpoint: u8,
        size: usize,
        count: usize,
    ) -> anyhow::Result<Vec<UsbRequest>> {
        Ok((0..count)
            .map(|_| UsbRequest::new(endpoint, size))
            .collect())
    }

    /// Submits `request` to its endpoint. `completion` is called with the request once it has
    /// completed or been cancelled.
    ///
    /// `completion` must not be called from within this method.
    fn queue(&self, request: UsbRequest, completion: CompletionCallback);

    /// Cancels all the requests queued on `endpoint`.
    ///
    /// The completion of every cancelled request must have been called by the time this method
    /// returns.
    fn cancel_all(&self, endpoint: u8);

    /// Selects alternate setting `alt_setting` of interface `interface`.
    fn set_alternate_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError>;

    /// Performs a control transfer on the default endpoint. `data` is the data stage, read from
    /// or written to depending on the direction of `setup`.
    ///
    /// Returns the number of bytes actually transferred.
    fn control_transfer(&self, setup: ControlSetup, data: &mut [u8])
        -> Result<usize, TransferError>;

    /// Clears the halt condition of `endpoint`.
    fn reset_endpoint(&self, endpoint: u8) -> Result<(), TransferError>;

    /// Largest transfer the host can perform on `endpoint`, in bytes.
    fn max_transfer_size(&self, endpoint: u8) -> usize;
}

/// Trait for the memory frames are assembled into.
///
/// Buffers are identified by their index. A buffer acquired for writing is owned by the stream
/// until it is either handed to the consumer with [`FrameBufferPool::release_write_lock`], or
/// given back with [`FrameBufferPool::release_unused`].
pub trait FrameBufferPool: Send {
    /// Acquires a free buffer for writing, if there is one. Never blocks.
    fn try_acquire_for_write(&mut self) -> Option<usize>;

    /// Returns the memory of buffer `index`, if it is currently acquired for writing.
    fn buffer_mut(&mut self, index: usize) -> Option<&mut [u8]>;

    /// Hands buffer `index` over to the consumer, and returns the index the consumer knows it
    /// by.
    fn release_write_lock(&mut self, index: usize) -> u32;

    /// Gives back buffer `index` without handing it to the consumer.
    fn release_unused(&mut self, index: usize);

    /// Called when the consumer is done with the buffer it knows as `consumer_index`.
    fn release_frame(&mut self, consumer_index: u32) -> Result<(), PoolError>;

    /// Size of every buffer of the pool, in bytes.
    fn buffer_size(&self) -> usize;
}

/// Trait for receiving the frames produced by a stream.
pub trait StreamConsumer: Send + Sync {
    /// Called for each frame that completed, successfully or not.
    ///
    /// This is never called with the stream's lock held, so it is safe to call back into the
    /// stream from here.
    fn on_frame_available(&self, event: FrameEvent);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SystemClock;

    impl HostClock for SystemClock {
        fn current_host_sof(&self) -> u64 {
            0
        }
    }

    #[test]
    fn default_monotonic_clock() {
        let first = SystemClock.monotonic_time_ns();
        let second = SystemClock.monotonic_time_ns();
        assert!(first > 0);
        assert!(second >= first);
    }
}

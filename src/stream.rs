// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Streaming state machine of a UVC device.
//!
//! [`UvcStream`] is the entry point of the client: it enumerates formats, negotiates the stream,
//! and drives the streaming requests. Completions of these requests come back on whatever thread
//! the [`UsbIoProvider`] runs them on, so all the mutable state lives behind a single mutex. The
//! consumer is always called after this mutex has been released.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;

use anyhow::Context;
use log::debug;
use log::error;
use log::warn;
use thiserror::Error;

use crate::descriptors::StreamingSettings;
use crate::format::VideoFormat;
use crate::frame::FrameAssembler;
use crate::negotiate::negotiate;
use crate::negotiate::NegotiatedConfig;
use crate::pool::PoolError;
use crate::request::RequestPool;
use crate::request::TransferError;
use crate::request::TransferStatus;
use crate::request::UsbRequest;
use crate::CompletionCallback;
use crate::FrameBufferPool;
use crate::StreamConsumer;
use crate::UsbIoProvider;

/// Maximum number of formats returned by a single call to [`UvcStream::get_formats`].
pub const MAX_FORMATS_PER_RESPONSE: usize = 16;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("operation not allowed in the current state: {0}")]
    BadState(&'static str),
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgs(&'static str),
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("buffer pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("cannot allocate requests: {0:#}")]
    NoMemory(anyhow::Error),
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl StreamError {
    /// Error code to report to a client.
    pub fn errno(&self) -> i32 {
        match self {
            StreamError::BadState(_) => libc::EBUSY,
            StreamError::NotSupported(_) => libc::ENOTSUP,
            StreamError::InvalidArgs(_) => libc::EINVAL,
            StreamError::Transfer(e) => e.errno(),
            StreamError::Pool(e) => e.errno(),
            StreamError::NoMemory(_) => libc::ENOMEM,
            StreamError::Internal(_) => libc::EIO,
        }
    }
}

/// Tunables of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    /// Number of streaming requests kept in flight.
    pub num_requests: usize,
    /// Frame sizes are rounded up to a multiple of this.
    pub page_size: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            num_requests: 8,
            page_size: 0x1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    /// No format has been negotiated yet.
    Stopped,
    /// A format has been negotiated, the stream can be started.
    Ready,
    Streaming,
    /// Waiting for the in-flight requests to come back.
    Stopping,
}

struct Inner<B> {
    state: StreamingState,
    config: Option<NegotiatedConfig>,
    requests: RequestPool,
    assembler: FrameAssembler,
    pool: Option<B>,
}

struct Shared<P, B, C> {
    settings: StreamingSettings,
    io: P,
    consumer: C,
    options: StreamOptions,
    inner: Mutex<Inner<B>>,
}

impl<P, B, C> Shared<P, B, C>
where
    P: UsbIoProvider + 'static,
    B: FrameBufferPool + 'static,
    C: StreamConsumer + 'static,
{
    fn lock(&self) -> MutexGuard<'_, Inner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn completion(self: &Arc<Self>) -> CompletionCallback {
        let stream: Weak<Self> = Arc::downgrade(self);
        Box::new(move |request| {
            if let Some(stream) = stream.upgrade() {
                stream.on_request_complete(request);
            }
        })
    }

    fn queue(self: &Arc<Self>, mut request: UsbRequest) {
        request.actual = 0;
        request.status = TransferStatus::Ok;
        self.io.queue(request, self.completion());
    }

    fn on_request_complete(self: &Arc<Self>, request: UsbRequest) {
        let events = {
            let mut inner = self.lock();
            if inner.state != StreamingState::Streaming {
                if !inner.requests.put(request) {
                    error!("completed request does not belong to the stream");
                }
                return;
            }

            let Inner {
                config,
                assembler,
                pool,
                ..
            } = &mut *inner;
            let events = match (config.as_ref(), pool.as_mut()) {
                (Some(config), Some(pool)) => {
                    assembler.process_payload(&request, config, pool, &self.io)
                }
                _ => {
                    error!("streaming without a configuration or buffer pool");
                    Vec::new()
                }
            };
            if request.status != TransferStatus::Ok {
                debug!("request completed with status {:?}", request.status);
            }

            // Completions never run from `queue`, so this cannot re-enter the lock.
            self.queue(request);
            events
        };

        for event in events {
            self.consumer.on_frame_available(event);
        }
    }
}

/// A video stream of a UVC device.
pub struct UvcStream<P, B, C>
where
    P: UsbIoProvider + 'static,
    B: FrameBufferPool + 'static,
    C: StreamConsumer + 'static,
{
    shared: Arc<Shared<P, B, C>>,
}

impl<P, B, C> UvcStream<P, B, C>
where
    P: UsbIoProvider + 'static,
    B: FrameBufferPool + 'static,
    C: StreamConsumer + 'static,
{
    /// Creates a stream for the device described by `settings`, which is accessed through `io`.
    /// Frames are reported to `consumer`.
    pub fn new(settings: StreamingSettings, io: P, consumer: C, options: StreamOptions) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                io,
                consumer,
                options,
                inner: Mutex::new(Inner {
                    state: StreamingState::Stopped,
                    config: None,
                    requests: RequestPool::new(),
                    assembler: FrameAssembler::new(),
                    pool: None,
                }),
            }),
        }
    }

    pub fn settings(&self) -> &StreamingSettings {
        &self.shared.settings
    }

    pub fn io(&self) -> &P {
        &self.shared.io
    }

    pub fn consumer(&self) -> &C {
        &self.shared.consumer
    }

    /// Returns up to [`MAX_FORMATS_PER_RESPONSE`] formats starting at `start_index`, as well as
    /// the total number of formats.
    pub fn get_formats(&self, start_index: usize) -> (Vec<VideoFormat>, usize) {
        let formats = &self.shared.settings.formats;
        let page = formats
            .iter()
            .skip(start_index)
            .take(MAX_FORMATS_PER_RESPONSE)
            .map(|format| format.to_video_format())
            .collect();
        (page, formats.len())
    }

    /// Negotiates `format` with the device and prepares the streaming requests.
    pub fn set_format(&self, format: &VideoFormat) -> Result<(), StreamError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        match inner.state {
            StreamingState::Stopped | StreamingState::Ready => (),
            _ => return Err(StreamError::BadState("cannot change format while streaming")),
        }
        // Requests that did not come back from the last stop still refer to the current pool.
        if !inner.requests.all_free() {
            return Err(StreamError::BadState("requests still in flight"));
        }

        let config = negotiate(
            &shared.io,
            &shared.settings,
            format,
            shared.options.page_size,
        )?;

        let num_requests = shared.options.num_requests;
        let endpoint = config.endpoint.address;
        if inner
            .requests
            .fits(endpoint, config.request_size, num_requests)
        {
            debug!("reusing {} requests", inner.requests.len());
        } else {
            let requests = shared
                .io
                .allocate_requests(endpoint, config.request_size, num_requests)
                .with_context(|| {
                    format!(
                        "while allocating {} requests of {} bytes",
                        num_requests, config.request_size
                    )
                })
                .map_err(StreamError::NoMemory)?;
            if requests.is_empty() {
                return Err(StreamError::NoMemory(anyhow::anyhow!(
                    "no streaming request allocated"
                )));
            }
            inner.requests.replace(requests);
        }
        inner.requests.set_length(config.request_size);

        inner.config = Some(config);
        inner.state = StreamingState::Ready;

        Ok(())
    }

    /// Sets the pool frames are written into, and returns the previous one.
    pub fn set_buffer_pool(&self, pool: B) -> Result<Option<B>, StreamError> {
        let mut inner = self.shared.lock();
        match inner.state {
            StreamingState::Stopped | StreamingState::Ready => Ok(inner.pool.replace(pool)),
            _ => Err(StreamError::BadState("cannot change buffers while streaming")),
        }
    }

    /// Starts streaming with the negotiated format.
    pub fn start(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.state != StreamingState::Ready {
            return Err(StreamError::BadState("stream is not ready"));
        }
        let Inner {
            config,
            assembler,
            pool,
            requests,
            ..
        } = &mut *inner;
        let config = config
            .as_ref()
            .ok_or(StreamError::Internal("ready without a configuration"))?;
        let pool = pool
            .as_mut()
            .ok_or(StreamError::InvalidArgs("no buffer pool"))?;
        if pool.buffer_size() < config.max_video_frame_size as usize {
            return Err(StreamError::InvalidArgs("buffers too small for the format"));
        }

        shared
            .io
            .set_alternate_interface(shared.settings.interface_number, config.endpoint.alt_setting)?;
        assembler.reset(pool);

        let pending = requests.take_all();
        inner.state = StreamingState::Streaming;
        debug!("starting stream with {} requests", pending.len());
        for request in pending {
            shared.queue(request);
        }

        Ok(())
    }

    /// Stops streaming and waits for all the in-flight requests to come back.
    pub fn stop(&self) -> Result<(), StreamError> {
        let shared = &self.shared;
        let endpoint = {
            let mut inner = shared.lock();
            if inner.state != StreamingState::Streaming {
                return Err(StreamError::BadState("not streaming"));
            }
            inner.state = StreamingState::Stopping;
            inner
                .config
                .as_ref()
                .map(|config| config.endpoint.address)
                .unwrap_or(shared.settings.endpoint_address)
        };

        // Completions run synchronously from here and need the lock.
        shared.io.cancel_all(endpoint);

        let mut inner = shared.lock();
        let Inner {
            assembler, pool, ..
        } = &mut *inner;
        if let Some(pool) = pool.as_mut() {
            assembler.reset(pool);
        }
        let all_returned = inner.requests.all_free();
        inner.state = StreamingState::Ready;
        drop(inner);

        if let Err(e) = shared
            .io
            .set_alternate_interface(shared.settings.interface_number, 0)
        {
            warn!("failed to select alternate setting 0: {}", e);
        }

        if !all_returned {
            error!("some requests did not come back after cancellation");
            return Err(StreamError::Internal("requests still in flight"));
        }

        Ok(())
    }

    /// Gives back the buffer the consumer knows as `consumer_index` to the pool.
    pub fn release_frame(&self, consumer_index: u32) -> Result<(), StreamError> {
        let mut inner = self.shared.lock();
        let pool = inner
            .pool
            .as_mut()
            .ok_or(StreamError::BadState("no buffer pool"))?;
        Ok(pool.release_frame(consumer_index)?)
    }

    pub fn state(&self) -> StreamingState {
        self.shared.lock().state
    }

    pub fn negotiated_config(&self) -> Option<NegotiatedConfig> {
        self.shared.lock().config.clone()
    }
}

impl<P, B, C> Drop for UvcStream<P, B, C>
where
    P: UsbIoProvider + 'static,
    B: FrameBufferPool + 'static,
    C: StreamConsumer + 'static,
{
    fn drop(&mut self) {
        if self.state() == StreamingState::Streaming {
            if let Err(e) = self.stop() {
                error!("error while stopping stream: {}", e);
            }
        }
    }
}

#[cfg(all(test, feature = "fake-camera"))]
mod tests {
    use super::*;
    use crate::builder::DescriptorBuilder;
    use crate::descriptors::parse_streaming_settings;
    use crate::devices::fake_camera::FakeTransport;
    use crate::devices::fake_camera::INTERFACE_NUMBER;
    use crate::devices::FakeUvcCamera;
    use crate::format::GUID_YUY2;
    use crate::frame::FrameEvent;
    use crate::frame::FrameStatus;
    use crate::frame::PayloadHeader;
    use crate::io::DescriptorIter;
    use crate::pool::BufferState;
    use crate::pool::VecFramePool;
    use crate::protocol::*;

    /// 320x240 YUY2.
    const FRAME_SIZE: usize = 320 * 240 * 2;
    /// `FRAME_SIZE` rounded up to the page size.
    const BUFFER_SIZE: usize = 38 * 4096;

    #[derive(Default)]
    struct TestConsumer {
        events: Mutex<Vec<FrameEvent>>,
    }

    impl TestConsumer {
        fn take_events(&self) -> Vec<FrameEvent> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl StreamConsumer for TestConsumer {
        fn on_frame_available(&self, event: FrameEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    type TestStream = UvcStream<FakeUvcCamera, VecFramePool, TestConsumer>;

    fn stream_with(camera: FakeUvcCamera, descriptors: &[u8]) -> TestStream {
        let settings = parse_streaming_settings(&mut DescriptorIter::new(descriptors)).unwrap();
        UvcStream::new(
            settings,
            camera,
            TestConsumer::default(),
            StreamOptions {
                num_requests: 4,
                ..Default::default()
            },
        )
    }

    fn stream(transport: FakeTransport, max_payload_transfer_size: u32) -> TestStream {
        let camera = FakeUvcCamera::new(transport, FRAME_SIZE as u32, max_payload_transfer_size);
        let descriptors = camera.descriptors();
        stream_with(camera, &descriptors)
    }

    fn small_format(stream: &TestStream) -> VideoFormat {
        let (formats, _) = stream.get_formats(0);
        formats
            .into_iter()
            .find(|format| format.width == 320)
            .unwrap()
    }

    fn test_frame(seed: u8) -> Vec<u8> {
        (0..FRAME_SIZE)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn get_formats_pages() {
        let mut builder = DescriptorBuilder::new()
            .interface(0, 0, 0, USB_SUBCLASS_VIDEO_CONTROL)
            .vc_header(48_000_000, 1)
            .interface(1, 0, 0, USB_SUBCLASS_VIDEO_STREAMING)
            .vs_input_header(1, 0x81)
            .uncompressed_format(1, 20, GUID_YUY2, 16);
        for i in 1..=20u16 {
            builder = builder.frame(
                VsSubtype::FrameUncompressed,
                i as u8,
                i * 16,
                i * 8,
                (i * 16) as u32 * (i * 8) as u32 * 2,
                333_333,
            );
        }
        let descriptors = builder
            .interface(1, 1, 1, USB_SUBCLASS_VIDEO_STREAMING)
            .endpoint(0x81, EndpointTransferType::Isochronous, 1024)
            .build();
        let stream = stream_with(
            FakeUvcCamera::new(FakeTransport::Isochronous, 4096, 1024),
            &descriptors,
        );

        let (formats, total) = stream.get_formats(0);
        assert_eq!(total, 20);
        assert_eq!(formats.len(), MAX_FORMATS_PER_RESPONSE);
        assert_eq!(formats[0].width, 16);
        let (formats, total) = stream.get_formats(16);
        assert_eq!(total, 20);
        assert_eq!(formats.len(), 4);
        assert_eq!(formats[3].width, 320);
        let (formats, _) = stream.get_formats(25);
        assert!(formats.is_empty());
    }

    #[test]
    fn isochronous_streaming() {
        let stream = stream(FakeTransport::Isochronous, 3000);
        assert_eq!(stream.state(), StreamingState::Stopped);
        assert!(matches!(stream.start(), Err(StreamError::BadState(_))));
        assert!(matches!(stream.stop(), Err(StreamError::BadState(_))));

        let format = small_format(&stream);
        stream.set_format(&format).unwrap();
        assert_eq!(stream.state(), StreamingState::Ready);
        assert_eq!(stream.io().committed(), Some((1, 2)));
        let config = stream.negotiated_config().unwrap();
        assert_eq!(config.endpoint.alt_setting, 3);
        assert_eq!(config.request_size, 3072);
        assert_eq!(config.max_video_frame_size as usize, BUFFER_SIZE);
        assert_eq!(config.clock_frequency_hz, 48_000_000);

        // No pool, then buffers that are too small.
        assert!(matches!(stream.start(), Err(StreamError::InvalidArgs(_))));
        stream
            .set_buffer_pool(VecFramePool::new(2, FRAME_SIZE))
            .unwrap();
        assert!(matches!(stream.start(), Err(StreamError::InvalidArgs(_))));
        stream
            .set_buffer_pool(VecFramePool::new(2, BUFFER_SIZE))
            .unwrap();

        stream.start().unwrap();
        assert_eq!(stream.state(), StreamingState::Streaming);
        assert_eq!(stream.io().alt_settings(), vec![(INTERFACE_NUMBER, 3)]);
        assert_eq!(stream.io().num_pending(), 4);
        assert!(matches!(
            stream.set_format(&format),
            Err(StreamError::BadState(_))
        ));
        assert!(matches!(
            stream.set_buffer_pool(VecFramePool::new(2, BUFFER_SIZE)),
            Err(StreamError::BadState(_))
        ));

        let frame = test_frame(0);
        assert_eq!(stream.io().send_frame(false, &frame), Some(51));
        let events = stream.consumer().take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, FrameStatus::Ok);
        assert_eq!(events[0].buffer_index, Some(0));
        // Requests are queued again after completion.
        assert_eq!(stream.io().num_pending(), 4);

        assert_eq!(
            stream.io().send_frame(true, &test_frame(1)),
            Some(51)
        );
        let events = stream.consumer().take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].buffer_index, Some(1));

        stream.release_frame(0).unwrap();
        assert!(matches!(
            stream.release_frame(0),
            Err(StreamError::Pool(_))
        ));

        stream.stop().unwrap();
        assert_eq!(stream.state(), StreamingState::Ready);
        assert_eq!(stream.io().num_pending(), 0);
        assert_eq!(
            stream.io().alt_settings(),
            vec![(INTERFACE_NUMBER, 3), (INTERFACE_NUMBER, 0)]
        );

        let pool = stream
            .set_buffer_pool(VecFramePool::new(2, BUFFER_SIZE))
            .unwrap()
            .unwrap();
        assert_eq!(&pool.buffer(0).unwrap()[..FRAME_SIZE], frame.as_slice());
        assert_eq!(pool.state(1), Some(BufferState::Reading));

        // Streaming can restart with the same requests.
        stream.start().unwrap();
        assert_eq!(stream.io().num_pending(), 4);
    }

    #[test]
    fn buffer_exhaustion() {
        let stream = stream(FakeTransport::Isochronous, 3000);
        stream.set_format(&small_format(&stream)).unwrap();
        stream
            .set_buffer_pool(VecFramePool::new(1, BUFFER_SIZE))
            .unwrap();
        stream.start().unwrap();

        stream.io().send_frame(false, &test_frame(0)).unwrap();
        stream.io().send_frame(true, &test_frame(1)).unwrap();
        let statuses = stream
            .consumer()
            .take_events()
            .into_iter()
            .map(|event| event.status)
            .collect::<Vec<_>>();
        assert_eq!(statuses, vec![FrameStatus::Ok, FrameStatus::BufferExhausted]);

        // Releasing the buffer makes it available again.
        stream.release_frame(0).unwrap();
        stream.io().send_frame(false, &test_frame(2)).unwrap();
        let events = stream.consumer().take_events();
        assert_eq!(events[0].status, FrameStatus::Ok);
    }

    #[test]
    fn bulk_streaming() {
        let stream = stream(FakeTransport::Bulk, 32768);
        let format = small_format(&stream);
        stream.set_format(&format).unwrap();
        let config = stream.negotiated_config().unwrap();
        assert_eq!(config.endpoint.alt_setting, 0);
        assert_eq!(config.request_size, 16384);

        stream
            .set_buffer_pool(VecFramePool::new(2, BUFFER_SIZE))
            .unwrap();
        stream.start().unwrap();
        assert_eq!(stream.io().alt_settings(), vec![(INTERFACE_NUMBER, 0)]);

        // Five payloads, the last one taking a full and a short transfer.
        let frame = test_frame(3);
        assert_eq!(stream.io().send_frame(true, &frame), Some(10));
        let events = stream.consumer().take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, FrameStatus::Ok);

        stream.stop().unwrap();
        let pool = stream
            .set_buffer_pool(VecFramePool::new(2, BUFFER_SIZE))
            .unwrap()
            .unwrap();
        assert_eq!(&pool.buffer(0).unwrap()[..FRAME_SIZE], frame.as_slice());
    }

    #[test]
    fn stop_discards_partial_frame() {
        let stream = stream(FakeTransport::Isochronous, 3000);
        stream.set_format(&small_format(&stream)).unwrap();
        stream
            .set_buffer_pool(VecFramePool::new(1, BUFFER_SIZE))
            .unwrap();
        stream.start().unwrap();

        let mut payload = Vec::new();
        PayloadHeader::new(false).write(&mut payload);
        payload.extend_from_slice(&[0xaa; 100]);
        assert!(stream.io().complete_next(&payload));
        assert!(stream.io().complete_next(&payload));

        stream.stop().unwrap();
        assert!(stream.consumer().take_events().is_empty());
        let pool = stream
            .set_buffer_pool(VecFramePool::new(1, BUFFER_SIZE))
            .unwrap()
            .unwrap();
        assert_eq!(pool.state(0), Some(BufferState::Free));
    }

    #[test]
    fn stop_with_requests_in_flight() {
        let stream = stream(FakeTransport::Isochronous, 3000);
        let format = small_format(&stream);
        stream.set_format(&format).unwrap();
        stream
            .set_buffer_pool(VecFramePool::new(2, BUFFER_SIZE))
            .unwrap();
        stream.start().unwrap();

        stream.io().hold_on_cancel(1);
        let err = stream.stop().unwrap_err();
        assert!(matches!(err, StreamError::Internal(_)));
        assert_eq!(err.errno(), libc::EIO);
        assert_eq!(stream.state(), StreamingState::Ready);
        assert_eq!(stream.io().num_pending(), 1);
        assert_eq!(
            stream.io().alt_settings(),
            vec![(INTERFACE_NUMBER, 3), (INTERFACE_NUMBER, 0)]
        );

        // The requests cannot be reallocated until the missing one is back.
        assert!(matches!(
            stream.set_format(&format),
            Err(StreamError::BadState(_))
        ));

        // Completions outside of streaming only return the request.
        let mut payload = Vec::new();
        PayloadHeader::new(false).write(&mut payload);
        payload.extend_from_slice(&[0x55; 100]);
        assert!(stream.io().complete_next(&payload));
        assert_eq!(stream.io().num_pending(), 0);
        assert!(stream.consumer().take_events().is_empty());

        stream.set_format(&format).unwrap();
        stream.start().unwrap();
        assert_eq!(stream.state(), StreamingState::Streaming);
        assert_eq!(stream.io().num_pending(), 4);
        stream.stop().unwrap();
    }

    #[test]
    fn capture_time_reaches_consumer() {
        let stream = stream(FakeTransport::Isochronous, 3000);
        stream.set_format(&small_format(&stream)).unwrap();
        stream
            .set_buffer_pool(VecFramePool::new(1, BUFFER_SIZE))
            .unwrap();
        stream.start().unwrap();

        stream.io().set_host_sof(0x800 | 102);
        stream.io().set_time_ns(1_000_000_000);

        // 48000 ticks of the 48MHz clock is 1ms of device delay. Device SOF 100 against host SOF
        // 102 is 2ms of transport delay.
        let mut payload = Vec::new();
        PayloadHeader {
            eof: true,
            pts: Some(1000),
            scr: Some((49_000, 100)),
            ..PayloadHeader::new(false)
        }
        .write(&mut payload);
        payload.extend_from_slice(&[0x55; 100]);
        assert!(stream.io().complete_next(&payload));

        let events = stream.consumer().take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, FrameStatus::Ok);
        assert_eq!(
            events[0].capture_time,
            1_000_000_000 - 3_000_000 + 500_000
        );

        // No timestamps in the header: unknown capture time.
        stream.release_frame(0).unwrap();
        let mut payload = Vec::new();
        PayloadHeader {
            eof: true,
            ..PayloadHeader::new(true)
        }
        .write(&mut payload);
        payload.extend_from_slice(&[0x55; 100]);
        assert!(stream.io().complete_next(&payload));
        let events = stream.consumer().take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].capture_time, 0);
    }

    #[test]
    fn failed_negotiation() {
        let stream = stream(FakeTransport::Isochronous, 3000);
        let format = small_format(&stream);

        stream.io().fail_next_control(TransferError::IoRefused);
        let err = stream.set_format(&format).unwrap_err();
        assert!(matches!(err, StreamError::Transfer(TransferError::IoRefused)));
        assert_eq!(err.errno(), libc::EPIPE);
        assert_eq!(stream.io().resets(), vec![0]);
        assert_eq!(stream.state(), StreamingState::Stopped);
        assert!(stream.negotiated_config().is_none());

        stream.set_format(&format).unwrap();
        let config = stream.negotiated_config().unwrap();

        // A failure from Ready keeps the previous configuration.
        let (formats, _) = stream.get_formats(0);
        stream.io().fail_next_control(TransferError::Failed);
        assert!(stream.set_format(&formats[0]).is_err());
        assert_eq!(stream.state(), StreamingState::Ready);
        assert_eq!(stream.negotiated_config(), Some(config));

        let mut unsupported = format.clone();
        unsupported.bytes_per_row += 2;
        let err = stream.set_format(&unsupported).unwrap_err();
        assert_eq!(err.errno(), libc::ENOTSUP);
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Software UVC camera with no hardware dependency.
//!
//! [`FakeUvcCamera`] implements [`UsbIoProvider`] entirely in memory: it describes itself with a
//! synthetic set of descriptors, answers the Probe/Commit controls, and keeps the streaming
//! requests queued on it until the caller completes them with payloads of its choosing. It can be
//! used to exercise the full streaming pipeline, or as a reference for what a host integration
//! needs to provide.

use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use log::debug;
use zerocopy::AsBytes;
use zerocopy::FromZeroes;

use crate::builder::DescriptorBuilder;
use crate::format::GUID_YUY2;
use crate::frame::PayloadHeader;
use crate::protocol::*;
use crate::request::ControlSetup;
use crate::request::TransferError;
use crate::request::TransferStatus;
use crate::CompletionCallback;
use crate::HostClock;
use crate::UsbIoProvider;
use crate::UsbRequest;

pub const INTERFACE_NUMBER: u8 = 1;
pub const ENDPOINT_ADDRESS: u8 = 0x81;
pub const CLOCK_FREQUENCY_HZ: u32 = 48_000_000;
/// 30 frames per second.
pub const FRAME_INTERVAL: u32 = 333_333;

/// Frame sizes advertised by the camera, all in YUY2.
pub const FRAME_SIZES: [(u16, u16); 2] = [(640, 480), (320, 240)];

/// Transport used for streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeTransport {
    /// Three alternate settings of 512, 1024 and 3x1024 bytes per microframe.
    Isochronous,
    /// A single bulk endpoint with 512-byte packets.
    Bulk,
}

/// Builds the configuration descriptor of the camera.
pub fn fake_camera_descriptors(transport: FakeTransport) -> Vec<u8> {
    let num_endpoints = match transport {
        FakeTransport::Isochronous => 0,
        FakeTransport::Bulk => 1,
    };

    let mut builder = DescriptorBuilder::new()
        .interface(0, 0, 0, USB_SUBCLASS_VIDEO_CONTROL)
        .vc_header(CLOCK_FREQUENCY_HZ, INTERFACE_NUMBER)
        .interface(
            INTERFACE_NUMBER,
            0,
            num_endpoints,
            USB_SUBCLASS_VIDEO_STREAMING,
        )
        .vs_input_header(1, ENDPOINT_ADDRESS)
        .uncompressed_format(1, FRAME_SIZES.len() as u8, GUID_YUY2, 16);
    for (index, (width, height)) in FRAME_SIZES.iter().enumerate() {
        let frame_size = *width as u32 * *height as u32 * 2;
        builder = builder.frame(
            VsSubtype::FrameUncompressed,
            index as u8 + 1,
            *width,
            *height,
            frame_size,
            FRAME_INTERVAL,
        );
    }
    builder = builder.color_matching();

    match transport {
        FakeTransport::Isochronous => {
            for (alt_setting, max_packet_size) in [(1, 512), (2, 1024), (3, (2 << 11) | 1024)] {
                builder = builder
                    .interface(INTERFACE_NUMBER, alt_setting, 1, USB_SUBCLASS_VIDEO_STREAMING)
                    .endpoint(
                        ENDPOINT_ADDRESS,
                        EndpointTransferType::Isochronous,
                        max_packet_size,
                    );
            }
        }
        FakeTransport::Bulk => {
            builder = builder.endpoint(ENDPOINT_ADDRESS, EndpointTransferType::Bulk, 512);
        }
    }

    builder.build()
}

struct FakeCameraState {
    probe: ProbeCommitControl,
    committed: Option<ProbeCommitControl>,
    pending: VecDeque<(UsbRequest, CompletionCallback)>,
    alt_settings: Vec<(u8, u8)>,
    resets: Vec<u8>,
    control_failures: VecDeque<TransferError>,
    /// Number of requests left pending by the next `cancel_all`.
    held_on_cancel: usize,
    host_sof: u64,
    time_ns: i64,
}

/// A camera that streams whatever it is given.
pub struct FakeUvcCamera {
    transport: FakeTransport,
    max_video_frame_size: u32,
    max_payload_transfer_size: u32,
    max_transfer_size: usize,
    state: Mutex<FakeCameraState>,
}

impl FakeUvcCamera {
    /// Creates a camera that will answer probes with the given frame and payload sizes.
    pub fn new(
        transport: FakeTransport,
        max_video_frame_size: u32,
        max_payload_transfer_size: u32,
    ) -> Self {
        Self {
            transport,
            max_video_frame_size,
            max_payload_transfer_size,
            max_transfer_size: 0x4000,
            state: Mutex::new(FakeCameraState {
                probe: ProbeCommitControl::new_zeroed(),
                committed: None,
                pending: Default::default(),
                alt_settings: Default::default(),
                resets: Default::default(),
                control_failures: Default::default(),
                held_on_cancel: 0,
                host_sof: 0,
                time_ns: 0,
            }),
        }
    }

    pub fn descriptors(&self) -> Vec<u8> {
        fake_camera_descriptors(self.transport)
    }

    fn lock(&self) -> MutexGuard<'_, FakeCameraState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next control transfer fail with `error`.
    pub fn fail_next_control(&self, error: TransferError) {
        self.lock().control_failures.push_back(error);
    }

    /// Format and frame indices of the last committed stream, if any.
    pub fn committed(&self) -> Option<(u8, u8)> {
        self.lock()
            .committed
            .map(|commit| (commit.bFormatIndex, commit.bFrameIndex))
    }

    /// Alternate settings selected so far, as (interface, setting) pairs.
    pub fn alt_settings(&self) -> Vec<(u8, u8)> {
        self.lock().alt_settings.clone()
    }

    /// Endpoints reset so far.
    pub fn resets(&self) -> Vec<u8> {
        self.lock().resets.clone()
    }

    /// Number of requests waiting to be completed.
    pub fn num_pending(&self) -> usize {
        self.lock().pending.len()
    }

    /// Makes the next `cancel_all` leave the `count` oldest requests of the endpoint pending, as
    /// a device that fails to give them back would.
    pub fn hold_on_cancel(&self, count: usize) {
        self.lock().held_on_cancel = count;
    }

    /// Sets the host bus frame number reported to the stream.
    pub fn set_host_sof(&self, sof: u64) {
        self.lock().host_sof = sof;
    }

    /// Sets the host monotonic time reported to the stream.
    pub fn set_time_ns(&self, time_ns: i64) {
        self.lock().time_ns = time_ns;
    }

    /// Completes the oldest pending request with `status` and as much of `data` as fits in it.
    ///
    /// Returns `false` if there was no request to complete.
    pub fn complete_next_with_status(&self, data: &[u8], status: TransferStatus) -> bool {
        let Some((mut request, completion)) = self.lock().pending.pop_front() else {
            return false;
        };
        let len = data.len().min(request.length).min(request.data.len());
        request.data[..len].copy_from_slice(&data[..len]);
        request.actual = len;
        request.status = status;
        completion(request);
        true
    }

    /// Completes the oldest pending request with `data`.
    pub fn complete_next(&self, data: &[u8]) -> bool {
        self.complete_next_with_status(data, TransferStatus::Ok)
    }

    fn next_request_length(&self) -> Option<usize> {
        self.lock().pending.front().map(|(request, _)| request.length)
    }

    /// Sends a whole frame with frame ID `fid`, split into as many payloads and transfers as
    /// needed. The last payload carries the end-of-frame bit.
    ///
    /// Returns the number of transfers used, or `None` if the camera ran out of requests.
    pub fn send_frame(&self, fid: bool, frame: &[u8]) -> Option<usize> {
        let header_len = size_of::<PayloadHeaderPrefix>();
        let mut transfers = 0;
        let mut remaining = frame;

        loop {
            let request_length = self.next_request_length()?;
            let payload_capacity = match self.transport {
                FakeTransport::Isochronous => request_length,
                FakeTransport::Bulk => self.max_payload_transfer_size as usize,
            };
            if payload_capacity <= header_len {
                return None;
            }

            let (chunk, rest) = remaining.split_at(remaining.len().min(payload_capacity - header_len));
            let mut payload = Vec::with_capacity(header_len + chunk.len());
            PayloadHeader {
                eof: rest.is_empty(),
                ..PayloadHeader::new(fid)
            }
            .write(&mut payload);
            payload.extend_from_slice(chunk);
            remaining = rest;

            for transfer in payload.chunks(request_length) {
                if !self.complete_next(transfer) {
                    return None;
                }
                transfers += 1;
            }

            if remaining.is_empty() {
                return Some(transfers);
            }
        }
    }
}

impl HostClock for FakeUvcCamera {
    fn current_host_sof(&self) -> u64 {
        self.lock().host_sof
    }

    fn monotonic_time_ns(&self) -> i64 {
        self.lock().time_ns
    }
}

impl UsbIoProvider for FakeUvcCamera {
    fn queue(&self, request: UsbRequest, completion: CompletionCallback) {
        self.lock().pending.push_back((request, completion));
    }

    fn cancel_all(&self, endpoint: u8) {
        let cancelled = {
            let mut state = self.lock();
            let mut held = std::mem::take(&mut state.held_on_cancel);
            let (cancelled, kept) = state
                .pending
                .drain(..)
                .partition::<VecDeque<_>, _>(|(request, _)| {
                    if request.endpoint != endpoint {
                        return false;
                    }
                    if held > 0 {
                        held -= 1;
                        return false;
                    }
                    true
                });
            state.pending = kept;
            cancelled
        };
        debug!("cancelling {} requests", cancelled.len());

        for (mut request, completion) in cancelled {
            request.actual = 0;
            request.status = TransferStatus::Cancelled;
            completion(request);
        }
    }

    fn set_alternate_interface(&self, interface: u8, alt_setting: u8) -> Result<(), TransferError> {
        if interface != INTERFACE_NUMBER {
            return Err(TransferError::IoInvalid);
        }
        self.lock().alt_settings.push((interface, alt_setting));
        Ok(())
    }

    fn control_transfer(
        &self,
        setup: ControlSetup,
        data: &mut [u8],
    ) -> Result<usize, TransferError> {
        let mut state = self.lock();
        if let Some(error) = state.control_failures.pop_front() {
            return Err(error);
        }
        if setup.index != INTERFACE_NUMBER as u16 {
            return Err(TransferError::IoRefused);
        }

        let len = data.len().min(size_of::<ProbeCommitControl>());
        let control = (setup.value >> 8) as u8;
        match (setup.request_type, setup.request, control) {
            (USB_REQ_TYPE_CLASS_INTERFACE_OUT, UVC_SET_CUR, UVC_VS_PROBE_CONTROL) => {
                let mut probe = ProbeCommitControl::new_zeroed();
                probe.as_bytes_mut()[..len].copy_from_slice(&data[..len]);
                state.probe = probe;
            }
            (USB_REQ_TYPE_CLASS_INTERFACE_IN, UVC_GET_CUR, UVC_VS_PROBE_CONTROL) => {
                let mut probe = state.probe;
                probe.dwMaxVideoFrameSize = Le32::new(self.max_video_frame_size);
                probe.dwMaxPayloadTransferSize = Le32::new(self.max_payload_transfer_size);
                probe.dwClockFrequency = Le32::new(CLOCK_FREQUENCY_HZ);
                data[..len].copy_from_slice(&probe.as_bytes()[..len]);
            }
            (USB_REQ_TYPE_CLASS_INTERFACE_OUT, UVC_SET_CUR, UVC_VS_COMMIT_CONTROL) => {
                let mut commit = ProbeCommitControl::new_zeroed();
                commit.as_bytes_mut()[..len].copy_from_slice(&data[..len]);
                state.committed = Some(commit);
            }
            _ => return Err(TransferError::IoRefused),
        }

        Ok(len)
    }

    fn reset_endpoint(&self, endpoint: u8) -> Result<(), TransferError> {
        self.lock().resets.push(endpoint);
        Ok(())
    }

    fn max_transfer_size(&self, _endpoint: u8) -> usize {
        self.max_transfer_size
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reassembly of video frames from the payloads received on the streaming endpoint.
//!
//! Each payload starts with a header giving, among other things, the frame ID bit that toggles
//! every time a new frame starts and an end-of-frame bit. On isochronous endpoints every transfer
//! is a payload. On bulk endpoints a payload can span several transfers, and only the first one
//! carries the header.

use std::mem::size_of;

use log::debug;
use log::trace;
use log::warn;
use thiserror::Error;
use zerocopy::AsBytes;
use zerocopy::FromBytes;

use crate::descriptors::EndpointType;
use crate::negotiate::NegotiatedConfig;
use crate::protocol::*;
use crate::request::TransferStatus;
use crate::request::UsbRequest;
use crate::timestamp::FrameClock;
use crate::FrameBufferPool;
use crate::HostClock;

const PTS_LEN: usize = 4;
const SCR_LEN: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("payload of {0} bytes is too short for a header")]
    TooShort(usize),
    #[error("invalid header length {0}")]
    InvalidLength(usize),
    #[error("header length {length} exceeds payload length {payload}")]
    ExceedsPayload { length: usize, payload: usize },
    #[error("header length {length} too short for announced fields ({needed} bytes)")]
    MissingFields { length: usize, needed: usize },
}

impl HeaderError {
    pub fn errno(&self) -> i32 {
        libc::EPROTO
    }
}

/// Decoded payload header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Length of the header, i.e. offset of the payload data.
    pub length: usize,
    /// Frame ID.
    pub fid: bool,
    pub eof: bool,
    pub still: bool,
    pub error: bool,
    /// Presentation time stamp, in device clock ticks.
    pub pts: Option<u32>,
    /// Source time clock, in device clock ticks, and the 11-bit bus frame number it was sampled
    /// at.
    pub scr: Option<(u32, u16)>,
}

impl PayloadHeader {
    pub fn new(fid: bool) -> Self {
        Self {
            length: size_of::<PayloadHeaderPrefix>(),
            fid,
            ..Default::default()
        }
    }

    /// Minimum length of a header carrying the fields announced by `info`.
    fn needed_len(info: u8) -> usize {
        let mut needed = size_of::<PayloadHeaderPrefix>();
        if info & UVC_HEADER_PTS != 0 {
            needed += PTS_LEN;
        }
        if info & UVC_HEADER_SCR != 0 {
            needed += SCR_LEN;
        }
        needed
    }

    /// Parses the header at the start of `payload`.
    pub fn parse(payload: &[u8]) -> Result<Self, HeaderError> {
        let prefix = PayloadHeaderPrefix::read_from_prefix(payload)
            .ok_or(HeaderError::TooShort(payload.len()))?;
        let length = prefix.bHeaderLength as usize;
        if length < size_of::<PayloadHeaderPrefix>() {
            return Err(HeaderError::InvalidLength(length));
        }
        if length > payload.len() {
            return Err(HeaderError::ExceedsPayload {
                length,
                payload: payload.len(),
            });
        }
        let info = prefix.bmHeaderInfo;
        let needed = Self::needed_len(info);
        if length < needed {
            return Err(HeaderError::MissingFields { length, needed });
        }

        let mut fields = &payload[size_of::<PayloadHeaderPrefix>()..length];
        let pts = if info & UVC_HEADER_PTS != 0 {
            let pts = Le32::read_from_prefix(fields).map(|pts| pts.get());
            fields = &fields[PTS_LEN..];
            pts
        } else {
            None
        };
        let scr = if info & UVC_HEADER_SCR != 0 {
            SourceClockReference::read_from_prefix(fields).map(|scr| {
                (
                    scr.dwSourceTimeClock.get(),
                    scr.wSofCounter.get() & USB_SOF_MASK as u16,
                )
            })
        } else {
            None
        };

        Ok(Self {
            length,
            fid: info & UVC_HEADER_FID != 0,
            eof: info & UVC_HEADER_EOF != 0,
            still: info & UVC_HEADER_STI != 0,
            error: info & UVC_HEADER_ERR != 0,
            pts,
            scr,
        })
    }

    /// Serializes this header at the end of `out`.
    ///
    /// The header is padded with zeroes up to `self.length` if it is longer than the announced
    /// fields require.
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut info = UVC_HEADER_EOH;
        for (set, bit) in [
            (self.fid, UVC_HEADER_FID),
            (self.eof, UVC_HEADER_EOF),
            (self.pts.is_some(), UVC_HEADER_PTS),
            (self.scr.is_some(), UVC_HEADER_SCR),
            (self.still, UVC_HEADER_STI),
            (self.error, UVC_HEADER_ERR),
        ] {
            if set {
                info |= bit;
            }
        }
        let length = self.length.max(Self::needed_len(info));
        let start = out.len();

        out.extend_from_slice(
            PayloadHeaderPrefix {
                bHeaderLength: length as u8,
                bmHeaderInfo: info,
            }
            .as_bytes(),
        );
        if let Some(pts) = self.pts {
            out.extend_from_slice(Le32::new(pts).as_bytes());
        }
        if let Some((stc, sof)) = self.scr {
            out.extend_from_slice(
                SourceClockReference {
                    dwSourceTimeClock: Le32::new(stc),
                    wSofCounter: Le16::new(sof),
                }
                .as_bytes(),
            );
        }
        out.resize(start + length, 0);
    }
}

/// Outcome of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Ok,
    /// The frame was corrupted and has been dropped.
    Error,
    /// No buffer was available to receive the frame.
    BufferExhausted,
}

/// Notification sent to the consumer for every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameEvent {
    pub status: FrameStatus,
    /// Consumer index of the buffer containing the frame, for successful frames.
    pub buffer_index: Option<u32>,
    /// Capture time in nanoseconds of the host monotonic clock, or 0 if unknown.
    pub capture_time: i64,
}

impl FrameEvent {
    fn new(status: FrameStatus, buffer_index: Option<u32>, capture_time: i64) -> Self {
        Self {
            status,
            buffer_index,
            capture_time,
        }
    }
}

/// State of the frame being assembled.
#[derive(Debug, Default)]
struct FrameState {
    bytes_received: usize,
    /// Frame ID of the frame, `None` if no frame is in progress.
    fid: Option<bool>,
    eof_seen: bool,
    error: bool,
    clock: FrameClock,
    /// Pool buffer the frame is written into.
    buffer: Option<usize>,
}

impl FrameState {
    fn mark_error(&mut self, reason: &str) {
        if !self.error {
            warn!("dropping frame: {}", reason);
            self.error = true;
        }
    }
}

/// State of the payload being received, for payloads spanning several bulk transfers.
#[derive(Debug, Default)]
struct PayloadState {
    eof: bool,
    skip_data: bool,
}

/// Turns completed transfers into frames.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    frame: FrameState,
    payload: PayloadState,
    /// Bytes received so far for the current bulk payload.
    bulk_count: usize,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether a frame is currently being assembled.
    pub fn in_progress(&self) -> bool {
        self.frame.fid.is_some()
    }

    /// Drops the frame in progress, if any, and gets ready to start over from a new stream.
    pub fn reset<B: FrameBufferPool + ?Sized>(&mut self, pool: &mut B) {
        if let Some(buffer) = self.frame.buffer.take() {
            pool.release_unused(buffer);
        }
        *self = Default::default();
    }

    /// Processes the transfer `request` that just completed, and returns the events of the
    /// frames it completed.
    pub fn process_payload<B, H>(
        &mut self,
        request: &UsbRequest,
        config: &NegotiatedConfig,
        pool: &mut B,
        host: &H,
    ) -> Vec<FrameEvent>
    where
        B: FrameBufferPool + ?Sized,
        H: HostClock + ?Sized,
    {
        let mut events = Vec::new();
        let data = request.received();
        if request.status != TransferStatus::Ok || data.is_empty() {
            return events;
        }

        let is_bulk = config.endpoint.ep_type == EndpointType::Bulk;
        let mut offset = 0;

        if !is_bulk || self.bulk_count == 0 {
            match PayloadHeader::parse(data) {
                Ok(header) => {
                    trace!("payload header {:?}, {} bytes", header, data.len());
                    if self.frame.fid != Some(header.fid) || self.frame.eof_seen {
                        events.extend(self.finalize(pool));
                        self.start_frame(header.fid, pool, host);
                    }

                    if let Some(pts) = header.pts {
                        self.frame.clock.record_pts(pts);
                    }
                    if let Some((stc, sof)) = header.scr {
                        self.frame.clock.record_scr(stc, sof);
                    }
                    if header.pts.is_some() || header.scr.is_some() {
                        self.frame
                            .clock
                            .update(host.monotonic_time_ns(), config.clock_frequency_hz);
                    }

                    if header.error {
                        self.frame.mark_error("device reported an error");
                    }
                    self.frame.eof_seen |= header.eof;
                    self.payload = PayloadState {
                        eof: header.eof,
                        skip_data: header.error,
                    };
                    offset = header.length;
                }
                Err(e) => {
                    if self.in_progress() {
                        self.frame.mark_error(&format!("invalid payload header: {}", e));
                    } else {
                        debug!("invalid payload header: {}", e);
                    }
                    self.payload = PayloadState {
                        eof: false,
                        skip_data: true,
                    };
                }
            }
        }

        if !self.payload.skip_data && self.in_progress() {
            self.append(&data[offset..], config, pool);
        }

        let payload_complete = if is_bulk {
            self.bulk_count += data.len();
            if self.bulk_count >= config.max_payload_transfer_size as usize
                || data.len() < config.request_size
            {
                self.bulk_count = 0;
                true
            } else {
                false
            }
        } else {
            true
        };

        if payload_complete && self.payload.eof {
            events.extend(self.finalize(pool));
        }

        events
    }

    fn start_frame<B, H>(&mut self, fid: bool, pool: &mut B, host: &H)
    where
        B: FrameBufferPool + ?Sized,
        H: HostClock + ?Sized,
    {
        let buffer = pool.try_acquire_for_write();
        if buffer.is_none() {
            debug!("no buffer available for the next frame");
        }
        self.frame = FrameState {
            fid: Some(fid),
            clock: FrameClock::new(host.current_host_sof()),
            buffer,
            ..Default::default()
        };
    }

    fn append<B: FrameBufferPool + ?Sized>(
        &mut self,
        data: &[u8],
        config: &NegotiatedConfig,
        pool: &mut B,
    ) {
        let frame = &mut self.frame;
        if data.is_empty() || frame.error {
            return;
        }

        let start = frame.bytes_received;
        let end = start + data.len();
        if end > config.max_video_frame_size as usize {
            frame.mark_error("frame larger than negotiated");
            return;
        }
        if let Some(index) = frame.buffer {
            match pool.buffer_mut(index) {
                Some(buffer) if end <= buffer.len() => buffer[start..end].copy_from_slice(data),
                _ => {
                    frame.mark_error("frame larger than its buffer");
                    return;
                }
            }
        }
        frame.bytes_received = end;
    }

    /// Completes the frame in progress, if any, and returns the event to send for it.
    fn finalize<B: FrameBufferPool + ?Sized>(&mut self, pool: &mut B) -> Option<FrameEvent> {
        let frame = std::mem::take(&mut self.frame);
        frame.fid?;
        let capture_time = frame.clock.capture_time();

        if frame.bytes_received == 0 || frame.error {
            if let Some(index) = frame.buffer {
                pool.release_unused(index);
            }
            return (frame.bytes_received > 0)
                .then(|| FrameEvent::new(FrameStatus::Error, None, capture_time));
        }

        Some(match frame.buffer {
            None => FrameEvent::new(FrameStatus::BufferExhausted, None, capture_time),
            Some(index) => {
                let consumer_index = pool.release_write_lock(index);
                trace!(
                    "frame of {} bytes in buffer {}",
                    frame.bytes_received,
                    consumer_index
                );
                FrameEvent::new(FrameStatus::Ok, Some(consumer_index), capture_time)
            }
        })
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Probe/Commit negotiation of the streaming parameters with the device.

use std::mem::size_of;

use log::debug;
use log::error;
use log::warn;
use zerocopy::AsBytes;
use zerocopy::FromZeroes;

use crate::descriptors::EndpointSetting;
use crate::descriptors::EndpointType;
use crate::descriptors::StreamingSettings;
use crate::format::UvcFormat;
use crate::format::VideoFormat;
use crate::protocol::*;
use crate::request::ControlSetup;
use crate::request::TransferError;
use crate::stream::StreamError;
use crate::UsbIoProvider;

/// Address of the default control endpoint.
const CONTROL_ENDPOINT: u8 = 0;

/// Parameters of a stream, as agreed upon with the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedConfig {
    pub format_index: u8,
    pub frame_index: u8,
    /// Largest frame the device will send, rounded up to the page size.
    pub max_video_frame_size: u32,
    /// Largest payload the device will send.
    pub max_payload_transfer_size: u32,
    /// Alternate setting to stream from.
    pub endpoint: EndpointSetting,
    /// Size of each streaming transfer.
    pub request_size: usize,
    pub clock_frequency_hz: u32,
}

/// Returns the device format described by `format`, if the device supports it.
pub fn find_format<'a>(formats: &'a [UvcFormat], format: &VideoFormat) -> Option<&'a UvcFormat> {
    formats.iter().find(|uvc_format| format.matches(uvc_format))
}

/// Returns the first alternate setting able to carry payloads of `max_payload` bytes.
///
/// Bulk interfaces only have a single setting, which is always suitable.
pub fn select_endpoint(
    settings: &[EndpointSetting],
    max_payload: u32,
) -> Option<&EndpointSetting> {
    match settings.first() {
        Some(setting) if setting.ep_type == EndpointType::Bulk => Some(setting),
        _ => settings
            .iter()
            .find(|setting| setting.bandwidth() >= max_payload),
    }
}

/// Rounds `value` up to a multiple of `alignment`, or returns `None` if the result does not fit.
fn round_up(value: u32, alignment: u32) -> Option<u32> {
    match alignment {
        0 => Some(value),
        alignment => value.checked_next_multiple_of(alignment),
    }
}

/// Performs `transfer` and resets the control endpoint if it stalled.
fn control_transfer<P: UsbIoProvider + ?Sized>(
    io: &P,
    setup: ControlSetup,
    data: &mut [u8],
) -> Result<usize, TransferError> {
    io.control_transfer(setup, data).map_err(|e| {
        if e.needs_reset() {
            if let Err(reset_err) = io.reset_endpoint(CONTROL_ENDPOINT) {
                error!("failed to reset control endpoint: {}", reset_err);
            }
        }
        e
    })
}

fn set_cur<P: UsbIoProvider + ?Sized>(
    io: &P,
    interface: u8,
    control: u8,
    data: &mut [u8],
) -> Result<(), TransferError> {
    let setup = ControlSetup {
        request_type: USB_REQ_TYPE_CLASS_INTERFACE_OUT,
        request: UVC_SET_CUR,
        value: (control as u16) << 8,
        index: interface as u16,
        length: data.len() as u16,
    };
    let written = control_transfer(io, setup, data)?;
    if written < data.len() {
        return Err(TransferError::ShortTransfer {
            actual: written,
            expected: data.len(),
        });
    }
    Ok(())
}

/// Reads the current value of `control`. Returns the block and its length as sent by the
/// device.
fn get_cur<P: UsbIoProvider + ?Sized>(
    io: &P,
    interface: u8,
    control: u8,
) -> Result<(ProbeCommitControl, usize), TransferError> {
    // Fields beyond what the device sends keep their zero value.
    let mut block = ProbeCommitControl::new_zeroed();
    let data = block.as_bytes_mut();
    let setup = ControlSetup {
        request_type: USB_REQ_TYPE_CLASS_INTERFACE_IN,
        request: UVC_GET_CUR,
        value: (control as u16) << 8,
        index: interface as u16,
        length: data.len() as u16,
    };
    let read = control_transfer(io, setup, data)?.min(size_of::<ProbeCommitControl>());
    if read < PROBE_COMMIT_CONTROL_UVC10_LEN {
        return Err(TransferError::ShortTransfer {
            actual: read,
            expected: PROBE_COMMIT_CONTROL_UVC10_LEN,
        });
    }
    Ok((block, read))
}

/// Runs the Probe/Commit sequence for `format` and picks the alternate setting to stream from.
///
/// Frame sizes are rounded up to `page_size`.
pub fn negotiate<P: UsbIoProvider + ?Sized>(
    io: &P,
    settings: &StreamingSettings,
    format: &VideoFormat,
    page_size: u32,
) -> Result<NegotiatedConfig, StreamError> {
    let uvc_format = find_format(&settings.formats, format)
        .ok_or(StreamError::NotSupported("format not supported by the device"))?;
    let interface = settings.interface_number;

    let mut probe = ProbeCommitControl::new_zeroed();
    probe.bmHint = Le16::new(UVC_PROBE_HINT_FRAME_INTERVAL);
    probe.bFormatIndex = uvc_format.format_index;
    probe.bFrameIndex = uvc_format.frame_index;
    probe.dwFrameInterval = Le32::new(uvc_format.default_frame_interval);

    set_cur(io, interface, UVC_VS_PROBE_CONTROL, probe.as_bytes_mut())?;
    let (mut commit, len) = get_cur(io, interface, UVC_VS_PROBE_CONTROL)?;
    debug!("probe result: {:?}", commit);
    set_cur(
        io,
        interface,
        UVC_VS_COMMIT_CONTROL,
        &mut commit.as_bytes_mut()[..len],
    )?;

    let max_payload_transfer_size = commit.dwMaxPayloadTransferSize.get();
    let endpoint = select_endpoint(&settings.endpoint_settings, max_payload_transfer_size)
        .ok_or(StreamError::NotSupported(
            "no alternate setting with enough bandwidth",
        ))?
        .clone();

    let request_size = match endpoint.ep_type {
        EndpointType::Isochronous => endpoint.bandwidth() as usize,
        EndpointType::Bulk => io
            .max_transfer_size(endpoint.address)
            .min(max_payload_transfer_size as usize),
    };
    if request_size == 0 {
        return Err(StreamError::NotSupported("zero-sized transfers"));
    }

    const OUT_OF_RANGE: StreamError = StreamError::NotSupported("frame size out of range");

    let mut max_video_frame_size = commit.dwMaxVideoFrameSize.get();
    if max_video_frame_size == 0 {
        max_video_frame_size = uvc_format
            .stride
            .checked_mul(uvc_format.height)
            .ok_or(OUT_OF_RANGE)?;
        warn!(
            "device did not report a frame size, assuming {} bytes",
            max_video_frame_size
        );
    }

    let clock_frequency_hz = match commit.dwClockFrequency.get() {
        0 => settings.clock_frequency_hz,
        frequency => frequency,
    };

    let config = NegotiatedConfig {
        format_index: uvc_format.format_index,
        frame_index: uvc_format.frame_index,
        max_video_frame_size: round_up(max_video_frame_size, page_size).ok_or(OUT_OF_RANGE)?,
        max_payload_transfer_size,
        endpoint,
        request_size,
        clock_frequency_hz,
    };
    debug!("negotiated {:?}", config);

    Ok(config)
}

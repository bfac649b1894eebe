// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Discovery of the streaming capabilities of a UVC device from its configuration descriptor.
//!
//! [`parse_streaming_settings`] walks the Video Control and Video Streaming interfaces of the
//! device and produces a [`StreamingSettings`], which lists every supported (format, frame)
//! combination as a flat [`UvcFormat`] and every alternate setting of the streaming interface as
//! an [`EndpointSetting`].
//!
//! Parsing is all-or-nothing: any inconsistency in the descriptors fails the whole operation and
//! no partial result is returned.

use std::ops::Deref;

use log::debug;
use log::warn;
use thiserror::Error;

use crate::format::PixelFormat;
use crate::format::UvcFormat;
use crate::io::DescriptorIter;
use crate::protocol::*;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("no more descriptors to parse")]
    Stop,
    #[error("malformed or missing descriptor: {0}")]
    BadState(&'static str),
    #[error("unexpected descriptor subtype {0:#04x}")]
    WrongType(u8),
    #[error("unsupported descriptor: {0}")]
    NotSupported(&'static str),
    #[error("invalid descriptor field: {0}")]
    InvalidArgs(&'static str),
}

impl ParseError {
    /// Error code to report to a client.
    pub fn errno(&self) -> i32 {
        match self {
            ParseError::Stop => libc::ENODATA,
            ParseError::BadState(_) => libc::EPROTO,
            ParseError::WrongType(_) => libc::EPROTOTYPE,
            ParseError::NotSupported(_) => libc::ENOTSUP,
            ParseError::InvalidArgs(_) => libc::EINVAL,
        }
    }
}

/// Transfer type of a streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Bulk,
    Isochronous,
}

/// One alternate setting of the streaming interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSetting {
    pub alt_setting: u8,
    pub max_packet_size: u32,
    /// Number of transactions per microframe (isochronous) or 1 (bulk).
    pub transactions_per_microframe: u32,
    pub ep_type: EndpointType,
    pub address: u8,
}

impl EndpointSetting {
    /// Bytes the endpoint can move per (micro)frame.
    pub fn bandwidth(&self) -> u32 {
        self.max_packet_size * self.transactions_per_microframe
    }
}

/// Everything needed to negotiate a stream with a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingSettings {
    /// Device clock frequency from the VC interface header, in Hz.
    pub clock_frequency_hz: u32,
    pub formats: Vec<UvcFormat>,
    pub endpoint_settings: Vec<EndpointSetting>,
    /// `bInterfaceNumber` of the Video Streaming interface.
    pub interface_number: u8,
    /// Streaming endpoint, from the VS input header.
    pub endpoint_address: u8,
}

/// Format descriptor of the group being parsed.
enum FormatDescriptor {
    Uncompressed(VsUncompressedFormatDescriptor),
    Mjpeg(VsMjpegFormatDescriptor),
    FrameBased(VsFrameBasedFormatDescriptor),
    /// Formats we validate but cannot stream.
    Unhandled {
        subtype: VsSubtype,
        num_frames: u8,
    },
}

impl FormatDescriptor {
    fn read(iter: &DescriptorIter, subtype: VsSubtype) -> Result<Self, ParseError> {
        const TOO_SHORT: ParseError = ParseError::BadState("format descriptor too short");

        Ok(match subtype {
            VsSubtype::FormatUncompressed => {
                FormatDescriptor::Uncompressed(iter.read().ok_or(TOO_SHORT)?)
            }
            VsSubtype::FormatMjpeg => FormatDescriptor::Mjpeg(iter.read().ok_or(TOO_SHORT)?),
            VsSubtype::FormatFrameBased => {
                FormatDescriptor::FrameBased(iter.read().ok_or(TOO_SHORT)?)
            }
            subtype if subtype.has_frame_descriptors() => {
                let header = iter.read::<VsFormatHeader>().ok_or(TOO_SHORT)?;
                FormatDescriptor::Unhandled {
                    subtype,
                    num_frames: header.bNumFrameDescriptors,
                }
            }
            subtype => {
                iter.read::<CsDescriptorHeader>().ok_or(TOO_SHORT)?;
                FormatDescriptor::Unhandled {
                    subtype,
                    num_frames: 0,
                }
            }
        })
    }

    fn num_frames(&self) -> u8 {
        match self {
            FormatDescriptor::Uncompressed(desc) => desc.bNumFrameDescriptors,
            FormatDescriptor::Mjpeg(desc) => desc.bNumFrameDescriptors,
            FormatDescriptor::FrameBased(desc) => desc.bNumFrameDescriptors,
            FormatDescriptor::Unhandled { num_frames, .. } => *num_frames,
        }
    }

    /// Combines this format with the frame descriptor the cursor is on.
    ///
    /// Returns `None` for frames that are valid but that we cannot stream.
    fn flatten(&self, iter: &DescriptorIter) -> Result<Option<UvcFormat>, ParseError> {
        const TOO_SHORT: ParseError = ParseError::BadState("frame descriptor too short");
        const ZERO_HEIGHT: ParseError = ParseError::InvalidArgs("frame height is zero");

        let (format_index, default_frame_index, pixel_format, bits_per_pixel) = match self {
            FormatDescriptor::Uncompressed(desc) => (
                desc.bFormatIndex,
                desc.bDefaultFrameIndex,
                PixelFormat::from_guid(&desc.guidFormat),
                desc.bBitsPerPixel,
            ),
            FormatDescriptor::Mjpeg(desc) => (
                desc.bFormatIndex,
                desc.bDefaultFrameIndex,
                PixelFormat::Mjpeg,
                0,
            ),
            FormatDescriptor::FrameBased(desc) => (
                desc.bFormatIndex,
                desc.bDefaultFrameIndex,
                PixelFormat::from_guid(&desc.guidFormat),
                desc.bBitsPerPixel,
            ),
            FormatDescriptor::Unhandled { .. } => {
                iter.read::<VsFrameHeader>().ok_or(TOO_SHORT)?;
                return Ok(None);
            }
        };

        let (frame_index, width, height, default_frame_interval, stride) = match self {
            FormatDescriptor::FrameBased(_) => {
                let frame = iter
                    .read::<VsFrameBasedFrameDescriptor>()
                    .ok_or(TOO_SHORT)?;
                let height = frame.wHeight.get() as u32;
                if height == 0 {
                    return Err(ZERO_HEIGHT);
                }
                (
                    frame.bFrameIndex,
                    frame.wWidth.get() as u32,
                    height,
                    frame.dwDefaultFrameInterval.get(),
                    frame.dwBytesPerLine.get(),
                )
            }
            _ => {
                let frame = iter.read::<VsFrameDescriptor>().ok_or(TOO_SHORT)?;
                let height = frame.wHeight.get() as u32;
                if height == 0 {
                    return Err(ZERO_HEIGHT);
                }
                // The stride is supposed to come from the commit response, but devices still
                // fill `dwMaxVideoFrameBufferSize` consistently and our consumers rely on it.
                let stride = frame.dwMaxVideoFrameBufferSize.get() / height;
                (
                    frame.bFrameIndex,
                    frame.wWidth.get() as u32,
                    height,
                    frame.dwDefaultFrameInterval.get(),
                    stride,
                )
            }
        };

        if pixel_format == PixelFormat::Invalid {
            return Ok(None);
        }

        Ok(Some(UvcFormat {
            format_index,
            frame_index,
            pixel_format,
            bits_per_pixel,
            default_frame_interval,
            width,
            height,
            stride,
            default_frame_index,
        }))
    }
}

/// Ordered list of the formats supported by a device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UvcFormatList {
    formats: Vec<UvcFormat>,
}

impl UvcFormatList {
    pub fn new() -> Self {
        Default::default()
    }

    /// Parses the format group starting at the current position of `iter`: the format
    /// descriptor, its frame descriptors, and the optional still image and color matching
    /// descriptors that follow them.
    ///
    /// On success the cursor is left on the first descriptor after the group, and one
    /// [`UvcFormat`] per streamable frame is appended to the list. On error nothing is appended.
    pub fn parse_usb_descriptor(&mut self, iter: &mut DescriptorIter) -> Result<(), ParseError> {
        let raw_subtype = iter
            .peek_cs_subtype()
            .ok_or(ParseError::BadState("expected a format descriptor"))?;
        let (subtype, frame_subtype) = match VsSubtype::n(raw_subtype)
            .and_then(|subtype| Some((subtype, subtype.allowed_frame_subtype()?)))
        {
            Some(subtypes) => subtypes,
            None => return Err(ParseError::WrongType(raw_subtype)),
        };

        let format = FormatDescriptor::read(iter, subtype)?;
        iter.advance();

        let mut parsed = Vec::with_capacity(format.num_frames() as usize);
        for _ in 0..format.num_frames() {
            match iter.peek_cs_subtype() {
                Some(raw) if raw == frame_subtype as u8 => (),
                Some(_) => {
                    return Err(ParseError::BadState(
                        "frame descriptor does not match its format",
                    ))
                }
                None => return Err(ParseError::BadState("missing frame descriptor")),
            }

            if let Some(uvc_format) = format.flatten(iter)? {
                parsed.push(uvc_format);
            }
            iter.advance();
        }

        match format {
            FormatDescriptor::Unhandled { subtype, .. } => {
                debug!("ignoring unsupported {:?} format", subtype);
            }
            _ if parsed.len() < format.num_frames() as usize => {
                warn!(
                    "ignoring {} frame(s) with an unsupported pixel format",
                    format.num_frames() as usize - parsed.len()
                );
            }
            _ => (),
        }

        while iter.peek_cs_subtype() == Some(VsSubtype::StillImageFrame as u8) {
            iter.advance();
        }
        if iter.peek_cs_subtype() == Some(VsSubtype::ColorFormat as u8) {
            iter.advance();
        }

        self.formats.extend(parsed);
        Ok(())
    }

    pub fn into_vec(self) -> Vec<UvcFormat> {
        self.formats
    }
}

impl Deref for UvcFormatList {
    type Target = [UvcFormat];

    fn deref(&self) -> &Self::Target {
        &self.formats
    }
}

/// Reads the class-specific descriptor of `subtype` the cursor is on, or fails with `what`.
fn read_cs<T: zerocopy::FromBytes>(
    iter: &DescriptorIter,
    subtype: u8,
    what: &'static str,
) -> Result<T, ParseError> {
    if iter.peek_cs_subtype() != Some(subtype) {
        return Err(ParseError::BadState(what));
    }
    iter.read().ok_or(ParseError::BadState(what))
}

/// Parses the endpoint descriptor the cursor is on, as well as its SuperSpeed companions.
fn parse_endpoint(
    iter: &mut DescriptorIter,
    alt_setting: u8,
) -> Result<EndpointSetting, ParseError> {
    let endpoint = iter
        .read::<EndpointDescriptor>()
        .ok_or(ParseError::BadState("endpoint descriptor too short"))?;
    iter.advance();

    let ep_type = match EndpointTransferType::n(endpoint.bmAttributes & USB_ENDPOINT_TYPE_MASK) {
        Some(EndpointTransferType::Isochronous) => EndpointType::Isochronous,
        Some(EndpointTransferType::Bulk) => EndpointType::Bulk,
        _ => return Err(ParseError::BadState("streaming endpoint is neither bulk nor isochronous")),
    };

    let raw_packet_size = endpoint.wMaxPacketSize.get();
    let max_packet_size = (raw_packet_size & USB_ENDPOINT_MAX_PACKET_SIZE_MASK) as u32;
    let mut transactions_per_microframe = match ep_type {
        EndpointType::Isochronous => {
            ((raw_packet_size >> USB_ENDPOINT_ADDITIONAL_TRANSACTIONS_SHIFT)
                & USB_ENDPOINT_ADDITIONAL_TRANSACTIONS_MASK) as u32
                + 1
        }
        EndpointType::Bulk => 1,
    };

    if iter.peek_type() == Some(DescriptorType::SsEndpointCompanion) {
        let companion = iter
            .read::<SsEndpointCompanionDescriptor>()
            .ok_or(ParseError::BadState("endpoint companion too short"))?;
        iter.advance();

        if ep_type == EndpointType::Isochronous {
            let mult = (companion.bmAttributes & USB_SS_COMPANION_MULT_MASK) as u32;
            transactions_per_microframe = (companion.bMaxBurst as u32 + 1) * (mult + 1);

            if companion.bmAttributes & USB_SS_COMPANION_SSP_ISOCH != 0 {
                if iter.peek_type() != Some(DescriptorType::SspIsochEndpointCompanion) {
                    return Err(ParseError::BadState(
                        "missing SuperSpeedPlus isochronous companion",
                    ));
                }
                let ssp_companion = iter
                    .read::<SspIsochEndpointCompanionDescriptor>()
                    .ok_or(ParseError::BadState("isochronous companion too short"))?;
                iter.advance();

                if max_packet_size == 0 {
                    return Err(ParseError::BadState("zero max packet size"));
                }
                transactions_per_microframe =
                    ssp_companion.dwBytesPerInterval.get() / max_packet_size;
            }
        }
    }

    Ok(EndpointSetting {
        alt_setting,
        max_packet_size,
        transactions_per_microframe,
        ep_type,
        address: endpoint.bEndpointAddress,
    })
}

/// Collects the alternate settings of streaming interface `interface_number`.
///
/// `first` is the interface descriptor that opened the streaming interface. Its endpoint, if it
/// has one, comes after the class-specific descriptors; the endpoints of the other alternate
/// settings must immediately follow their interface descriptor.
fn parse_endpoint_settings(
    iter: &mut DescriptorIter,
    first: &InterfaceDescriptor,
) -> Result<Vec<EndpointSetting>, ParseError> {
    let mut settings = Vec::new();
    // Alternate setting waiting for its endpoint, and whether it must come next.
    let mut pending = (first.bNumEndpoints > 0).then_some((first.bAlternateSetting, false));

    while let Some(descriptor_type) = iter.peek().map(|header| header.bDescriptorType) {
        match DescriptorType::n(descriptor_type) {
            Some(DescriptorType::Interface) => {
                let interface = iter
                    .read::<InterfaceDescriptor>()
                    .ok_or(ParseError::BadState("interface descriptor too short"))?;
                if interface.bInterfaceNumber != first.bInterfaceNumber
                    || !interface.is_video(USB_SUBCLASS_VIDEO_STREAMING)
                {
                    break;
                }
                if pending.is_some() {
                    return Err(ParseError::BadState("alternate setting without endpoint"));
                }
                pending = (interface.bNumEndpoints > 0)
                    .then_some((interface.bAlternateSetting, true));
                iter.advance();
            }
            Some(DescriptorType::Endpoint) => match pending.take() {
                Some((alt_setting, _)) => settings.push(parse_endpoint(iter, alt_setting)?),
                None => {
                    iter.advance();
                }
            },
            _ => {
                if let Some((_, true)) = pending {
                    return Err(ParseError::BadState(
                        "alternate setting not followed by its endpoint",
                    ));
                }
                iter.advance();
            }
        }
    }

    if pending.is_some() {
        return Err(ParseError::BadState("alternate setting without endpoint"));
    }

    Ok(settings)
}

fn validate_endpoint_settings(settings: &[EndpointSetting]) -> Result<(), ParseError> {
    match settings.first() {
        None => Err(ParseError::BadState("no streaming endpoint")),
        Some(first) if first.ep_type == EndpointType::Bulk => {
            if settings.len() != 1 || first.alt_setting != 0 {
                Err(ParseError::BadState(
                    "bulk interfaces must have a single alternate setting 0",
                ))
            } else {
                Ok(())
            }
        }
        Some(_) => {
            if settings
                .iter()
                .all(|setting| setting.ep_type == EndpointType::Isochronous)
            {
                Ok(())
            } else {
                Err(ParseError::BadState("mixed endpoint types"))
            }
        }
    }
}

fn is_video_interface(iter: &DescriptorIter, subclass: u8) -> bool {
    iter.peek_interface()
        .is_some_and(|interface| interface.is_video(subclass))
}

/// Parses the streaming capabilities of the video function described by `iter`.
///
/// Returns [`ParseError::Stop`] if no video function could be found before the end of the
/// descriptors.
pub fn parse_streaming_settings(
    iter: &mut DescriptorIter,
) -> Result<StreamingSettings, ParseError> {
    if !iter.skip_until(|iter| is_video_interface(iter, USB_SUBCLASS_VIDEO_CONTROL)) {
        return Err(ParseError::Stop);
    }
    iter.advance();
    let vc_header: VcHeaderDescriptor =
        read_cs(iter, VcSubtype::Header as u8, "missing VC interface header")?;
    iter.advance();

    if !iter.skip_until(|iter| is_video_interface(iter, USB_SUBCLASS_VIDEO_STREAMING)) {
        return Err(ParseError::Stop);
    }
    let vs_interface = iter
        .peek_interface()
        .ok_or(ParseError::BadState("missing VS interface"))?;
    iter.advance();
    let input_header: VsInputHeaderDescriptor = read_cs(
        iter,
        VsSubtype::InputHeader as u8,
        "missing VS input header",
    )?;
    iter.advance();

    let mut formats = UvcFormatList::new();
    for _ in 0..input_header.bNumFormats {
        formats.parse_usb_descriptor(iter)?;
    }

    let endpoint_settings = parse_endpoint_settings(iter, &vs_interface)?;
    validate_endpoint_settings(&endpoint_settings)?;

    debug!(
        "found {} format(s) and {} alternate setting(s) on interface {}",
        formats.len(),
        endpoint_settings.len(),
        vs_interface.bInterfaceNumber
    );

    Ok(StreamingSettings {
        clock_frequency_hz: vc_header.dwClockFrequency.get(),
        formats: formats.into_vec(),
        endpoint_settings,
        interface_number: vs_interface.bInterfaceNumber,
        endpoint_address: input_header.bEndpointAddress,
    })
}

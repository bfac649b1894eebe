// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Serialization of synthetic UVC descriptor sets.
//!
//! [`DescriptorBuilder`] writes the same wire structures the parser reads, which makes it
//! possible to describe a device entirely in software, e.g. for the fake camera or for tests.

use std::mem::size_of;

use zerocopy::AsBytes;

use crate::protocol::*;

/// Incremental writer of a configuration descriptor blob.
#[derive(Debug, Default, Clone)]
pub struct DescriptorBuilder {
    data: Vec<u8>,
}

impl DescriptorBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Appends `bytes` as-is.
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.data.extend_from_slice(bytes);
        self
    }

    fn push<T: AsBytes>(self, desc: &T) -> Self {
        self.raw(desc.as_bytes())
    }

    /// Appends `desc` followed by `trailer`, patching the declared length of the descriptor to
    /// cover both.
    fn push_with_trailer<T: AsBytes>(mut self, desc: &T, trailer: &[u8]) -> Self {
        let start = self.data.len();
        self = self.push(desc).raw(trailer);
        self.data[start] = (size_of::<T>() + trailer.len()) as u8;
        self
    }

    /// Standard interface descriptor of the video class.
    pub fn interface(self, number: u8, alt_setting: u8, num_endpoints: u8, subclass: u8) -> Self {
        self.push(&InterfaceDescriptor {
            bLength: size_of::<InterfaceDescriptor>() as u8,
            bDescriptorType: DescriptorType::Interface as u8,
            bInterfaceNumber: number,
            bAlternateSetting: alt_setting,
            bNumEndpoints: num_endpoints,
            bInterfaceClass: USB_CLASS_VIDEO,
            bInterfaceSubClass: subclass,
            bInterfaceProtocol: 0,
            iInterface: 0,
        })
    }

    /// Class-specific VC interface header referencing a single streaming interface.
    pub fn vc_header(self, clock_frequency: u32, streaming_interface: u8) -> Self {
        let header = VcHeaderDescriptor {
            bLength: 0,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VcSubtype::Header as u8,
            bcdUVC: Le16::new(0x0150),
            wTotalLength: Le16::new(size_of::<VcHeaderDescriptor>() as u16 + 1),
            dwClockFrequency: Le32::new(clock_frequency),
            bInCollection: 1,
        };
        self.push_with_trailer(&header, &[streaming_interface])
    }

    /// Class-specific VS input header, with one byte of controls per format.
    pub fn vs_input_header(self, num_formats: u8, endpoint_address: u8) -> Self {
        let header = VsInputHeaderDescriptor {
            bLength: 0,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VsSubtype::InputHeader as u8,
            bNumFormats: num_formats,
            wTotalLength: Le16::new(0),
            bEndpointAddress: endpoint_address,
            bmInfo: 0,
            bTerminalLink: 2,
            bStillCaptureMethod: 0,
            bTriggerSupport: 0,
            bTriggerUsage: 0,
            bControlSize: 1,
        };
        self.push_with_trailer(&header, &vec![0u8; num_formats as usize])
    }

    pub fn uncompressed_format(
        self,
        format_index: u8,
        num_frames: u8,
        guid: [u8; 16],
        bits_per_pixel: u8,
    ) -> Self {
        self.push(&VsUncompressedFormatDescriptor {
            bLength: size_of::<VsUncompressedFormatDescriptor>() as u8,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VsSubtype::FormatUncompressed as u8,
            bFormatIndex: format_index,
            bNumFrameDescriptors: num_frames,
            guidFormat: guid,
            bBitsPerPixel: bits_per_pixel,
            bDefaultFrameIndex: 1,
            bAspectRatioX: 0,
            bAspectRatioY: 0,
            bmInterlaceFlags: 0,
            bCopyProtect: 0,
        })
    }

    pub fn mjpeg_format(self, format_index: u8, num_frames: u8) -> Self {
        self.push(&VsMjpegFormatDescriptor {
            bLength: size_of::<VsMjpegFormatDescriptor>() as u8,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VsSubtype::FormatMjpeg as u8,
            bFormatIndex: format_index,
            bNumFrameDescriptors: num_frames,
            bmFlags: 0,
            bDefaultFrameIndex: 1,
            bAspectRatioX: 0,
            bAspectRatioY: 0,
            bmInterlaceFlags: 0,
            bCopyProtect: 0,
        })
    }

    pub fn frame_based_format(
        self,
        format_index: u8,
        num_frames: u8,
        guid: [u8; 16],
        bits_per_pixel: u8,
    ) -> Self {
        self.push(&VsFrameBasedFormatDescriptor {
            bLength: size_of::<VsFrameBasedFormatDescriptor>() as u8,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VsSubtype::FormatFrameBased as u8,
            bFormatIndex: format_index,
            bNumFrameDescriptors: num_frames,
            guidFormat: guid,
            bBitsPerPixel: bits_per_pixel,
            bDefaultFrameIndex: 1,
            bAspectRatioX: 0,
            bAspectRatioY: 0,
            bmInterlaceFlags: 0,
            bCopyProtect: 0,
            bVariableSize: 0,
        })
    }

    /// Format descriptor of a format that is only identified by its subtype, e.g. H.264.
    pub fn other_format(self, subtype: VsSubtype, format_index: u8, num_frames: u8) -> Self {
        let header = VsFormatHeader {
            bLength: 0,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: subtype as u8,
            bFormatIndex: format_index,
            bNumFrameDescriptors: num_frames,
        };
        self.push_with_trailer(&header, &[0u8; 4])
    }

    /// Uncompressed or MJPEG frame descriptor with a single discrete frame interval.
    pub fn frame(
        self,
        subtype: VsSubtype,
        frame_index: u8,
        width: u16,
        height: u16,
        max_frame_buffer_size: u32,
        frame_interval: u32,
    ) -> Self {
        let frame = VsFrameDescriptor {
            bLength: 0,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: subtype as u8,
            bFrameIndex: frame_index,
            bmCapabilities: 0,
            wWidth: Le16::new(width),
            wHeight: Le16::new(height),
            dwMinBitRate: Le32::new(0),
            dwMaxBitRate: Le32::new(0),
            dwMaxVideoFrameBufferSize: Le32::new(max_frame_buffer_size),
            dwDefaultFrameInterval: Le32::new(frame_interval),
            bFrameIntervalType: 1,
        };
        self.push_with_trailer(&frame, &frame_interval.to_le_bytes())
    }

    /// Frame-based frame descriptor with a single discrete frame interval.
    pub fn frame_based_frame(
        self,
        frame_index: u8,
        width: u16,
        height: u16,
        bytes_per_line: u32,
        frame_interval: u32,
    ) -> Self {
        let frame = VsFrameBasedFrameDescriptor {
            bLength: 0,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VsSubtype::FrameFrameBased as u8,
            bFrameIndex: frame_index,
            bmCapabilities: 0,
            wWidth: Le16::new(width),
            wHeight: Le16::new(height),
            dwMinBitRate: Le32::new(0),
            dwMaxBitRate: Le32::new(0),
            dwDefaultFrameInterval: Le32::new(frame_interval),
            bFrameIntervalType: 1,
            dwBytesPerLine: Le32::new(bytes_per_line),
        };
        self.push_with_trailer(&frame, &frame_interval.to_le_bytes())
    }

    /// Frame descriptor of a format that is only identified by its subtype.
    pub fn other_frame(self, subtype: VsSubtype, frame_index: u8) -> Self {
        let header = VsFrameHeader {
            bLength: 0,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: subtype as u8,
            bFrameIndex: frame_index,
        };
        self.push_with_trailer(&header, &[0u8; 8])
    }

    /// Still image frame descriptor with a single image size and no compression pattern.
    pub fn still_image_frame(self, width: u16, height: u16) -> Self {
        let mut bytes = vec![
            0,
            DescriptorType::CsInterface as u8,
            VsSubtype::StillImageFrame as u8,
            0,
            1,
        ];
        bytes.extend_from_slice(&width.to_le_bytes());
        bytes.extend_from_slice(&height.to_le_bytes());
        bytes.push(0);
        bytes[0] = bytes.len() as u8;
        self.raw(&bytes)
    }

    pub fn color_matching(self) -> Self {
        self.push(&VsColorMatchingDescriptor {
            bLength: size_of::<VsColorMatchingDescriptor>() as u8,
            bDescriptorType: DescriptorType::CsInterface as u8,
            bDescriptorSubtype: VsSubtype::ColorFormat as u8,
            bColorPrimaries: 1,
            bTransferCharacteristics: 1,
            bMatrixCoefficients: 4,
        })
    }

    /// Standard endpoint descriptor. `max_packet_size` is the raw `wMaxPacketSize` value,
    /// including the additional transactions bits.
    pub fn endpoint(
        self,
        address: u8,
        transfer_type: EndpointTransferType,
        max_packet_size: u16,
    ) -> Self {
        self.push(&EndpointDescriptor {
            bLength: size_of::<EndpointDescriptor>() as u8,
            bDescriptorType: DescriptorType::Endpoint as u8,
            bEndpointAddress: address,
            bmAttributes: transfer_type as u8,
            wMaxPacketSize: Le16::new(max_packet_size),
            bInterval: 1,
        })
    }

    pub fn ss_companion(self, max_burst: u8, attributes: u8, bytes_per_interval: u16) -> Self {
        self.push(&SsEndpointCompanionDescriptor {
            bLength: size_of::<SsEndpointCompanionDescriptor>() as u8,
            bDescriptorType: DescriptorType::SsEndpointCompanion as u8,
            bMaxBurst: max_burst,
            bmAttributes: attributes,
            wBytesPerInterval: Le16::new(bytes_per_interval),
        })
    }

    pub fn ssp_isoch_companion(self, bytes_per_interval: u32) -> Self {
        self.push(&SspIsochEndpointCompanionDescriptor {
            bLength: size_of::<SspIsochEndpointCompanionDescriptor>() as u8,
            bDescriptorType: DescriptorType::SspIsochEndpointCompanion as u8,
            wReserved: Le16::new(0),
            dwBytesPerInterval: Le32::new(bytes_per_interval),
        })
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

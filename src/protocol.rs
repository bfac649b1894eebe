// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Wire definitions for the USB and USB Video Class descriptors, control blocks and payload
//! headers handled by this crate.
//!
//! All multi-byte fields are little-endian on the wire [USB 2.0 §8.1] and are declared using the
//! `zerocopy` byte-order types, so every structure here has an alignment of 1 and can be read
//! from any offset of a descriptor blob. Field names follow the UVC 1.5 specification.

#![allow(non_snake_case)]

use enumn::N;
use zerocopy::byteorder::LittleEndian;
use zerocopy::byteorder::U16;
use zerocopy::byteorder::U32;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;
use zerocopy::Unaligned;

pub type Le16 = U16<LittleEndian>;
pub type Le32 = U32<LittleEndian>;

pub const USB_CLASS_VIDEO: u8 = 0x0e;
pub const USB_SUBCLASS_VIDEO_CONTROL: u8 = 0x01;
pub const USB_SUBCLASS_VIDEO_STREAMING: u8 = 0x02;

/// `bmRequestType` for a class request to an interface, host to device.
pub const USB_REQ_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;
/// `bmRequestType` for a class request to an interface, device to host.
pub const USB_REQ_TYPE_CLASS_INTERFACE_IN: u8 = 0xa1;

pub const UVC_SET_CUR: u8 = 0x01;
pub const UVC_GET_CUR: u8 = 0x81;

pub const UVC_VS_PROBE_CONTROL: u8 = 0x01;
pub const UVC_VS_COMMIT_CONTROL: u8 = 0x02;

/// `bmHint` bit asking the device to keep `dwFrameInterval` fixed.
pub const UVC_PROBE_HINT_FRAME_INTERVAL: u16 = 1 << 0;

/// Bits of the `bmHeaderInfo` field of a payload header.
pub const UVC_HEADER_FID: u8 = 1 << 0;
pub const UVC_HEADER_EOF: u8 = 1 << 1;
pub const UVC_HEADER_PTS: u8 = 1 << 2;
pub const UVC_HEADER_SCR: u8 = 1 << 3;
pub const UVC_HEADER_STI: u8 = 1 << 5;
pub const UVC_HEADER_ERR: u8 = 1 << 6;
pub const UVC_HEADER_EOH: u8 = 1 << 7;

/// Start-of-frame counters are transmitted with 11 bits.
pub const USB_SOF_MASK: u64 = 0x7ff;

/// Frame intervals are expressed in units of 100ns.
pub const FRAME_INTERVAL_UNITS_PER_SEC: u32 = 10_000_000;

/// Masks of the `wMaxPacketSize` field of an endpoint descriptor.
pub const USB_ENDPOINT_MAX_PACKET_SIZE_MASK: u16 = 0x07ff;
pub const USB_ENDPOINT_ADDITIONAL_TRANSACTIONS_SHIFT: u16 = 11;
pub const USB_ENDPOINT_ADDITIONAL_TRANSACTIONS_MASK: u16 = 0x3;

/// `bmAttributes` transfer type mask of an endpoint descriptor.
pub const USB_ENDPOINT_TYPE_MASK: u8 = 0x03;

/// `bmAttributes` of a SuperSpeed companion: isochronous multiplier, and presence of a
/// SuperSpeedPlus isochronous companion.
pub const USB_SS_COMPANION_MULT_MASK: u8 = 0x03;
pub const USB_SS_COMPANION_SSP_ISOCH: u8 = 1 << 7;

#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u8)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    InterfaceAssociation = 0x0b,
    CsInterface = 0x24,
    CsEndpoint = 0x25,
    SsEndpointCompanion = 0x30,
    SspIsochEndpointCompanion = 0x31,
}

/// Video Control class-specific interface descriptor subtypes.
#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u8)]
pub enum VcSubtype {
    Header = 0x01,
    InputTerminal = 0x02,
    OutputTerminal = 0x03,
    SelectorUnit = 0x04,
    ProcessingUnit = 0x05,
    ExtensionUnit = 0x06,
    EncodingUnit = 0x07,
}

/// Video Streaming class-specific interface descriptor subtypes.
#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u8)]
pub enum VsSubtype {
    InputHeader = 0x01,
    OutputHeader = 0x02,
    StillImageFrame = 0x03,
    FormatUncompressed = 0x04,
    FrameUncompressed = 0x05,
    FormatMjpeg = 0x06,
    FrameMjpeg = 0x07,
    FormatMpeg2ts = 0x0a,
    FormatDv = 0x0c,
    ColorFormat = 0x0d,
    FormatFrameBased = 0x10,
    FrameFrameBased = 0x11,
    FormatStreamBased = 0x12,
    FormatH264 = 0x13,
    FrameH264 = 0x14,
    FormatH264Simulcast = 0x15,
    FormatVp8 = 0x16,
    FrameVp8 = 0x17,
    FormatVp8Simulcast = 0x18,
}

impl VsSubtype {
    /// Returns the frame descriptor subtype that may follow a format descriptor of this
    /// subtype, or `None` if `self` is not a format subtype.
    pub fn allowed_frame_subtype(self) -> Option<VsSubtype> {
        match self {
            VsSubtype::FormatUncompressed => Some(VsSubtype::FrameUncompressed),
            VsSubtype::FormatMjpeg | VsSubtype::FormatMpeg2ts | VsSubtype::FormatDv => {
                Some(VsSubtype::FrameMjpeg)
            }
            VsSubtype::FormatFrameBased | VsSubtype::FormatStreamBased => {
                Some(VsSubtype::FrameFrameBased)
            }
            VsSubtype::FormatH264 | VsSubtype::FormatH264Simulcast => Some(VsSubtype::FrameH264),
            VsSubtype::FormatVp8 | VsSubtype::FormatVp8Simulcast => Some(VsSubtype::FrameVp8),
            _ => None,
        }
    }

    /// Whether the descriptor layout of this format carries a `bNumFrameDescriptors` field.
    pub fn has_frame_descriptors(self) -> bool {
        !matches!(
            self,
            VsSubtype::FormatMpeg2ts | VsSubtype::FormatDv | VsSubtype::FormatStreamBased
        )
    }
}

/// Transfer type of an endpoint, from bits 0-1 of `bmAttributes`.
#[derive(PartialEq, Eq, N, Clone, Copy, Debug)]
#[repr(u8)]
pub enum EndpointTransferType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

/// Header common to all descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct DescriptorHeader {
    pub bLength: u8,
    pub bDescriptorType: u8,
}

/// Header common to all class-specific interface descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct CsDescriptorHeader {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct InterfaceDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bInterfaceNumber: u8,
    pub bAlternateSetting: u8,
    pub bNumEndpoints: u8,
    pub bInterfaceClass: u8,
    pub bInterfaceSubClass: u8,
    pub bInterfaceProtocol: u8,
    pub iInterface: u8,
}

impl InterfaceDescriptor {
    pub fn is_video(&self, subclass: u8) -> bool {
        self.bInterfaceClass == USB_CLASS_VIDEO && self.bInterfaceSubClass == subclass
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct EndpointDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bEndpointAddress: u8,
    pub bmAttributes: u8,
    pub wMaxPacketSize: Le16,
    pub bInterval: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct SsEndpointCompanionDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bMaxBurst: u8,
    pub bmAttributes: u8,
    pub wBytesPerInterval: Le16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct SspIsochEndpointCompanionDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub wReserved: Le16,
    pub dwBytesPerInterval: Le32,
}

/// Fixed part of the class-specific VC interface header; `baInterfaceNr` follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VcHeaderDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bcdUVC: Le16,
    pub wTotalLength: Le16,
    pub dwClockFrequency: Le32,
    pub bInCollection: u8,
}

/// Fixed part of the class-specific VS input header; `bmaControls` follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsInputHeaderDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bNumFormats: u8,
    pub wTotalLength: Le16,
    pub bEndpointAddress: u8,
    pub bmInfo: u8,
    pub bTerminalLink: u8,
    pub bStillCaptureMethod: u8,
    pub bTriggerSupport: u8,
    pub bTriggerUsage: u8,
    pub bControlSize: u8,
}

/// Prefix shared by the format descriptors that are followed by frame descriptors.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsFormatHeader {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFormatIndex: u8,
    pub bNumFrameDescriptors: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsUncompressedFormatDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFormatIndex: u8,
    pub bNumFrameDescriptors: u8,
    pub guidFormat: [u8; 16],
    pub bBitsPerPixel: u8,
    pub bDefaultFrameIndex: u8,
    pub bAspectRatioX: u8,
    pub bAspectRatioY: u8,
    pub bmInterlaceFlags: u8,
    pub bCopyProtect: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsMjpegFormatDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFormatIndex: u8,
    pub bNumFrameDescriptors: u8,
    pub bmFlags: u8,
    pub bDefaultFrameIndex: u8,
    pub bAspectRatioX: u8,
    pub bAspectRatioY: u8,
    pub bmInterlaceFlags: u8,
    pub bCopyProtect: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsFrameBasedFormatDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFormatIndex: u8,
    pub bNumFrameDescriptors: u8,
    pub guidFormat: [u8; 16],
    pub bBitsPerPixel: u8,
    pub bDefaultFrameIndex: u8,
    pub bAspectRatioX: u8,
    pub bAspectRatioY: u8,
    pub bmInterlaceFlags: u8,
    pub bCopyProtect: u8,
    pub bVariableSize: u8,
}

/// Fixed part of an uncompressed or MJPEG frame descriptor; the frame intervals follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsFrameDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFrameIndex: u8,
    pub bmCapabilities: u8,
    pub wWidth: Le16,
    pub wHeight: Le16,
    pub dwMinBitRate: Le32,
    pub dwMaxBitRate: Le32,
    pub dwMaxVideoFrameBufferSize: Le32,
    pub dwDefaultFrameInterval: Le32,
    pub bFrameIntervalType: u8,
}

/// Fixed part of a frame-based frame descriptor; the frame intervals follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsFrameBasedFrameDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFrameIndex: u8,
    pub bmCapabilities: u8,
    pub wWidth: Le16,
    pub wHeight: Le16,
    pub dwMinBitRate: Le32,
    pub dwMaxBitRate: Le32,
    pub dwDefaultFrameInterval: Le32,
    pub bFrameIntervalType: u8,
    pub dwBytesPerLine: Le32,
}

/// Prefix of the frame descriptors this crate validates but does not flatten (H.264, VP8).
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsFrameHeader {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bFrameIndex: u8,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct VsColorMatchingDescriptor {
    pub bLength: u8,
    pub bDescriptorType: u8,
    pub bDescriptorSubtype: u8,
    pub bColorPrimaries: u8,
    pub bTransferCharacteristics: u8,
    pub bMatrixCoefficients: u8,
}

/// Video Probe and Commit control block, in its UVC 1.1 layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct ProbeCommitControl {
    pub bmHint: Le16,
    pub bFormatIndex: u8,
    pub bFrameIndex: u8,
    pub dwFrameInterval: Le32,
    pub wKeyFrameRate: Le16,
    pub wPFrameRate: Le16,
    pub wCompQuality: Le16,
    pub wCompWindowSize: Le16,
    pub wDelay: Le16,
    pub dwMaxVideoFrameSize: Le32,
    pub dwMaxPayloadTransferSize: Le32,
    pub dwClockFrequency: Le32,
    pub bmFramingInfo: u8,
    pub bPreferedVersion: u8,
    pub bMinVersion: u8,
    pub bMaxVersion: u8,
}

/// Length of the Probe and Commit control block defined by UVC 1.0, the shortest reply a device
/// may send to `GET_CUR`.
pub const PROBE_COMMIT_CONTROL_UVC10_LEN: usize = 26;

/// Prefix of every payload header.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct PayloadHeaderPrefix {
    pub bHeaderLength: u8,
    pub bmHeaderInfo: u8,
}

/// Source clock reference carried by payload headers with the SCR bit set.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes, Unaligned)]
pub struct SourceClockReference {
    pub dwSourceTimeClock: Le32,
    pub wSofCounter: Le16,
}

#[cfg(test)]
mod tests {
    use std::mem::size_of;

    use super::*;

    #[test]
    fn descriptor_sizes() {
        assert_eq!(size_of::<InterfaceDescriptor>(), 9);
        assert_eq!(size_of::<EndpointDescriptor>(), 7);
        assert_eq!(size_of::<SsEndpointCompanionDescriptor>(), 6);
        assert_eq!(size_of::<SspIsochEndpointCompanionDescriptor>(), 8);
        assert_eq!(size_of::<VcHeaderDescriptor>(), 12);
        assert_eq!(size_of::<VsInputHeaderDescriptor>(), 13);
        assert_eq!(size_of::<VsUncompressedFormatDescriptor>(), 27);
        assert_eq!(size_of::<VsMjpegFormatDescriptor>(), 11);
        assert_eq!(size_of::<VsFrameBasedFormatDescriptor>(), 28);
        assert_eq!(size_of::<VsFrameDescriptor>(), 26);
        assert_eq!(size_of::<VsFrameBasedFrameDescriptor>(), 26);
        assert_eq!(size_of::<ProbeCommitControl>(), 34);
        assert_eq!(size_of::<SourceClockReference>(), 6);
    }

    #[test]
    fn allowed_frame_subtypes() {
        assert_eq!(
            VsSubtype::FormatUncompressed.allowed_frame_subtype(),
            Some(VsSubtype::FrameUncompressed)
        );
        assert_eq!(
            VsSubtype::FormatDv.allowed_frame_subtype(),
            Some(VsSubtype::FrameMjpeg)
        );
        assert_eq!(
            VsSubtype::FormatStreamBased.allowed_frame_subtype(),
            Some(VsSubtype::FrameFrameBased)
        );
        assert_eq!(
            VsSubtype::FormatVp8Simulcast.allowed_frame_subtype(),
            Some(VsSubtype::FrameVp8)
        );
        assert_eq!(VsSubtype::FrameMjpeg.allowed_frame_subtype(), None);
        assert_eq!(VsSubtype::InputHeader.allowed_frame_subtype(), None);
    }
}

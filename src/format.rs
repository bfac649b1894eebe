// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Video formats, as advertised by the device and as requested by the stream consumer.

use crate::protocol::FRAME_INTERVAL_UNITS_PER_SEC;

/// Pixel formats this crate can stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Invalid,
    Bgra32,
    I420,
    M420,
    Nv12,
    Yuy2,
    Mjpeg,
}

/// Builds one of the `XXXX-0000-0010-8000-00AA00389B71` GUIDs used by UVC for FourCC-based
/// formats, as it appears in a descriptor (mixed-endian).
const fn fourcc_guid(fourcc: &[u8; 4]) -> [u8; 16] {
    [
        fourcc[0], fourcc[1], fourcc[2], fourcc[3], 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00,
        0xaa, 0x00, 0x38, 0x9b, 0x71,
    ]
}

pub const GUID_YUY2: [u8; 16] = fourcc_guid(b"YUY2");
pub const GUID_NV12: [u8; 16] = fourcc_guid(b"NV12");
pub const GUID_I420: [u8; 16] = fourcc_guid(b"I420");
pub const GUID_M420: [u8; 16] = fourcc_guid(b"M420");
pub const GUID_MJPG: [u8; 16] = fourcc_guid(b"MJPG");
/// `MEDIASUBTYPE_RGB32`, which is laid out as B, G, R, A in memory.
pub const GUID_RGB32: [u8; 16] = [
    0x7e, 0xeb, 0x36, 0xe4, 0x4f, 0x52, 0xce, 0x11, 0x9f, 0x53, 0x00, 0x20, 0xaf, 0x0b, 0xa7, 0x70,
];

impl PixelFormat {
    /// Returns the pixel format identified by `guid` in an uncompressed or frame-based format
    /// descriptor, or `PixelFormat::Invalid` if it is not supported.
    pub fn from_guid(guid: &[u8; 16]) -> Self {
        match *guid {
            GUID_YUY2 => PixelFormat::Yuy2,
            GUID_NV12 => PixelFormat::Nv12,
            GUID_I420 => PixelFormat::I420,
            GUID_M420 => PixelFormat::M420,
            GUID_RGB32 => PixelFormat::Bgra32,
            GUID_MJPG => PixelFormat::Mjpeg,
            _ => PixelFormat::Invalid,
        }
    }

    /// Returns the GUID that identifies this format in a descriptor.
    pub fn guid(self) -> Option<[u8; 16]> {
        match self {
            PixelFormat::Invalid => None,
            PixelFormat::Bgra32 => Some(GUID_RGB32),
            PixelFormat::I420 => Some(GUID_I420),
            PixelFormat::M420 => Some(GUID_M420),
            PixelFormat::Nv12 => Some(GUID_NV12),
            PixelFormat::Yuy2 => Some(GUID_YUY2),
            PixelFormat::Mjpeg => Some(GUID_MJPG),
        }
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Frame rate, in frames per second, as a fraction.
///
/// Devices do not necessarily report reduced fractions, so two rates compare equal whenever they
/// represent the same value.
#[derive(Debug, Clone, Copy)]
pub struct FrameRate {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameRate {
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Frame rate corresponding to a frame interval expressed in 100ns units.
    pub fn from_frame_interval(interval: u32) -> Self {
        Self::new(FRAME_INTERVAL_UNITS_PER_SEC, interval).reduced()
    }

    /// Returns this fraction with numerator and denominator divided by their GCD.
    pub fn reduced(self) -> Self {
        match gcd(self.numerator, self.denominator) {
            0 => self,
            d => Self::new(self.numerator / d, self.denominator / d),
        }
    }

    /// Frame interval in 100ns units corresponding to this rate, if it is a whole number.
    pub fn frame_interval(self) -> Option<u32> {
        if self.numerator == 0 {
            return None;
        }
        let units = FRAME_INTERVAL_UNITS_PER_SEC as u64 * self.denominator as u64;
        if units % self.numerator as u64 != 0 {
            return None;
        }
        u32::try_from(units / self.numerator as u64).ok()
    }
}

impl PartialEq for FrameRate {
    fn eq(&self, other: &Self) -> bool {
        let a = self.reduced();
        let b = other.reduced();
        a.numerator == b.numerator && a.denominator == b.denominator
    }
}

impl Eq for FrameRate {}

/// One supported (format, frame) combination of a device, flattened from its descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UvcFormat {
    /// `bFormatIndex` of the format descriptor.
    pub format_index: u8,
    /// `bFrameIndex` of the frame descriptor.
    pub frame_index: u8,
    pub pixel_format: PixelFormat,
    pub bits_per_pixel: u8,
    /// Default frame interval, in 100ns units.
    pub default_frame_interval: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row.
    pub stride: u32,
    /// `bDefaultFrameIndex` of the format descriptor.
    pub default_frame_index: u8,
}

impl UvcFormat {
    pub fn frame_rate(&self) -> FrameRate {
        FrameRate::from_frame_interval(self.default_frame_interval)
    }

    /// Converts this format into its client-facing representation.
    pub fn to_video_format(&self) -> VideoFormat {
        VideoFormat {
            pixel_format: self.pixel_format,
            width: self.width,
            height: self.height,
            bytes_per_row: self.stride,
            bits_per_pixel: self.bits_per_pixel,
            frame_rate: self.frame_rate(),
        }
    }
}

/// Client-facing description of a video format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFormat {
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub bytes_per_row: u32,
    pub bits_per_pixel: u8,
    pub frame_rate: FrameRate,
}

impl VideoFormat {
    /// Whether `uvc_format` is the device format described by `self`.
    pub fn matches(&self, uvc_format: &UvcFormat) -> bool {
        self.pixel_format == uvc_format.pixel_format
            && self.width == uvc_format.width
            && self.height == uvc_format.height
            && self.bytes_per_row == uvc_format.stride
            && self.frame_rate == uvc_format.frame_rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yuy2_720p() -> UvcFormat {
        UvcFormat {
            format_index: 1,
            frame_index: 2,
            pixel_format: PixelFormat::Yuy2,
            bits_per_pixel: 16,
            default_frame_interval: 333_333,
            width: 1280,
            height: 720,
            stride: 2560,
            default_frame_index: 1,
        }
    }

    #[test]
    fn frame_rate_reduction() {
        assert_eq!(FrameRate::new(30, 1), FrameRate::new(60, 2));
        assert_ne!(FrameRate::new(30, 1), FrameRate::new(60, 1));
        let reduced = FrameRate::new(10_000_000, 333_333).reduced();
        assert_eq!(reduced.numerator, 10_000_000);
        assert_eq!(reduced.denominator, 333_333);
        let reduced = FrameRate::new(10_000_000, 400_000).reduced();
        assert_eq!((reduced.numerator, reduced.denominator), (25, 1));
        assert_eq!(FrameRate::from_frame_interval(400_000), FrameRate::new(25, 1));
    }

    #[test]
    fn frame_rate_degenerate() {
        let zero = FrameRate::new(0, 0);
        assert_eq!(zero.reduced().denominator, 0);
        assert_eq!(zero.frame_interval(), None);
        assert_eq!(FrameRate::new(30, 1).frame_interval(), None);
        assert_eq!(FrameRate::new(25, 1).frame_interval(), Some(400_000));
    }

    #[test]
    fn video_format_round_trip() {
        let format = yuy2_720p();
        let video_format = format.to_video_format();
        assert_eq!(video_format.width, format.width);
        assert_eq!(video_format.height, format.height);
        assert_eq!(video_format.pixel_format, format.pixel_format);
        assert_eq!(video_format.bytes_per_row, format.stride);
        assert_eq!(
            video_format.frame_rate.frame_interval(),
            Some(format.default_frame_interval)
        );
        assert_eq!(video_format.frame_rate, format.frame_rate());
    }

    #[test]
    fn video_format_matching() {
        let format = yuy2_720p();
        let video_format = format.to_video_format();
        assert!(video_format.matches(&format));

        let mut other = video_format.clone();
        other.bytes_per_row += 1;
        assert!(!other.matches(&format));

        let mut other = video_format.clone();
        other.width = 640;
        assert!(!other.matches(&format));

        let mut other = video_format.clone();
        other.pixel_format = PixelFormat::Nv12;
        assert!(!other.matches(&format));

        // Unreduced but equivalent frame rates still match.
        let mut format = yuy2_720p();
        format.default_frame_interval = 400_000;
        let mut other = format.to_video_format();
        other.frame_rate = FrameRate::new(50, 2);
        assert!(other.matches(&format));
    }

    #[test]
    fn guid_lookup() {
        assert_eq!(PixelFormat::from_guid(&GUID_YUY2), PixelFormat::Yuy2);
        assert_eq!(PixelFormat::from_guid(&GUID_RGB32), PixelFormat::Bgra32);
        assert_eq!(PixelFormat::from_guid(&[0u8; 16]), PixelFormat::Invalid);
        for format in [
            PixelFormat::Bgra32,
            PixelFormat::I420,
            PixelFormat::M420,
            PixelFormat::Nv12,
            PixelFormat::Yuy2,
            PixelFormat::Mjpeg,
        ] {
            assert_eq!(PixelFormat::from_guid(&format.guid().unwrap()), format);
        }
        assert_eq!(PixelFormat::Invalid.guid(), None);
    }
}

// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! UVC devices implemented in software.
//!
//! [fake_camera] implements a camera that streams payloads provided by the caller. It can be used
//! to test a client of this crate without any specific hardware on the host, or as a reference
//! for how to implement [`crate::UsbIoProvider`].

#[cfg(feature = "fake-camera")]
pub mod fake_camera;
#[cfg(feature = "fake-camera")]
pub use fake_camera::FakeUvcCamera;

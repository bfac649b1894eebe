// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reconciliation of the device and host clocks into a capture time for each frame.
//!
//! Payload headers may carry the device clock value at which the frame started being sampled
//! (PTS) and the device clock value and bus frame number at which the payload was sent (SCR).
//! Together with the bus frame number at which the host saw the frame start and the time at which
//! the transfer completed, this gives an estimate of when the frame was captured in the host's
//! monotonic time base.

use log::debug;

use crate::protocol::USB_SOF_MASK;

const NSEC_PER_SEC: u64 = 1_000_000_000;
/// USB (micro)frame numbers reported in the SCR count milliseconds.
const NSEC_PER_SOF: u64 = 1_000_000;

/// Delay between the start of sampling and the transmission of the frame by the device, in
/// nanoseconds.
pub fn device_delay_ns(pts: u32, stc: u32, clock_frequency_hz: u32) -> u64 {
    if clock_frequency_hz == 0 {
        return 0;
    }
    stc.wrapping_sub(pts) as u64 * NSEC_PER_SEC / clock_frequency_hz as u64
}

/// Delay between the transmission of the frame by the device and its reception by the host, in
/// bus frames (milliseconds).
pub fn transport_delay_ms(host_sof: u64, device_sof: u16) -> u64 {
    (host_sof & USB_SOF_MASK).wrapping_sub(device_sof as u64) & USB_SOF_MASK
}

/// Clock samples collected for the frame being assembled.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FrameClock {
    pts: Option<u32>,
    /// Source time clock and the device SOF it was sampled at.
    scr: Option<(u32, u16)>,
    /// Host SOF at which the frame started.
    host_sof: u64,
    capture_time: Option<i64>,
}

impl FrameClock {
    /// Starts tracking a new frame that started at bus frame `host_sof`.
    pub fn new(host_sof: u64) -> Self {
        Self {
            host_sof,
            ..Default::default()
        }
    }

    /// Records the presentation timestamp of a payload. Only the first one of a frame is kept.
    pub fn record_pts(&mut self, pts: u32) {
        match self.pts {
            None => self.pts = Some(pts),
            Some(first) if first != pts => {
                debug!("PTS changed within frame: {} -> {}", first, pts)
            }
            Some(_) => (),
        }
    }

    /// Records the source clock reference of a payload. Only the first one of a frame is kept.
    pub fn record_scr(&mut self, stc: u32, device_sof: u16) {
        if self.scr.is_none() {
            self.scr = Some((stc, device_sof));
        }
    }

    /// Computes the capture time of the frame if it has not been computed yet and all the
    /// required samples are available. `host_time_ns` is the time at which the current payload
    /// completed.
    ///
    /// The capture time moves back as `STC - PTS` grows: half of the device delay is taken off
    /// the host completion time on top of the transport delay.
    pub fn update(&mut self, host_time_ns: i64, clock_frequency_hz: u32) {
        if self.capture_time.is_some() {
            return;
        }
        let (Some(pts), Some((stc, device_sof))) = (self.pts, self.scr) else {
            return;
        };

        let device_delay = device_delay_ns(pts, stc, clock_frequency_hz) as i64;
        let transport_delay =
            (transport_delay_ms(self.host_sof, device_sof) * NSEC_PER_SOF) as i64;
        let capture_start = host_time_ns - (device_delay + transport_delay);
        self.capture_time = Some(capture_start + device_delay / 2);
    }

    /// Capture time of the frame in nanoseconds of the host monotonic clock, or 0 if it could
    /// not be computed.
    pub fn capture_time(&self) -> i64 {
        self.capture_time.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CLOCK_HZ: u32 = 48_000_000;

    #[test]
    fn delays() {
        // 48000 ticks at 48MHz.
        assert_eq!(device_delay_ns(1000, 49_000, CLOCK_HZ), 1_000_000);
        assert_eq!(device_delay_ns(u32::MAX - 999, 47_000, CLOCK_HZ), 1_000_000);
        assert_eq!(device_delay_ns(1000, 49_000, 0), 0);

        assert_eq!(transport_delay_ms(105, 100), 5);
        assert_eq!(transport_delay_ms(0x800 | 105, 100), 5);
        assert_eq!(transport_delay_ms(2, 0x7fe), 4);
    }

    #[test]
    fn requires_pts_and_scr() {
        let mut clock = FrameClock::new(10);
        clock.update(1_000_000_000, CLOCK_HZ);
        assert_eq!(clock.capture_time(), 0);

        clock.record_pts(1000);
        clock.update(1_000_000_000, CLOCK_HZ);
        assert_eq!(clock.capture_time(), 0);

        clock.record_scr(49_000, 8);
        clock.update(1_000_000_000, CLOCK_HZ);
        // 1ms device delay, 2ms transport delay.
        assert_eq!(clock.capture_time(), 1_000_000_000 - 3_000_000 + 500_000);
    }

    #[test]
    fn computed_once() {
        let mut clock = FrameClock::new(10);
        clock.record_pts(1000);
        clock.record_scr(49_000, 10);
        clock.update(1_000_000_000, CLOCK_HZ);
        let first = clock.capture_time();
        clock.update(2_000_000_000, CLOCK_HZ);
        assert_eq!(clock.capture_time(), first);
    }

    #[test]
    fn first_samples_win() {
        let mut clock = FrameClock::new(10);
        clock.record_pts(1000);
        clock.record_pts(5000);
        clock.record_scr(49_000, 10);
        clock.record_scr(97_000, 9);
        clock.update(1_000_000_000, CLOCK_HZ);
        assert_eq!(clock.capture_time(), 1_000_000_000 - 1_000_000 + 500_000);
    }

    #[test]
    fn capture_time_moves_back_with_device_delay() {
        let capture_time = |delay_ticks: u32| {
            let mut clock = FrameClock::new(10);
            clock.record_pts(1000);
            clock.record_scr(1000 + delay_ticks, 10);
            clock.update(1_000_000_000, CLOCK_HZ);
            clock.capture_time()
        };

        let mut previous = capture_time(0);
        assert_eq!(previous, 1_000_000_000);
        for delay_ticks in [480, 4800, 48_000, 480_000] {
            let current = capture_time(delay_ticks);
            assert!(current < previous);
            previous = current;
        }
    }
}

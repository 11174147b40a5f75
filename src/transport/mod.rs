//! # Transport Module
//!
//! Collaborator interfaces the RPM subsystem talks through.
//!
//! This module handles:
//! - Capturing polled KISS frames from an asynchronous receive path
//! - Draining the continuous HW4 byte stream
//! - Requesting telemetry from a motor output
//! - Querying the non-ESC eRPM origins (frequency sensor, DSHOT telemetry)
//! - Opening the ESC telemetry serial port on a host

pub mod frame_buffer;
pub mod serial;

pub use frame_buffer::FrameBuffer;

#[cfg(test)]
use mockall::automock;

/// Polled byte source for protocols without a receive callback
pub trait ByteSource: Send {
    /// Number of received bytes waiting to be read
    fn bytes_available(&mut self) -> usize;

    /// Take the next received byte, if any
    fn read_byte(&mut self) -> Option<u8>;
}

/// Motor output driver as seen by the telemetry subsystem
#[cfg_attr(test, automock)]
pub trait MotorDriver {
    /// Number of configured motors
    fn motor_count(&self) -> usize;

    /// Whether the motor outputs are running (telemetry is only polled then)
    fn motor_is_enabled(&self) -> bool;

    /// Ask the ESC on `motor` to send one KISS telemetry frame
    fn request_telemetry(&mut self, motor: usize);
}

/// An origin of raw electrical RPM other than the ESC sensor
#[cfg_attr(test, automock)]
pub trait ErpmSource {
    /// Whether this origin can deliver eRPM for `motor` (checked once at init)
    fn is_available(&self, motor: usize) -> bool;

    /// Latest eRPM for `motor`, in the origin's native units
    fn erpm(&self, motor: usize) -> i32;
}

/// In-memory byte source for protocol tests
#[cfg(test)]
#[derive(Debug, Default, Clone)]
pub struct SliceByteSource {
    data: std::collections::VecDeque<u8>,
}

#[cfg(test)]
impl SliceByteSource {
    /// Create a source that yields `data` in order
    pub fn new(data: &[u8]) -> Self {
        Self {
            data: data.iter().copied().collect(),
        }
    }
}

#[cfg(test)]
impl ByteSource for SliceByteSource {
    fn bytes_available(&mut self) -> usize {
        self.data.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.data.pop_front()
    }
}

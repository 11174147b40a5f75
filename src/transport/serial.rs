//! # ESC Telemetry Serial Port
//!
//! Host-side transport for the ESC telemetry line.
//!
//! This module handles:
//! - Opening the telemetry port at the protocol's baud rate (8N1)
//! - Feeding received bytes into the KISS capture buffer
//! - Forwarding the HW4 byte stream to the polling tick over a channel

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use super::{ByteSource, FrameBuffer};
use crate::config::EscProtocol;
use crate::error::{Result, RotorRpmError};

/// KISS telemetry baud rate
pub const KISS_BAUD_RATE: u32 = 115_200;

/// Hobbywing V4 telemetry baud rate
pub const HW4_BAUD_RATE: u32 = 19_200;

/// Read chunk size for the receive pumps
const READ_CHUNK_SIZE: usize = 64;

/// Baud rate used by a telemetry protocol
pub fn baud_rate_for(protocol: EscProtocol) -> u32 {
    match protocol {
        EscProtocol::Kiss => KISS_BAUD_RATE,
        EscProtocol::Hw4 => HW4_BAUD_RATE,
    }
}

/// ESC telemetry serial port
pub struct EscSerial {
    /// Serial port handle
    port: tokio_serial::SerialStream,
    /// Device path (e.g., /dev/ttyUSB0)
    device_path: String,
}

impl std::fmt::Debug for EscSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl EscSerial {
    /// Open the telemetry port for `protocol`
    ///
    /// # Errors
    ///
    /// Returns [`RotorRpmError::NoTransport`] if `path` is empty, or a
    /// serial error if the device cannot be opened.
    pub fn open(path: &str, protocol: EscProtocol, half_duplex: bool) -> Result<Self> {
        if path.is_empty() {
            return Err(RotorRpmError::NoTransport);
        }

        if half_duplex {
            warn!("Half-duplex requested for {}; host ports run full-duplex", path);
        }

        Self::open_with_paths(&[path], baud_rate_for(protocol))
    }

    /// Open the first device in `paths` that accepts the settings
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened ESC telemetry port {} at {} baud", path, baud_rate);
                    return Ok(Self {
                        port,
                        device_path: path.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(RotorRpmError::SerialPortNotFound(paths.join(", ")))
    }

    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| RotorRpmError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Device path of the opened port
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    /// Hand the stream over to a receive pump
    pub fn into_stream(self) -> tokio_serial::SerialStream {
        self.port
    }
}

/// Receive loop for KISS: every byte goes straight into the capture buffer
///
/// Stands in for the UART receive interrupt. Runs until the reader hits EOF
/// and returns the number of bytes received.
pub async fn pump_into_frame_buffer<R>(mut reader: R, buffer: Arc<FrameBuffer>) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut chunk)
            .await
            .map_err(|e| RotorRpmError::Serial(format!("Read failed: {}", e)))?;
        if n == 0 {
            debug!("Telemetry port closed after {} bytes", total);
            return Ok(total);
        }

        for &byte in &chunk[..n] {
            buffer.push(byte);
        }
        total += n as u64;
    }
}

/// Receive loop for HW4: forward raw chunks to the polling side
///
/// Stops at EOF or once the receiving side has been dropped.
pub async fn pump_into_channel<R>(mut reader: R, tx: mpsc::UnboundedSender<Bytes>) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut total = 0u64;

    loop {
        chunk.reserve(READ_CHUNK_SIZE);
        let n = reader
            .read_buf(&mut chunk)
            .await
            .map_err(|e| RotorRpmError::Serial(format!("Read failed: {}", e)))?;
        if n == 0 {
            debug!("Telemetry port closed after {} bytes", total);
            return Ok(total);
        }

        total += n as u64;
        if tx.send(chunk.split().freeze()).is_err() {
            return Ok(total);
        }
    }
}

/// Byte source fed by [`pump_into_channel`]
#[derive(Debug)]
pub struct ChannelByteSource {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
}

impl ChannelByteSource {
    pub fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            rx,
            pending: BytesMut::new(),
        }
    }

    fn drain_channel(&mut self) {
        while let Ok(chunk) = self.rx.try_recv() {
            self.pending.extend_from_slice(&chunk);
        }
    }
}

impl ByteSource for ChannelByteSource {
    fn bytes_available(&mut self) -> usize {
        self.drain_channel();
        self.pending.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if !self.pending.has_remaining() {
            self.drain_channel();
        }

        if self.pending.has_remaining() {
            Some(self.pending.get_u8())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baud_rates() {
        assert_eq!(baud_rate_for(EscProtocol::Kiss), 115_200);
        assert_eq!(baud_rate_for(EscProtocol::Hw4), 19_200);
    }

    #[test]
    fn test_open_with_empty_path_has_no_transport() {
        let result = EscSerial::open("", EscProtocol::Kiss, false);
        assert!(matches!(result, Err(RotorRpmError::NoTransport)));
    }

    #[test]
    fn test_open_with_invalid_paths_returns_error() {
        let invalid_paths = &["/dev/nonexistent0", "/dev/nonexistent1"];
        let result = EscSerial::open_with_paths(invalid_paths, KISS_BAUD_RATE);

        match result {
            Err(RotorRpmError::SerialPortNotFound(msg)) => {
                assert!(msg.contains("/dev/nonexistent0"));
                assert!(msg.contains("/dev/nonexistent1"));
            }
            other => panic!("Expected SerialPortNotFound error, got: {:?}", other),
        }
    }

    #[test]
    fn test_open_port_with_invalid_path_returns_error() {
        let result = EscSerial::open_port("/dev/nonexistent_serial_device_12345", HW4_BAUD_RATE);

        match result {
            Err(RotorRpmError::Serial(msg)) => {
                assert!(msg.contains("/dev/nonexistent_serial_device_12345"));
                assert!(msg.contains("Failed to open"));
            }
            other => panic!("Expected Serial error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pump_into_frame_buffer_stops_at_armed_length() {
        let buffer = Arc::new(FrameBuffer::new());
        buffer.arm(4);

        let reader = tokio_test::io::Builder::new()
            .read(&[1, 2, 3])
            .read(&[4, 5, 6])
            .build();

        let total = pump_into_frame_buffer(reader, Arc::clone(&buffer)).await.unwrap();

        assert_eq!(total, 6);
        assert!(buffer.is_complete());
        assert_eq!(buffer.contents::<4>(), [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_pump_into_channel_feeds_byte_source() {
        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio_test::io::Builder::new()
            .read(&[0x9B, 0x00])
            .read(&[0x01])
            .build();

        let total = pump_into_channel(reader, tx).await.unwrap();
        assert_eq!(total, 3);

        let mut source = ChannelByteSource::new(rx);
        assert_eq!(source.bytes_available(), 3);
        assert_eq!(source.read_byte(), Some(0x9B));
        assert_eq!(source.read_byte(), Some(0x00));
        assert_eq!(source.read_byte(), Some(0x01));
        assert_eq!(source.read_byte(), None);
    }

    #[tokio::test]
    async fn test_pump_into_channel_stops_when_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let reader = tokio_test::io::Builder::new().read(&[1, 2]).build();
        let total = pump_into_channel(reader, tx).await.unwrap();
        assert_eq!(total, 2);
    }
}

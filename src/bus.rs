use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use log::{debug, info};
use serialport::{DataBits, Parity, StopBits};
use thiserror::Error;

use crate::bus_msg::{BusMessage, MessageBlock, MAX_PAYLOAD_LEN};

/// Every message on the wire starts with these bytes.
pub const PREAMBLE: [u8; 3] = [0x55, 0x77, 0x4F];

#[derive(Error, Debug)]
pub enum BusError {
    #[error("the payload length cannot exceed {MAX_PAYLOAD_LEN} bytes, but payload is {0} bytes")]
    PayloadTooLong(usize),
    #[error("bus write failed after {sent} of {total} messages")]
    Write {
        sent: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },
}

/// Wraps a single message into its wire representation.
pub fn encode_message(message: &BusMessage) -> Result<Vec<u8>, BusError> {
    let payload = message.payload();
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(BusError::PayloadTooLong(payload.len()));
    }
    let mut buffer = Vec::with_capacity(PREAMBLE.len() + 1 + payload.len());
    buffer.extend_from_slice(&PREAMBLE);
    buffer.push(message.field().tag());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Exclusive access to the serial line of the fixture microcontrollers.
pub struct BusHub {
    port: Mutex<Box<dyn Write + Send>>,
}

impl BusHub {
    /// Opens the UART with 8N1 framing.
    ///
    /// Arguments:
    ///   path:      Device path of the serial port, e.g. /dev/ttyAMA0.
    ///   baud_rate: Must match the firmware, usually 19200.
    pub fn open(path: &str, baud_rate: u32) -> anyhow::Result<BusHub> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(500))
            .open()
            .with_context(|| format!("failed to open UART {}", path))?;
        info!("opened bus on {} at {} baud", path, baud_rate);
        Ok(BusHub::from_writer(port))
    }

    pub fn from_writer(writer: impl Write + Send + 'static) -> BusHub {
        BusHub {
            port: Mutex::new(Box::new(writer)),
        }
    }

    /// Writes all messages of the block in order.
    ///
    /// Nothing is written if any message is malformed. A failed write aborts
    /// the rest of the block; the next full block resynchronizes the fixtures.
    pub fn send(&self, block: &MessageBlock) -> Result<(), BusError> {
        let frames = block
            .iter()
            .map(encode_message)
            .collect::<Result<Vec<_>, _>>()?;

        let mut port = self.port.lock().unwrap_or_else(PoisonError::into_inner);
        for (sent, frame) in frames.iter().enumerate() {
            port.write_all(frame)
                .and_then(|_| port.flush())
                .map_err(|source| BusError::Write {
                    sent,
                    total: frames.len(),
                    source,
                })?;
        }
        debug!("sent block of {} bus messages", frames.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus_msg::{create_lighting_off, create_lighting_strobe, Color};
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<Vec<u8>>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Accepts `remaining` writes, then fails.
    struct Flaky {
        remaining: usize,
        capture: Capture,
    }

    impl Write for Flaky {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"));
            }
            self.remaining -= 1;
            self.capture.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_messages_are_framed_in_order() {
        let capture = Capture::default();
        let hub = BusHub::from_writer(capture.clone());
        hub.send(&create_lighting_off(true)).unwrap();

        let written = capture.0.lock().unwrap();
        assert_eq!(
            *written,
            vec![
                vec![0x55, 0x77, 0x4F, 0x03, 0x00],
                vec![0x55, 0x77, 0x4F, 0x02, 0x01],
            ]
        );
    }

    #[test]
    fn test_write_error_aborts_block() {
        let capture = Capture::default();
        let hub = BusHub::from_writer(Flaky {
            remaining: 2,
            capture: capture.clone(),
        });
        let block = create_lighting_strobe(Color::WHITE, 100, 1, false);
        let err = hub.send(&block).unwrap_err();

        match err {
            BusError::Write { sent, total, .. } => {
                assert_eq!(sent, 2);
                assert_eq!(total, 5);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(capture.0.lock().unwrap().len(), 2);
    }
}

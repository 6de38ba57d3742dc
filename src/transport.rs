//! The transport collaborator
//!
//! The physical link to the controller (UART, USB, a socket to an emulator) is driven by a
//! separate crate. This crate only requires that the driver can deliver and accept *whole* HCI
//! packets prefixed with the packet indicator byte defined by the UART transport layer of the
//! Bluetooth Specification. The indicator is necessary because HCI packets contain no information
//! on the type of packet that they are.
//!
//! Frames going down to the controller are pushed through [`Transport::send_frame`]. Frames
//! coming up from the controller are read by a driver-owned reader task which classifies them
//! with [`PacketIndicator::classify`] and hands them to the event decoder (for event packets) or
//! to [`ConnectionManager::handle_data`] (for ACL data packets).
//!
//! [`ConnectionManager::handle_data`]: crate::manager::ConnectionManager::handle_data

use crate::errors::Error;

/// A link to the Bluetooth controller
///
/// Implementations deliver one complete indicator-prefixed HCI packet per call. An `Err` return
/// means the link itself failed; it is treated as fatal by every manager sharing the transport
/// as nothing can be salvaged once the link is gone.
pub trait Transport: Send + Sync {
    /// Send a complete HCI packet, including the leading packet indicator byte
    fn send_frame(&self, frame: &[u8]) -> Result<(), Error>;
}

/// The HCI UART packet indicator
///
/// A single byte prepended to every HCI packet to label the kind of packet that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketIndicator {
    Command,
    Acl,
    Sco,
    Event,
}

impl PacketIndicator {
    /// Convert the indicator into its wire value
    pub const fn into_byte(self) -> u8 {
        match self {
            PacketIndicator::Command => 1,
            PacketIndicator::Acl => 2,
            PacketIndicator::Sco => 3,
            PacketIndicator::Event => 4,
        }
    }

    /// Classify a frame by its leading indicator byte
    ///
    /// The returned payload is the HCI packet without the indicator. An unknown indicator value
    /// is a protocol error; the caller is expected to drop the frame.
    pub fn classify(frame: &[u8]) -> Result<(PacketIndicator, &[u8]), Error> {
        let (first, rest) = frame.split_first().ok_or(Error::Protocol("empty frame"))?;

        let indicator = match first {
            1 => PacketIndicator::Command,
            2 => PacketIndicator::Acl,
            3 => PacketIndicator::Sco,
            4 => PacketIndicator::Event,
            _ => return Err(Error::Protocol("reserved packet indicator")),
        };

        Ok((indicator, rest))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A transport that records every sent frame
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        frames: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl RecordingTransport {
        pub fn new() -> std::sync::Arc<Self> {
            std::sync::Arc::new(Self::default())
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.frames.lock().unwrap().clone()
        }

        pub fn sent_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }

        pub fn fail_next(&self) {
            self.fail.store(true, Ordering::SeqCst);
        }
    }

    impl Transport for RecordingTransport {
        fn send_frame(&self, frame: &[u8]) -> Result<(), Error> {
            if self.fail.swap(false, Ordering::SeqCst) {
                return Err(Error::Transport("test transport failure".to_string()));
            }

            self.frames.lock().unwrap().push(frame.to_vec());

            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_indicators() {
        let (kind, payload) = PacketIndicator::classify(&[2, 0xa, 0xb]).unwrap();

        assert_eq!(PacketIndicator::Acl, kind);
        assert_eq!(&[0xa, 0xb], payload);

        assert_eq!(
            Err(Error::Protocol("reserved packet indicator")),
            PacketIndicator::classify(&[9, 0])
        );

        assert_eq!(Err(Error::Protocol("empty frame")), PacketIndicator::classify(&[]));
    }
}

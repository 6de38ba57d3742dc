//! The host side transport core of the Host Controller Interface (HCI)
//!
//! This crate turns the single byte-stream link to a Bluetooth controller into two services for
//! the protocol layers above it: reliable, ordered command/response exchange with the controller
//! and many independent, flow controlled, fragmented data connections multiplexed over that same
//! link.
//!
//! # Async Tasks
//! The implementation is broken up into long lived async tasks coordinated through explicit
//! signals and queues rather than one lock held across I/O.
//!
//! ### Command Queue Tasks
//! The [`CommandManager`] runs one worker task per command queue. A worker pops committed command
//! tokens, waits for command credit from the controller and for its opcode to be unique among
//! in-flight commands, and then transmits the command. The *Command Complete* and
//! *Command Status* events resolve the waiting callers.
//!
//! ### TX Slot Tasks
//! Each physical data buffer on the controller (BR/EDR ACL, SCO, LE ACL) is represented by a
//! [`TxSlotManager`] running one worker task. The worker transmits queued ACL fragments from the
//! connections assigned to its buffer while credit remains, preferring the connection with the
//! fewest unacknowledged packets.
//!
//! ### The Reader Task
//! The driver of the physical link owns a reader task. It classifies received frames with
//! [`PacketIndicator::classify`] and hands ACL data to [`ConnectionManager::handle_data`] and
//! decoded events to [`ConnectionManager::handle_event`].
//!
//! # Wire framing
//! Frames exchanged with the transport driver are whole HCI packets prefixed with the UART packet
//! indicator byte. An ACL data packet is the 4 byte header (12 bit connection handle, 2 bit
//! packet boundary flag, 2 bit broadcast flag, and a little endian payload length) followed by
//! the payload. The L2CAP basic header (little endian length then channel identifier) inside the
//! reassembled payload is the sole signal for where one upper layer frame ends and the next
//! begins.
//!
//! [`CommandManager`]: crate::commands::CommandManager
//! [`TxSlotManager`]: crate::flow_ctrl::TxSlotManager
//! [`ConnectionManager::handle_data`]: crate::manager::ConnectionManager::handle_data
//! [`ConnectionManager::handle_event`]: crate::manager::ConnectionManager::handle_event
//! [`PacketIndicator::classify`]: crate::transport::PacketIndicator::classify

pub mod commands;
pub mod connection;
pub mod errors;
pub mod events;
pub mod flow_ctrl;
pub mod manager;
pub mod opcodes;
pub mod token;
pub mod transport;

pub use commands::{CommandManager, WatchdogConfig};
pub use connection::Connection;
pub use errors::Error;
pub use flow_ctrl::{BufferClass, SlotConfig, TxSlotManager};
pub use manager::ConnectionManager;
pub use transport::{PacketIndicator, Transport};

use core::fmt;

/// The connection handle
///
/// This is used as an identifier of a connection by both the host and controller. It is created
/// by the controller when a connection is established with another device and is unique among
/// open connections for the lifetime of the connection.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct ConnectionHandle {
    handle: u16,
}

impl ConnectionHandle {
    pub const MAX: u16 = 0x0EFF;

    const ERROR: &'static str = "raw connection handle is larger than the maximum (0x0EFF)";

    pub fn get_raw_handle(&self) -> u16 {
        self.handle
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.handle)
    }
}

impl fmt::LowerHex for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.handle)
    }
}

impl AsRef<u16> for ConnectionHandle {
    fn as_ref(&self) -> &u16 {
        &self.handle
    }
}

impl TryFrom<u16> for ConnectionHandle {
    type Error = Error;

    fn try_from(raw: u16) -> Result<Self, Self::Error> {
        if raw <= ConnectionHandle::MAX {
            Ok(ConnectionHandle { handle: raw })
        } else {
            Err(Error::InvalidHandle(Self::ERROR))
        }
    }
}

impl TryFrom<[u8; 2]> for ConnectionHandle {
    type Error = Error;

    fn try_from(raw: [u8; 2]) -> Result<Self, Self::Error> {
        ConnectionHandle::try_from(<u16>::from_le_bytes(raw))
    }
}

/// The packet boundary flag
///
/// The packet boundary flag is a two bit flag within the HCI ACL data packet. It is the signal
/// the receiver uses to recombine fragments into whole upper layer frames: a *first* flag starts
/// a new frame and a *continuing* flag extends the one in progress.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclPacketBoundary {
    FirstNonFlushable,
    ContinuingFragment,
    FirstAutoFlushable,
    CompleteL2capPdu,
}

impl AclPacketBoundary {
    /// Get the value shifted into the correct place of the packet boundary flag in the HCI ACL
    /// data packet. The returned value is in host byte order.
    pub(crate) fn get_shifted_val(&self) -> u16 {
        (match self {
            AclPacketBoundary::FirstNonFlushable => 0x0,
            AclPacketBoundary::ContinuingFragment => 0x1,
            AclPacketBoundary::FirstAutoFlushable => 0x2,
            AclPacketBoundary::CompleteL2capPdu => 0x3,
        }) << 12
    }

    /// Get the `AclPacketBoundary` from the first 16 bits of a HCI ACL data packet. The input
    /// `val` does not need to be masked to only include the packet boundary flag, however it does
    /// need to be in host byte order.
    pub(crate) fn from_shifted_val(val: u16) -> Self {
        match (val >> 12) & 3 {
            0x0 => AclPacketBoundary::FirstNonFlushable,
            0x1 => AclPacketBoundary::ContinuingFragment,
            0x2 => AclPacketBoundary::FirstAutoFlushable,
            _ => AclPacketBoundary::CompleteL2capPdu,
        }
    }

    /// Check whether this flag starts a new upper layer frame
    pub fn is_start(&self) -> bool {
        !matches!(self, AclPacketBoundary::ContinuingFragment)
    }
}

/// The broadcast flag
///
/// The broadcast flag is an indicator of who the message is for or from. Everything this crate
/// sends is point-to-point data, so it always transmits `NoBroadcast`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AclBroadcastFlag {
    /// Point-to-point message
    NoBroadcast,
    /// Broadcast to all active peripherals
    BrEdrBroadcast,
}

impl AclBroadcastFlag {
    pub(crate) fn get_shifted_val(&self) -> u16 {
        (match self {
            AclBroadcastFlag::NoBroadcast => 0x0,
            AclBroadcastFlag::BrEdrBroadcast => 0x1,
        }) << 14
    }

    pub(crate) fn try_from_shifted_val(val: u16) -> Result<Self, ()> {
        match (val >> 14) & 3 {
            0x0 => Ok(AclBroadcastFlag::NoBroadcast),
            0x1 => Ok(AclBroadcastFlag::BrEdrBroadcast),
            _ => Err(()),
        }
    }
}

/// The HCI ACL data packet
///
/// HCI ACL data packets are sent between the host and controller for a specified connection. They
/// consist of a header and payload. The header contains a connection handle, a packet boundary
/// flag, a broadcast flag, and the total length of the payload. The connection handle is used by
/// the receiver of this packet to determine what connection the payload is for, and the packet
/// boundary flag is used when recombining fragments.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HciAclData {
    connection_handle: ConnectionHandle,
    packet_boundary_flag: AclPacketBoundary,
    broadcast_flag: AclBroadcastFlag,
    payload: Vec<u8>,
}

impl HciAclData {
    /// The size of the header of a HCI ACL data packet
    pub const HEADER_SIZE: usize = 4;

    /// It is required that the minimum maximum payload size of a HCI ACL data packet be 27 bytes.
    /// Both the host and controller must be able to accept a HCI ACL data packet with 27 bytes.
    /// Larger maximum payload sizes may be defined by either the host or controller.
    pub const MIN_MAX_PAYLOAD_SIZE: usize = 27;

    /// Create a new `HciAclData`
    ///
    /// # Panic
    /// The payload length must not be larger than the maximum `u16` number
    pub fn new(
        connection_handle: ConnectionHandle,
        packet_boundary_flag: AclPacketBoundary,
        broadcast_flag: AclBroadcastFlag,
        payload: Vec<u8>,
    ) -> Self {
        assert!(payload.len() <= <u16>::MAX.into());

        HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload,
        }
    }

    pub fn get_handle(&self) -> &ConnectionHandle {
        &self.connection_handle
    }

    pub fn get_payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn get_packet_boundary_flag(&self) -> AclPacketBoundary {
        self.packet_boundary_flag
    }

    pub fn get_broadcast_flag(&self) -> AclBroadcastFlag {
        self.broadcast_flag
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Convert the `HciAclData` into the transport frame
    ///
    /// The returned frame is the full packet sent to the transport driver, the ACL packet
    /// indicator byte followed by the ACL header and payload.
    pub fn into_frame(self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + Self::HEADER_SIZE + self.payload.len());

        let first_2_bytes = self.connection_handle.get_raw_handle()
            | self.packet_boundary_flag.get_shifted_val()
            | self.broadcast_flag.get_shifted_val();

        frame.push(PacketIndicator::Acl.into_byte());

        frame.extend_from_slice(&first_2_bytes.to_le_bytes());

        frame.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());

        frame.extend_from_slice(&self.payload);

        frame
    }

    /// Attempt to create a `HciAclData` from an ACL packet
    ///
    /// The input is the ACL packet without the packet indicator byte. An error is returned if the
    /// packet is not in the correct HCI ACL data packet format.
    pub fn try_from_packet(packet: &[u8]) -> Result<Self, Error> {
        if packet.len() < Self::HEADER_SIZE {
            return Err(Error::Protocol("ACL packet is smaller than its header"));
        }

        let first_2_bytes = <u16>::from_le_bytes([packet[0], packet[1]]);

        let connection_handle = ConnectionHandle::try_from(first_2_bytes & 0xFFF)?;

        let packet_boundary_flag = AclPacketBoundary::from_shifted_val(first_2_bytes);

        let broadcast_flag = AclBroadcastFlag::try_from_shifted_val(first_2_bytes)
            .map_err(|_| Error::Protocol("invalid broadcast flag"))?;

        let data_length = <u16>::from_le_bytes([packet[2], packet[3]]) as usize;

        let payload = packet
            .get(Self::HEADER_SIZE..(Self::HEADER_SIZE + data_length))
            .ok_or(Error::Protocol("data total length is larger than the received data"))?
            .to_vec();

        Ok(HciAclData {
            connection_handle,
            packet_boundary_flag,
            broadcast_flag,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_range() {
        assert!(ConnectionHandle::try_from(0x0EFF).is_ok());

        assert!(matches!(
            ConnectionHandle::try_from(0x0F00),
            Err(Error::InvalidHandle(_))
        ));

        let handle = ConnectionHandle::try_from([0x21, 0x0]).unwrap();

        assert_eq!(0x21, handle.get_raw_handle());
    }

    #[test]
    fn acl_packet_round_trip() {
        let handle = ConnectionHandle::try_from(0x31).unwrap();

        let data = HciAclData::new(
            handle,
            AclPacketBoundary::ContinuingFragment,
            AclBroadcastFlag::NoBroadcast,
            vec![1, 2, 3, 4, 5],
        );

        let frame = data.clone().into_frame();

        assert_eq!(2, frame[0]);

        // continuing fragment sets bit 12 of the handle field
        assert_eq!(&[0x31, 0x10, 0x5, 0x0], &frame[1..5]);

        let parsed = HciAclData::try_from_packet(&frame[1..]).unwrap();

        assert_eq!(data, parsed);
    }

    #[test]
    fn acl_packet_length_mismatch() {
        // length field says 6 bytes but only 2 are present
        let packet = [0x1, 0x0, 0x6, 0x0, 0xa, 0xb];

        assert!(HciAclData::try_from_packet(&packet).is_err());
    }
}

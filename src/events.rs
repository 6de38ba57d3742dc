//! Typed controller events consumed by the managers
//!
//! The core of this crate never parses raw event packets. Decoding the event packet bytes is the
//! job of an external collaborator (generated per-event decoders); what that collaborator hands
//! to the [`CommandManager`] and [`ConnectionManager`] are the typed structures in this module.
//!
//! Only the events that drive command correlation and data flow control are represented here:
//! *Command Complete*, *Command Status*, *Number of Completed Packets*, and
//! *Disconnection Complete*.
//!
//! [`CommandManager`]: crate::commands::CommandManager
//! [`ConnectionManager`]: crate::manager::ConnectionManager

use crate::ConnectionHandle;

/// Decoded *Command Complete* event
///
/// `command_opcode` is `None` when the raw event carried opcode zero, which the controller uses
/// to update the command credit count without acknowledging any command.
#[derive(Debug, Clone)]
pub struct CommandCompleteData {
    /// The number of command packets the controller can currently accept
    pub number_of_hci_command_packets: u8,
    /// The opcode of the acknowledged command, if any
    pub command_opcode: Option<u16>,
    /// The return parameter of the command, starting with the status byte
    pub return_parameter: Vec<u8>,
}

/// Decoded *Command Status* event
#[derive(Debug, Clone, Copy)]
pub struct CommandStatusData {
    /// The status of the pending command
    pub status: u8,
    /// The number of command packets the controller can currently accept
    pub number_of_hci_command_packets: u8,
    /// The opcode of the acknowledged command, if any
    pub command_opcode: Option<u16>,
}

/// One entry of a decoded *Number of Completed Packets* event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumberOfCompletedPacketsData {
    pub connection_handle: ConnectionHandle,
    /// The number of data packets the controller finished transmitting for this handle
    pub completed_packets: u16,
}

/// Decoded *Disconnection Complete* event
#[derive(Debug, Clone, Copy)]
pub struct DisconnectionCompleteData {
    pub status: u8,
    pub connection_handle: ConnectionHandle,
    /// The controller error code giving the reason for the disconnection
    pub reason: u8,
}

/// The decoded events delivered to this crate
///
/// Dispatched through [`ConnectionManager::handle_event`], which routes the command
/// acknowledgements to the command manager and handles the rest itself.
///
/// [`ConnectionManager::handle_event`]: crate::manager::ConnectionManager::handle_event
#[derive(Debug, Clone)]
pub enum EventsData {
    CommandComplete(CommandCompleteData),
    CommandStatus(CommandStatusData),
    NumberOfCompletedPackets(Vec<NumberOfCompletedPacketsData>),
    DisconnectionComplete(DisconnectionCompleteData),
}

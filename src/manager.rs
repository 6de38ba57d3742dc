//! Connection tracking and event routing
//!
//! The [`ConnectionManager`] owns the table of open connections and the [`TxSlotManager`] of each
//! configured buffer class. The driver's reader task forwards decoded events and raw data frames
//! here; the manager routes them to the connection the handle names and moves slot credit
//! accordingly.
//!
//! Routing is deliberately forgiving. Events and data outlive the connections they refer to: a
//! data packet can still be in flight up the transport when the *Disconnection Complete* for its
//! handle was already processed, and a controller may acknowledge a disconnect the host never
//! asked for. Anything referring to an unknown handle is logged and dropped instead of treated as
//! an error.
//!
//! # Note
//! Some controller firmware is known to mangle the *Number of Completed Packets* event when it
//! reports multiple handles at once (see [`ConnectionManager::apply_vendor_quirks`]). The
//! correction is applied to the decoded event before any credit moves.

use crate::commands::CommandManager;
use crate::connection::Connection;
use crate::errors::Error;
use crate::events::{DisconnectionCompleteData, EventsData, NumberOfCompletedPacketsData};
use crate::flow_ctrl::{BufferClass, SlotConfig, TxSlotManager};
use crate::transport::{PacketIndicator, Transport};
use crate::{ConnectionHandle, HciAclData};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// The Bluetooth SIG company identifier of Broadcom Corporation
const COMPANY_ID_BROADCOM: u16 = 15;

struct ManagerShared {
    connections: Mutex<HashMap<u16, Connection>>,
    commands: CommandManager,
    acl: Option<TxSlotManager>,
    sco: Option<TxSlotManager>,
    le_acl: Option<TxSlotManager>,
    nocp_interleave_quirk: AtomicBool,
    closed: AtomicBool,
}

impl ManagerShared {
    fn slot_for(&self, class: BufferClass) -> Option<&TxSlotManager> {
        match class {
            BufferClass::Acl => self.acl.as_ref(),
            BufferClass::Sco => self.sco.as_ref(),
            // a controller without a dedicated LE buffer shares the BR/EDR ACL buffer
            BufferClass::LeAcl => self.le_acl.as_ref().or(self.acl.as_ref()),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let connections: Vec<Connection> = {
            let mut connections = self.connections.lock().expect("connection table lock poisoned");

            connections.drain().map(|(_, connection)| connection).collect()
        };

        for connection in connections {
            let inner = connection.inner();

            let returned = inner.teardown(Err(Error::Closed));

            inner.slot().give_credit(returned);
            inner.slot().detach(inner.handle());
        }

        for slot in [self.acl.as_ref(), self.sco.as_ref(), self.le_acl.as_ref()].into_iter().flatten() {
            slot.close();
        }

        self.commands.close();
    }
}

/// The top level manager of data connections
///
/// Cloning is cheap; every clone routes into the same connection table.
///
/// # Note
/// `new` spawns the slot workers and their supervisor, so a `ConnectionManager` must be created
/// within the context of a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<ManagerShared>,
}

impl ConnectionManager {
    /// Create a new `ConnectionManager`
    ///
    /// A [`TxSlotManager`] is created for each buffer class the controller advertised a buffer
    /// for. A transport failure in any slot worker closes this manager and the command manager
    /// with it, the link is shared so nothing can be salvaged.
    pub fn new(
        transport: Arc<dyn Transport>,
        commands: CommandManager,
        acl: Option<SlotConfig>,
        sco: Option<SlotConfig>,
        le_acl: Option<SlotConfig>,
    ) -> Self {
        let acl = acl.map(|config| TxSlotManager::new(BufferClass::Acl, config, transport.clone()));
        let sco = sco.map(|config| TxSlotManager::new(BufferClass::Sco, config, transport.clone()));
        let le_acl = le_acl.map(|config| TxSlotManager::new(BufferClass::LeAcl, config, transport));

        let shared = Arc::new(ManagerShared {
            connections: Mutex::new(HashMap::new()),
            commands,
            acl,
            sco,
            le_acl,
            nocp_interleave_quirk: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        for slot in [shared.acl.as_ref(), shared.sco.as_ref(), shared.le_acl.as_ref()]
            .into_iter()
            .flatten()
        {
            spawn_supervisor(Arc::downgrade(&shared), slot);
        }

        ConnectionManager { shared }
    }

    /// The command manager this connection manager disconnects through
    pub fn commands(&self) -> &CommandManager {
        &self.shared.commands
    }

    /// Register a connection the controller reported as established
    ///
    /// # Panics
    /// A second connection with the handle of a live one is a host side bookkeeping bug and
    /// panics. So does a `class` for which the controller advertised no buffer.
    pub fn new_connection(&self, handle: ConnectionHandle, class: BufferClass) -> Connection {
        let slot = self
            .shared
            .slot_for(class)
            .unwrap_or_else(|| panic!("no TX slot manager configured for {} data", class));

        let connection = Connection::new(handle, slot.shared().clone(), self.shared.commands.clone());

        if self.shared.closed.load(Ordering::SeqCst) {
            connection.inner().teardown(Err(Error::Closed));

            return connection;
        }

        slot.attach(connection.inner().clone());

        let previous = self
            .shared
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .insert(handle.get_raw_handle(), connection.clone());

        assert!(previous.is_none(), "duplicate connection handle {}", handle);

        connection
    }

    /// Look up a live connection by its handle
    pub fn find_by_handle(&self, handle: ConnectionHandle) -> Option<Connection> {
        self.shared
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .get(&handle.get_raw_handle())
            .cloned()
    }

    /// Route a decoded event to whichever manager consumes it
    ///
    /// This is the single entry point for the external event decoder: command acknowledgements go
    /// to the [`CommandManager`], everything else is handled here. The individual handlers remain
    /// callable directly for decoders that already know the event kind.
    pub fn handle_event(&self, event: EventsData) {
        match event {
            EventsData::CommandComplete(data) => self.shared.commands.handle_command_complete(&data),
            EventsData::CommandStatus(data) => self.shared.commands.handle_command_status(&data),
            EventsData::NumberOfCompletedPackets(entries) => self.handle_number_of_completed_packets(&entries),
            EventsData::DisconnectionComplete(data) => self.handle_disconnection_complete(&data),
        }
    }

    /// Route a decoded *Disconnection Complete* event
    ///
    /// A successful event makes the named connection terminal and returns its outstanding slot
    /// credit. Events with a failure status or an unknown handle are logged and dropped.
    pub fn handle_disconnection_complete(&self, data: &DisconnectionCompleteData) {
        if data.status != 0 {
            log::trace!(
                "disconnection of connection {} failed with status {:#x}",
                data.connection_handle,
                data.status
            );

            return;
        }

        let connection = self
            .shared
            .connections
            .lock()
            .expect("connection table lock poisoned")
            .remove(&data.connection_handle.get_raw_handle());

        let Some(connection) = connection else {
            log::trace!("disconnection event for unknown connection {}", data.connection_handle);

            return;
        };

        log::debug!(
            "connection {} disconnected, reason {:#x}",
            data.connection_handle,
            data.reason
        );

        let inner = connection.inner();

        let returned = inner.teardown(Ok(()));

        inner.slot().give_credit(returned);
        inner.slot().detach(inner.handle());
    }

    /// Route a raw frame received from the controller
    ///
    /// Returns `true` when the frame was accepted by a live connection. Malformed frames, frames
    /// of a kind this manager does not route, and data for unknown (typically recently closed)
    /// handles are dropped with a trace log.
    pub fn handle_data(&self, frame: &[u8]) -> bool {
        let (indicator, packet) = match PacketIndicator::classify(frame) {
            Ok(classified) => classified,
            Err(error) => {
                log::trace!("dropping unclassifiable frame: {}", error);

                return false;
            }
        };

        if indicator != PacketIndicator::Acl {
            log::trace!("dropping {:?} frame, not routed by the connection manager", indicator);

            return false;
        }

        let acl = match HciAclData::try_from_packet(packet) {
            Ok(acl) => acl,
            Err(error) => {
                log::trace!("dropping malformed ACL data packet: {}", error);

                return false;
            }
        };

        let connection = self.find_by_handle(*acl.get_handle());

        match connection {
            Some(connection) => {
                connection
                    .inner()
                    .recombine(acl.get_packet_boundary_flag(), acl.get_payload());

                true
            }
            None => {
                log::trace!("dropping data for unknown connection {}", acl.get_handle());

                false
            }
        }
    }

    /// Route a decoded *Number of Completed Packets* event
    ///
    /// Every reported packet returns one credit to the slot manager that lent it. Entries for
    /// unknown handles are dropped; the teardown path already returned their credit.
    pub fn handle_number_of_completed_packets(&self, entries: &[NumberOfCompletedPacketsData]) {
        let corrected;

        let entries = if self.shared.nocp_interleave_quirk.load(Ordering::Relaxed) {
            corrected = correct_nocp_interleave(entries);

            corrected.as_slice()
        } else {
            entries
        };

        for entry in entries {
            let Some(connection) = self.find_by_handle(entry.connection_handle) else {
                log::trace!(
                    "completed packets for unknown connection {}",
                    entry.connection_handle
                );

                continue;
            };

            let inner = connection.inner();

            if let Some(returned) = inner.complete_packets(entry.completed_packets.into()) {
                inner.slot().give_credit(returned);
            }
        }
    }

    /// Enable workarounds for the controller the local version information names
    ///
    /// Broadcom controllers interleave the handle and count arrays of a multi-entry *Number of
    /// Completed Packets* event; reading the local version information at startup and passing the
    /// manufacturer identifier here enables the correction.
    pub fn apply_vendor_quirks(&self, manufacturer_id: u16) {
        if manufacturer_id == COMPANY_ID_BROADCOM {
            log::info!(
                "enabling the completed packets interleave correction (manufacturer {})",
                manufacturer_id
            );

            self.set_nocp_interleave_quirk(true);
        }
    }

    /// Directly enable or disable the completed packets interleave correction
    ///
    /// Meant to be set once at startup, before any data connection exists.
    pub fn set_nocp_interleave_quirk(&self, enabled: bool) {
        self.shared.nocp_interleave_quirk.store(enabled, Ordering::Relaxed);
    }

    /// Shut everything down
    ///
    /// Every connection becomes terminal with [`Error::Closed`], the slot managers stop, and the
    /// command manager is closed. Idempotent.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Check whether the manager was closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn slot(&self, class: BufferClass) -> Option<&TxSlotManager> {
        self.shared.slot_for(class)
    }
}

/// Watch one slot manager's fatal signal and close the whole manager when it fires
fn spawn_supervisor(shared: Weak<ManagerShared>, slot: &TxSlotManager) {
    let mut fatal = slot.subscribe_fatal();

    tokio::spawn(async move {
        loop {
            if *fatal.borrow_and_update() {
                if let Some(shared) = shared.upgrade() {
                    shared.close();
                }

                return;
            }

            if fatal.changed().await.is_err() {
                return;
            }
        }
    });
}

/// Undo the entry interleave of a mangled multi-handle *Number of Completed Packets* event
///
/// The affected firmware emits the handle of one entry paired with the count of the entry before
/// it, so the counts lag the handles by one position. Rotating the counts forward by one restores
/// the pairing. Single entry events are already correct.
fn correct_nocp_interleave(entries: &[NumberOfCompletedPacketsData]) -> Vec<NumberOfCompletedPacketsData> {
    if entries.len() < 2 {
        return entries.to_vec();
    }

    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| NumberOfCompletedPacketsData {
            connection_handle: entry.connection_handle,
            completed_packets: entries[(index + 1) % entries.len()].completed_packets,
        })
        .collect()
}

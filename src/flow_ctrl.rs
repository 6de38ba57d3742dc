//! Host to controller data flow control
//!
//! The controller exposes up to three physical receive buffers for data packets: the BR/EDR ACL
//! buffer, the SCO buffer, and the LE ACL buffer. Each buffer accepts a fixed number of packets
//! of a fixed maximum size, and the only way the host learns that space was freed is the
//! *Number of Completed Packets* event. A [`TxSlotManager`] tracks one of these buffers as a pool
//! of credits: transmitting a fragment consumes a credit, the completed packets event returns
//! them.
//!
//! One worker task per slot manager selects among the connections assigned to its buffer class.
//! Selection is fairness based, not submission order based: among connections with queued
//! fragments the worker picks the one with the fewest unacknowledged packets, so one busy
//! connection cannot starve the others. Within a single connection fragments always transmit in
//! order, and fragments of two frames from the same connection are never interleaved because
//! frames are cut into fragments before they enter the queue.

use crate::connection::{ConnectionInner, TakenFragment};
use crate::transport::Transport;
use crate::{AclBroadcastFlag, AclPacketBoundary, ConnectionHandle, HciAclData};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// Identification of a physical controller data buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferClass {
    /// The BR/EDR ACL data buffer
    Acl,
    /// The synchronous (SCO) data buffer
    ///
    /// Only credit bookkeeping is supported for this class, synchronous channels carry no
    /// reassembled upper layer frames.
    Sco,
    /// The LE ACL data buffer
    LeAcl,
}

impl core::fmt::Display for BufferClass {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            BufferClass::Acl => f.write_str("BR/EDR ACL"),
            BufferClass::Sco => f.write_str("SCO"),
            BufferClass::LeAcl => f.write_str("LE ACL"),
        }
    }
}

/// The dimensions of one controller data buffer
///
/// `buffer_len` is the maximum payload of a single data packet and `ceiling` is the number of
/// packets the buffer holds, which is also the credit ceiling of the slot manager built from it.
#[derive(Debug, Clone, Copy)]
pub struct SlotConfig {
    pub buffer_len: usize,
    pub ceiling: usize,
}

impl SlotConfig {
    /// Create a `SlotConfig` from the fields of a read buffer size command response
    pub fn from_buffer_size(packet_len: u16, packet_count: u16) -> Self {
        log::info!("maximum HCI data packet payload size: {}", packet_len);
        log::info!("controller data buffer size (packets): {}", packet_count);

        SlotConfig {
            buffer_len: packet_len.into(),
            ceiling: packet_count.into(),
        }
    }
}

pub(crate) struct SlotShared {
    class: BufferClass,
    buffer_len: usize,
    ceiling: usize,
    credits: Mutex<usize>,
    closed: AtomicBool,
    /// Woken when fragments are queued or credit is returned; coalesced, "at least once if
    /// anything happened since the last wake"
    wake: Notify,
    connections: Mutex<Vec<Arc<ConnectionInner>>>,
    transport: Arc<dyn Transport>,
    fatal: watch::Sender<bool>,
}

impl SlotShared {
    pub(crate) fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub(crate) fn wake_worker(&self) {
        // the worker and credit waiters share this Notify, every parked task must recheck
        self.wake.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.wake.notify_waiters();
        }
    }

    fn try_take_credit(&self) -> bool {
        let mut credits = self.credits.lock().expect("credit lock poisoned");

        if *credits > 0 {
            *credits -= 1;

            true
        } else {
            false
        }
    }

    /// Return credits lent for transmitted packets
    ///
    /// Returning credit above the ceiling is a credit accounting bug somewhere in the caller; in
    /// assertion builds it stops the subsystem loudly, otherwise the counter saturates at the
    /// ceiling and the error is logged.
    pub(crate) fn give_credit(&self, returned: usize) {
        if returned == 0 {
            return;
        }

        {
            let mut credits = self.credits.lock().expect("credit lock poisoned");

            let raised = *credits + returned;

            debug_assert!(
                raised <= self.ceiling,
                "{} slot manager credit raised above its ceiling of {}",
                self.class,
                self.ceiling
            );

            if raised > self.ceiling {
                log::error!(
                    "{} slot manager credit raised above its ceiling of {}",
                    self.class,
                    self.ceiling
                );
            }

            *credits = raised.min(self.ceiling);
        }

        self.wake.notify_waiters();
    }

    pub(crate) fn detach(&self, handle: ConnectionHandle) {
        self.connections
            .lock()
            .expect("connection list lock poisoned")
            .retain(|connection| connection.handle() != handle);
    }

    /// Pick the next fragment to put on the wire
    ///
    /// Returns `None` when there is no credit or no eligible connection. A fragment popped from a
    /// connection that stopped accepting output mid-teardown is discarded and its credit returned
    /// untransmitted.
    fn next_transmit(&self) -> Option<Vec<u8>> {
        loop {
            if *self.credits.lock().expect("credit lock poisoned") == 0 {
                return None;
            }

            let candidate = {
                let connections = self.connections.lock().expect("connection list lock poisoned");

                connections
                    .iter()
                    .filter_map(|connection| {
                        connection
                            .tx_eligibility()
                            .map(|outstanding| (outstanding, connection.clone()))
                    })
                    .min_by_key(|(outstanding, _)| *outstanding)
                    .map(|(_, connection)| connection)
            };

            let connection = candidate?;

            if !self.try_take_credit() {
                return None;
            }

            match connection.take_fragment() {
                TakenFragment::Transmit(frame) => return Some(frame),
                TakenFragment::Discarded | TakenFragment::Empty => {
                    self.give_credit(1);
                }
            }
        }
    }
}

/// The flow controller of one physical data buffer
///
/// Cloning a `TxSlotManager` is cheap, all clones share the same credit pool and worker.
///
/// # Note
/// `new` spawns the worker task, so a `TxSlotManager` must be created within the context of a
/// tokio runtime.
#[derive(Clone)]
pub struct TxSlotManager {
    shared: Arc<SlotShared>,
}

impl TxSlotManager {
    /// Create a new `TxSlotManager` for one buffer class
    ///
    /// The credit counter starts at the configured ceiling, the whole controller buffer is empty
    /// at creation.
    pub fn new(class: BufferClass, config: SlotConfig, transport: Arc<dyn Transport>) -> Self {
        assert!(config.buffer_len > 0, "a data buffer accepts at least one byte");
        assert!(config.ceiling > 0, "a data buffer holds at least one packet");

        let (fatal, _) = watch::channel(false);

        let shared = Arc::new(SlotShared {
            class,
            buffer_len: config.buffer_len,
            ceiling: config.ceiling,
            credits: Mutex::new(config.ceiling),
            closed: AtomicBool::new(false),
            wake: Notify::new(),
            connections: Mutex::new(Vec::new()),
            transport,
            fatal,
        });

        tokio::spawn(slot_worker(shared.clone()));

        TxSlotManager { shared }
    }

    /// The buffer class this manager flow controls
    pub fn class(&self) -> BufferClass {
        self.shared.class
    }

    /// The maximum number of payload bytes of one physical fragment for this class
    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }

    /// Wait for one credit and take it
    ///
    /// Returns `false` only when the manager is shutting down; otherwise the caller owns one
    /// credit and must eventually return it through [`return_credit`](TxSlotManager::return_credit).
    pub async fn wait_for_credit(&self) -> bool {
        loop {
            let wake = self.shared.wake.notified();
            tokio::pin!(wake);
            wake.as_mut().enable();

            if self.shared.is_closed() {
                return false;
            }

            if self.shared.try_take_credit() {
                return true;
            }

            wake.await;
        }
    }

    /// Return `returned` credits to the pool
    pub fn return_credit(&self, returned: usize) {
        self.shared.give_credit(returned);
    }

    /// Wake the worker
    ///
    /// Coalesced: the worker wakes at least once after any number of calls.
    pub fn wake(&self) {
        self.shared.wake_worker();
    }

    /// Shut the manager down
    ///
    /// Idempotent; the worker stops and every `wait_for_credit` call returns `false`.
    pub fn close(&self) {
        self.shared.close();
    }

    pub(crate) fn shared(&self) -> &Arc<SlotShared> {
        &self.shared
    }

    pub(crate) fn attach(&self, connection: Arc<ConnectionInner>) {
        self.shared
            .connections
            .lock()
            .expect("connection list lock poisoned")
            .push(connection);
    }

    pub(crate) fn detach(&self, handle: ConnectionHandle) {
        self.shared.detach(handle)
    }

    pub(crate) fn subscribe_fatal(&self) -> watch::Receiver<bool> {
        self.shared.fatal.subscribe()
    }

    #[cfg(test)]
    pub(crate) fn credits(&self) -> usize {
        *self.shared.credits.lock().unwrap()
    }
}

/// The worker loop of one slot manager
///
/// A transport write error is fatal to everything sharing the link; the worker closes its own
/// credit pool and raises the fatal signal watched by the connection manager.
async fn slot_worker(shared: Arc<SlotShared>) {
    loop {
        let wake = shared.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        if shared.is_closed() {
            return;
        }

        match shared.next_transmit() {
            Some(frame) => {
                if let Err(error) = shared.transport.send_frame(&frame) {
                    log::error!("failed to send {} data packet: {}", shared.class, error);

                    shared.close();

                    let _ = shared.fatal.send(true);

                    return;
                }
            }
            None => wake.await,
        }
    }
}

/// Cut a whole upper layer frame into transport-ready ACL fragments
///
/// Each fragment is an indicator-prefixed ACL packet whose payload is at most `buffer_len` bytes.
/// The first fragment is tagged as the start of a frame and every following fragment as a
/// continuation; those boundary tags are the only signal the receiver has for where one upper
/// layer frame ends and the next begins.
pub fn fragment_frame(handle: ConnectionHandle, frame: &[u8], buffer_len: usize) -> Vec<Vec<u8>> {
    assert!(buffer_len > 0);

    if frame.is_empty() {
        let empty = HciAclData::new(
            handle,
            AclPacketBoundary::FirstNonFlushable,
            AclBroadcastFlag::NoBroadcast,
            Vec::new(),
        );

        return vec![empty.into_frame()];
    }

    frame
        .chunks(buffer_len)
        .enumerate()
        .map(|(index, chunk)| {
            let boundary = if index == 0 {
                AclPacketBoundary::FirstNonFlushable
            } else {
                AclPacketBoundary::ContinuingFragment
            };

            HciAclData::new(handle, boundary, AclBroadcastFlag::NoBroadcast, chunk.to_vec()).into_frame()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::test_support::RecordingTransport;

    fn handle() -> ConnectionHandle {
        ConnectionHandle::try_from(0x40).unwrap()
    }

    #[test]
    fn forty_byte_frame_cuts_into_three_fragments() {
        let frame: Vec<u8> = (0..40).collect();

        let fragments = fragment_frame(handle(), &frame, 16);

        assert_eq!(3, fragments.len());

        // 5 bytes of link header (indicator plus ACL header) per fragment
        assert_eq!(5 + 16, fragments[0].len());
        assert_eq!(5 + 16, fragments[1].len());
        assert_eq!(5 + 8, fragments[2].len());

        let boundaries: Vec<_> = fragments
            .iter()
            .map(|fragment| {
                HciAclData::try_from_packet(&fragment[1..])
                    .unwrap()
                    .get_packet_boundary_flag()
            })
            .collect();

        assert_eq!(
            vec![
                AclPacketBoundary::FirstNonFlushable,
                AclPacketBoundary::ContinuingFragment,
                AclPacketBoundary::ContinuingFragment,
            ],
            boundaries
        );

        let recombined: Vec<u8> = fragments
            .iter()
            .flat_map(|fragment| HciAclData::try_from_packet(&fragment[1..]).unwrap().into_payload())
            .collect();

        assert_eq!(frame, recombined);
    }

    #[test]
    fn fragments_carry_the_frame_unchanged() {
        for len in [0usize, 1, 15, 16, 17, 255, 1000] {
            for buffer_len in [1usize, 16, 256] {
                let frame: Vec<u8> = (0..len).map(|i| i as u8).collect();

                let fragments = fragment_frame(handle(), &frame, buffer_len);

                let parsed: Vec<HciAclData> = fragments
                    .iter()
                    .map(|fragment| HciAclData::try_from_packet(&fragment[1..]).unwrap())
                    .collect();

                assert!(parsed[0].get_packet_boundary_flag().is_start());

                for continuation in &parsed[1..] {
                    assert_eq!(
                        AclPacketBoundary::ContinuingFragment,
                        continuation.get_packet_boundary_flag()
                    );
                }

                let recombined: Vec<u8> = parsed.into_iter().flat_map(HciAclData::into_payload).collect();

                assert_eq!(frame, recombined, "len {} buffer {}", len, buffer_len);
            }
        }
    }

    #[test]
    fn single_byte_buffer_fragments() {
        let frame = vec![0xA, 0xB, 0xC];

        let fragments = fragment_frame(handle(), &frame, 1);

        assert_eq!(3, fragments.len());

        for fragment in &fragments {
            assert_eq!(6, fragment.len());
        }
    }

    #[test]
    fn empty_frame_still_produces_a_start_fragment() {
        let fragments = fragment_frame(handle(), &[], 27);

        assert_eq!(1, fragments.len());

        let acl = HciAclData::try_from_packet(&fragments[0][1..]).unwrap();

        assert!(acl.get_packet_boundary_flag().is_start());
        assert!(acl.get_payload().is_empty());
    }

    #[tokio::test]
    async fn wait_for_credit_fails_on_shutdown() {
        let transport = RecordingTransport::new();

        let manager = TxSlotManager::new(BufferClass::LeAcl, SlotConfig { buffer_len: 27, ceiling: 1 }, transport);

        assert!(manager.wait_for_credit().await);

        let blocked = tokio::spawn({
            let manager = manager.clone();

            async move { manager.wait_for_credit().await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!blocked.is_finished());

        manager.close();

        assert!(!blocked.await.unwrap());
    }

    #[tokio::test]
    async fn credit_returns_wake_a_waiter() {
        let transport = RecordingTransport::new();

        let manager = TxSlotManager::new(BufferClass::Acl, SlotConfig { buffer_len: 27, ceiling: 1 }, transport);

        assert!(manager.wait_for_credit().await);
        assert_eq!(0, manager.credits());

        let blocked = tokio::spawn({
            let manager = manager.clone();

            async move { manager.wait_for_credit().await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        manager.return_credit(1);

        assert!(blocked.await.unwrap());
    }

    #[tokio::test]
    #[should_panic]
    async fn returning_credit_above_the_ceiling_is_a_bug() {
        let transport = RecordingTransport::new();

        let manager = TxSlotManager::new(BufferClass::Acl, SlotConfig { buffer_len: 27, ceiling: 2 }, transport);

        manager.return_credit(1);
    }
}

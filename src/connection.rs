//! A single established data connection
//!
//! A [`Connection`] is the per-handle endpoint handed to upper layers by the
//! [`ConnectionManager`]. Writing sends a whole upper layer frame; the frame is cut into ACL
//! fragments immediately and transmitted by the slot manager worker as credit allows. Reading
//! yields whole upper layer frames recombined from received fragments.
//!
//! Recombination relies on the basic L2CAP header: the first two bytes of a frame are the little
//! endian length of the information payload, so a whole frame is four header bytes plus that
//! length. Fragments for one frame arrive in order (a start fragment followed by continuations)
//! and the controller never interleaves fragments of different frames on the same handle.
//!
//! # Note
//! Closing is a three party exchange. [`Connection::close`] sends the *Disconnect* command and
//! then waits for the *Disconnection Complete* event to be routed through the connection manager;
//! only that event makes the closure terminal. A connection can equally be closed from the remote
//! side, in which case the event arrives without any local command.
//!
//! [`ConnectionManager`]: crate::manager::ConnectionManager

use crate::commands::CommandManager;
use crate::errors::Error;
use crate::flow_ctrl::{fragment_frame, SlotShared};
use crate::opcodes::{HciCommand, LinkControl};
use crate::{AclPacketBoundary, ConnectionHandle};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};

/// The basic L2CAP header length (two length bytes and two channel identifier bytes)
const L2CAP_HEADER_SIZE: usize = 4;

/// Consumed bytes allowed to linger at the front of the recombination buffer before compaction
const RECOMBINE_SLACK_MAX: usize = 8192;

/// Controller error code *Remote User Terminated Connection*, the reason sent with a locally
/// initiated disconnect
const REMOTE_USER_TERMINATED: u8 = 0x13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Open,
    Closing,
    Closed,
}

/// What [`ConnectionInner::take_fragment`] produced
pub(crate) enum TakenFragment {
    /// A fragment to put on the wire
    Transmit(Vec<u8>),
    /// A fragment popped from a connection that no longer accepts output; its credit was not used
    Discarded,
    /// The queue raced empty between selection and the pop
    Empty,
}

struct ConnState {
    lifecycle: Lifecycle,
    /// Wire-ready fragments waiting for credit, in transmit order
    outbound: VecDeque<Vec<u8>>,
    /// Fragments transmitted but not yet acknowledged by a completed packets event
    outstanding: usize,
    /// Once set, completed packets events for this handle no longer move credit; the teardown
    /// path returned everything outstanding already
    lockout: bool,
    recombine: Vec<u8>,
    /// Offset of the first unconsumed byte in `recombine`
    read_at: usize,
    inbound: VecDeque<Vec<u8>>,
}

pub(crate) struct ConnectionInner {
    handle: ConnectionHandle,
    state: Mutex<ConnState>,
    readable: Notify,
    /// Set exactly once, when the connection reaches its terminal state
    closed: watch::Sender<Option<Result<(), Error>>>,
    slot: Arc<SlotShared>,
}

impl ConnectionInner {
    pub(crate) fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub(crate) fn slot(&self) -> &Arc<SlotShared> {
        &self.slot
    }

    /// Whether this connection wants a transmit slot, and at what priority
    ///
    /// Returns the count of unacknowledged packets when there is something to send; the slot
    /// worker prefers the eligible connection with the smallest count.
    pub(crate) fn tx_eligibility(&self) -> Option<usize> {
        let state = self.state.lock().expect("connection state lock poisoned");

        if !state.outbound.is_empty() && !state.lockout {
            Some(state.outstanding)
        } else {
            None
        }
    }

    /// Pop the next queued fragment, charging it to this connection's outstanding count
    pub(crate) fn take_fragment(&self) -> TakenFragment {
        let mut state = self.state.lock().expect("connection state lock poisoned");

        match state.outbound.pop_front() {
            None => TakenFragment::Empty,
            Some(fragment) => {
                if state.lifecycle == Lifecycle::Open && !state.lockout {
                    state.outstanding += 1;

                    TakenFragment::Transmit(fragment)
                } else {
                    TakenFragment::Discarded
                }
            }
        }
    }

    /// Feed one received ACL fragment into recombination
    ///
    /// Completed upper layer frames are pushed to the inbound queue and readers are woken. Data
    /// for a connection already torn down is dropped.
    pub(crate) fn recombine(&self, boundary: AclPacketBoundary, payload: &[u8]) {
        let mut state = self.state.lock().expect("connection state lock poisoned");

        if state.lifecycle == Lifecycle::Closed {
            return;
        }

        if boundary.is_start() && state.recombine.len() != state.read_at {
            // the previous frame never completed, abandon its partial bytes
            log::warn!("dropping incomplete recombination for connection {}", self.handle);

            state.recombine.truncate(0);
            state.read_at = 0;
        }

        state.recombine.extend_from_slice(payload);

        let mut delivered = false;

        loop {
            let available = state.recombine.len() - state.read_at;

            if available < L2CAP_HEADER_SIZE {
                break;
            }

            let at = state.read_at;

            let payload_len =
                <u16>::from_le_bytes([state.recombine[at], state.recombine[at + 1]]) as usize;

            let frame_len = L2CAP_HEADER_SIZE + payload_len;

            if available < frame_len {
                break;
            }

            let frame = state.recombine[at..at + frame_len].to_vec();

            state.read_at += frame_len;

            state.inbound.push_back(frame);

            delivered = true;
        }

        if state.read_at == state.recombine.len() {
            state.recombine.clear();
            state.read_at = 0;
        } else if state.read_at > RECOMBINE_SLACK_MAX {
            let at = state.read_at;

            state.recombine.drain(..at);
            state.read_at = 0;
        }

        drop(state);

        if delivered {
            self.readable.notify_waiters();
        }
    }

    /// Credit returned by a completed packets event for this handle
    ///
    /// Returns how many slot credits to give back, or `None` when the teardown path already
    /// returned them. A count above the outstanding packets is a controller accounting error and
    /// is clamped.
    pub(crate) fn complete_packets(&self, completed: usize) -> Option<usize> {
        let mut state = self.state.lock().expect("connection state lock poisoned");

        if state.lockout {
            return None;
        }

        debug_assert!(
            completed <= state.outstanding,
            "connection {} completed more packets than were outstanding",
            self.handle
        );

        if completed > state.outstanding {
            log::error!(
                "connection {} completed more packets than were outstanding",
                self.handle
            );
        }

        let returned = completed.min(state.outstanding);

        state.outstanding -= returned;

        Some(returned)
    }

    /// Move the connection to its terminal state
    ///
    /// Returns the outstanding packet count so the caller can give that credit back to the slot
    /// manager; the lockout flag guarantees it is returned exactly once even if completed packets
    /// events for this handle keep arriving.
    pub(crate) fn teardown(&self, result: Result<(), Error>) -> usize {
        let outstanding = {
            let mut state = self.state.lock().expect("connection state lock poisoned");

            if state.lockout {
                return 0;
            }

            state.lifecycle = Lifecycle::Closed;
            state.lockout = true;
            state.outbound.clear();

            core::mem::take(&mut state.outstanding)
        };

        // send_replace stores the result even when no close() caller is subscribed yet
        self.closed.send_replace(Some(result));

        self.readable.notify_waiters();

        outstanding
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().unwrap().outstanding
    }
}

/// An established connection to a peer device
///
/// Created by [`ConnectionManager::new_connection`]; clones share the same underlying queues.
///
/// [`ConnectionManager::new_connection`]: crate::manager::ConnectionManager::new_connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
    commands: CommandManager,
}

impl Connection {
    pub(crate) fn new(
        handle: ConnectionHandle,
        slot: Arc<SlotShared>,
        commands: CommandManager,
    ) -> Self {
        let (closed, _) = watch::channel(None);

        let inner = Arc::new(ConnectionInner {
            handle,
            state: Mutex::new(ConnState {
                lifecycle: Lifecycle::Open,
                outbound: VecDeque::new(),
                outstanding: 0,
                lockout: false,
                recombine: Vec::new(),
                read_at: 0,
                inbound: VecDeque::new(),
            }),
            readable: Notify::new(),
            closed,
            slot,
        });

        Connection { inner, commands }
    }

    pub(crate) fn inner(&self) -> &Arc<ConnectionInner> {
        &self.inner
    }

    /// The connection handle assigned by the controller
    pub fn handle(&self) -> ConnectionHandle {
        self.inner.handle
    }

    /// Check whether the connection still accepts writes
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().expect("connection state lock poisoned").lifecycle == Lifecycle::Open
    }

    /// Queue a whole upper layer frame for transmission
    ///
    /// The frame is fragmented immediately; this never waits for credit. An error means the
    /// connection no longer accepts writes, it does not mean the frame reached the controller.
    pub fn write(&self, frame: &[u8]) -> Result<(), Error> {
        {
            let mut state = self.inner.state.lock().expect("connection state lock poisoned");

            if state.lifecycle != Lifecycle::Open {
                return Err(Error::Closed);
            }

            let fragments = fragment_frame(self.inner.handle, frame, self.inner.slot.buffer_len());

            state.outbound.extend(fragments);
        }

        self.inner.slot.wake_worker();

        Ok(())
    }

    /// Receive the next whole upper layer frame
    ///
    /// Frames received before the connection closed remain readable; once the inbound queue is
    /// drained a closed connection returns [`Error::Closed`].
    pub async fn read(&self) -> Result<Vec<u8>, Error> {
        loop {
            let readable = self.inner.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();

            {
                let mut state = self.inner.state.lock().expect("connection state lock poisoned");

                if let Some(frame) = state.inbound.pop_front() {
                    return Ok(frame);
                }

                if state.lifecycle == Lifecycle::Closed {
                    return Err(Error::Closed);
                }
            }

            readable.await;
        }
    }

    /// Disconnect from the peer device
    ///
    /// This sends the *Disconnect* command (reason *Remote User Terminated Connection*) and waits
    /// for the resulting *Disconnection Complete* event. Calling `close` on a connection that is
    /// already closing or closed does not send another command; every caller gets the same
    /// terminal result. A rejected disconnect command is terminal too, its error becomes the
    /// result, and the wait fails with [`Error::Closed`] if the command manager shuts down before
    /// the disconnection event arrives.
    pub async fn close(&self) -> Result<(), Error> {
        let mut closed = self.inner.closed.subscribe();

        let initiate = {
            let mut state = self.inner.state.lock().expect("connection state lock poisoned");

            match state.lifecycle {
                Lifecycle::Open => {
                    state.lifecycle = Lifecycle::Closing;

                    true
                }
                Lifecycle::Closing | Lifecycle::Closed => false,
            }
        };

        if initiate {
            let raw_handle = self.inner.handle.get_raw_handle().to_le_bytes();

            let parameters = [raw_handle[0], raw_handle[1], REMOTE_USER_TERMINATED];

            let exchange = self
                .commands
                .run_sync(0, HciCommand::LinkControl(LinkControl::Disconnect), &parameters)
                .await;

            if let Err(error) = exchange {
                // without an acknowledged disconnect no completion event will ever arrive to
                // finish the closure, so the failure is the terminal result
                let returned = self.inner.teardown(Err(error));

                self.inner.slot().give_credit(returned);
            }
        }

        let mut shutdown = self.commands.subscribe_shutdown();

        loop {
            if let Some(result) = closed.borrow_and_update().clone() {
                return result;
            }

            if *shutdown.borrow_and_update() {
                return Err(Error::Closed);
            }

            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    /// Frame a payload with the basic L2CAP header on a fixed signalling channel
    pub(crate) fn l2cap_frame(payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + payload.len());

        frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        frame.extend_from_slice(&4u16.to_le_bytes());
        frame.extend_from_slice(payload);

        frame
    }
}

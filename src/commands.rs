//! Command flow control and correlation
//!
//! The controller processes commands asynchronously: the host sends a command packet and some
//! time later the controller acknowledges it with a *Command Complete* or *Command Status* event
//! carrying the command's opcode. The [`CommandManager`] owns everything required to make that
//! exchange look like an ordinary call to the layers above it.
//!
//! Three rules govern when a command may actually be put on the wire:
//! * The controller advertises within every acknowledging event how many more command packets it
//!   will accept (`Num_HCI_Command_Packets`). A command consumes one credit at the moment it is
//!   transmitted and never before.
//! * Acknowledgement events are matched to commands by opcode alone, so two commands with the
//!   same opcode must never be in flight at the same time. A queue worker holds back a command
//!   until no active command shares its opcode.
//! * Commands of one queue are transmitted in the order they were committed.
//!
//! A watchdog task periodically scans the in-flight commands. A command that stays beyond its
//! deadline for [`WatchdogConfig::max_strikes`] consecutive scans is declared permanently stuck,
//! which is fatal to the whole manager: the credit and opcode bookkeeping cannot be trusted to
//! resynchronize once the controller stops acknowledging.

use crate::errors::Error;
use crate::events::{CommandCompleteData, CommandStatusData};
use crate::opcodes::{HciCommand, OpCodePair};
use crate::token::{CommittedStream, TokenQueue};
use crate::transport::{PacketIndicator, Transport};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch, Notify};

/// Tuning values for the command liveness watchdog
///
/// `max_strikes` is the number of consecutive scans a command must be found expired before the
/// manager declares it stuck. Requiring two tolerates one slow scan cycle without raising a false
/// positive; the value is a tuning constant, not a protocol requirement.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How often the in-flight commands are scanned
    pub check_interval: Duration,
    /// How long a transmitted command may stay unacknowledged
    pub deadline: Duration,
    /// Consecutive expired scans before the command is declared stuck
    pub max_strikes: u8,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            check_interval: Duration::from_millis(500),
            deadline: Duration::from_secs(1),
            max_strikes: 2,
        }
    }
}

/// How the caller of a command is informed of its result
enum Completion {
    Idle,
    Sync(oneshot::Sender<Result<Vec<u8>, Error>>),
    Callback(Box<dyn FnOnce(Result<Vec<u8>, Error>) + Send>),
}

/// A pooled command job
///
/// The `packet` buffer is reused across commands to avoid a per-command allocation. While the
/// token sits in the active set, `sent_at` and `strikes` drive the watchdog.
struct CommandToken {
    queue: usize,
    opcode: u16,
    packet: Vec<u8>,
    completion: Completion,
    sent_at: Option<Instant>,
    strikes: u8,
}

impl CommandToken {
    fn unused(queue: usize) -> Self {
        CommandToken {
            queue,
            opcode: OpCodePair::NO_COMMAND,
            packet: Vec::new(),
            completion: Completion::Idle,
            sent_at: None,
            strikes: 0,
        }
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    queues: Vec<TokenQueue<CommandToken>>,
    /// In-flight commands; never contains two entries with the same opcode
    active: Mutex<Vec<CommandToken>>,
    /// `Num_HCI_Command_Packets`, the credits granted by the controller
    credits: Mutex<usize>,
    /// Woken when credit rises from zero or an active command resolves
    wake: Notify,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    watchdog: WatchdogConfig,
}

/// The command correlation manager
///
/// Cloning a `CommandManager` is cheap, all clones drive the same queues and workers.
///
/// # Note
/// `new` spawns the queue workers and the watchdog, so a `CommandManager` must be created within
/// the context of a tokio runtime.
#[derive(Clone)]
pub struct CommandManager {
    shared: Arc<Shared>,
}

impl CommandManager {
    /// Create a new `CommandManager`
    ///
    /// One worker task is spawned per command queue, each owning a fixed pool of
    /// `tokens_per_queue` command tokens. Controllers expose a single logical command channel, so
    /// `queue_count` is normally one.
    pub fn new(
        transport: Arc<dyn Transport>,
        queue_count: usize,
        tokens_per_queue: usize,
        watchdog: WatchdogConfig,
    ) -> Self {
        assert!(queue_count > 0, "a command manager requires at least one queue");
        assert!(tokens_per_queue > 0, "a command queue requires at least one token");

        let mut queues = Vec::with_capacity(queue_count);
        let mut streams = Vec::with_capacity(queue_count);

        for queue_index in 0..queue_count {
            let tokens = (0..tokens_per_queue).map(|_| CommandToken::unused(queue_index)).collect();

            let (queue, stream) = TokenQueue::new(tokens);

            queues.push(queue);
            streams.push(stream);
        }

        let (shutdown, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            transport,
            queues,
            active: Mutex::new(Vec::new()),
            // a controller accepts one command before it has advertised anything
            credits: Mutex::new(1),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
            shutdown,
            watchdog,
        });

        for stream in streams {
            tokio::spawn(queue_worker(shared.clone(), stream));
        }

        tokio::spawn(watchdog_task(shared.clone()));

        CommandManager { shared }
    }

    /// Run a command, suspending until the controller acknowledges it
    ///
    /// The returned bytes are the return parameter of the acknowledging event, beginning with the
    /// status byte. A controller-reported failure within a *Command Status* acknowledgement is
    /// returned as [`Error::Controller`].
    ///
    /// # Cancellation
    /// Dropping the returned future only stops the wait. A command already transmitted stays in
    /// flight and is resolved internally by its acknowledging event or by manager close.
    pub async fn run_sync(&self, queue: usize, command: HciCommand, parameters: &[u8]) -> Result<Vec<u8>, Error> {
        let (sender, receiver) = oneshot::channel();

        self.submit(queue, command, parameters, Completion::Sync(sender)).await?;

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(Error::Closed),
        }
    }

    /// Run a command, delivering its result through a callback
    ///
    /// This returns as soon as the command is queued. The callback is invoked exactly once, with
    /// the decoded result or with the error that ended the command; the token is recycled after
    /// the callback returns.
    pub async fn run_async<F>(&self, queue: usize, command: HciCommand, parameters: &[u8], callback: F) -> Result<(), Error>
    where
        F: FnOnce(Result<Vec<u8>, Error>) + Send + 'static,
    {
        self.submit(queue, command, parameters, Completion::Callback(Box::new(callback)))
            .await
    }

    async fn submit(
        &self,
        queue: usize,
        command: HciCommand,
        parameters: &[u8],
        completion: Completion,
    ) -> Result<(), Error> {
        if parameters.len() > <u8>::MAX.into() {
            return Err(Error::Protocol("command parameter is larger than 255 bytes"));
        }

        let queue = self
            .shared
            .queues
            .get(queue)
            .ok_or(Error::Protocol("no such command queue"))?;

        let mut token = queue.acquire().await?;

        token.opcode = command.into_opcode();
        token.completion = completion;
        token.sent_at = None;
        token.strikes = 0;

        token.packet.clear();
        token.packet.push(PacketIndicator::Command.into_byte());
        token.packet.extend_from_slice(&token.opcode.to_le_bytes());
        token.packet.push(parameters.len() as u8);
        token.packet.extend_from_slice(parameters);

        queue.commit(token)
    }

    /// Process a decoded *Command Complete* event
    ///
    /// The credit count is updated from every event; when the event acknowledges a command (its
    /// opcode is not zero) the matching active command is resolved with the return parameter.
    pub fn handle_command_complete(&self, data: &CommandCompleteData) {
        self.shared.update_credits(data.number_of_hci_command_packets);

        match data.command_opcode {
            Some(opcode) if opcode != OpCodePair::NO_COMMAND => {
                self.shared.resolve(opcode, Ok(data.return_parameter.clone()))
            }
            _ => (),
        }
    }

    /// Process a decoded *Command Status* event
    ///
    /// A zero status resolves the matching command with the status byte as its response; any
    /// other status resolves it with [`Error::Controller`].
    pub fn handle_command_status(&self, data: &CommandStatusData) {
        self.shared.update_credits(data.number_of_hci_command_packets);

        match data.command_opcode {
            Some(opcode) if opcode != OpCodePair::NO_COMMAND => {
                let result = if data.status == 0 {
                    Ok(vec![data.status])
                } else {
                    Err(Error::Controller(data.status))
                };

                self.shared.resolve(opcode, result)
            }
            _ => (),
        }
    }

    /// Close the manager
    ///
    /// Every active and queued command resolves with [`Error::Closed`], all blocked callers
    /// unblock, and the workers stop. Closing is idempotent and safe to call concurrently.
    pub fn close(&self) {
        self.shared.close_with(Error::Closed);
    }

    /// Check whether the manager was closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Subscribe to the shutdown signal
    ///
    /// The watched value flips to `true` when the manager closes, fatally or otherwise.
    pub(crate) fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    #[cfg(test)]
    fn credits(&self) -> usize {
        *self.shared.credits.lock().unwrap()
    }
}

impl Shared {
    /// Set the credit count from an acknowledging event
    ///
    /// The advertised value is authoritative, the counter is set rather than incremented. Workers
    /// blocked on an empty counter are woken when it rises from zero.
    fn update_credits(&self, advertised: u8) {
        let was = {
            let mut credits = self.credits.lock().expect("credit lock poisoned");

            core::mem::replace(&mut *credits, advertised.into())
        };

        if was == 0 && advertised > 0 {
            self.wake.notify_waiters();
        }
    }

    /// Resolve the active command with the given opcode
    ///
    /// Opcodes are unique within the active set, so at most one command matches. An event for an
    /// opcode with no active command is dropped; the controller may acknowledge commands this
    /// host never sent (or already failed over).
    fn resolve(&self, opcode: u16, result: Result<Vec<u8>, Error>) {
        let token = {
            let mut active = self.active.lock().expect("active command lock poisoned");

            match active.iter().position(|token| token.opcode == opcode) {
                Some(index) => active.swap_remove(index),
                None => {
                    log::trace!("dropping acknowledgement for inactive opcode {:#x}", opcode);
                    return;
                }
            }
        };

        // a resolved opcode may unblock a queue worker waiting on opcode uniqueness
        self.wake.notify_waiters();

        self.complete(token, result);
    }

    /// Deliver a result to the command's caller and recycle the token
    fn complete(&self, mut token: CommandToken, result: Result<Vec<u8>, Error>) {
        match core::mem::replace(&mut token.completion, Completion::Idle) {
            Completion::Idle => (),
            Completion::Sync(sender) => {
                // the caller may have cancelled its wait, that does not retract the command
                let _ = sender.send(result);
            }
            Completion::Callback(callback) => callback(result),
        }

        token.packet.clear();
        token.sent_at = None;
        token.strikes = 0;

        self.queues[token.queue].release(token);
    }

    fn close_with(&self, reason: Error) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for queue in &self.queues {
            queue.close();
        }

        let _ = self.shutdown.send(true);

        let actives: Vec<_> = {
            let mut active = self.active.lock().expect("active command lock poisoned");

            active.drain(..).collect()
        };

        for token in actives {
            self.complete(token, Err(reason.clone()));
        }

        self.wake.notify_waiters();
    }
}

/// The worker loop of one command queue
async fn queue_worker(shared: Arc<Shared>, mut stream: CommittedStream<CommandToken>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        let token = tokio::select! {
            biased;

            _ = shutdown.changed() => break,

            next = stream.next() => match next {
                Some(token) => token,
                None => break,
            },
        };

        if transmit_when_ready(&shared, token).await.is_break() {
            break;
        }
    }

    // fail whatever was committed but never picked up
    while let Some(token) = stream.try_next() {
        shared.complete(token, Err(Error::Closed));
    }
}

/// Hold a command back until it may be transmitted, then transmit it
///
/// The command transmits once a credit is available and no active command shares its opcode.
/// Registration in the active set, the credit decrement, and the transmit timestamp all happen
/// under one lock scope so an acknowledging event can never race past an unregistered command;
/// the transport write happens after the locks are released.
async fn transmit_when_ready(shared: &Arc<Shared>, token: CommandToken) -> ControlFlow<()> {
    let opcode = token.opcode;

    // held here until the transmit branch moves it into the active set
    let mut token = Some(token);

    loop {
        let wake = shared.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        if shared.closed.load(Ordering::SeqCst) {
            if let Some(token) = token.take() {
                shared.complete(token, Err(Error::Closed));
            }

            return ControlFlow::Break(());
        }

        let frame = {
            let mut credits = shared.credits.lock().expect("credit lock poisoned");
            let mut active = shared.active.lock().expect("active command lock poisoned");

            if *credits > 0 && !active.iter().any(|active_token| active_token.opcode == opcode) {
                *credits -= 1;

                let mut registered = token.take().expect("command token transmitted twice");

                registered.sent_at = Some(Instant::now());

                let frame = core::mem::take(&mut registered.packet);

                active.push(registered);

                Some(frame)
            } else {
                None
            }
        };

        match frame {
            Some(frame) => {
                if let Err(error) = shared.transport.send_frame(&frame) {
                    log::error!("failed to send command packet: {}", error);

                    shared.close_with(error);

                    return ControlFlow::Break(());
                }

                // hand the packet buffer back to the registered token so release reuses it
                if let Some(active_token) = shared
                    .active
                    .lock()
                    .expect("active command lock poisoned")
                    .iter_mut()
                    .find(|active_token| active_token.opcode == opcode)
                {
                    active_token.packet = frame;
                }

                return ControlFlow::Continue(());
            }
            None => wake.await,
        }
    }
}

/// The liveness watchdog
///
/// Scans the active commands every `check_interval`. A command unacknowledged past its deadline
/// collects a strike per scan; at `max_strikes` consecutive strikes the manager fails fatally.
async fn watchdog_task(shared: Arc<Shared>) {
    let mut shutdown = shared.shutdown.subscribe();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => return,

            _ = tokio::time::sleep(shared.watchdog.check_interval) => (),
        }

        let stuck = {
            let mut active = shared.active.lock().expect("active command lock poisoned");

            let mut stuck = None;

            for token in active.iter_mut() {
                let expired = token
                    .sent_at
                    .map(|sent_at| sent_at.elapsed() > shared.watchdog.deadline)
                    .unwrap_or(false);

                if expired {
                    token.strikes += 1;
                } else {
                    token.strikes = 0;
                }

                if token.strikes >= shared.watchdog.max_strikes {
                    stuck = Some(token.opcode);
                }
            }

            stuck
        };

        if let Some(opcode) = stuck {
            log::error!(
                "command with opcode {:#x} is permanently stuck, the state of the controller is \
                unknown, closing the command manager",
                opcode
            );

            shared.close_with(Error::Timeout);

            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes::{ControllerAndBaseband, InformationParameters, LEController};
    use crate::transport::test_support::RecordingTransport;

    fn quiet_watchdog() -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_secs(60),
            deadline: Duration::from_secs(60),
            max_strikes: 2,
        }
    }

    fn complete_event(opcode: u16, credits: u8, return_parameter: &[u8]) -> CommandCompleteData {
        CommandCompleteData {
            number_of_hci_command_packets: credits,
            command_opcode: Some(opcode),
            return_parameter: return_parameter.to_vec(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        panic!("condition not reached within two seconds");
    }

    fn sent_opcode(frame: &[u8]) -> u16 {
        assert_eq!(1, frame[0], "not a command packet");

        <u16>::from_le_bytes([frame[1], frame[2]])
    }

    #[tokio::test]
    async fn responses_match_the_callers_opcode() {
        let transport = RecordingTransport::new();

        let manager = CommandManager::new(transport.clone(), 1, 4, quiet_watchdog());

        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);
        let read_buffer = HciCommand::InformationParameters(InformationParameters::ReadBufferSize);

        let first = tokio::spawn({
            let manager = manager.clone();

            async move { manager.run_sync(0, reset, &[]).await }
        });

        wait_until(|| transport.sent_count() == 1).await;
        assert_eq!(reset.into_opcode(), sent_opcode(&transport.sent()[0]));

        let second = tokio::spawn({
            let manager = manager.clone();

            async move { manager.run_sync(0, read_buffer, &[]).await }
        });

        // only one command credit exists until the controller advertises more
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, transport.sent_count());

        manager.handle_command_complete(&complete_event(reset.into_opcode(), 1, &[0, 0xAA]));

        wait_until(|| transport.sent_count() == 2).await;
        assert_eq!(read_buffer.into_opcode(), sent_opcode(&transport.sent()[1]));

        manager.handle_command_complete(&complete_event(read_buffer.into_opcode(), 1, &[0, 0xBB]));

        // each caller gets the response matching its own opcode, never the other caller's
        assert_eq!(Ok(vec![0, 0xAA]), first.await.unwrap());
        assert_eq!(Ok(vec![0, 0xBB]), second.await.unwrap());
    }

    #[tokio::test]
    async fn same_opcode_commands_serialize() {
        let transport = RecordingTransport::new();

        let manager = CommandManager::new(transport.clone(), 1, 4, quiet_watchdog());

        // plenty of credit, only the opcode uniqueness rule can hold a command back
        manager.handle_command_complete(&CommandCompleteData {
            number_of_hci_command_packets: 5,
            command_opcode: None,
            return_parameter: Vec::new(),
        });

        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);

        let first = tokio::spawn({
            let manager = manager.clone();

            async move { manager.run_sync(0, reset, &[]).await }
        });

        let second = tokio::spawn({
            let manager = manager.clone();

            async move { manager.run_sync(0, reset, &[]).await }
        });

        wait_until(|| transport.sent_count() == 1).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(1, transport.sent_count(), "duplicate opcode transmitted while active");

        manager.handle_command_complete(&complete_event(reset.into_opcode(), 5, &[0]));

        wait_until(|| transport.sent_count() == 2).await;

        manager.handle_command_complete(&complete_event(reset.into_opcode(), 5, &[0]));

        assert!(first.await.unwrap().is_ok());
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn async_commands_wait_for_credit() {
        let transport = RecordingTransport::new();

        let manager = CommandManager::new(transport.clone(), 1, 4, quiet_watchdog());

        let (first_tx, first_rx) = oneshot::channel();
        let (second_tx, second_rx) = oneshot::channel();

        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);
        let le_buffer = HciCommand::LEController(LEController::ReadBufferSize);

        manager
            .run_async(0, reset, &[], move |result| {
                first_tx.send(result).unwrap();
            })
            .await
            .unwrap();

        manager
            .run_async(0, le_buffer, &[], move |result| {
                second_tx.send(result).unwrap();
            })
            .await
            .unwrap();

        // the single credit lets the first command out immediately
        wait_until(|| transport.sent_count() == 1).await;
        assert_eq!(reset.into_opcode(), sent_opcode(&transport.sent()[0]));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(1, transport.sent_count());
        assert_eq!(0, manager.credits());

        manager.handle_command_complete(&complete_event(reset.into_opcode(), 1, &[0]));

        assert_eq!(Ok(vec![0]), first_rx.await.unwrap());

        wait_until(|| transport.sent_count() == 2).await;
        assert_eq!(le_buffer.into_opcode(), sent_opcode(&transport.sent()[1]));

        manager.handle_command_complete(&complete_event(le_buffer.into_opcode(), 1, &[0, 0x1B, 0x0, 0x5]));

        assert_eq!(Ok(vec![0, 0x1B, 0x0, 0x5]), second_rx.await.unwrap());
    }

    #[tokio::test]
    async fn command_status_error_is_surfaced() {
        let transport = RecordingTransport::new();

        let manager = CommandManager::new(transport.clone(), 1, 2, quiet_watchdog());

        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);

        let pending = tokio::spawn({
            let manager = manager.clone();

            async move { manager.run_sync(0, reset, &[]).await }
        });

        wait_until(|| transport.sent_count() == 1).await;

        manager.handle_command_status(&CommandStatusData {
            status: 0x0C,
            number_of_hci_command_packets: 1,
            command_opcode: Some(reset.into_opcode()),
        });

        assert_eq!(Err(Error::Controller(0x0C)), pending.await.unwrap());
    }

    #[tokio::test]
    async fn watchdog_declares_a_stuck_command_fatal() {
        let transport = RecordingTransport::new();

        let watchdog = WatchdogConfig {
            check_interval: Duration::from_millis(20),
            deadline: Duration::from_millis(30),
            max_strikes: 2,
        };

        let manager = CommandManager::new(transport.clone(), 1, 2, watchdog);

        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);

        let result = manager.run_sync(0, reset, &[]).await;

        assert_eq!(Err(Error::Timeout), result);

        assert!(manager.is_closed());

        assert_eq!(Err(Error::Closed), manager.run_sync(0, reset, &[]).await);
    }

    #[tokio::test]
    async fn close_unblocks_pending_callers() {
        let transport = RecordingTransport::new();

        let manager = CommandManager::new(transport.clone(), 1, 2, quiet_watchdog());

        let reset = HciCommand::ControllerAndBaseband(ControllerAndBaseband::Reset);

        let pending = tokio::spawn({
            let manager = manager.clone();

            async move { manager.run_sync(0, reset, &[]).await }
        });

        wait_until(|| transport.sent_count() == 1).await;

        manager.close();
        manager.close();

        assert_eq!(Err(Error::Closed), pending.await.unwrap());
    }
}

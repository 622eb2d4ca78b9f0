//! Multiplayer Bridge
//!
//! An actor task owning the packet queue, the anchor chain, the tracked
//! game and the engine. Commands arrive from [`BridgeHandle`]s, confirmed
//! transactions from the ledger event stream, and flush stages progress
//! as futures polled by the same loop.
//!
//! Flush cycle:
//!
//! ```text
//! Idle -> [Resolving] -> Submitting -> Idle
//! ```
//!
//! Packets queued before a transaction is built ride in it; packets
//! queued while it is in flight wait for the next one. A rejected
//! transaction leaves the queue untouched and drops the anchor, so the
//! next flush re-resolves it. Nothing is retried automatically.

use std::any::Any;
use std::future::Future;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::codec::game::GameRecord;
use crate::codec::packet::{encode_packets, Packet};
use crate::codec::payload::{decode_payload, Payload};
use crate::ledger::tx::{parse_transaction, ObservedTx, TransactionBuilder};
use crate::ledger::utxo::{AnchorResolver, ChainError, TxId, Utxo, UtxoChain};
use crate::ledger::{Ledger, LedgerError, LedgerEvent};

use super::engine::{deliver_packet, GameEngine};
use super::events::BridgeListener;
use super::{BridgeError, BridgeSnapshot};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type FlushResult = Result<Option<TxId>, BridgeError>;
type Reply = oneshot::Sender<FlushResult>;

// =============================================================================
// COMMANDS
// =============================================================================

enum Command {
    Send { packet: Packet, reply: Option<Reply> },
    Flush { reply: Reply },
    SetLocalSlot(u32),
    Snapshot(oneshot::Sender<BridgeSnapshot>),
    Shutdown,
}

/// Cloneable handle to a running bridge.
#[derive(Clone)]
pub struct BridgeHandle {
    commands: mpsc::UnboundedSender<Command>,
    ephemeral_key: Arc<[u8]>,
}

impl BridgeHandle {
    /// Key hash stamped on outgoing packets.
    pub fn ephemeral_key(&self) -> &[u8] {
        &self.ephemeral_key
    }

    /// Queue a packet and request a flush.
    ///
    /// The packet is queued when this is called, not when the future is
    /// polled. Resolves with the id of the transaction that carried it,
    /// `None` when no flush happened (connection not open), or the
    /// rejection.
    pub fn send(
        &self,
        to: u32,
        from: u32,
        data: Vec<u8>,
    ) -> impl Future<Output = FlushResult> + Send + 'static {
        let (reply, outcome) = oneshot::channel();
        let queued = self
            .commands
            .send(Command::Send {
                packet: self.packet(to, from, data),
                reply: Some(reply),
            })
            .is_ok();
        async move {
            if !queued {
                return Err(BridgeError::Stopped);
            }
            outcome.await.unwrap_or(Err(BridgeError::Stopped))
        }
    }

    /// Engine-side send: queue and forget.
    pub fn send_packet(&self, to: u32, from: u32, data: Vec<u8>) -> Result<(), BridgeError> {
        self.commands
            .send(Command::Send {
                packet: self.packet(to, from, data),
                reply: None,
            })
            .map_err(|_| BridgeError::Stopped)
    }

    /// Flush whatever is queued. `Ok(None)` if there was nothing to do.
    pub fn flush(&self) -> impl Future<Output = FlushResult> + Send + 'static {
        let (reply, outcome) = oneshot::channel();
        let queued = self.commands.send(Command::Flush { reply }).is_ok();
        async move {
            if !queued {
                return Err(BridgeError::Stopped);
            }
            outcome.await.unwrap_or(Err(BridgeError::Stopped))
        }
    }

    /// Slot whose packets are delivered to the local engine.
    pub fn set_local_slot(&self, slot: u32) -> Result<(), BridgeError> {
        self.commands
            .send(Command::SetLocalSlot(slot))
            .map_err(|_| BridgeError::Stopped)
    }

    /// Current queue, anchor and game.
    pub async fn snapshot(&self) -> Result<BridgeSnapshot, BridgeError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Snapshot(reply))
            .map_err(|_| BridgeError::Stopped)?;
        outcome.await.map_err(|_| BridgeError::Stopped)
    }

    /// Stop the bridge. Pending sends resolve with [`BridgeError::Stopped`].
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    fn packet(&self, to: u32, from: u32, data: Vec<u8>) -> Packet {
        Packet::new(to, from, self.ephemeral_key.to_vec(), data)
    }
}

// =============================================================================
// BRIDGE
// =============================================================================

/// Bridge parts, assembled before the actor starts.
pub struct MultiplayerBridge<L, R, E, Li> {
    builder: TransactionBuilder,
    ledger: Arc<L>,
    resolver: Arc<R>,
    engine: E,
    listener: Li,
    events: mpsc::Receiver<LedgerEvent>,
    local_slot: u32,
}

impl<L, R, E, Li> MultiplayerBridge<L, R, E, Li>
where
    L: Ledger + 'static,
    R: AnchorResolver + 'static,
    E: GameEngine,
    Li: BridgeListener,
{
    /// Assemble a bridge; `events` is the ledger's confirmation stream.
    pub fn new(
        builder: TransactionBuilder,
        ledger: Arc<L>,
        resolver: Arc<R>,
        engine: E,
        listener: Li,
        events: mpsc::Receiver<LedgerEvent>,
    ) -> Self {
        Self {
            builder,
            ledger,
            resolver,
            engine,
            listener,
            events,
            local_slot: 0,
        }
    }

    /// Initial engine slot.
    pub fn with_local_slot(mut self, slot: u32) -> Self {
        self.local_slot = slot;
        self
    }

    /// Start the actor.
    pub fn spawn(self) -> (BridgeHandle, JoinHandle<()>) {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let handle = BridgeHandle {
            commands,
            ephemeral_key: Arc::from(self.builder.keys().public_key_hash().to_vec()),
        };
        let actor = BridgeActor {
            builder: self.builder,
            ledger: self.ledger,
            resolver: self.resolver,
            engine: self.engine,
            listener: self.listener,
            commands: commands_rx,
            events: self.events,
            events_open: true,
            local_slot: self.local_slot,
            queue: Vec::new(),
            chain: UtxoChain::new(),
            game_id: None,
            flush: FlushState::Idle,
            flush_requested: false,
            waiting: Vec::new(),
            next_waiting: Vec::new(),
        };
        (handle, tokio::spawn(actor.run()))
    }
}

// =============================================================================
// ACTOR
// =============================================================================

enum FlushState {
    Idle,
    Resolving(BoxFuture<Result<Utxo, ChainError>>),
    Submitting {
        submission: BoxFuture<Result<TxId, LedgerError>>,
        batch_len: usize,
        successor: Utxo,
    },
}

enum Progress {
    Resolved(Result<Utxo, ChainError>),
    Submitted {
        result: Result<TxId, LedgerError>,
        batch_len: usize,
        successor: Utxo,
    },
}

impl FlushState {
    fn is_idle(&self) -> bool {
        matches!(self, FlushState::Idle)
    }

    /// Completes when the current stage does; never while idle.
    async fn progress(&mut self) -> Progress {
        match self {
            FlushState::Idle => std::future::pending().await,
            FlushState::Resolving(resolution) => Progress::Resolved(resolution.await),
            FlushState::Submitting {
                submission,
                batch_len,
                successor,
            } => Progress::Submitted {
                result: submission.await,
                batch_len: *batch_len,
                successor: successor.clone(),
            },
        }
    }
}

struct BridgeActor<L, R, E, Li> {
    builder: TransactionBuilder,
    ledger: Arc<L>,
    resolver: Arc<R>,
    engine: E,
    listener: Li,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::Receiver<LedgerEvent>,
    events_open: bool,
    local_slot: u32,
    queue: Vec<Packet>,
    chain: UtxoChain,
    game_id: Option<TxId>,
    flush: FlushState,
    flush_requested: bool,
    /// Replies settled by the current flush.
    waiting: Vec<Reply>,
    /// Replies for packets queued after the in-flight batch was built.
    next_waiting: Vec<Reply>,
}

impl<L, R, E, Li> BridgeActor<L, R, E, Li>
where
    L: Ledger + 'static,
    R: AnchorResolver + 'static,
    E: GameEngine,
    Li: BridgeListener,
{
    async fn run(mut self) {
        info!(
            local_slot = self.local_slot,
            key = %self.builder.keys().public_key_hash_hex(),
            "bridge started"
        );

        loop {
            // Everything already queued joins the next batch.
            while let Ok(command) = self.commands.try_recv() {
                if !self.handle_command(command) {
                    info!("bridge stopped");
                    return;
                }
            }
            if self.flush_requested && self.flush.is_idle() {
                self.start_flush();
            }

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("ledger event stream ended");
                        self.events_open = false;
                    }
                },
                progress = self.flush.progress() => self.handle_progress(progress),
            }
        }
        info!("bridge stopped");
    }

    /// Returns `false` on shutdown.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Send { packet, reply } => {
                trace!(to = packet.to, from = packet.from, len = packet.data.len(), "packet queued");
                self.queue.push(packet);
                if let Some(reply) = reply {
                    self.attach(reply);
                }
                self.flush_requested = true;
            }
            Command::Flush { reply } => {
                self.attach(reply);
                self.flush_requested = true;
            }
            Command::SetLocalSlot(slot) => {
                debug!(slot, "local slot set");
                self.local_slot = slot;
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn attach(&mut self, reply: Reply) {
        match self.flush {
            FlushState::Submitting { .. } => self.next_waiting.push(reply),
            _ => self.waiting.push(reply),
        }
    }

    fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            queued: self.queue.clone(),
            anchor: self.chain.current_anchor().cloned(),
            game_id: self.game_id,
            local_slot: self.local_slot,
            flushing: !self.flush.is_idle(),
        }
    }

    // -------------------------------------------------------------------------
    // Flushing
    // -------------------------------------------------------------------------

    fn start_flush(&mut self) {
        self.flush_requested = false;
        if self.queue.is_empty() {
            self.settle_waiting(Ok(None));
            return;
        }
        if !self.ledger.is_open() {
            debug!(queued = self.queue.len(), "ledger not open, holding packets");
            self.settle_waiting(Ok(None));
            return;
        }

        match self.chain.current_anchor().map(|a| a.utxo.clone()) {
            Some(anchor) => self.submit_batch(anchor),
            None => {
                debug!("resolving anchor");
                let resolver = self.resolver.clone();
                self.flush = FlushState::Resolving(Box::pin(async move { resolver.resolve().await }));
            }
        }
    }

    fn submit_batch(&mut self, anchor: Utxo) {
        let payload = encode_packets(&self.queue);
        match self.builder.build(&anchor, &payload) {
            Ok((successor, signed)) => {
                info!(
                    tx_id = %signed.tx_id,
                    spends = %anchor.out_ref,
                    packets = self.queue.len(),
                    "submitting packet batch"
                );
                self.chain.begin_submission(signed.tx_id);
                let ledger = self.ledger.clone();
                self.flush = FlushState::Submitting {
                    submission: Box::pin(async move { ledger.submit(signed).await }),
                    batch_len: self.queue.len(),
                    successor,
                };
            }
            Err(e) => {
                error!("failed to build transaction: {}", e);
                self.settle_waiting(Err(BridgeError::Build(e.to_string())));
            }
        }
    }

    fn handle_progress(&mut self, progress: Progress) {
        self.flush = FlushState::Idle;
        match progress {
            Progress::Resolved(Ok(utxo)) => {
                let anchor = self.chain.adopt(utxo).utxo.clone();
                self.submit_batch(anchor);
            }
            Progress::Resolved(Err(e)) => {
                warn!("anchor resolution failed: {}", e);
                self.settle_waiting(Err(BridgeError::Anchor(e.to_string())));
            }
            Progress::Submitted {
                result: Ok(tx_id),
                batch_len,
                successor,
            } => {
                self.chain.advance(successor);
                self.queue.drain(..batch_len);
                debug!(%tx_id, remaining = self.queue.len(), "packet batch accepted");
                self.settle_waiting(Ok(Some(tx_id)));
                self.waiting = mem::take(&mut self.next_waiting);
                if !self.queue.is_empty() {
                    self.flush_requested = true;
                }
            }
            Progress::Submitted { result: Err(e), .. } => {
                warn!(queued = self.queue.len(), "packet batch not accepted: {}", e);
                self.chain.invalidate();
                let error = BridgeError::from(e);
                self.waiting.append(&mut self.next_waiting);
                self.settle_waiting(Err(error));
            }
        }
    }

    fn settle_waiting(&mut self, result: FlushResult) {
        for reply in self.waiting.drain(..) {
            let _ = reply.send(result.clone());
        }
    }

    // -------------------------------------------------------------------------
    // Observation
    // -------------------------------------------------------------------------

    fn handle_event(&mut self, event: LedgerEvent) {
        match event {
            LedgerEvent::Confirmed {
                tx_id,
                tx_cbor,
                observed_at,
            } => self.observe(tx_id, &tx_cbor, observed_at),
            LedgerEvent::Closed { reason } => {
                warn!("ledger connection closed: {}", reason);
            }
        }
    }

    fn observe(&mut self, tx_id: TxId, tx_cbor: &[u8], observed_at: Option<DateTime<Utc>>) {
        let tx = match parse_transaction(tx_cbor) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(%tx_id, "unreadable confirmed transaction: {}", e);
                return;
            }
        };
        self.chain.observe_spend(&tx_id, &tx.inputs);

        let Some(datum) = tx.outputs.first().and_then(|o| o.datum.as_deref()) else {
            debug!(%tx_id, "confirmed transaction carries no inline datum");
            return;
        };
        let payload = match decode_payload(datum) {
            Ok(Payload::Unrecognized) => {
                debug!(%tx_id, "datum is neither a packet batch nor a game record");
                return;
            }
            Ok(payload) => payload,
            Err(e) => {
                warn!(%tx_id, "undecodable datum: {}", e);
                return;
            }
        };

        // Engine and listener are foreign code; a panic there must not end the actor.
        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| match &payload {
            Payload::PacketBatch(packets) => self.dispatch_packets(&tx, packets, observed_at),
            Payload::GameRecord(record) => self.dispatch_game(tx_id, record),
            Payload::Unrecognized => {}
        }));
        if let Err(cause) = dispatched {
            error!(%tx_id, "dispatch panicked: {}", panic_message(&*cause));
        }
    }

    fn dispatch_packets(
        &mut self,
        tx: &ObservedTx,
        packets: &[Packet],
        observed_at: Option<DateTime<Utc>>,
    ) {
        let mut delivered = 0;
        for packet in packets {
            self.listener.packet_observed(&tx.tx_id, packet);
            if packet.to == self.local_slot && deliver_packet(&mut self.engine, packet) {
                delivered += 1;
            }
        }
        debug!(
            tx_id = %tx.tx_id,
            packets = packets.len(),
            delivered,
            observed_at = ?observed_at,
            "packet batch observed"
        );
        self.listener.tx_observed(tx, packets);
    }

    fn dispatch_game(&mut self, tx_id: TxId, record: &GameRecord) {
        let game_id = match self.game_id {
            Some(game_id) => {
                debug!(%game_id, players = record.players.len(), "game record updated");
                self.listener.player_joined(&game_id, &record.players);
                game_id
            }
            None => {
                info!(
                    game_id = %tx_id,
                    players = record.player_count,
                    bots = record.bot_count,
                    "new game announced"
                );
                self.game_id = Some(tx_id);
                self.listener.new_game(
                    &tx_id,
                    record.player_count,
                    record.bot_count,
                    record.players.first(),
                );
                tx_id
            }
        };
        if record.state.is_terminal() {
            info!(%game_id, state = ?record.state, "game ended");
            self.listener.game_ended(&game_id, record);
        }
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    cause
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| cause.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

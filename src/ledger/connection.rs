//! Head Connection
//!
//! One websocket to a Hydra node. A writer task drains outbound frames;
//! a reader task parses head messages, settles the pending submission
//! and forwards every confirmed transaction as a [`LedgerEvent`].
//!
//! State machine, published through a watch channel:
//!
//! ```text
//! Connecting -> Open -> Closed
//!                  \--> Errored
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::protocol::{ClientInput, HeadMessage};
use super::tx::{transaction_id, SignedTx};
use super::utxo::TxId;
use super::{Ledger, LedgerEvent};

/// Outbound frame buffer.
const OUTBOUND_BUFFER: usize = 64;
/// Confirmation event buffer.
const EVENT_BUFFER: usize = 256;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Node API URL (`http`, `https`, `ws` or `wss`).
    pub head_url: Url,
    /// Only receive transactions touching this address.
    pub filter_address: Option<String>,
    /// Era tag placed on submitted transactions.
    pub era_tag: String,
    /// How long a submission may wait for its verdict.
    pub submit_timeout: Duration,
}

impl LedgerConfig {
    /// Websocket URL: no history replay, optional address filter.
    pub fn websocket_url(&self) -> Result<Url, LedgerError> {
        let mut url = self.head_url.clone();
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(LedgerError::UnsupportedScheme(other.to_string())),
        };
        url.set_scheme(scheme)
            .map_err(|_| LedgerError::UnsupportedScheme(scheme.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query.clear().append_pair("history", "no");
            if let Some(address) = &self.filter_address {
                query.append_pair("address", address);
            }
        }
        Ok(url)
    }
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Ready for submissions.
    Open,
    /// Closed locally or by the node.
    Closed,
    /// Transport failure.
    Errored,
}

/// Connection errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// URL scheme cannot be mapped to a websocket.
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Message could not be serialized.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The head sent a message that could not be interpreted.
    #[error("malformed head message: {0}")]
    Protocol(String),

    /// Submission attempted while not open.
    #[error("connection is not open")]
    NotOpen,

    /// Another submission is awaiting its verdict.
    #[error("a submission is already in flight")]
    SubmissionInFlight,

    /// The head rejected the transaction.
    #[error("transaction rejected: {reason}")]
    Rejected {
        /// Node-provided reason.
        reason: String,
    },

    /// No verdict within the submit timeout.
    #[error("submission timed out")]
    Timeout,

    /// Connection closed before the verdict.
    #[error("connection closed")]
    ConnectionClosed,

    /// Transport failed before the verdict.
    #[error("transport error: {0}")]
    Transport(String),
}

/// The submission awaiting a verdict.
struct Pending {
    tx_id: TxId,
    reply: oneshot::Sender<Result<TxId, LedgerError>>,
}

type PendingSlot = Arc<Mutex<Option<Pending>>>;

/// A live connection to the head.
pub struct LedgerConnection {
    state: Arc<watch::Sender<ConnectionState>>,
    outbound: mpsc::Sender<Message>,
    pending: PendingSlot,
    era_tag: String,
    submit_timeout: Duration,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl LedgerConnection {
    /// Open the websocket and start the reader and writer tasks.
    ///
    /// The returned receiver yields every confirmed transaction.
    #[instrument(skip(config), fields(url = %config.head_url))]
    pub async fn connect(
        config: &LedgerConfig,
    ) -> Result<(Self, mpsc::Receiver<LedgerEvent>), LedgerError> {
        let url = config.websocket_url()?;
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let state = Arc::new(state);

        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(ok) => ok,
            Err(e) => {
                state.send_replace(ConnectionState::Errored);
                error!("WebSocket handshake with {} failed: {}", url, e);
                return Err(e.into());
            }
        };
        state.send_replace(ConnectionState::Open);
        info!("connected to head at {}", url);

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        let (events, events_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: PendingSlot = Arc::new(Mutex::new(None));

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = ws_sender.send(msg).await {
                    warn!("failed to write to head: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        let reader_state = state.clone();
        let reader_pending = pending.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&text, &reader_pending, &events).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("head closed connection: {:?}", frame);
                        reader_state.send_if_modified(|s| open_to(s, ConnectionState::Closed));
                        settle(&reader_pending, Err(LedgerError::ConnectionClosed)).await;
                        break "closed by head".to_string();
                    }
                    None => {
                        reader_state.send_if_modified(|s| open_to(s, ConnectionState::Closed));
                        settle(&reader_pending, Err(LedgerError::ConnectionClosed)).await;
                        break "stream ended".to_string();
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error: {}", e);
                        reader_state.send_if_modified(|s| open_to(s, ConnectionState::Errored));
                        settle(&reader_pending, Err(LedgerError::Transport(e.to_string()))).await;
                        break e.to_string();
                    }
                    _ => {}
                }
            };
            let _ = events.send(LedgerEvent::Closed { reason }).await;
        });

        Ok((
            Self {
                state,
                outbound,
                pending,
                era_tag: config.era_tag.clone(),
                submit_timeout: config.submit_timeout,
                reader,
                writer,
            },
            events_rx,
        ))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Whether submissions are accepted.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Submit a transaction and wait for the head's verdict.
    pub async fn submit(&self, tx: SignedTx) -> Result<TxId, LedgerError> {
        if !self.is_open() {
            return Err(LedgerError::NotOpen);
        }
        let tx_id = tx.tx_id;
        let (reply, verdict) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.is_some() {
                return Err(LedgerError::SubmissionInFlight);
            }
            *pending = Some(Pending { tx_id, reply });
        }

        let text = ClientInput::new_tx(&self.era_tag, &tx).to_json()?;
        if self.outbound.send(Message::Text(text)).await.is_err() {
            self.clear_pending(&tx_id).await;
            return Err(LedgerError::ConnectionClosed);
        }
        debug!(%tx_id, bytes = tx.cbor.len(), "submitted transaction");

        match tokio::time::timeout(self.submit_timeout, verdict).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LedgerError::ConnectionClosed),
            Err(_) => {
                warn!(%tx_id, "no verdict within {:?}", self.submit_timeout);
                self.clear_pending(&tx_id).await;
                Err(LedgerError::Timeout)
            }
        }
    }

    /// Close the socket, rejecting any pending submission.
    pub async fn close(&self) {
        let was_open = self.state.send_if_modified(|s| open_to(s, ConnectionState::Closed));
        if was_open {
            let _ = self.outbound.send(Message::Close(None)).await;
            info!("closing head connection");
        }
        settle(&self.pending, Err(LedgerError::ConnectionClosed)).await;
    }

    async fn clear_pending(&self, tx_id: &TxId) {
        let mut pending = self.pending.lock().await;
        if pending.as_ref().map(|p| &p.tx_id) == Some(tx_id) {
            *pending = None;
        }
    }
}

impl Drop for LedgerConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Ledger for LedgerConnection {
    fn is_open(&self) -> bool {
        LedgerConnection::is_open(self)
    }

    async fn submit(&self, tx: SignedTx) -> Result<TxId, LedgerError> {
        LedgerConnection::submit(self, tx).await
    }
}

/// Move `Open` (or `Connecting`) to `next`; terminal states stay put.
fn open_to(state: &mut ConnectionState, next: ConnectionState) -> bool {
    match state {
        ConnectionState::Open | ConnectionState::Connecting => {
            *state = next;
            true
        }
        ConnectionState::Closed | ConnectionState::Errored => false,
    }
}

async fn settle(pending: &PendingSlot, result: Result<TxId, LedgerError>) {
    if let Some(p) = pending.lock().await.take() {
        let _ = p.reply.send(result);
    }
}

/// Settle the pending submission if `tx_id` names it, or unconditionally
/// when the node did not say which transaction it means.
async fn settle_matching(
    pending: &PendingSlot,
    tx_id: Option<TxId>,
    result: Result<TxId, LedgerError>,
) {
    let mut slot = pending.lock().await;
    let matches = match (slot.as_ref(), tx_id) {
        (Some(p), Some(id)) => p.tx_id == id,
        (Some(_), None) => true,
        (None, _) => false,
    };
    if matches {
        if let Some(p) = slot.take() {
            let _ = p.reply.send(result);
        }
    }
}

async fn handle_text(text: &str, pending: &PendingSlot, events: &mpsc::Sender<LedgerEvent>) {
    let msg = match HeadMessage::from_json(text) {
        Ok(m) => m,
        Err(e) => {
            let tag = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("tag").and_then(|t| t.as_str()).map(str::to_string));
            warn!(tag = ?tag, "malformed head message: {}", e);
            let reason = match tag {
                Some(tag) => format!("{}: {}", tag, e),
                None => e.to_string(),
            };
            settle(pending, Err(LedgerError::Protocol(reason))).await;
            return;
        }
    };

    match msg {
        HeadMessage::TxValid {
            transaction,
            transaction_id: id_field,
            timestamp,
        } => {
            let envelope = transaction.unwrap_or_default();
            let tx_cbor = match hex::decode(&envelope.cbor_hex) {
                Ok(bytes) if !bytes.is_empty() => Some(bytes),
                _ => None,
            };
            let tx_id = envelope
                .tx_id
                .as_deref()
                .or(id_field.as_deref())
                .and_then(|s| s.parse::<TxId>().ok())
                .or_else(|| tx_cbor.as_deref().and_then(|b| transaction_id(b).ok()));

            let Some(tx_id) = tx_id else {
                warn!("TxValid without a usable transaction id");
                return;
            };
            settle_matching(pending, Some(tx_id), Ok(tx_id)).await;

            match tx_cbor {
                Some(tx_cbor) => {
                    debug!(%tx_id, "transaction confirmed");
                    let _ = events
                        .send(LedgerEvent::Confirmed {
                            tx_id,
                            tx_cbor,
                            observed_at: timestamp,
                        })
                        .await;
                }
                None => debug!(%tx_id, "confirmation without transaction body"),
            }
        }
        HeadMessage::TxInvalid {
            transaction,
            validation_error,
        } => {
            let reason = validation_error
                .map(|e| e.reason)
                .unwrap_or_else(|| "unspecified".to_string());
            let tx_id = transaction.and_then(|t| {
                t.tx_id
                    .and_then(|s| s.parse::<TxId>().ok())
                    .or_else(|| hex::decode(&t.cbor_hex).ok().and_then(|b| transaction_id(&b).ok()))
            });
            warn!(tx_id = ?tx_id, "transaction invalid: {}", reason);
            settle_matching(pending, tx_id, Err(LedgerError::Rejected { reason })).await;
        }
        HeadMessage::SnapshotConfirmed { snapshot } => {
            debug!(number = ?snapshot.and_then(|s| s.number), "snapshot confirmed");
        }
        HeadMessage::CommandFailed { client_input } => {
            warn!("head command failed: {:?}", client_input);
            settle(pending, Err(LedgerError::Rejected {
                reason: "CommandFailed".to_string(),
            }))
            .await;
        }
        HeadMessage::PostTxOnChainFailed { post_tx_error } => {
            warn!("on-chain post failed: {:?}", post_tx_error);
            settle(pending, Err(LedgerError::Rejected {
                reason: "PostTxOnChainFailed".to_string(),
            }))
            .await;
        }
        HeadMessage::Unknown => {
            warn!("unrecognized head message: {}", text);
            settle(pending, Err(LedgerError::Rejected {
                reason: "unrecognized head message".to_string(),
            }))
            .await;
        }
        other => info!(tag = other.tag(), "head event"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type HeadSocket = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

    fn config(addr: std::net::SocketAddr) -> LedgerConfig {
        LedgerConfig {
            head_url: Url::parse(&format!("http://{}", addr)).unwrap(),
            filter_address: None,
            era_tag: "Tx BabbageEra".to_string(),
            submit_timeout: Duration::from_secs(5),
        }
    }

    /// Fake head: accepts one client and hands the socket to `script`.
    async fn fake_head<F, Fut>(script: F) -> std::net::SocketAddr
    where
        F: FnOnce(HeadSocket) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let ws = accept_async(stream).await.unwrap();
            script(ws).await;
        });
        addr
    }

    fn signed(byte: u8) -> SignedTx {
        SignedTx {
            tx_id: TxId([byte; 32]),
            cbor: vec![0x84, 0xa0, 0xa0, 0xf5, 0xf6],
        }
    }

    fn tx_valid(tx: &SignedTx) -> Message {
        Message::Text(format!(
            r#"{{"tag":"TxValid","timestamp":"2024-05-01T12:00:00Z","transaction":{{"type":"Tx BabbageEra","description":"","cborHex":"{}","txId":"{}"}}}}"#,
            tx.to_hex(),
            tx.tx_id
        ))
    }

    async fn next_text(ws: &mut HeadSocket) -> serde_json::Value {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("head socket ended: {:?}", other),
            }
        }
    }

    #[test]
    fn test_websocket_url() {
        let mut cfg = config("127.0.0.1:4001".parse().unwrap());
        assert_eq!(cfg.websocket_url().unwrap().as_str(), "ws://127.0.0.1:4001/?history=no");

        cfg.head_url = Url::parse("https://head.example/").unwrap();
        cfg.filter_address = Some("addr_test1xyz".to_string());
        assert_eq!(
            cfg.websocket_url().unwrap().as_str(),
            "wss://head.example/?history=no&address=addr_test1xyz"
        );

        cfg.head_url = Url::parse("ftp://head.example/").unwrap();
        assert!(matches!(cfg.websocket_url(), Err(LedgerError::UnsupportedScheme(_))));
    }

    #[tokio::test]
    async fn test_submit_resolves_on_tx_valid() {
        let tx = signed(1);
        let reply = tx.clone();
        let addr = fake_head(move |mut ws| async move {
            let msg = next_text(&mut ws).await;
            assert_eq!(msg["tag"], "NewTx");
            assert_eq!(msg["transaction"]["type"], "Tx BabbageEra");
            assert_eq!(msg["transaction"]["cborHex"], reply.to_hex());
            ws.send(tx_valid(&reply)).await.unwrap();
            let _ = next_text(&mut ws).await;
        })
        .await;

        let (conn, mut events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.submit(tx.clone()).await.unwrap(), tx.tx_id);

        match events.recv().await.unwrap() {
            LedgerEvent::Confirmed { tx_id, tx_cbor, observed_at } => {
                assert_eq!(tx_id, tx.tx_id);
                assert_eq!(tx_cbor, tx.cbor);
                assert!(observed_at.is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tx_invalid_rejects_with_reason() {
        let addr = fake_head(|mut ws| async move {
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text(
                r#"{"tag":"TxInvalid","validationError":{"reason":"BadInputsUTxO"}}"#.to_string(),
            ))
            .await
            .unwrap();
            let _ = next_text(&mut ws).await;
        })
        .await;

        let (conn, _events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        match conn.submit(signed(2)).await {
            Err(LedgerError::Rejected { reason }) => assert_eq!(reason, "BadInputsUTxO"),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_confirmation_is_forwarded() {
        let foreign = signed(3);
        let sent = foreign.clone();
        let addr = fake_head(move |mut ws| async move {
            ws.send(Message::Text(r#"{"tag":"Greetings","headStatus":"Open"}"#.to_string()))
                .await
                .unwrap();
            ws.send(tx_valid(&sent)).await.unwrap();
            let _ = next_text(&mut ws).await;
        })
        .await;

        let (_conn, mut events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        match events.recv().await.unwrap() {
            LedgerEvent::Confirmed { tx_id, .. } => assert_eq!(tx_id, foreign.tx_id),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_second_submission_in_flight() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let first = signed(4);
        let reply = first.clone();
        let addr = fake_head(move |mut ws| async move {
            let _ = next_text(&mut ws).await;
            let _ = seen_tx.send(());
            let _ = release_rx.await;
            ws.send(tx_valid(&reply)).await.unwrap();
            let _ = next_text(&mut ws).await;
        })
        .await;

        let (conn, _events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        let conn = Arc::new(conn);
        let submitter = conn.clone();
        let first_id = first.tx_id;
        let in_flight = tokio::spawn(async move { submitter.submit(first).await });

        seen_rx.await.unwrap();
        assert!(matches!(
            conn.submit(signed(5)).await,
            Err(LedgerError::SubmissionInFlight)
        ));
        release_tx.send(()).unwrap();
        assert_eq!(in_flight.await.unwrap().unwrap(), first_id);
    }

    #[tokio::test]
    async fn test_unknown_tag_rejects_pending() {
        let addr = fake_head(|mut ws| async move {
            let _ = next_text(&mut ws).await;
            ws.send(Message::Text(r#"{"tag":"Mystery"}"#.to_string())).await.unwrap();
            let _ = next_text(&mut ws).await;
        })
        .await;

        let (conn, _events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        assert!(matches!(
            conn.submit(signed(6)).await,
            Err(LedgerError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_message_rejects_pending() {
        for frame in [
            "this is not json",
            r#"{"tag":"TxInvalid","validationError":"BadInputsUTxO"}"#,
        ] {
            let addr = fake_head(move |mut ws| async move {
                let _ = next_text(&mut ws).await;
                ws.send(Message::Text(frame.to_string())).await.unwrap();
                let _ = next_text(&mut ws).await;
            })
            .await;

            let mut config = config(addr);
            config.submit_timeout = Duration::from_secs(10);
            let (conn, _events) = LedgerConnection::connect(&config).await.unwrap();
            match conn.submit(signed(9)).await {
                Err(LedgerError::Protocol(reason)) => {
                    if frame.starts_with('{') {
                        assert!(reason.starts_with("TxInvalid"), "{}", reason);
                    }
                }
                other => panic!("{} -> {:?}", frame, other),
            }
        }
    }

    #[tokio::test]
    async fn test_close_rejects_pending() {
        let (seen_tx, seen_rx) = oneshot::channel();
        let addr = fake_head(move |mut ws| async move {
            let _ = next_text(&mut ws).await;
            let _ = seen_tx.send(());
            while ws.next().await.is_some() {}
        })
        .await;

        let (conn, _events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        let conn = Arc::new(conn);
        let submitter = conn.clone();
        let pending = tokio::spawn(async move { submitter.submit(signed(7)).await });

        seen_rx.await.unwrap();
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            pending.await.unwrap(),
            Err(LedgerError::ConnectionClosed)
        ));
        assert!(matches!(conn.submit(signed(8)).await, Err(LedgerError::NotOpen)));
    }

    #[tokio::test]
    async fn test_head_hangup_emits_closed() {
        let addr = fake_head(|mut ws| async move {
            ws.close(None).await.unwrap();
        })
        .await;

        let (conn, mut events) = LedgerConnection::connect(&config(addr)).await.unwrap();
        let mut states = conn.subscribe();
        assert!(matches!(events.recv().await.unwrap(), LedgerEvent::Closed { .. }));
        states.wait_for(|s| *s != ConnectionState::Open).await.unwrap();
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_submit_timeout() {
        let addr = fake_head(|mut ws| async move {
            while ws.next().await.is_some() {}
        })
        .await;

        let mut cfg = config(addr);
        cfg.submit_timeout = Duration::from_millis(50);
        let (conn, _events) = LedgerConnection::connect(&cfg).await.unwrap();
        assert!(matches!(conn.submit(signed(9)).await, Err(LedgerError::Timeout)));
        // The slot is free again.
        assert!(matches!(conn.submit(signed(10)).await, Err(LedgerError::Timeout)));
    }
}

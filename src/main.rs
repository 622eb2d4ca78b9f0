//! Hydra Multiplayer Relay
//!
//! Headless participant: loads the session key, connects to the head and
//! runs the bridge with a logging engine. Lines on stdin of the form
//! `<to> <hex>` are sent as packets from the local slot.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use hydra_multiplayer::{
    bridge::{EnginePtr, GameEngine},
    codec::KeyHash,
    BridgeConfig, BridgeListener, GameRecord, HydraUtxoResolver, LedgerConnection,
    MultiplayerBridge, SessionKeys, TransactionBuilder, TxId, VERSION,
};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Hydra Multiplayer Relay v{}", VERSION);

    let config = BridgeConfig::from_env()?;
    let keys = load_keys(&config)?;
    info!(address = %keys.address(), key = %keys.public_key_hash_hex(), "session key ready");

    let ledger_config = config.ledger_config()?;
    let resolver = HydraUtxoResolver::new(&ledger_config.head_url, keys.address())?;
    let (connection, events) = LedgerConnection::connect(&ledger_config)
        .await
        .with_context(|| format!("failed to connect to {}", ledger_config.head_url))?;
    let connection = Arc::new(connection);
    let mut state = connection.subscribe();

    let (bridge, task) = MultiplayerBridge::new(
        TransactionBuilder::new(keys, config.fee),
        connection.clone(),
        Arc::new(resolver),
        LoggingEngine::default(),
        LoggingListener,
        events,
    )
    .with_local_slot(config.local_slot)
    .spawn();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            changed = state.changed() => {
                if changed.is_err() || !connection.is_open() {
                    warn!(state = ?connection.state(), "head connection ended");
                    break;
                }
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match parse_command(&line) {
                    Some((to, data)) => {
                        let sent = bridge.send(to, config.local_slot, data);
                        tokio::spawn(async move {
                            match sent.await {
                                Ok(Some(tx_id)) => info!(%tx_id, to, "packet accepted"),
                                Ok(None) => warn!(to, "head not open, packet held"),
                                Err(e) => warn!(to, "packet not sent: {}", e),
                            }
                        });
                    }
                    None => warn!("expected `<to> <hex>`, got {:?}", line),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!("stdin: {}", e);
                    stdin_open = false;
                }
            },
        }
    }

    bridge.shutdown();
    connection.close().await;
    task.await.context("bridge task failed")?;
    info!("relay stopped");
    Ok(())
}

fn load_keys(config: &BridgeConfig) -> anyhow::Result<SessionKeys> {
    if config.key_file.exists() {
        SessionKeys::load(&config.key_file, config.network_id)
            .with_context(|| format!("failed to load {}", config.key_file.display()))
    } else {
        warn!(path = %config.key_file.display(), "key file missing, generating a session key");
        Ok(SessionKeys::generate(config.network_id))
    }
}

fn parse_command(line: &str) -> Option<(u32, Vec<u8>)> {
    let (to, data) = line.trim().split_once(' ')?;
    Some((to.parse().ok()?, hex::decode(data.trim()).ok()?))
}

/// Engine stand-in that logs every delivered datagram.
#[derive(Default)]
struct LoggingEngine {
    buffers: HashMap<usize, Vec<u8>>,
    next: usize,
}

impl GameEngine for LoggingEngine {
    fn alloc(&mut self, len: usize) -> Option<EnginePtr> {
        self.next += 1;
        self.buffers.insert(self.next, vec![0; len]);
        Some(EnginePtr(self.next))
    }

    fn write(&mut self, ptr: EnginePtr, bytes: &[u8]) {
        if let Some(buffer) = self.buffers.get_mut(&ptr.0) {
            buffer.copy_from_slice(bytes);
        }
    }

    fn receive_packet(&mut self, from: u32, ptr: EnginePtr, len: usize) {
        if let Some(buffer) = self.buffers.get(&ptr.0) {
            info!(from, len, data = %hex::encode(&buffer[..len]), "packet received");
        }
    }

    fn free(&mut self, ptr: EnginePtr) {
        self.buffers.remove(&ptr.0);
    }
}

struct LoggingListener;

impl BridgeListener for LoggingListener {
    fn new_game(
        &mut self,
        game_id: &TxId,
        player_count: u64,
        bot_count: u64,
        first_player: Option<&KeyHash>,
    ) {
        info!(%game_id, player_count, bot_count, first_player = ?first_player, "new game");
    }

    fn player_joined(&mut self, game_id: &TxId, players: &[KeyHash]) {
        info!(%game_id, players = players.len(), "player joined");
    }

    fn game_ended(&mut self, game_id: &TxId, record: &GameRecord) {
        info!(
            %game_id,
            state = ?record.state,
            winner = ?record.winner,
            cheater = ?record.cheater,
            "game ended"
        );
    }
}

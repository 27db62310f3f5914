//! Client role: discover servers, ingest replays
//!
//! A client learns its primary server from heartbeat broadcasts, answers
//! server pings, and feeds replayed history back into the local delivery
//! pipeline. A small persistent log of already-ingested replay IDs keeps a
//! re-requested history from delivering the same message to the user
//! twice.

use std::io::{Read, Write};

use hashbrown::HashSet;
use tracing::{debug, info, warn};

use crate::config::StoreForwardConfig;
use crate::errors::StorageError;
use crate::messenger::Messenger;
use crate::packet::{DecodedPayload, MeshPacket, PayloadVariant, PortNum, Priority};
use crate::proto::{RequestResponse, StatsPayload, StoreAndForward, Variant};
use crate::scheduler::ACTIVE_TICK_MS;
use crate::storage::Storage;
use crate::types::{Clock, NodeId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Assumed heartbeat period until a server tells us otherwise
const DEFAULT_HEARTBEAT_INTERVAL_S: u32 = 900;

/// Retry delay after ROUTER_BUSY; doubled for ROUTER_ERROR
const RETRY_AFTER_BUSY_MS: u64 = 30_000;

/// Received-replay log bound; pruning keeps the numerically newer half
const REPLAY_LOG_MAX: usize = 10_000;

/// Persisted replay-log location (count + IDs, little-endian u32s)
pub const REPLAY_LOG_FILE: &str = "history/sf_received";
const REPLAY_LOG_TMP: &str = "history/sf_received.tmp";
const REPLAY_LOG_SAVE_EVERY: usize = 10;

// ----------------------------------------------------------------------------
// Client State
// ----------------------------------------------------------------------------

/// Mutable state of the client role
#[derive(Debug)]
pub struct ClientState {
    pub primary_server: Option<NodeId>,
    pub server_available: bool,
    pub last_heartbeat_ms: u64,
    /// Learned from the server's heartbeat
    pub heartbeat_interval_s: u32,
    /// When to re-issue the last refused request, if scheduled
    pub retry_at_ms: Option<u64>,
    /// Stats learned from the most recent ROUTER_STATS
    pub last_stats: Option<StatsPayload>,
    /// Window (minutes) announced by the most recent ROUTER_HISTORY
    pub announced_window_min: Option<u32>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            primary_server: None,
            server_available: false,
            last_heartbeat_ms: 0,
            heartbeat_interval_s: DEFAULT_HEARTBEAT_INTERVAL_S,
            retry_at_ms: None,
            last_stats: None,
            announced_window_min: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Received-Replay Log
// ----------------------------------------------------------------------------

/// Packet IDs of replays already ingested, so duplicates are dropped
#[derive(Debug, Default)]
struct ReplayLog {
    ids: HashSet<u32>,
    inserts_since_save: usize,
}

impl ReplayLog {
    /// Record an ID; returns false when it was already present
    fn insert(&mut self, id: u32) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.inserts_since_save += 1;

        if self.ids.len() > REPLAY_LOG_MAX {
            // IDs trend upward in time; keep the newer half.
            let mut sorted: Vec<u32> = self.ids.drain().collect();
            sorted.sort_unstable();
            self.ids.extend(sorted.split_off(sorted.len() / 2));
            debug!("S&F - Pruned replay log to {} entries", self.ids.len());
        }
        true
    }

    fn save(&mut self, storage: &mut dyn Storage) -> Result<(), StorageError> {
        storage.mkdir(crate::persistence::HISTORY_DIR)?;

        let mut sorted: Vec<u32> = self.ids.iter().copied().collect();
        sorted.sort_unstable();

        let mut buf = Vec::with_capacity(4 + sorted.len() * 4);
        buf.extend_from_slice(&(sorted.len() as u32).to_le_bytes());
        for id in sorted {
            buf.extend_from_slice(&id.to_le_bytes());
        }

        {
            let mut writer = storage.open_write(REPLAY_LOG_TMP)?;
            writer.write_all(&buf)?;
            writer.flush()?;
        }
        storage.rename(REPLAY_LOG_TMP, REPLAY_LOG_FILE)?;
        self.inserts_since_save = 0;
        Ok(())
    }

    fn load(&mut self, storage: &mut dyn Storage) -> Result<(), StorageError> {
        if !storage.exists(REPLAY_LOG_FILE) {
            return Ok(());
        }

        let mut bytes = Vec::new();
        storage
            .open_read(REPLAY_LOG_FILE)?
            .read_to_end(&mut bytes)?;
        if bytes.len() < 4 {
            warn!("S&F - Replay log too short, ignoring");
            return Ok(());
        }

        let count = u32::from_le_bytes(bytes[0..4].try_into().expect("4-byte slice")) as usize;
        let available = (bytes.len() - 4) / 4;
        for i in 0..count.min(available) {
            let at = 4 + i * 4;
            let id = u32::from_le_bytes(bytes[at..at + 4].try_into().expect("4-byte slice"));
            self.ids.insert(id);
        }
        info!("S&F - Loaded {} replay IDs", self.ids.len());
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Client Role
// ----------------------------------------------------------------------------

/// The Store & Forward client engine
pub struct ClientRole {
    config: StoreForwardConfig,
    messenger: Messenger,
    clock: Box<dyn Clock>,
    storage: Box<dyn Storage>,
    state: ClientState,
    replay_log: ReplayLog,
}

impl ClientRole {
    pub fn new(
        config: StoreForwardConfig,
        messenger: Messenger,
        clock: Box<dyn Clock>,
        mut storage: Box<dyn Storage>,
    ) -> Self {
        info!("S&F - Client role starting");
        let mut replay_log = ReplayLog::default();
        if let Err(err) = replay_log.load(storage.as_mut()) {
            warn!("S&F - Could not load replay log: {err}");
        }
        Self {
            config,
            messenger,
            clock,
            storage,
            state: ClientState::default(),
            replay_log,
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    pub fn on_receive(&mut self, packet: &MeshPacket) {
        let Some(decoded) = packet.decoded() else {
            return;
        };
        if decoded.portnum != Some(PortNum::StoreForward) {
            return;
        }

        let envelope = match StoreAndForward::decode(&decoded.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("S&F - Dropping undecodable envelope: {err}");
                return;
            }
        };

        match envelope.rr {
            RequestResponse::RouterHeartbeat | RequestResponse::RouterPong => {
                self.register_server(packet.from);
                if let Variant::Heartbeat(hb) = envelope.variant {
                    if hb.period > 0 {
                        self.state.heartbeat_interval_s = hb.period;
                    }
                }
                info!(
                    "S&F - Heartbeat from server {}, interval {} s",
                    packet.from, self.state.heartbeat_interval_s
                );
            }

            RequestResponse::RouterPing => {
                info!("S&F - Responding to PING from {}", packet.from);
                self.register_server(packet.from);
                if let Err(err) = self.messenger.send_pong(packet.from) {
                    warn!("S&F - Pong send failed: {err}");
                }
            }

            RequestResponse::RouterHistory => {
                if let Variant::History(h) = envelope.variant {
                    let minutes = h.window / 60_000;
                    self.state.announced_window_min = Some(minutes);
                    info!(
                        "S&F - Server {} sending {} messages from last {} minutes",
                        packet.from, h.history_messages, minutes
                    );
                }
            }

            RequestResponse::RouterStats => {
                if let Variant::Stats(stats) = envelope.variant {
                    info!(
                        "S&F - Server {} stats: {}/{} messages, up {} s",
                        packet.from, stats.messages_saved, stats.messages_max, stats.up_time
                    );
                    self.state.last_stats = Some(stats);
                }
            }

            RequestResponse::RouterTextDirect | RequestResponse::RouterTextBroadcast => {
                if let Variant::Text(text) = envelope.variant {
                    self.ingest_replay(packet, envelope.rr, text);
                }
            }

            RequestResponse::RouterError | RequestResponse::RouterBusy => {
                let backoff = if envelope.rr == RequestResponse::RouterError {
                    RETRY_AFTER_BUSY_MS * 2
                } else {
                    RETRY_AFTER_BUSY_MS
                };
                warn!(
                    "S&F - Server {} refused ({:?}), retrying in {} ms",
                    packet.from, envelope.rr, backoff
                );
                self.state.retry_at_ms = Some(self.clock.now_ms() + backoff);
            }

            other => {
                debug!("S&F - Ignoring {other:?} from {}", packet.from);
            }
        }
    }

    fn register_server(&mut self, server: NodeId) {
        self.state.primary_server = Some(server);
        self.state.server_available = true;
        self.state.last_heartbeat_ms = self.clock.now_ms();
    }

    /// Re-inject a replayed message into the local delivery pipeline
    ///
    /// The envelope carries only the text bytes, so the relaying server
    /// stands in as the sender; broadcast vs direct restores the
    /// destination.
    fn ingest_replay(&mut self, packet: &MeshPacket, rr: RequestResponse, text: Vec<u8>) {
        if !self.replay_log.insert(packet.id) {
            debug!("S&F - Dropping duplicate replay 0x{:08x}", packet.id);
            return;
        }
        if self.replay_log.inserts_since_save >= REPLAY_LOG_SAVE_EVERY {
            if let Err(err) = self.replay_log.save(self.storage.as_mut()) {
                warn!("S&F - Could not save replay log: {err}");
            }
        }

        let to = if rr == RequestResponse::RouterTextBroadcast {
            NodeId::BROADCAST
        } else {
            self.messenger.local_node()
        };

        info!("S&F - Received forwarded message via server {}", packet.from);
        let delivery = MeshPacket {
            from: packet.from,
            to,
            id: packet.id,
            channel: packet.channel,
            rx_time: packet.rx_time,
            priority: Priority::default(),
            want_ack: false,
            payload: PayloadVariant::Decoded(DecodedPayload {
                portnum: Some(PortNum::TextMessage),
                payload: text,
                reply_id: packet.decoded().map(|d| d.reply_id).unwrap_or(0),
                emoji: packet.decoded().map(|d| d.emoji).unwrap_or(false),
                ..DecodedPayload::default()
            }),
        };
        if let Err(err) = self.messenger.send_raw(delivery) {
            warn!("S&F - Replay re-injection failed: {err}");
        }
    }

    // ------------------------------------------------------------------
    // Drive loop
    // ------------------------------------------------------------------

    /// One cooperative tick; returns the delay until the next one
    pub fn run_once(&mut self) -> u64 {
        let now = self.clock.now_ms();

        // A server that misses two heartbeat periods is gone.
        let silence_limit = self.state.heartbeat_interval_s as u64 * 2000;
        if self.state.server_available
            && self.state.last_heartbeat_ms > 0
            && now.saturating_sub(self.state.last_heartbeat_ms) > silence_limit
        {
            if let Some(server) = self.state.primary_server {
                info!("S&F - Lost connection to server {}", server);
            }
            self.state.server_available = false;
        }

        if let Some(retry_at) = self.state.retry_at_ms {
            if now >= retry_at {
                self.state.retry_at_ms = None;
                if let Some(server) = self.state.primary_server {
                    info!("S&F - Retrying history request to {}", server);
                    self.request_history(Some(server), self.config.history_return_window);
                }
            }
        }

        ACTIVE_TICK_MS
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Ask a server (default: the primary) for history
    pub fn request_history(&mut self, server: Option<NodeId>, minutes: u32) {
        let Some(server) = server.or(self.state.primary_server) else {
            warn!("S&F - No server specified and no primary server known");
            return;
        };
        if let Err(err) = self.messenger.request_history(server, minutes) {
            warn!("S&F - History request failed: {err}");
        }
    }

    /// Ask a server (default: the primary) for its statistics
    pub fn request_stats(&mut self, server: Option<NodeId>) {
        let Some(server) = server.or(self.state.primary_server) else {
            warn!("S&F - No server specified and no primary server known");
            return;
        };
        if let Err(err) = self.messenger.request_stats(server) {
            warn!("S&F - Stats request failed: {err}");
        }
    }

    /// Ping a server (default: the primary)
    pub fn send_ping(&mut self, server: Option<NodeId>) {
        let Some(server) = server.or(self.state.primary_server) else {
            warn!("S&F - No server specified and no primary server known");
            return;
        };
        if let Err(err) = self.messenger.send_ping(server) {
            warn!("S&F - Ping failed: {err}");
        }
    }

    // ------------------------------------------------------------------
    // Shutdown & introspection
    // ------------------------------------------------------------------

    /// Orderly shutdown: flush the replay log
    pub fn shutdown(&mut self) {
        if let Err(err) = self.replay_log.save(self.storage.as_mut()) {
            warn!("S&F - Could not save replay log: {err}");
        }
    }

    pub fn state(&self) -> &ClientState {
        &self.state
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::HeartbeatPayload;
    use crate::storage::MemoryStorage;
    use crate::testing::{protocol_packet, ManualClock, MockTransport, MockTransportHandle};

    const LOCAL: NodeId = NodeId::new(0x42);
    const SERVER: NodeId = NodeId::new(0x99);

    fn client(clock: &ManualClock) -> (ClientRole, MockTransportHandle) {
        let transport = MockTransport::new(LOCAL);
        let handle = transport.handle();
        let role = ClientRole::new(
            StoreForwardConfig::default(),
            Messenger::new(Box::new(transport)),
            Box::new(clock.clone()),
            Box::new(MemoryStorage::new()),
        );
        (role, handle)
    }

    fn envelope_packet(id: u32, envelope: &StoreAndForward) -> MeshPacket {
        protocol_packet(SERVER, LOCAL, 1, id, envelope.encode())
    }

    #[test]
    fn test_heartbeat_registers_server() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, _handle) = client(&clock);

        let hb = StoreAndForward {
            rr: RequestResponse::RouterHeartbeat,
            variant: Variant::Heartbeat(HeartbeatPayload {
                period: 600,
                secondary: 0,
            }),
        };
        client.on_receive(&envelope_packet(1, &hb));

        assert_eq!(client.state().primary_server, Some(SERVER));
        assert!(client.state().server_available);
        assert_eq!(client.state().heartbeat_interval_s, 600);
    }

    #[test]
    fn test_server_marked_unavailable_after_silence() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, _handle) = client(&clock);

        client.on_receive(&envelope_packet(1, &StoreAndForward::heartbeat(60, 0)));
        assert!(client.state().server_available);

        // Just under two periods: still available.
        clock.advance(100_000);
        client.run_once();
        assert!(client.state().server_available);

        clock.advance(30_000);
        client.run_once();
        assert!(!client.state().server_available);
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, handle) = client(&clock);

        let ping = StoreAndForward::bare(RequestResponse::RouterPing);
        client.on_receive(&envelope_packet(1, &ping));

        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        let reply = StoreAndForward::decode(&sent[0].decoded().unwrap().payload).unwrap();
        assert_eq!(reply.rr, RequestResponse::ClientPong);
        assert_eq!(sent[0].to, SERVER);
    }

    #[test]
    fn test_replay_reinjection_and_dedup() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, handle) = client(&clock);

        let replay = StoreAndForward::text(
            RequestResponse::RouterTextBroadcast,
            b"missed message".to_vec(),
        );
        client.on_receive(&envelope_packet(7, &replay));

        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, NodeId::BROADCAST);
        assert_eq!(sent[0].from, SERVER);
        let decoded = sent[0].decoded().unwrap();
        assert_eq!(decoded.portnum, Some(PortNum::TextMessage));
        assert_eq!(decoded.payload, b"missed message");

        // The same replay packet again is dropped.
        client.on_receive(&envelope_packet(7, &replay));
        assert_eq!(handle.sent_count(), 1);
    }

    #[test]
    fn test_direct_replay_addressed_to_us() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, handle) = client(&clock);

        let replay = StoreAndForward::text(RequestResponse::RouterTextDirect, b"for you".to_vec());
        client.on_receive(&envelope_packet(9, &replay));

        assert_eq!(handle.sent()[0].to, LOCAL);
    }

    #[test]
    fn test_busy_schedules_retry_and_error_doubles_it() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, handle) = client(&clock);
        client.on_receive(&envelope_packet(1, &StoreAndForward::heartbeat(900, 0)));

        client.on_receive(&envelope_packet(
            2,
            &StoreAndForward::bare(RequestResponse::RouterBusy),
        ));
        assert_eq!(client.state().retry_at_ms, Some(1000 + RETRY_AFTER_BUSY_MS));

        client.on_receive(&envelope_packet(
            3,
            &StoreAndForward::bare(RequestResponse::RouterError),
        ));
        assert_eq!(
            client.state().retry_at_ms,
            Some(1000 + RETRY_AFTER_BUSY_MS * 2)
        );

        // Once due, the request is re-issued to the primary server.
        handle.clear_sent();
        clock.advance(RETRY_AFTER_BUSY_MS * 2 + 1);
        client.run_once();
        assert_eq!(client.state().retry_at_ms, None);
        let sent = handle.sent();
        assert_eq!(sent.len(), 1);
        let request = StoreAndForward::decode(&sent[0].decoded().unwrap().payload).unwrap();
        assert_eq!(request.rr, RequestResponse::ClientHistory);
    }

    #[test]
    fn test_stats_learned() {
        let clock = ManualClock::new(1000, 50_000);
        let (mut client, _handle) = client(&clock);

        let stats = StoreAndForward::stats(StatsPayload {
            messages_saved: 12,
            messages_max: 3000,
            ..StatsPayload::default()
        });
        client.on_receive(&envelope_packet(4, &stats));
        assert_eq!(client.state().last_stats.unwrap().messages_saved, 12);
    }

    #[test]
    fn test_replay_log_persists_across_restart() {
        let clock = ManualClock::new(1000, 50_000);
        let storage = MemoryStorage::new();

        let transport = MockTransport::new(LOCAL);
        let mut first = ClientRole::new(
            StoreForwardConfig::default(),
            Messenger::new(Box::new(transport)),
            Box::new(clock.clone()),
            Box::new(storage.clone()),
        );
        let replay = StoreAndForward::text(RequestResponse::RouterTextDirect, b"x".to_vec());
        first.on_receive(&envelope_packet(77, &replay));
        first.shutdown();

        let transport = MockTransport::new(LOCAL);
        let handle = transport.handle();
        let mut second = ClientRole::new(
            StoreForwardConfig::default(),
            Messenger::new(Box::new(transport)),
            Box::new(clock.clone()),
            Box::new(storage),
        );
        // Replay 77 is already known from the previous boot.
        second.on_receive(&envelope_packet(77, &replay));
        assert_eq!(handle.sent_count(), 0);
    }

    #[test]
    fn test_replay_log_pruning() {
        let mut log = ReplayLog::default();
        for id in 0..(REPLAY_LOG_MAX as u32 + 1) {
            log.insert(id);
        }
        assert!(log.ids.len() <= REPLAY_LOG_MAX / 2 + 1);
        assert!(log.ids.contains(&(REPLAY_LOG_MAX as u32)));
        assert!(!log.ids.contains(&0));
    }
}

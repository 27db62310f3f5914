//! Server role: record, replay, retry
//!
//! The server passively records storable mesh traffic into the history
//! ring, answers `SF` text commands and `CLIENT_*` protocol requests, and
//! drains replay sessions one acknowledged packet at a time under the
//! airtime governor. It is the single owner of the history, the cursor
//! map, and the persistence layer; every mutation flows through here.

use tracing::{debug, info, warn};

use crate::config::StoreForwardConfig;
use crate::errors::{ProtocolError, StoreForwardError};
use crate::history::{is_command_payload, History};
use crate::messenger::Messenger;
use crate::nodedb::{node_label, NodeDirectory};
use crate::packet::{DecodedPayload, MeshPacket, PayloadVariant, PortNum, Priority};
use crate::persistence::{Persistence, SAVE_EVERY_RECORDS};
use crate::proto::{RequestResponse, StatsPayload, StoreAndForward, Variant};
use crate::scheduler::{ACTIVE_TICK_MS, PACKET_TIME_MAX_MS, PROMPT_TICK_MS};
use crate::types::{ChannelId, Clock, NodeId};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// First ACK wait; doubles on every retry
pub const RETRY_TIMEOUT_INITIAL_MS: u64 = 5000;

/// Resend attempts before a session is abandoned
pub const MAX_RETRIES: u32 = 7;

/// Default heartbeat broadcast period
pub const HEARTBEAT_INTERVAL_S: u32 = 900;

/// Settling delay before a queued notification text goes out
const NOTICE_DELAY_MS: u64 = 500;

const STATUS_LOG_INTERVAL_MS: u64 = 60_000;

const TEXT_BUSY: &str = "S&F - Busy. Try again shortly.";
const TEXT_NO_MESSAGES: &str = "S&F - No messages available in your history window.";
const TEXT_PUBLIC_CHANNEL: &str = "S&F not permitted on the public channel.";
const TEXT_RESET_DONE: &str = "S&F - History reset successful. Use 'SF' to receive all messages.";
const TEXT_RESET_NONE: &str = "S&F - No history found to reset. Use 'SF' to begin receiving messages.";

// ----------------------------------------------------------------------------
// Server State
// ----------------------------------------------------------------------------

/// Notification queued behind the airtime/busy gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingNotice {
    pub kind: NoticeKind,
    pub target: NodeId,
    pub earliest_send_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    NoMessages,
    ResetDone,
    NothingToReset,
}

impl NoticeKind {
    fn text(self) -> &'static str {
        match self {
            NoticeKind::NoMessages => TEXT_NO_MESSAGES,
            NoticeKind::ResetDone => TEXT_RESET_DONE,
            NoticeKind::NothingToReset => TEXT_RESET_NONE,
        }
    }
}

/// Mutable replay/session state of the server
///
/// Invariants: `busy` implies `busy_to` is a real client;
/// `waiting_for_ack` implies `busy`.
#[derive(Debug)]
pub struct ServerState {
    pub busy: bool,
    pub busy_to: NodeId,
    /// Replay time floor of the active session (seconds since epoch)
    pub last_time: u32,
    /// Replays sent in the active session
    pub request_count: u32,
    pub last_send_time_ms: u64,
    pub waiting_for_ack: bool,
    /// Outbound packet ID the next ACK must match
    pub last_msg_id: u32,
    pub retry_count: u32,
    pub retry_timeout_ms: u64,
    pub last_heartbeat_ms: u64,
    pub pending: Option<PendingNotice>,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            busy: false,
            busy_to: NodeId::new(0),
            last_time: 0,
            request_count: 0,
            last_send_time_ms: 0,
            waiting_for_ack: false,
            last_msg_id: 0,
            retry_count: 0,
            retry_timeout_ms: RETRY_TIMEOUT_INITIAL_MS,
            last_heartbeat_ms: 0,
            pending: None,
        }
    }
}

// ----------------------------------------------------------------------------
// Server Role
// ----------------------------------------------------------------------------

/// The Store & Forward server engine
pub struct ServerRole {
    config: StoreForwardConfig,
    history: History,
    persist: Persistence,
    messenger: Messenger,
    clock: Box<dyn Clock>,
    nodes: Box<dyn NodeDirectory>,
    state: ServerState,

    heartbeat_interval_s: u32,
    started_at_ms: u64,
    /// Lifetime recorded messages (monotonic, unlike the ring count)
    messages_total: u32,
    /// Inbound protocol envelopes
    requests: u32,
    /// Inbound CLIENT_HISTORY requests
    requests_history: u32,
    /// Next ring index to consider for local phone delivery
    phone_cursor: u32,
    last_status_log_ms: u64,
}

impl ServerRole {
    pub fn new(
        config: StoreForwardConfig,
        history: History,
        persist: Persistence,
        messenger: Messenger,
        clock: Box<dyn Clock>,
        nodes: Box<dyn NodeDirectory>,
    ) -> Self {
        let started_at_ms = clock.now_ms();
        info!(
            "S&F - Server role starting: {} record slots, return max {}, window {} min",
            history.records_max(),
            config.history_return_max,
            config.history_return_window
        );
        Self {
            config,
            history,
            persist,
            messenger,
            clock,
            nodes,
            state: ServerState::default(),
            heartbeat_interval_s: HEARTBEAT_INTERVAL_S,
            started_at_ms,
            messages_total: 0,
            requests: 0,
            requests_history: 0,
            phone_cursor: 0,
            last_status_log_ms: 0,
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Inspect one received packet
    pub fn on_receive(&mut self, packet: &MeshPacket) {
        if self.try_handle_ack(packet) {
            return;
        }

        if let Some(text) = packet.text_payload() {
            if packet.to == self.messenger.local_node()
                && is_command_payload(text)
                && self.handle_text_command(packet, text)
            {
                return;
            }
        }

        if let Some(decoded) = packet.decoded() {
            if decoded.portnum == Some(PortNum::StoreForward) {
                match StoreAndForward::decode(&decoded.payload) {
                    Ok(envelope) => self.handle_protocol(packet, &envelope),
                    Err(err) => debug!("S&F - Dropping undecodable envelope: {err}"),
                }
                return;
            }
        }

        if self.history.should_store(packet) {
            self.record_packet(packet);
        }
    }

    fn try_handle_ack(&mut self, packet: &MeshPacket) -> bool {
        if !self.state.waiting_for_ack || packet.from != self.state.busy_to {
            return false;
        }
        // Out-of-order ACKs for earlier attempts fail this match and are
        // ignored.
        if !packet.acknowledges(self.state.last_msg_id) {
            return false;
        }

        debug!(
            "S&F - ACK received from {} for 0x{:08x}",
            packet.from, self.state.last_msg_id
        );
        self.state.waiting_for_ack = false;
        self.state.retry_count = 0;
        self.state.retry_timeout_ms = RETRY_TIMEOUT_INITIAL_MS;
        true
    }

    /// Returns true when the payload was a recognized command
    fn handle_text_command(&mut self, packet: &MeshPacket, text: &[u8]) -> bool {
        let client = packet.from;

        if text.starts_with(b"SF reset") {
            info!(
                "S&F - 'SF reset' from {} ({})",
                node_label(self.nodes.as_ref(), client),
                client
            );
            self.handle_reset(client);
            true
        } else if text.starts_with(b"SF stats") {
            if self.state.busy {
                self.send_text_now(client, TEXT_BUSY);
            } else {
                self.send_stats(client);
            }
            true
        } else if text.len() == 2 || text[2] == 0 {
            // Bare "SF": history request with the configured window.
            info!(
                "S&F - 'SF' from {} ({}) on {}",
                node_label(self.nodes.as_ref(), client),
                client,
                packet.channel
            );
            let window_s = self.config.history_return_window.saturating_mul(60);
            self.handle_history_request(client, window_s, packet.channel, false);
            true
        } else {
            // "SF <something else>": consumed as a command word, but there
            // is nothing to do.
            false
        }
    }

    fn handle_protocol(&mut self, packet: &MeshPacket, envelope: &StoreAndForward) {
        self.requests += 1;
        let from = packet.from;

        match envelope.rr {
            RequestResponse::ClientError | RequestResponse::ClientAbort => {
                if self.state.busy && self.state.busy_to == from {
                    warn!("S&F - Client {} aborted, ending session", from);
                    self.end_session();
                }
            }

            RequestResponse::ClientHistory => {
                self.requests_history += 1;
                let window_s = match envelope.variant {
                    Variant::History(h) if h.window > 0 => h.window.saturating_mul(60),
                    _ => self.config.history_return_window.saturating_mul(60),
                };
                self.handle_history_request(from, window_s, packet.channel, true);
            }

            RequestResponse::ClientStats => {
                if self.state.busy {
                    self.send_control(from, RequestResponse::RouterBusy);
                } else {
                    self.send_stats(from);
                }
            }

            RequestResponse::ClientPing => {
                self.send_control(from, RequestResponse::RouterPong);
            }

            RequestResponse::ClientPong => {
                debug!("S&F - CLIENT_PONG from {}", from);
            }

            other => {
                debug!("S&F - Unhandled request/response kind {other:?} from {from}");
            }
        }
    }

    // ------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------

    fn record_packet(&mut self, packet: &MeshPacket) {
        let time = self.clock.unix_time();
        let outcome = self.history.record(packet, time);
        self.messages_total = self.messages_total.wrapping_add(1);

        if outcome.wrapped {
            self.phone_cursor = 0;
        }

        debug!(
            "S&F - Recorded message from {} at index {} ({} stored)",
            packet.from,
            outcome.index,
            self.history.count()
        );

        // Wraps rewrite every cursor, so they count as cursor mutations.
        if outcome.wrapped || self.history.count() % SAVE_EVERY_RECORDS == 0 {
            self.save_state();
        }
    }

    // ------------------------------------------------------------------
    // History requests
    // ------------------------------------------------------------------

    fn handle_history_request(
        &mut self,
        client: NodeId,
        window_s: u32,
        channel: ChannelId,
        via_protocol: bool,
    ) {
        if self.state.busy {
            info!("S&F - Busy with {}, refusing {}", self.state.busy_to, client);
            if via_protocol {
                self.send_control(client, RequestResponse::RouterBusy);
            } else {
                self.send_text_now(client, TEXT_BUSY);
            }
            return;
        }

        if self.messenger.is_default_channel(channel) {
            warn!("S&F - History request on public channel from {}", client);
            self.send_text_now(client, TEXT_PUBLIC_CHANNEL);
            return;
        }

        self.start_session(client, window_s);
    }

    fn start_session(&mut self, client: NodeId, window_s: u32) {
        let now_unix = self.clock.unix_time();
        // Unix time 0 means no synchronized clock; the floor is then
        // already satisfied for every record.
        let floor = if now_unix < window_s {
            0
        } else {
            now_unix - window_s
        };

        if self.history.ensure_cursor(client) {
            debug!("S&F - New cursor entry for {}", client);
            self.save_state();
        }

        let available = self.history.num_available(client, floor);
        if available == 0 {
            info!("S&F - No messages for {}, queueing notification", client);
            self.queue_notice(NoticeKind::NoMessages, client);
            return;
        }

        let announce = available.min(self.config.history_return_max);
        info!(
            "S&F - Sending {} of {} available messages to {} ({})",
            announce,
            available,
            node_label(self.nodes.as_ref(), client),
            client
        );

        if let Err(err) = self.messenger.send_history_response(
            client,
            announce,
            window_s.saturating_mul(1000),
            self.history.cursor(client),
        ) {
            warn!("S&F - Could not announce history session: {err}");
            return;
        }

        self.state.busy = true;
        self.state.busy_to = client;
        self.state.last_time = floor;
        self.state.request_count = 0;
    }

    fn handle_reset(&mut self, client: NodeId) {
        if self.history.reset_cursor(client) {
            self.save_state();
            self.queue_notice(NoticeKind::ResetDone, client);
        } else {
            self.queue_notice(NoticeKind::NothingToReset, client);
        }
    }

    fn queue_notice(&mut self, kind: NoticeKind, target: NodeId) {
        self.state.pending = Some(PendingNotice {
            kind,
            target,
            earliest_send_ms: self.clock.now_ms() + NOTICE_DELAY_MS,
        });
    }

    // ------------------------------------------------------------------
    // Drive loop
    // ------------------------------------------------------------------

    /// One cooperative tick; returns the delay until the next one
    pub fn run_once(&mut self) -> u64 {
        let now = self.clock.now_ms();

        self.log_status_periodically(now);
        self.handle_retries(now);
        self.try_drain(now);
        self.send_heartbeat_if_due(now);
        self.try_send_pending(now);

        if self.state.pending.is_some() {
            PROMPT_TICK_MS
        } else if self.state.busy {
            PACKET_TIME_MAX_MS
        } else {
            ACTIVE_TICK_MS
        }
    }

    fn log_status_periodically(&mut self, now: u64) {
        if now.saturating_sub(self.last_status_log_ms) < STATUS_LOG_INTERVAL_MS {
            return;
        }
        self.last_status_log_ms = now;
        info!(
            "S&F Status - Busy: {}, WaitingForAck: {}, RetryCount: {}, Stored: {}/{}, Util: {:.2}%",
            self.state.busy,
            self.state.waiting_for_ack,
            self.state.retry_count,
            self.history.count(),
            self.history.records_max(),
            self.messenger.channel_utilization_percent()
        );
    }

    fn handle_retries(&mut self, now: u64) {
        if !self.state.waiting_for_ack
            || now.saturating_sub(self.state.last_send_time_ms) < self.state.retry_timeout_ms
        {
            return;
        }

        let client = self.state.busy_to;
        if self.state.retry_count >= MAX_RETRIES {
            warn!(
                "S&F - Max retries reached for {} ({}). Giving up.",
                node_label(self.nodes.as_ref(), client),
                client
            );
            self.abandon_session();
            return;
        }

        // The unacknowledged record sits just behind the cursor.
        let cursor = self.history.cursor(client);
        let record = cursor
            .checked_sub(1)
            .and_then(|i| self.history.records().get(i as usize))
            .cloned();
        let Some(record) = record else {
            // The ring wrapped underneath the session; nothing to resend.
            warn!("S&F - In-flight record vanished, ending session with {client}");
            self.end_session();
            return;
        };

        info!(
            "S&F - Retrying message to {} ({}), attempt {} of {}",
            node_label(self.nodes.as_ref(), client),
            client,
            self.state.retry_count + 1,
            MAX_RETRIES
        );

        match self.messenger.send_replay(client, &record, true) {
            Ok(id) => {
                self.state.last_msg_id = id;
                self.state.retry_count += 1;
                self.state.last_send_time_ms = now;
                self.state.retry_timeout_ms *= 2;
                debug!("S&F - Next retry in {} ms", self.state.retry_timeout_ms);
            }
            Err(err) => {
                // Allocation failures abandon this tick; the next one
                // tries again with the same attempt counter.
                warn!("S&F - Retry send failed: {err}");
            }
        }
    }

    fn try_drain(&mut self, now: u64) {
        if !self.state.busy || self.state.waiting_for_ack {
            return;
        }

        if self.state.request_count >= self.config.history_return_max {
            info!(
                "S&F - Session cap reached for {}, returning to idle",
                self.state.busy_to
            );
            self.end_session();
            return;
        }

        if !self.messenger.is_tx_allowed() {
            warn!(
                "S&F - Cannot transmit: channel utilization {:.2}%",
                self.messenger.channel_utilization_percent()
            );
            return;
        }

        let client = self.state.busy_to;
        let next = self
            .history
            .messages_for(client, self.state.last_time)
            .next()
            .map(|(i, r)| (i, r.clone()));

        let Some((index, record)) = next else {
            info!("S&F - Finished transmission to {}", client);
            self.end_session();
            return;
        };

        match self.messenger.send_replay(client, &record, false) {
            Ok(id) => {
                self.state.last_msg_id = id;
                self.state.waiting_for_ack = true;
                self.state.retry_count = 0;
                self.state.retry_timeout_ms = RETRY_TIMEOUT_INITIAL_MS;
                self.state.last_send_time_ms = now;
                self.state.request_count += 1;

                self.history.update_cursor(client, index + 1);
                self.save_state();
            }
            Err(StoreForwardError::Protocol(ProtocolError::EncodeTooLarge { size, max })) => {
                // An undeliverable record would wedge the session; end it
                // without advancing past the record.
                warn!("S&F - Replay encode overrun ({size} > {max}), ending session");
                self.end_session();
            }
            Err(err) => {
                warn!("S&F - Replay send failed: {err}");
            }
        }
    }

    fn send_heartbeat_if_due(&mut self, now: u64) {
        if !self.config.heartbeat {
            return;
        }
        let interval_ms = self.heartbeat_interval_s as u64 * 1000;
        if now.saturating_sub(self.state.last_heartbeat_ms) < interval_ms
            && self.state.last_heartbeat_ms != 0
        {
            return;
        }
        if !self.messenger.is_tx_allowed() {
            return;
        }

        info!("S&F - Sending heartbeat");
        match self.messenger.send_heartbeat(self.heartbeat_interval_s) {
            // last_heartbeat_ms == 0 means "never sent"; now can be 0 at boot.
            Ok(_) => self.state.last_heartbeat_ms = now.max(1),
            Err(err) => warn!("S&F - Heartbeat send failed: {err}"),
        }
    }

    fn try_send_pending(&mut self, now: u64) {
        let Some(notice) = self.state.pending else {
            return;
        };
        if self.state.busy
            || self.state.waiting_for_ack
            || !self.messenger.is_tx_allowed()
            || now < notice.earliest_send_ms
        {
            return;
        }

        info!(
            "S&F - Sending notification to {}: {}",
            notice.target,
            notice.kind.text()
        );
        match self
            .messenger
            .send_text(notice.target, notice.kind.text(), Priority::Reliable, true)
        {
            Ok(_) => self.state.pending = None,
            Err(err) => warn!("S&F - Notification send failed, will retry: {err}"),
        }
    }

    // ------------------------------------------------------------------
    // Session teardown
    // ------------------------------------------------------------------

    fn end_session(&mut self) {
        self.state.busy = false;
        self.state.waiting_for_ack = false;
        self.state.request_count = 0;
        self.state.retry_count = 0;
        self.state.retry_timeout_ms = RETRY_TIMEOUT_INITIAL_MS;
    }

    /// Give up on an unacknowledged replay: the cursor advance for the
    /// in-flight record is rolled back so it is re-deliverable later
    fn abandon_session(&mut self) {
        let client = self.state.busy_to;
        let cursor = self.history.cursor(client);
        if cursor > 0 {
            self.history.update_cursor(client, cursor - 1);
            self.save_state();
        }
        self.end_session();
    }

    // ------------------------------------------------------------------
    // Outbound helpers
    // ------------------------------------------------------------------

    fn send_text_now(&mut self, to: NodeId, text: &str) {
        if let Err(err) = self.messenger.send_text(to, text, Priority::Background, false) {
            warn!("S&F - Text send to {} failed: {err}", to);
        }
    }

    fn send_control(&mut self, to: NodeId, rr: RequestResponse) {
        if let Err(err) = self.messenger.send_control(to, rr) {
            warn!("S&F - Control send to {} failed: {err}", to);
        }
    }

    fn send_stats(&mut self, to: NodeId) {
        let stats = StatsPayload {
            messages_total: self.messages_total,
            messages_saved: self.history.count(),
            messages_max: self.history.records_max(),
            up_time: ((self.clock.now_ms() - self.started_at_ms) / 1000) as u32,
            requests: self.requests,
            requests_history: self.requests_history,
            heartbeat: self.config.heartbeat,
            return_max: self.config.history_return_max,
            return_window: self.config.history_return_window,
        };
        if let Err(err) = self.messenger.send_stats(to, stats) {
            warn!("S&F - Stats send to {} failed: {err}", to);
        }
    }

    // ------------------------------------------------------------------
    // Local delivery
    // ------------------------------------------------------------------

    /// Next stored packet deliverable to the host UI, one per call
    ///
    /// Walks the ring once with its own cursor, independent of client
    /// replay cursors; the cursor resets with the ring.
    pub fn for_phone(&mut self) -> Option<MeshPacket> {
        let local = self.messenger.local_node();

        while (self.phone_cursor as usize) < self.history.records().len() {
            let index = self.phone_cursor as usize;
            self.phone_cursor += 1;

            let record = &self.history.records()[index];
            if record.to != local && record.to != NodeId::BROADCAST {
                continue;
            }

            return Some(MeshPacket {
                from: record.from,
                to: local,
                id: record.id,
                channel: ChannelId::new(record.channel),
                rx_time: record.time,
                priority: Priority::default(),
                want_ack: false,
                payload: PayloadVariant::Decoded(DecodedPayload {
                    portnum: Some(PortNum::TextMessage),
                    payload: record.payload.clone(),
                    reply_id: record.reply_id,
                    emoji: record.emoji,
                    ..DecodedPayload::default()
                }),
            });
        }

        None
    }

    // ------------------------------------------------------------------
    // Persistence & shutdown
    // ------------------------------------------------------------------

    fn save_state(&mut self) {
        if let Err(err) = self.persist.save(&self.history) {
            // State stays in memory; the next trigger retries.
            warn!("S&F - Persistence failed: {err}");
        }
    }

    /// Orderly shutdown: flush state to storage
    pub fn shutdown(&mut self) {
        info!("S&F - Server shutting down, saving history");
        self.save_state();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn config(&self) -> &StoreForwardConfig {
        &self.config
    }
}

//! End-to-end replay scenarios against the server role
//!
//! Drives a server through the mock transport/clock/storage seams and
//! asserts on the exact packets it emits.

use storefwd_core::config::StoreForwardConfig;
use storefwd_core::history::History;
use storefwd_core::messenger::Messenger;
use storefwd_core::nodedb::EmptyDirectory;
use storefwd_core::persistence::{Persistence, CURSOR_FILE};
use storefwd_core::proto::{RequestResponse, StoreAndForward, Variant};
use storefwd_core::roles::ServerRole;
use storefwd_core::storage::{MemoryStorage, MemoryStorageHandle};
use storefwd_core::testing::{ack_packet, protocol_packet, text_packet, ManualClock, MockTransport, MockTransportHandle};
use storefwd_core::types::NodeId;
use storefwd_core::{MeshPacket, PortNum, Priority};

const SERVER: NodeId = NodeId::new(0x10);
const NODE_A: NodeId = NodeId::new(0xA);
const NODE_B: NodeId = NodeId::new(0xB);
const CLIENT_C: NodeId = NodeId::new(0xC);
const CLIENT_D: NodeId = NodeId::new(0xD);

struct Harness {
    server: ServerRole,
    transport: MockTransportHandle,
    clock: ManualClock,
    storage: MemoryStorageHandle,
    next_rx_id: u32,
}

impl Harness {
    /// records_max = 4, return_max = 3, return_window = 60 min, now = 10000
    fn new() -> Self {
        let clock = ManualClock::new(100_000, 10_000);
        let transport = MockTransport::new(SERVER);
        let transport_handle = transport.handle();
        let storage = MemoryStorage::new();
        let storage_handle = storage.handle();

        let config = StoreForwardConfig::testing();
        let history = History::new(config.records);
        let server = ServerRole::new(
            config,
            history,
            Persistence::new(Box::new(storage)),
            Messenger::new(Box::new(transport)),
            Box::new(clock.clone()),
            Box::new(EmptyDirectory),
        );

        Self {
            server,
            transport: transport_handle,
            clock,
            storage: storage_handle,
            next_rx_id: 500,
        }
    }

    fn rx_id(&mut self) -> u32 {
        self.next_rx_id += 1;
        self.next_rx_id
    }

    /// Ingest a text message heard on the mesh at wall time `time`
    fn hear_text(&mut self, from: NodeId, to: NodeId, time: u32, text: &str) {
        self.clock.set_unix(time);
        let id = self.rx_id();
        self.server.on_receive(&text_packet(from, to, 1, id, text));
        self.clock.set_unix(10_000);
    }

    /// Client sends the bare `SF` command on a private channel
    fn send_sf(&mut self, from: NodeId) {
        let id = self.rx_id();
        self.server.on_receive(&text_packet(from, SERVER, 1, id, "SF"));
    }

    fn ack(&mut self, from: NodeId, acked_id: u32) {
        let id = self.rx_id();
        self.server.on_receive(&ack_packet(from, SERVER, id, acked_id));
    }

    fn decode(&self, packet: &MeshPacket) -> StoreAndForward {
        StoreAndForward::decode(&packet.decoded().unwrap().payload).unwrap()
    }

    /// Drive run_once and return packets sent since the last call
    fn tick(&mut self) -> Vec<MeshPacket> {
        let before = self.transport.sent_count();
        self.server.run_once();
        self.transport.sent()[before..].to_vec()
    }
}

// ----------------------------------------------------------------------------
// Scenario 1: basic replay
// ----------------------------------------------------------------------------

#[test]
fn basic_replay_session() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.hear_text(NODE_B, CLIENT_C, 9500, "you");
    h.transport.clear_sent();

    h.send_sf(CLIENT_C);

    // The announce goes out synchronously with the command.
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    let announce = h.decode(&sent[0]);
    assert_eq!(announce.rr, RequestResponse::RouterHistory);
    assert_eq!(
        announce.variant,
        Variant::History(storefwd_core::proto::HistoryPayload {
            history_messages: 2,
            window: 3_600_000,
            last_request: 0,
        })
    );
    assert!(sent[0].want_ack);
    assert!(h.server.state().busy);

    // First drain tick replays R1 (broadcast), with want_ack.
    let replays = h.tick();
    assert_eq!(replays.len(), 1);
    let r1 = h.decode(&replays[0]);
    assert_eq!(r1.rr, RequestResponse::RouterTextBroadcast);
    assert_eq!(r1.variant, Variant::Text(b"hi".to_vec()));
    assert!(replays[0].want_ack);
    assert_eq!(replays[0].to, CLIENT_C);
    assert!(h.server.state().waiting_for_ack);

    h.ack(CLIENT_C, replays[0].id);
    assert!(!h.server.state().waiting_for_ack);

    // Second drain tick replays R2 (direct).
    let replays = h.tick();
    assert_eq!(replays.len(), 1);
    let r2 = h.decode(&replays[0]);
    assert_eq!(r2.rr, RequestResponse::RouterTextDirect);
    assert_eq!(r2.variant, Variant::Text(b"you".to_vec()));
    h.ack(CLIENT_C, replays[0].id);

    // Session drains dry and the server returns to idle.
    assert!(h.tick().is_empty());
    assert!(!h.server.state().busy);
    assert_eq!(h.server.history().cursor(CLIENT_C), 2);
}

// ----------------------------------------------------------------------------
// Scenario 2: self-filtering
// ----------------------------------------------------------------------------

#[test]
fn own_messages_are_never_replayed() {
    let mut h = Harness::new();
    h.hear_text(CLIENT_C, NodeId::BROADCAST, 8000, "me");
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.hear_text(NODE_B, CLIENT_C, 9500, "you");
    h.transport.clear_sent();

    h.send_sf(CLIENT_C);
    let announce = h.decode(&h.transport.sent()[0]);
    assert_eq!(
        announce.variant,
        Variant::History(storefwd_core::proto::HistoryPayload {
            history_messages: 2,
            window: 3_600_000,
            last_request: 0,
        })
    );

    let first = h.tick();
    assert_eq!(h.decode(&first[0]).variant, Variant::Text(b"hi".to_vec()));
    h.ack(CLIENT_C, first[0].id);

    let second = h.tick();
    assert_eq!(h.decode(&second[0]).variant, Variant::Text(b"you".to_vec()));
    h.ack(CLIENT_C, second[0].id);

    h.tick();
    // Cursor lands past the last delivered index, skipping R0.
    assert_eq!(h.server.history().cursor(CLIENT_C), 3);
    assert!(!h.server.state().busy);
}

// ----------------------------------------------------------------------------
// Scenario 3: ring wrap
// ----------------------------------------------------------------------------

#[test]
fn ring_wrap_resets_all_cursors() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.hear_text(NODE_B, CLIENT_C, 9500, "you");

    // Replay both to advance cursor(C) to 2.
    h.send_sf(CLIENT_C);
    for _ in 0..2 {
        let replays = h.tick();
        h.ack(CLIENT_C, replays[0].id);
    }
    h.tick();
    assert_eq!(h.server.history().cursor(CLIENT_C), 2);

    // Fill to capacity 4, then one more wraps.
    h.hear_text(NODE_A, NodeId::BROADCAST, 9600, "third");
    h.hear_text(NODE_A, NodeId::BROADCAST, 9700, "fourth");
    assert_eq!(h.server.history().count(), 4);

    h.hear_text(NODE_B, NodeId::BROADCAST, 9800, "fifth");
    assert_eq!(h.server.history().count(), 1);
    assert_eq!(h.server.history().cursor(CLIENT_C), 0);

    // A fresh SF sees whatever survived the wrap.
    h.transport.clear_sent();
    h.send_sf(CLIENT_C);
    let announce = h.decode(&h.transport.sent()[0]);
    assert_eq!(
        announce.variant,
        Variant::History(storefwd_core::proto::HistoryPayload {
            history_messages: 1,
            window: 3_600_000,
            last_request: 0,
        })
    );
}

// ----------------------------------------------------------------------------
// Scenario 4: reset command
// ----------------------------------------------------------------------------

#[test]
fn reset_command_zeroes_cursor_and_confirms() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");

    h.send_sf(CLIENT_C);
    let replays = h.tick();
    h.ack(CLIENT_C, replays[0].id);
    h.tick();
    assert_eq!(h.server.history().cursor(CLIENT_C), 1);

    h.transport.clear_sent();
    let id = h.rx_id();
    h.server
        .on_receive(&text_packet(CLIENT_C, SERVER, 1, id, "SF reset"));
    assert_eq!(h.server.history().cursor(CLIENT_C), 0);

    // The persisted cursor file reflects the reset immediately.
    let cursors = h.storage.contents(CURSOR_FILE).unwrap();
    assert_eq!(u32::from_le_bytes(cursors[0..4].try_into().unwrap()), 1);
    assert_eq!(
        u32::from_le_bytes(cursors[4..8].try_into().unwrap()),
        CLIENT_C.raw()
    );
    assert_eq!(u32::from_le_bytes(cursors[8..12].try_into().unwrap()), 0);

    // Confirmation text goes out after the settling delay.
    assert!(h.tick().is_empty());
    h.clock.advance(600);
    let sent = h.tick();
    assert_eq!(sent.len(), 1);
    let decoded = sent[0].decoded().unwrap();
    assert_eq!(decoded.portnum, Some(PortNum::TextMessage));
    assert_eq!(
        decoded.payload,
        b"S&F - History reset successful. Use 'SF' to receive all messages."
    );
    assert_eq!(sent[0].priority, Priority::Reliable);
    assert!(sent[0].want_ack);
}

#[test]
fn reset_without_history_sends_distinct_notice() {
    let mut h = Harness::new();
    let id = h.rx_id();
    h.server
        .on_receive(&text_packet(CLIENT_C, SERVER, 1, id, "SF reset"));

    h.clock.advance(600);
    let sent = h.tick();
    assert_eq!(
        sent[0].decoded().unwrap().payload,
        b"S&F - No history found to reset. Use 'SF' to begin receiving messages."
    );
}

// ----------------------------------------------------------------------------
// Scenario 5: busy rejection
// ----------------------------------------------------------------------------

#[test]
fn second_client_is_rejected_while_draining() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.hear_text(NODE_A, CLIENT_C, 9100, "more");

    h.send_sf(CLIENT_C);
    h.tick();
    assert!(h.server.state().busy);
    h.transport.clear_sent();

    h.send_sf(CLIENT_D);
    let sent = h.transport.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].to, CLIENT_D);
    assert_eq!(
        sent[0].decoded().unwrap().payload,
        b"S&F - Busy. Try again shortly."
    );

    // The active session is untouched and D gained no cursor entry.
    assert_eq!(h.server.state().busy_to, CLIENT_C);
    assert_eq!(h.server.history().cursor(CLIENT_D), 0);
    assert_eq!(h.server.history().client_count(), 1);
}

// ----------------------------------------------------------------------------
// Scenario 6: retry and abandon
// ----------------------------------------------------------------------------

#[test]
fn unacked_replay_retries_with_backoff_then_abandons() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.transport.clear_sent();

    h.send_sf(CLIENT_C);
    let first = h.tick();
    assert_eq!(first.len(), 1);
    let original_record_id = {
        // The stored record keeps the mesh packet ID it was heard with.
        h.server.history().records()[0].id
    };
    let mut last_replay_id = first[0].id;

    // Seven retries, each after a doubled timeout, each with a fresh
    // packet ID and request_id naming the original record.
    let mut timeout = 5000u64;
    for attempt in 1..=7 {
        h.clock.advance(timeout);
        let resent = h.tick();
        assert_eq!(resent.len(), 1, "retry {attempt} did not go out");
        assert_ne!(resent[0].id, last_replay_id);
        assert_eq!(resent[0].priority, Priority::Reliable);
        assert_eq!(resent[0].decoded().unwrap().request_id, original_record_id);
        assert!(h.server.state().waiting_for_ack);

        last_replay_id = resent[0].id;
        timeout *= 2;
    }

    // The eighth timeout gives up: idle, cursor back at its pre-session
    // value.
    h.clock.advance(timeout);
    let sent = h.tick();
    assert!(sent.is_empty());
    assert!(!h.server.state().busy);
    assert!(!h.server.state().waiting_for_ack);
    assert_eq!(h.server.history().cursor(CLIENT_C), 0);
}

// ----------------------------------------------------------------------------
// Boundaries and invariants
// ----------------------------------------------------------------------------

#[test]
fn session_cap_stops_at_return_max() {
    let mut h = Harness::new();
    // Four qualifying records against a session cap of three.
    for (i, t) in [9000u32, 9100, 9200, 9300].iter().enumerate() {
        h.hear_text(NODE_A, NodeId::BROADCAST, *t, &format!("msg {i}"));
    }

    h.send_sf(CLIENT_C);
    for _ in 0..3 {
        let replays = h.tick();
        assert_eq!(replays.len(), 1);
        h.ack(CLIENT_C, replays[0].id);
    }
    assert_eq!(h.server.state().request_count, 3);

    // request_count == return_max exactly: the next tick goes idle
    // without sending.
    assert!(h.tick().is_empty());
    assert!(!h.server.state().busy);
    assert_eq!(h.server.history().cursor(CLIENT_C), 3);
}

#[test]
fn airtime_gate_pauses_drain_without_losing_the_session() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");

    h.send_sf(CLIENT_C);
    h.transport.set_tx_allowed(false);
    assert!(h.tick().is_empty());
    assert!(h.server.state().busy);
    assert_eq!(h.server.history().cursor(CLIENT_C), 0);

    h.transport.set_tx_allowed(true);
    let replays = h.tick();
    assert_eq!(replays.len(), 1);
    assert_eq!(h.server.history().cursor(CLIENT_C), 1);
}

#[test]
fn waiting_for_ack_implies_busy() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.send_sf(CLIENT_C);

    let check = |h: &Harness| {
        let state = h.server.state();
        assert!(!state.waiting_for_ack || state.busy);
    };

    check(&h);
    let replays = h.tick();
    check(&h);
    h.ack(CLIENT_C, replays[0].id);
    check(&h);
    h.tick();
    check(&h);
}

#[test]
fn no_messages_in_window_sends_notification() {
    let mut h = Harness::new();
    // Only a stale record far outside the 60-minute window.
    h.hear_text(NODE_A, NodeId::BROADCAST, 100, "ancient");
    h.transport.clear_sent();

    h.send_sf(CLIENT_C);
    assert!(h.transport.sent().is_empty());
    assert!(!h.server.state().busy);

    h.clock.advance(600);
    let sent = h.tick();
    assert_eq!(
        sent[0].decoded().unwrap().payload,
        b"S&F - No messages available in your history window."
    );
}

#[test]
fn public_channel_request_is_refused() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.transport.clear_sent();

    // Channel 0 is the default channel on the mock transport.
    let id = h.rx_id();
    h.server.on_receive(&text_packet(CLIENT_C, SERVER, 0, id, "SF"));

    let sent = h.transport.sent();
    assert_eq!(
        sent[0].decoded().unwrap().payload,
        b"S&F not permitted on the public channel."
    );
    assert!(!h.server.state().busy);
}

// ----------------------------------------------------------------------------
// Protocol requests
// ----------------------------------------------------------------------------

#[test]
fn client_history_envelope_starts_session_with_requested_window() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.transport.clear_sent();

    // CLIENT_HISTORY carries the window in minutes.
    let request = StoreAndForward::history(
        RequestResponse::ClientHistory,
        storefwd_core::proto::HistoryPayload {
            window: 30,
            ..Default::default()
        },
    );
    let id = h.rx_id();
    h.server
        .on_receive(&protocol_packet(CLIENT_C, SERVER, 1, id, request.encode()));

    let announce = h.decode(&h.transport.sent()[0]);
    match announce.variant {
        Variant::History(payload) => {
            assert_eq!(payload.window, 30 * 60 * 1000);
            assert_eq!(payload.history_messages, 1);
        }
        other => panic!("expected history payload, got {other:?}"),
    }
}

#[test]
fn client_abort_ends_the_session() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.hear_text(NODE_A, CLIENT_C, 9100, "more");

    h.send_sf(CLIENT_C);
    h.tick();
    assert!(h.server.state().busy);

    let abort = StoreAndForward::bare(RequestResponse::ClientAbort);
    let id = h.rx_id();
    h.server
        .on_receive(&protocol_packet(CLIENT_C, SERVER, 1, id, abort.encode()));
    assert!(!h.server.state().busy);
    assert!(!h.server.state().waiting_for_ack);
}

#[test]
fn stats_request_reports_counters() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hi");
    h.clock.advance(30_000);
    h.transport.clear_sent();

    let request = StoreAndForward::bare(RequestResponse::ClientStats);
    let id = h.rx_id();
    h.server
        .on_receive(&protocol_packet(CLIENT_C, SERVER, 1, id, request.encode()));

    let reply = h.decode(&h.transport.sent()[0]);
    assert_eq!(reply.rr, RequestResponse::RouterStats);
    match reply.variant {
        Variant::Stats(stats) => {
            assert_eq!(stats.messages_total, 1);
            assert_eq!(stats.messages_saved, 1);
            assert_eq!(stats.messages_max, 4);
            assert_eq!(stats.up_time, 30);
            assert_eq!(stats.requests, 1);
            assert_eq!(stats.requests_history, 0);
            assert_eq!(stats.return_max, 3);
            assert_eq!(stats.return_window, 60);
        }
        other => panic!("expected stats payload, got {other:?}"),
    }
}

#[test]
fn ping_gets_pong() {
    let mut h = Harness::new();
    h.transport.clear_sent();

    let ping = StoreAndForward::bare(RequestResponse::ClientPing);
    let id = h.rx_id();
    h.server
        .on_receive(&protocol_packet(CLIENT_C, SERVER, 1, id, ping.encode()));

    let reply = h.decode(&h.transport.sent()[0]);
    assert_eq!(reply.rr, RequestResponse::RouterPong);
}

// ----------------------------------------------------------------------------
// Local delivery
// ----------------------------------------------------------------------------

#[test]
fn for_phone_yields_local_and_broadcast_records_once() {
    let mut h = Harness::new();
    h.hear_text(NODE_A, NodeId::BROADCAST, 9000, "hello everyone");
    h.hear_text(NODE_A, CLIENT_C, 9100, "not for the host");
    h.hear_text(NODE_B, SERVER, 9200, "direct to host");

    let first = h.server.for_phone().unwrap();
    assert_eq!(first.to, SERVER);
    assert_eq!(first.from, NODE_A);
    assert_eq!(first.decoded().unwrap().payload, b"hello everyone");

    let second = h.server.for_phone().unwrap();
    assert_eq!(second.decoded().unwrap().payload, b"direct to host");

    // One pass only; the phone cursor does not rewind on its own.
    assert!(h.server.for_phone().is_none());
}

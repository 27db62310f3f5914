//! Terminal harness for the Store & Forward engine
//!
//! Runs one node against a loopback transport that prints every outbound
//! packet, with real filesystem persistence under `--data-dir`. Mesh
//! traffic is injected by typing commands, which makes the replay flow
//! observable end to end:
//!
//! ```text
//! > text a1 bcast hello everyone
//! > sf c2
//! > tick
//! ```

use std::io::{self, BufRead, Write as _};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use storefwd_core::config::StoreForwardConfig;
use storefwd_core::errors::TransportError;
use storefwd_core::nodedb::EmptyDirectory;
use storefwd_core::proto::{RequestResponse, StoreAndForward, Variant};
use storefwd_core::roles::build_role;
use storefwd_core::scheduler::Scheduler;
use storefwd_core::storage::FsStorage;
use storefwd_core::testing::text_packet;
use storefwd_core::transport::Transport;
use storefwd_core::types::{ChannelId, NodeId, SystemClock};
use storefwd_core::{MeshPacket, PayloadVariant, PortNum, Priority};

// ----------------------------------------------------------------------------
// Arguments
// ----------------------------------------------------------------------------

#[derive(Debug, Parser)]
#[command(name = "storefwd", about = "Store & Forward node harness")]
struct Args {
    /// Directory for persisted history
    #[arg(long, default_value = "storefwd-data")]
    data_dir: String,

    /// This node's ID (hex)
    #[arg(long, default_value = "10")]
    node_id: String,

    /// Run as a client instead of a server
    #[arg(long)]
    client: bool,

    /// Ring capacity (0 = auto)
    #[arg(long, default_value_t = 64)]
    records: u32,

    /// Broadcast the periodic heartbeat
    #[arg(long)]
    heartbeat: bool,
}

// ----------------------------------------------------------------------------
// Loopback Transport
// ----------------------------------------------------------------------------

/// Transport that prints everything it is asked to send
struct LoopbackTransport {
    local: NodeId,
    next_id: u32,
}

impl LoopbackTransport {
    fn new(local: NodeId) -> Self {
        Self {
            local,
            next_id: 0x2000,
        }
    }
}

impl Transport for LoopbackTransport {
    fn allocate_packet(&mut self) -> Result<MeshPacket, TransportError> {
        self.next_id += 1;
        Ok(MeshPacket {
            from: self.local,
            to: NodeId::BROADCAST,
            id: self.next_id,
            channel: ChannelId::new(0),
            rx_time: 0,
            priority: Priority::default(),
            want_ack: false,
            payload: PayloadVariant::Decoded(Default::default()),
        })
    }

    fn send(&mut self, packet: MeshPacket) -> Result<(), TransportError> {
        println!("  -> {}", describe(&packet));
        Ok(())
    }

    fn is_tx_allowed(&self) -> bool {
        true
    }

    fn channel_utilization_percent(&self) -> f32 {
        0.0
    }

    fn is_default_channel(&self, channel: ChannelId) -> bool {
        channel.index() == 0
    }

    fn local_node(&self) -> NodeId {
        self.local
    }
}

fn describe(packet: &MeshPacket) -> String {
    let head = format!(
        "{} -> {} id=0x{:08x}{}",
        packet.from,
        packet.to,
        packet.id,
        if packet.want_ack { " want_ack" } else { "" }
    );

    let Some(decoded) = packet.decoded() else {
        return format!("{head} [encrypted]");
    };

    match decoded.portnum {
        Some(PortNum::TextMessage) => {
            format!("{head} TEXT {:?}", String::from_utf8_lossy(&decoded.payload))
        }
        Some(PortNum::StoreForward) => match StoreAndForward::decode(&decoded.payload) {
            Ok(envelope) => {
                let detail = match &envelope.variant {
                    Variant::None => String::new(),
                    Variant::Text(bytes) => {
                        format!(" {:?}", String::from_utf8_lossy(bytes))
                    }
                    other => format!(" {other:?}"),
                };
                format!("{head} {:?}{detail}", envelope.rr)
            }
            Err(err) => format!("{head} S&F <undecodable: {err}>"),
        },
        Some(PortNum::Routing) => format!("{head} ROUTING ack=0x{:08x}", decoded.request_id),
        None => format!("{head} <no port>"),
    }
}

// ----------------------------------------------------------------------------
// Command Loop
// ----------------------------------------------------------------------------

fn parse_node(token: &str) -> Result<NodeId> {
    if token.eq_ignore_ascii_case("bcast") {
        return Ok(NodeId::BROADCAST);
    }
    let raw = u32::from_str_radix(token.trim_start_matches('!'), 16)
        .with_context(|| format!("bad node id {token:?}"))?;
    Ok(NodeId::new(raw))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "storefwd_core=info".into()),
        )
        .init();

    let args = Args::parse();
    let local = parse_node(&args.node_id)?;

    let config = StoreForwardConfig {
        enabled: true,
        is_server: !args.client,
        records: args.records,
        heartbeat: args.heartbeat,
        ..StoreForwardConfig::default()
    };

    let role = build_role(
        config,
        2 * 1024 * 1024,
        Box::new(LoopbackTransport::new(local)),
        Box::new(SystemClock::new()),
        Box::new(EmptyDirectory),
        Box::new(FsStorage::new(&args.data_dir)),
    );

    info!(
        "node {} running as {}",
        local,
        if role.is_server() { "server" } else { "client" }
    );
    println!("commands: text <from> <to|bcast> <msg> | sf <from> | reset <from> | stats <from> | ping <from> | tick | phone | quit");

    let mut scheduler = Scheduler::new(role);
    let mut next_rx_id = 0x8000u32;
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush()?;
        let Some(line) = stdin.lock().lines().next() else {
            break;
        };
        let line = line?;
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        next_rx_id += 1;

        match command {
            "text" => {
                let (Some(from), Some(to)) = (words.next(), words.next()) else {
                    println!("usage: text <from> <to|bcast> <msg>");
                    continue;
                };
                let body = words.collect::<Vec<_>>().join(" ");
                let packet = text_packet(parse_node(from)?, parse_node(to)?, 1, next_rx_id, &body);
                scheduler.on_receive(&packet);
            }
            "sf" | "reset" | "stats" => {
                let Some(from) = words.next() else {
                    println!("usage: {command} <from>");
                    continue;
                };
                let body = match command {
                    "sf" => "SF".to_string(),
                    other => format!("SF {other}"),
                };
                let packet = text_packet(parse_node(from)?, local, 1, next_rx_id, &body);
                scheduler.on_receive(&packet);
            }
            "ping" => {
                let Some(from) = words.next() else {
                    println!("usage: ping <from>");
                    continue;
                };
                let envelope = StoreAndForward::bare(RequestResponse::ClientPing);
                let packet = storefwd_core::testing::protocol_packet(
                    parse_node(from)?,
                    local,
                    1,
                    next_rx_id,
                    envelope.encode(),
                );
                scheduler.on_receive(&packet);
            }
            "tick" => {
                let delay = scheduler.role_mut().run_once();
                println!("  (next tick in {delay} ms)");
            }
            "phone" => match scheduler.role_mut().for_phone() {
                Some(packet) => println!("  phone <- {}", describe(&packet)),
                None => println!("  (no stored packets for the host)"),
            },
            "quit" | "exit" => break,
            other => println!("unknown command {other:?}"),
        }
    }

    scheduler.shutdown();
    Ok(())
}

//! UDP echo responder, the far end of a convergence probe flow.
//!
//! Echoes every datagram back to its sender. Probe datagrams (carrying the
//! `CONV` tag) get a `:S<count>` field appended with this side's receive
//! counter, which the probe uses to split total loss into transmit-side and
//! receive-side components. Probe sessions are keyed by test id rather than
//! source address, so an SD-WAN failover that moves the flow to a new
//! address keeps counting against the same session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::net::UdpSocket;

use crate::probe::wire;

/// Sessions with no traffic for this long are swept away.
pub const SESSION_IDLE_EXPIRY: Duration = Duration::from_secs(60);

/// Per-session receive bookkeeping on the responder side.
#[derive(Debug, Clone)]
pub struct EchoSession {
    pub packet_count: u64,
    pub started: Instant,
    pub last_seen: Instant,
    pub last_addr: SocketAddr,
}

pub type SessionMap = Arc<Mutex<HashMap<String, EchoSession>>>;

/// Binds the given ports and serves echoes until the process exits.
pub async fn run_echo(bind_ip: &str, ports: &[u16]) -> Result<(), std::io::Error> {
    let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));

    for &port in ports {
        let socket = UdpSocket::bind((bind_ip, port)).await?;
        info!("Echo responder listening on {}:{}", bind_ip, port);
        tokio::spawn(serve_socket(socket, sessions.clone()));
    }

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        sweep_idle(&sessions, Instant::now());
    }
}

/// Serves echoes on one already-bound socket.
pub async fn serve_socket(socket: UdpSocket, sessions: SessionMap) {
    let mut buf = [0u8; 2048];
    loop {
        let (len, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Echo receive error: {}", e);
                break;
            }
        };
        let reply = handle_datagram(&buf[..len], addr, &sessions, Instant::now());
        if let Err(e) = socket.send_to(&reply, addr).await {
            debug!("Echo reply to {} failed: {}", addr, e);
        }
    }
}

/// Updates session state for one datagram and builds the reply payload.
pub fn handle_datagram(
    data: &[u8],
    addr: SocketAddr,
    sessions: &SessionMap,
    now: Instant,
) -> Vec<u8> {
    let text = String::from_utf8_lossy(data);
    let parts: Vec<&str> = text.split(':').collect();
    let probe_id = if parts.len() >= wire::MIN_FIELDS && parts[0] == wire::TAG {
        Some(parts[1].to_string())
    } else {
        None
    };

    // Probe flows are keyed by test id so the session survives address
    // changes during failover; everything else is keyed by peer address.
    let key = probe_id
        .clone()
        .unwrap_or_else(|| addr.to_string());

    let count = match sessions.lock() {
        Ok(mut map) => {
            let session = map.entry(key).or_insert_with(|| {
                debug!("New echo session from {}", addr);
                EchoSession {
                    packet_count: 0,
                    started: now,
                    last_seen: now,
                    last_addr: addr,
                }
            });
            session.packet_count += 1;
            session.last_seen = now;
            session.last_addr = addr;
            session.packet_count
        }
        Err(_) => 0,
    };

    match probe_id {
        Some(_) => {
            let mut reply = data.to_vec();
            reply.extend_from_slice(format!(":S{}", count).as_bytes());
            reply
        }
        None => data.to_vec(),
    }
}

/// Removes sessions idle past [`SESSION_IDLE_EXPIRY`].
pub fn sweep_idle(sessions: &SessionMap, now: Instant) {
    if let Ok(mut map) = sessions.lock() {
        map.retain(|key, session| {
            let keep = now.saturating_duration_since(session.last_seen) <= SESSION_IDLE_EXPIRY;
            if !keep {
                info!(
                    "Echo session {} completed: {} packets from {}",
                    key, session.packet_count, session.last_addr
                );
            }
            keep
        });
    }
}

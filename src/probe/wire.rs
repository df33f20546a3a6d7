//! Datagram payload codec.
//!
//! A probe datagram is delimiter-separated text:
//! `CONV:<test-id>:<label>:<sequence>:<send-timestamp>`. The echo side
//! appends a `S<count>` field carrying its own receive counter. Decoding is
//! deliberately tolerant: anything with the tag and at least four fields is
//! accepted, unknown fields are ignored, so the payload can grow without
//! breaking older responders.

/// Leading tag identifying a convergence probe datagram.
pub const TAG: &str = "CONV";

/// Minimum number of `:`-separated fields a decodable payload must carry.
pub const MIN_FIELDS: usize = 4;

/// A successfully parsed echoed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoedPacket {
    pub seq: u64,
    /// Receive counter reported by the far end (`S<digits>` field), 0 when
    /// the responder did not report one.
    pub server_received: u64,
}

/// Builds the payload for one outgoing probe datagram.
pub fn encode(test_id: &str, label: &str, seq: u64, send_epoch: f64) -> String {
    format!("{}:{}:{}:{}:{:.6}", TAG, test_id, label, seq, send_epoch)
}

/// Parses an echoed payload. Returns `None` for anything that is not a
/// well-formed probe echo; the caller discards those silently.
pub fn decode(payload: &str) -> Option<EchoedPacket> {
    let parts: Vec<&str> = payload.split(':').collect();
    if parts.len() < MIN_FIELDS || parts[0] != TAG {
        return None;
    }
    let seq = parts[3].parse::<u64>().ok()?;
    let server_received = parts
        .iter()
        .find_map(|part| {
            part.strip_prefix('S')
                .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|d| d.parse::<u64>().ok())
        })
        .unwrap_or(0);
    Some(EchoedPacket {
        seq,
        server_received,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let payload = encode("CONV-042", "wan failover", 17, 1714000000.25);
        let pkt = decode(&payload).unwrap();
        assert_eq!(pkt.seq, 17);
        assert_eq!(pkt.server_received, 0);
    }

    #[test]
    fn test_decode_with_server_counter() {
        let pkt = decode("CONV:CONV-001::5:1714000000.0:S42").unwrap();
        assert_eq!(pkt.seq, 5);
        assert_eq!(pkt.server_received, 42);
    }

    #[test]
    fn test_decode_counter_anywhere_in_field_list() {
        let pkt = decode("CONV:CONV-001:S9:5:1714000000.0").unwrap();
        assert_eq!(pkt.server_received, 9);
    }

    #[test]
    fn test_decode_ignores_trailing_extensions() {
        let pkt = decode("CONV:CONV-001:label:5:1714000000.0:X7:future-field").unwrap();
        assert_eq!(pkt.seq, 5);
        assert_eq!(pkt.server_received, 0);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("VOIP:CONV-001::5:1.0"), None);
        assert_eq!(decode("CONV:CONV-001:5"), None);
        assert_eq!(decode("CONV:CONV-001:label:not-a-number:1.0"), None);
    }
}

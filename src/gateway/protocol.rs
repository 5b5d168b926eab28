// Gateway wire format: JSON frames {op, d, s, t}, optionally zlib-compressed

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io::Read;

use crate::error::{Error, Result};

pub const DISPATCH: u8 = 0;
pub const HEARTBEAT: u8 = 1;
pub const IDENTIFY: u8 = 2;
pub const RESUME: u8 = 6;
pub const RECONNECT: u8 = 7;
pub const INVALID_SESSION: u8 = 9;
pub const HELLO: u8 = 10;
pub const HEARTBEAT_ACK: u8 = 11;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

impl Frame {
    fn new(op: u8, d: Value) -> Self {
        Self {
            op,
            d,
            s: None,
            t: None,
        }
    }

    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(HEARTBEAT, json!(sequence))
    }

    pub fn identify(token: &str, intents: u64) -> Self {
        Self::new(
            IDENTIFY,
            json!({
                "token": token,
                "intents": intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "herald",
                    "device": "herald"
                }
            }),
        )
    }

    pub fn resume(token: &str, session_id: &str, sequence: u64) -> Self {
        Self::new(
            RESUME,
            json!({
                "token": token,
                "session_id": session_id,
                "seq": sequence
            }),
        )
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Heartbeat interval announced by HELLO.
    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        if self.op != HELLO {
            return None;
        }
        self.d.get("heartbeat_interval").and_then(Value::as_u64)
    }
}

pub fn decode_text(text: &str) -> Result<Frame> {
    serde_json::from_str(text).map_err(|e| Error::Decode(format!("bad gateway frame: {}", e)))
}

/// Binary frames carry a zlib-compressed JSON frame.
pub fn decode_binary(data: &[u8]) -> Result<Frame> {
    let mut text = String::new();
    ZlibDecoder::new(data)
        .read_to_string(&mut text)
        .map_err(|e| Error::Decode(format!("failed to inflate gateway frame: {}", e)))?;
    decode_text(&text)
}

/// What a close code means for the session.
#[derive(Debug, Clone)]
pub enum CloseDisposition {
    /// Reconnect and resume the existing session
    Resume,
    /// Reconnect with a fresh IDENTIFY
    Reidentify,
    /// Never retried
    Fatal(Error),
}

pub fn classify_close(code: u16, reason: &str) -> CloseDisposition {
    match code {
        4004 => CloseDisposition::Fatal(Error::Auth(format!(
            "gateway closed with 4004: {}",
            reason
        ))),
        4010..=4014 => CloseDisposition::Fatal(Error::ProtocolMismatch(format!(
            "gateway closed with {}: {}",
            code, reason
        ))),
        // Invalid sequence, session timed out
        4007 | 4009 => CloseDisposition::Reidentify,
        _ => CloseDisposition::Resume,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_decode_dispatch_frame() {
        let frame =
            decode_text(r#"{"op":0,"d":{"id":"1"},"s":42,"t":"GUILD_CREATE"}"#).unwrap();
        assert_eq!(frame.op, DISPATCH);
        assert_eq!(frame.s, Some(42));
        assert_eq!(frame.t.as_deref(), Some("GUILD_CREATE"));
    }

    #[test]
    fn test_hello_interval() {
        let frame = decode_text(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(frame.heartbeat_interval_ms(), Some(41250));
        assert!(decode_text(r#"{"op":11}"#)
            .unwrap()
            .heartbeat_interval_ms()
            .is_none());
    }

    #[test]
    fn test_outbound_frames() {
        let hb: Value = serde_json::from_str(&Frame::heartbeat(None).to_json().unwrap()).unwrap();
        assert_eq!(hb["op"], 1);
        assert!(hb["d"].is_null());

        let resume = Frame::resume("tok", "sess", 9);
        assert_eq!(resume.op, RESUME);
        assert_eq!(resume.d["seq"], 9);
        assert_eq!(resume.d["session_id"], "sess");

        let identify = Frame::identify("tok", 513);
        assert_eq!(identify.d["intents"], 513);
        assert_eq!(identify.d["properties"]["browser"], "herald");
    }

    #[test]
    fn test_decode_compressed_frame() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(br#"{"op":11,"d":null}"#)
            .unwrap();
        let compressed = encoder.finish().unwrap();

        let frame = decode_binary(&compressed).unwrap();
        assert_eq!(frame.op, HEARTBEAT_ACK);
        assert!(decode_binary(b"not zlib").is_err());
    }

    #[test]
    fn test_close_codes() {
        assert!(matches!(
            classify_close(4004, "Authentication failed."),
            CloseDisposition::Fatal(Error::Auth(_))
        ));
        for code in [4010, 4011, 4012, 4013, 4014] {
            assert!(matches!(
                classify_close(code, ""),
                CloseDisposition::Fatal(Error::ProtocolMismatch(_))
            ));
        }
        assert!(matches!(classify_close(4009, ""), CloseDisposition::Reidentify));
        assert!(matches!(classify_close(4000, ""), CloseDisposition::Resume));
        assert!(matches!(classify_close(1001, ""), CloseDisposition::Resume));
    }
}

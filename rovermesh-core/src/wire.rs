//! Wire formats.
//!
//! Two encodings share this module:
//!
//! - **Frames** travel over TCP peer connections as a big-endian `u32`
//!   length prefix followed by a JSON 2-tuple `[kind, payload]`. The
//!   dialer's very first frame is a bare JSON string carrying its own
//!   name (the handshake).
//! - **Beacons** travel over UDP broadcast as a 4-byte filter key
//!   followed by a JSON 5-tuple
//!   `[name, uid, acceptPort, wants, subs]`.
//!
//! The shapes are positional arrays, so encoding goes through
//! `serde_json::Value` tuples instead of struct derives.

use serde_json::{json, Map, Value};
use thiserror::Error;

/// Hard cap on a single TCP frame body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Beacons larger than this may be dropped by receivers.
pub const MAX_BEACON_LEN: usize = 1024;

/// Keyword-argument map of a request.
pub type Kwargs = Map<String, Value>;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("unexpected shape: {0}")]
    WrongShape(&'static str),
    #[error("frame length {0} exceeds cap")]
    Oversize(usize),
    #[error("datagram shorter than filter key")]
    ShortKey,
    #[error("filter key mismatch")]
    KeyMismatch,
}

/// One multiplexed packet on a TCP peer connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Fire-and-forget payload for an endpoint (`publish` also uses this).
    Send { endpoint: String, data: Value },
    /// A call expecting a correlated [`Frame::Response`].
    Request {
        rid: u32,
        endpoint: String,
        args: Vec<Value>,
        kwargs: Kwargs,
    },
    /// The reply to a [`Frame::Request`] with the same `rid`.
    Response { rid: u32, result: Value },
    /// Handshake: the dialer announces its member name.
    Hello { name: String },
}

impl Frame {
    pub fn to_value(&self) -> Value {
        match self {
            Frame::Send { endpoint, data } => json!(["send", [endpoint, data]]),
            Frame::Request {
                rid,
                endpoint,
                args,
                kwargs,
            } => json!(["request", [rid, endpoint, args, kwargs]]),
            Frame::Response { rid, result } => json!(["response", [rid, result]]),
            Frame::Hello { name } => json!(name),
        }
    }

    pub fn from_value(value: Value) -> Result<Self, WireError> {
        // A bare string is the dialer handshake.
        let (kind, payload) = match value {
            Value::String(name) => return Ok(Frame::Hello { name }),
            Value::Array(mut tuple) if tuple.len() == 2 => {
                let payload = tuple.pop().ok_or(WireError::WrongShape("empty tuple"))?;
                let kind = tuple.pop().ok_or(WireError::WrongShape("empty tuple"))?;
                (kind, payload)
            }
            _ => return Err(WireError::WrongShape("expected [kind, payload]")),
        };
        let kind = kind
            .as_str()
            .ok_or(WireError::WrongShape("kind must be a string"))?
            .to_string();
        let Value::Array(mut fields) = payload else {
            return Err(WireError::WrongShape("payload must be an array"));
        };
        match (kind.as_str(), fields.len()) {
            ("send", 2) => {
                let data = fields.pop().ok_or(WireError::WrongShape("send payload"))?;
                let endpoint = take_string(fields.pop(), "send endpoint")?;
                Ok(Frame::Send { endpoint, data })
            }
            ("request", 4) => {
                let kwargs = match fields.pop() {
                    Some(Value::Object(map)) => map,
                    _ => return Err(WireError::WrongShape("request kwargs")),
                };
                let args = match fields.pop() {
                    Some(Value::Array(args)) => args,
                    _ => return Err(WireError::WrongShape("request args")),
                };
                let endpoint = take_string(fields.pop(), "request endpoint")?;
                let rid = take_rid(fields.pop())?;
                Ok(Frame::Request {
                    rid,
                    endpoint,
                    args,
                    kwargs,
                })
            }
            ("response", 2) => {
                let result = fields.pop().ok_or(WireError::WrongShape("response payload"))?;
                let rid = take_rid(fields.pop())?;
                Ok(Frame::Response { rid, result })
            }
            _ => Err(WireError::WrongShape("unknown frame kind")),
        }
    }

    /// Serialize with the 4-byte big-endian length prefix.
    pub fn encode(&self) -> Vec<u8> {
        let body = self.to_value().to_string().into_bytes();
        let mut packet = Vec::with_capacity(4 + body.len());
        packet.extend_from_slice(&(body.len() as u32).to_be_bytes());
        packet.extend_from_slice(&body);
        packet
    }

    /// Parse a frame body (the bytes after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, WireError> {
        Self::from_value(serde_json::from_slice(body)?)
    }
}

fn take_string(value: Option<Value>, what: &'static str) -> Result<String, WireError> {
    match value {
        Some(Value::String(s)) => Ok(s),
        _ => Err(WireError::WrongShape(what)),
    }
}

fn take_rid(value: Option<Value>) -> Result<u32, WireError> {
    value
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|rid| u32::try_from(rid).ok())
        .ok_or(WireError::WrongShape("request id"))
}

/// One UDP broadcast advertisement of local identity, wants and
/// subscriptions.
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    pub name: String,
    pub uid: u32,
    pub accept_port: u16,
    pub wants: Vec<String>,
    pub subs: Vec<String>,
}

impl Beacon {
    /// Serialize as `key ‖ JSON 5-tuple`.
    pub fn encode(&self, key: &[u8; 4]) -> Vec<u8> {
        let tuple = (
            &self.name,
            self.uid,
            self.accept_port,
            &self.wants,
            &self.subs,
        );
        let body = serde_json::to_vec(&tuple).unwrap_or_default();
        let mut datagram = Vec::with_capacity(4 + body.len());
        datagram.extend_from_slice(key);
        datagram.extend_from_slice(&body);
        datagram
    }

    /// Parse a datagram, validating the filter key.
    pub fn decode(datagram: &[u8], key: &[u8; 4]) -> Result<Self, WireError> {
        if datagram.len() < key.len() {
            return Err(WireError::ShortKey);
        }
        let (prefix, body) = datagram.split_at(key.len());
        if prefix != key {
            return Err(WireError::KeyMismatch);
        }
        let (name, uid, accept_port, wants, subs): (String, u32, u16, Vec<String>, Vec<String>) =
            serde_json::from_slice(body)?;
        Ok(Self {
            name,
            uid,
            accept_port,
            wants,
            subs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_frame_shape() {
        let frame = Frame::Send {
            endpoint: "hello".into(),
            data: json!("world"),
        };
        assert_eq!(frame.to_value(), json!(["send", ["hello", "world"]]));
        assert_eq!(Frame::from_value(frame.to_value()).unwrap(), frame);
    }

    #[test]
    fn request_frame_shape() {
        let frame = Frame::Request {
            rid: 7,
            endpoint: "add".into(),
            args: vec![json!(2), json!(3)],
            kwargs: Kwargs::new(),
        };
        assert_eq!(frame.to_value(), json!(["request", [7, "add", [2, 3], {}]]));
        assert_eq!(Frame::from_value(frame.to_value()).unwrap(), frame);
    }

    #[test]
    fn response_frame_shape() {
        let frame = Frame::Response {
            rid: 7,
            result: json!(5),
        };
        assert_eq!(frame.to_value(), json!(["response", [7, 5]]));
        assert_eq!(Frame::from_value(frame.to_value()).unwrap(), frame);
    }

    #[test]
    fn hello_is_a_bare_string() {
        let frame = Frame::Hello {
            name: "device-a".into(),
        };
        assert_eq!(frame.to_value(), json!("device-a"));
        assert_eq!(Frame::from_value(frame.to_value()).unwrap(), frame);
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let packet = Frame::Hello { name: "x".into() }.encode();
        let body_len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        assert_eq!(body_len, packet.len() - 4);
        assert_eq!(Frame::decode(&packet[4..]).unwrap(), Frame::Hello { name: "x".into() });
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(Frame::decode(b"not json").is_err());
        assert!(Frame::from_value(json!(42)).is_err());
        assert!(Frame::from_value(json!(["send", ["only-endpoint"], "extra"])).is_err());
        assert!(Frame::from_value(json!(["bogus", []])).is_err());
        assert!(Frame::from_value(json!(["request", [1, "e", "not-args", {}]])).is_err());
        // request ids above u32 are not valid
        assert!(Frame::from_value(json!(["response", [4294967296u64, null]])).is_err());
    }

    #[test]
    fn beacon_round_trip() {
        let key = crate::filter_key(4242);
        let beacon = Beacon {
            name: "rover".into(),
            uid: 0xDEADBEEF,
            accept_port: 35000,
            wants: vec!["base-*".into()],
            subs: vec!["base/telemetry".into()],
        };
        let datagram = beacon.encode(&key);
        assert_eq!(&datagram[..4], &key);
        assert_eq!(Beacon::decode(&datagram, &key).unwrap(), beacon);
    }

    #[test]
    fn beacon_key_filtering() {
        let key = crate::filter_key(4242);
        let other = crate::filter_key(4243);
        let datagram = Beacon {
            name: "rover".into(),
            uid: 1,
            accept_port: 1,
            wants: vec![],
            subs: vec![],
        }
        .encode(&key);
        assert!(matches!(
            Beacon::decode(&datagram, &other),
            Err(WireError::KeyMismatch)
        ));
        assert!(matches!(
            Beacon::decode(&datagram[..2], &key),
            Err(WireError::ShortKey)
        ));
    }
}

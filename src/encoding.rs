//! Payload encodings the gateway can speak.

use crate::error::Error;
use crate::protocol::{GatewayFrame, OutboundFrame};
use tokio_tungstenite::tungstenite::Message;

/// Wire encoding, chosen once per connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON text frames
    #[default]
    Json,
    /// Erlang external term format in binary frames
    Etf,
}

impl Encoding {
    /// ETF when the crate is built with the `etf` feature, JSON otherwise.
    pub fn preferred() -> Self {
        if Self::Etf.is_available() {
            Encoding::Etf
        } else {
            Encoding::Json
        }
    }

    /// Whether this build can speak the encoding
    pub fn is_available(self) -> bool {
        match self {
            Encoding::Json => true,
            Encoding::Etf => cfg!(feature = "etf"),
        }
    }

    /// Value of the `encoding` query parameter
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Etf => "etf",
        }
    }

    /// Decode one complete (already inflated) frame.
    pub fn decode(self, bytes: &[u8]) -> Result<GatewayFrame, Error> {
        match self {
            Encoding::Json => Ok(serde_json::from_slice(bytes)?),
            Encoding::Etf => etf::decode(bytes),
        }
    }

    /// Encode an outbound frame as the WebSocket message to write.
    pub fn encode(self, frame: &OutboundFrame) -> Result<Message, Error> {
        match self {
            Encoding::Json => Ok(Message::Text(serde_json::to_string(frame)?)),
            Encoding::Etf => etf::encode(frame).map(Message::Binary),
        }
    }
}

#[cfg(feature = "etf")]
mod etf {
    use super::*;
    use eetf::{Atom, BigInteger, Binary, FixInteger, Float, List, Map, Term};
    use num_bigint::BigInt;
    use serde_json::{Number, Value};
    use std::collections::HashMap;

    pub(super) fn decode(bytes: &[u8]) -> Result<GatewayFrame, Error> {
        let term = Term::decode(bytes).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(serde_json::from_value(term_to_value(term)?)?)
    }

    pub(super) fn encode(frame: &OutboundFrame) -> Result<Vec<u8>, Error> {
        let term = value_to_term(&serde_json::to_value(frame)?)?;
        let mut out = Vec::new();
        term.encode(&mut out)
            .map_err(|e| Error::Decode(e.to_string()))?;
        Ok(out)
    }

    fn term_to_value(term: Term) -> Result<Value, Error> {
        Ok(match term {
            Term::Atom(atom) => match atom.name.as_str() {
                "nil" | "null" => Value::Null,
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => Value::String(atom.name),
            },
            Term::FixInteger(i) => Value::from(i.value),
            Term::BigInteger(big) => {
                let digits = big.value.to_string();
                match digits.parse::<u64>() {
                    Ok(n) => Value::from(n),
                    Err(_) => match digits.parse::<i64>() {
                        Ok(n) => Value::from(n),
                        // Out of range ids survive as strings
                        Err(_) => Value::String(digits),
                    },
                }
            }
            Term::Float(f) => Number::from_f64(f.value)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Term::Binary(bin) => Value::String(
                String::from_utf8(bin.bytes).map_err(|e| Error::Decode(e.to_string()))?,
            ),
            Term::ByteList(list) => {
                Value::Array(list.bytes.into_iter().map(Value::from).collect())
            }
            Term::List(list) => Value::Array(
                list.elements
                    .into_iter()
                    .map(term_to_value)
                    .collect::<Result<_, _>>()?,
            ),
            Term::Tuple(tuple) => Value::Array(
                tuple
                    .elements
                    .into_iter()
                    .map(term_to_value)
                    .collect::<Result<_, _>>()?,
            ),
            Term::Map(map) => {
                let mut object = serde_json::Map::with_capacity(map.map.len());
                for (key, value) in map.map {
                    let key = match term_to_value(key)? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    object.insert(key, term_to_value(value)?);
                }
                Value::Object(object)
            }
            other => return Err(Error::Decode(format!("unsupported ETF term: {other}"))),
        })
    }

    fn value_to_term(value: &Value) -> Result<Term, Error> {
        Ok(match value {
            Value::Null => Term::from(Atom::from("nil")),
            Value::Bool(b) => Term::from(Atom::from(if *b { "true" } else { "false" })),
            Value::Number(n) => {
                if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                    Term::from(FixInteger::from(i))
                } else if let Some(u) = n.as_u64() {
                    Term::from(BigInteger { value: BigInt::from(u) })
                } else if let Some(i) = n.as_i64() {
                    Term::from(BigInteger { value: BigInt::from(i) })
                } else {
                    let f = n.as_f64().unwrap_or_default();
                    Term::from(Float::try_from(f).map_err(|e| Error::Decode(e.to_string()))?)
                }
            }
            Value::String(s) => Term::from(Binary::from(s.as_bytes())),
            Value::Array(items) => Term::from(List::from(
                items
                    .iter()
                    .map(value_to_term)
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Value::Object(object) => {
                let mut map = HashMap::with_capacity(object.len());
                for (key, value) in object {
                    map.insert(Term::from(Atom::from(key.as_str())), value_to_term(value)?);
                }
                Term::from(Map::from(map))
            }
        })
    }

}

#[cfg(not(feature = "etf"))]
mod etf {
    use super::*;

    pub(super) fn decode(_bytes: &[u8]) -> Result<GatewayFrame, Error> {
        Err(Error::Decode(
            "ETF encoding requires the `etf` feature".to_string(),
        ))
    }

    pub(super) fn encode(_frame: &OutboundFrame) -> Result<Vec<u8>, Error> {
        Err(Error::Decode(
            "ETF encoding requires the `etf` feature".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OpCode;
    use serde_json::json;

    #[test]
    fn test_json_decode() {
        let frame = Encoding::Json
            .decode(br#"{"op":0,"t":"READY","s":1,"d":{"v":10}}"#)
            .unwrap();
        assert_eq!(frame.op, 0);
        assert_eq!(frame.s, Some(1));
        assert_eq!(frame.t.as_deref(), Some("READY"));
    }

    #[test]
    fn test_json_encode_is_text() {
        let message = Encoding::Json
            .encode(&OutboundFrame::heartbeat(42))
            .unwrap();
        let Message::Text(text) = message else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"op": OpCode::Heartbeat as u8, "d": 42}));
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        assert!(matches!(
            Encoding::Json.decode(b"{not json"),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_preferred_matches_availability() {
        assert_eq!(Encoding::preferred() == Encoding::Etf, cfg!(feature = "etf"));
        assert_eq!(Encoding::Etf.as_str(), "etf");
        assert!(Encoding::Json.is_available());
    }
}

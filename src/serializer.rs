//! Wire serialization for outbound/inbound frames.
//!
//! Two formats are supported, mirroring the spec's default JSON array
//! encoding and its optional byte-oriented binary encoding.

use serde_json::Value;

use crate::error::PhoenixError;
use crate::message::Message;

/// A wire codec: turns a `Message` into bytes suitable for a text or binary
/// WebSocket frame, and back.
pub trait Serializer: Send + Sync + 'static {
    /// Encode a message. `is_binary` tells the caller which frame kind to send.
    fn encode(&self, message: &Message) -> Result<Encoded, PhoenixError>;
    fn decode(&self, frame: &Frame) -> Result<Message, PhoenixError>;
}

/// An encoded frame ready to hand to the transport.
pub enum Encoded {
    Text(String),
    Binary(Vec<u8>),
}

/// A frame received from the transport, before decoding.
pub enum Frame<'a> {
    Text(&'a str),
    Binary(&'a [u8]),
}

/// Default serializer: `[joinRef, ref, topic, event, payload]` JSON array.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, message: &Message) -> Result<Encoded, PhoenixError> {
        let array = Value::Array(vec![
            message
                .join_ref
                .as_deref()
                .map_or(Value::Null, |s| Value::String(s.to_string())),
            message
                .message_ref
                .as_deref()
                .map_or(Value::Null, |s| Value::String(s.to_string())),
            Value::String(message.topic.clone()),
            Value::String(message.event.clone()),
            message.payload.clone(),
        ]);
        let text = serde_json::to_string(&array)
            .map_err(|e| PhoenixError::Protocol { message: e.to_string() })?;
        Ok(Encoded::Text(text))
    }

    fn decode(&self, frame: &Frame) -> Result<Message, PhoenixError> {
        let Frame::Text(text) = frame else {
            return Err(PhoenixError::Protocol {
                message: "JsonSerializer cannot decode a binary frame".to_string(),
            });
        };
        let value: Value = serde_json::from_str(text)
            .map_err(|e| PhoenixError::Protocol { message: e.to_string() })?;
        let arr = value.as_array().ok_or_else(|| PhoenixError::Protocol {
            message: "expected a 5-element JSON array frame".to_string(),
        })?;
        if arr.len() != 5 {
            return Err(PhoenixError::Protocol {
                message: format!("expected 5 elements, got {}", arr.len()),
            });
        }
        let join_ref = arr[0].as_str().map(str::to_string);
        let message_ref = arr[1].as_str().map(str::to_string);
        let topic = arr[2]
            .as_str()
            .ok_or_else(|| PhoenixError::Protocol {
                message: "topic must be a string".to_string(),
            })?
            .to_string();
        let event = arr[3]
            .as_str()
            .ok_or_else(|| PhoenixError::Protocol {
                message: "event must be a string".to_string(),
            })?
            .to_string();
        let payload = arr[4].clone();

        Ok(Message::new(join_ref, message_ref, topic, event, payload))
    }
}

/// Byte-for-byte binary encoding: kind byte + 1-byte length headers + UTF-8 bodies.
///
/// Kind 0 = push (no ref field), 1 = reply (event is always decoded as
/// `phx_reply`, payload becomes `{status, response}`), 2 = broadcast (no
/// joinRef/ref fields at all).
#[derive(Debug, Clone, Copy, Default)]
pub struct BinarySerializer;

const KIND_PUSH: u8 = 0x00;
const KIND_REPLY: u8 = 0x01;
const KIND_BROADCAST: u8 = 0x02;

impl Serializer for BinarySerializer {
    fn encode(&self, message: &Message) -> Result<Encoded, PhoenixError> {
        let payload_bytes = payload_to_bytes(&message.payload);

        let mut out = Vec::new();
        if message.event == crate::message::PHX_REPLY {
            // Reply: [kind, joinRefLen, refLen, topicLen, statusLen] then bodies.
            let status = message
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("error");
            let response_bytes = message
                .payload
                .get("response")
                .map_or_else(Vec::new, payload_to_bytes);
            let join_ref = message.join_ref.as_deref().unwrap_or("");
            let msg_ref = message.message_ref.as_deref().unwrap_or("");
            out.push(KIND_REPLY);
            push_len(&mut out, join_ref)?;
            push_len(&mut out, msg_ref)?;
            push_len(&mut out, &message.topic)?;
            push_len(&mut out, status)?;
            out.extend_from_slice(join_ref.as_bytes());
            out.extend_from_slice(msg_ref.as_bytes());
            out.extend_from_slice(message.topic.as_bytes());
            out.extend_from_slice(status.as_bytes());
            out.extend_from_slice(&response_bytes);
        } else if message.topic.is_empty() && message.join_ref.is_none() && message.message_ref.is_none() {
            out.push(KIND_BROADCAST);
            push_len(&mut out, &message.topic)?;
            push_len(&mut out, &message.event)?;
            out.extend_from_slice(message.topic.as_bytes());
            out.extend_from_slice(message.event.as_bytes());
            out.extend_from_slice(&payload_bytes);
        } else {
            let join_ref = message.join_ref.as_deref().unwrap_or("");
            out.push(KIND_PUSH);
            push_len(&mut out, join_ref)?;
            push_len(&mut out, &message.topic)?;
            push_len(&mut out, &message.event)?;
            out.extend_from_slice(join_ref.as_bytes());
            out.extend_from_slice(message.topic.as_bytes());
            out.extend_from_slice(message.event.as_bytes());
            out.extend_from_slice(&payload_bytes);
        }
        Ok(Encoded::Binary(out))
    }

    fn decode(&self, frame: &Frame) -> Result<Message, PhoenixError> {
        let Frame::Binary(bytes) = frame else {
            return Err(PhoenixError::Protocol {
                message: "BinarySerializer cannot decode a text frame".to_string(),
            });
        };
        let (&kind, rest) = bytes.split_first().ok_or_else(|| PhoenixError::Protocol {
            message: "empty binary frame".to_string(),
        })?;

        match kind {
            KIND_PUSH => decode_push(rest),
            KIND_REPLY => decode_reply(rest),
            KIND_BROADCAST => decode_broadcast(rest),
            other => Err(PhoenixError::Protocol {
                message: format!("unknown binary frame kind byte {other:#04x}"),
            }),
        }
    }
}

fn payload_to_bytes(payload: &Value) -> Vec<u8> {
    match payload {
        Value::String(s) => s.clone().into_bytes(),
        Value::Null => Vec::new(),
        other => serde_json::to_vec(other).unwrap_or_default(),
    }
}

fn push_len(out: &mut Vec<u8>, s: &str) -> Result<(), PhoenixError> {
    let len = u8::try_from(s.len()).map_err(|_| PhoenixError::Protocol {
        message: format!("binary frame segment too long ({} bytes, max 255)", s.len()),
    })?;
    out.push(len);
    Ok(())
}

fn take<'a>(bytes: &mut &'a [u8], len: usize) -> Result<&'a [u8], PhoenixError> {
    if bytes.len() < len {
        return Err(PhoenixError::Protocol {
            message: "binary frame truncated".to_string(),
        });
    }
    let (head, tail) = bytes.split_at(len);
    *bytes = tail;
    Ok(head)
}

fn utf8(bytes: &[u8]) -> Result<String, PhoenixError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| PhoenixError::Protocol { message: e.to_string() })
}

fn decode_push(mut rest: &[u8]) -> Result<Message, PhoenixError> {
    let header = take(&mut rest, 3)?;
    let (join_ref_len, topic_len, event_len) = (header[0] as usize, header[1] as usize, header[2] as usize);
    let join_ref = utf8(take(&mut rest, join_ref_len)?)?;
    let topic = utf8(take(&mut rest, topic_len)?)?;
    let event = utf8(take(&mut rest, event_len)?)?;
    let payload = body_to_payload(rest);
    Ok(Message::new(
        if join_ref.is_empty() { None } else { Some(join_ref) },
        None,
        topic,
        event,
        payload,
    ))
}

fn decode_reply(mut rest: &[u8]) -> Result<Message, PhoenixError> {
    let header = take(&mut rest, 4)?;
    let (join_ref_len, ref_len, topic_len, status_len) = (
        header[0] as usize,
        header[1] as usize,
        header[2] as usize,
        header[3] as usize,
    );
    let join_ref = utf8(take(&mut rest, join_ref_len)?)?;
    let msg_ref = utf8(take(&mut rest, ref_len)?)?;
    let topic = utf8(take(&mut rest, topic_len)?)?;
    let status = utf8(take(&mut rest, status_len)?)?;
    let response = body_to_payload(rest);
    let payload = serde_json::json!({"status": status, "response": response});
    Ok(Message::new(
        if join_ref.is_empty() { None } else { Some(join_ref) },
        if msg_ref.is_empty() { None } else { Some(msg_ref) },
        topic,
        crate::message::PHX_REPLY,
        payload,
    ))
}

fn decode_broadcast(mut rest: &[u8]) -> Result<Message, PhoenixError> {
    let header = take(&mut rest, 2)?;
    let (topic_len, event_len) = (header[0] as usize, header[1] as usize);
    let topic = utf8(take(&mut rest, topic_len)?)?;
    let event = utf8(take(&mut rest, event_len)?)?;
    let payload = body_to_payload(rest);
    // Open Question (b): the binary decoder always synthesizes a null ref.
    Ok(Message::new(None, None, topic, event, payload))
}

fn body_to_payload(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or_else(|_| {
        Value::String(String::from_utf8_lossy(bytes).into_owned())
    })
}

//! Remote input messages
//!
//! Browsers send one JSON object per WebSocket text frame:
//!
//! ```json
//! {"type":"weel","deltaY":-3,"timestampInMs":1700000000000}
//! {"type":"mouseMove","x":10,"y":20,"ctrlKey":0,"shiftKey":1,"timestampInMs":...}
//! {"type":"mouseLeftClick","x":10,"y":20,"ctrlKey":0,"shiftKey":0,"mouseButton":1,"on":1,"timestampInMs":...}
//! ```
//!
//! `"weel"` is the wire spelling used by the bundled client. The literal text
//! `close` ends the session. Everything is decoded into an [`EventRecord`]
//! before it gets near the queue, so malformed input is never stored.

use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

use crate::queue::{CircularQueue, EventRecord, MouseButton};

/// Text frame that ends the session
pub const CLOSE_MESSAGE: &str = "close";

/// Why an input message was dropped
#[derive(Debug, Error)]
pub enum InputError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid mouse button: {0}")]
    InvalidButton(f64),
}

/// Modifier or press flag: `true`/`false` or exactly `0`/`1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawFlag")]
pub struct Flag(pub bool);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawFlag {
    Bool(bool),
    Number(f64),
}

impl TryFrom<RawFlag> for Flag {
    type Error = String;

    fn try_from(raw: RawFlag) -> Result<Self, Self::Error> {
        match raw {
            RawFlag::Bool(b) => Ok(Flag(b)),
            RawFlag::Number(n) if n == 0.0 => Ok(Flag(false)),
            RawFlag::Number(n) if n == 1.0 => Ok(Flag(true)),
            RawFlag::Number(n) => Err(format!("flag must be 0 or 1, got {}", n)),
        }
    }
}

/// Decoded client event, before validation of cross-field constraints
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "weel")]
    Wheel {
        #[serde(rename = "deltaY")]
        delta_y: f64,
        #[serde(rename = "timestampInMs")]
        timestamp_ms: f64,
    },

    #[serde(rename = "mouseMove")]
    MouseMove {
        x: f64,
        y: f64,
        #[serde(rename = "ctrlKey")]
        ctrl: Flag,
        #[serde(rename = "shiftKey")]
        shift: Flag,
        #[serde(rename = "timestampInMs")]
        timestamp_ms: f64,
    },

    #[serde(rename = "mouseLeftClick")]
    MouseClick {
        x: f64,
        y: f64,
        #[serde(rename = "ctrlKey")]
        ctrl: Flag,
        #[serde(rename = "shiftKey")]
        shift: Flag,
        #[serde(rename = "mouseButton")]
        button: f64,
        /// `1` is a press, `0` a release
        on: Flag,
        #[serde(rename = "timestampInMs")]
        timestamp_ms: f64,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, InputError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn timestamp_ms(&self) -> f64 {
        match self {
            ClientMessage::Wheel { timestamp_ms, .. }
            | ClientMessage::MouseMove { timestamp_ms, .. }
            | ClientMessage::MouseClick { timestamp_ms, .. } => *timestamp_ms,
        }
    }

    /// Convert into a queue record
    pub fn into_record(self) -> Result<EventRecord, InputError> {
        match self {
            ClientMessage::Wheel {
                delta_y,
                timestamp_ms,
            } => Ok(EventRecord::wheel(delta_y, timestamp_ms)),
            ClientMessage::MouseMove {
                x,
                y,
                ctrl,
                shift,
                timestamp_ms,
            } => Ok(EventRecord::mouse_move(x, y, ctrl.0, shift.0, timestamp_ms)),
            ClientMessage::MouseClick {
                x,
                y,
                ctrl,
                shift,
                button,
                on,
                timestamp_ms,
            } => {
                let button = mouse_button(button)?;
                Ok(EventRecord::button(
                    button,
                    !on.0,
                    x,
                    y,
                    ctrl.0,
                    shift.0,
                    timestamp_ms,
                ))
            }
        }
    }
}

fn mouse_button(value: f64) -> Result<MouseButton, InputError> {
    if value.fract() != 0.0 || !(0.0..=2.0).contains(&value) {
        return Err(InputError::InvalidButton(value));
    }
    MouseButton::from_index(value as u8).ok_or(InputError::InvalidButton(value))
}

/// One inbound text frame, interpreted
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Close,
    Event(EventRecord),
}

/// Interpret a WebSocket text frame
pub fn parse_text(text: &str) -> Result<Inbound, InputError> {
    if text == CLOSE_MESSAGE {
        return Ok(Inbound::Close);
    }
    let message = ClientMessage::parse(text)?;
    Ok(Inbound::Event(message.into_record()?))
}

fn now_ms() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64() * 1000.0)
        .unwrap_or_default()
}

/// Enqueue a decoded record, logging wheel latency at debug level.
///
/// Returns what the queue returned; `false` only after cleanup.
pub fn dispatch(queue: &CircularQueue, record: &EventRecord) -> bool {
    let ok = queue.enqueue(record);
    if record.event_type() == 1 {
        debug!(
            "Wheel event enqueued {:.2} ms after client timestamp",
            now_ms() - record.timestamp_ms
        );
    }
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventKind;

    fn event(text: &str) -> EventRecord {
        match parse_text(text).unwrap() {
            Inbound::Event(record) => record,
            Inbound::Close => panic!("unexpected close"),
        }
    }

    #[test]
    fn test_wheel() {
        let record = event(r#"{"type":"weel","deltaY":-2.5,"timestampInMs":100}"#);
        assert_eq!(record.to_words(), [1.0, -2.5, 0.0, 0.0, 0.0, 0.0, 100.0, 0.0]);
    }

    #[test]
    fn test_mouse_move_accepts_numeric_and_bool_flags() {
        let a = event(
            r#"{"type":"mouseMove","x":3,"y":4,"ctrlKey":1,"shiftKey":0,"timestampInMs":9}"#,
        );
        let b = event(
            r#"{"type":"mouseMove","x":3,"y":4,"ctrlKey":true,"shiftKey":false,"timestampInMs":9}"#,
        );
        assert_eq!(a, b);
        assert_eq!(a.to_words(), [2.0, 0.0, 3.0, 4.0, 1.0, 0.0, 9.0, 0.0]);
    }

    #[test]
    fn test_middle_click_codes() {
        let press = event(
            r#"{"type":"mouseLeftClick","x":1,"y":2,"ctrlKey":0,"shiftKey":0,"mouseButton":1,"on":1,"timestampInMs":5}"#,
        );
        assert_eq!(press.event_type(), 5);

        let release = event(
            r#"{"type":"mouseLeftClick","x":1,"y":2,"ctrlKey":0,"shiftKey":0,"mouseButton":1,"on":0,"timestampInMs":5}"#,
        );
        assert_eq!(release.event_type(), 6);
        assert_eq!(
            release.kind,
            EventKind::Button {
                button: MouseButton::Middle,
                released: true
            }
        );
    }

    #[test]
    fn test_rejects_out_of_range_modifier() {
        let text =
            r#"{"type":"mouseMove","x":3,"y":4,"ctrlKey":2,"shiftKey":0,"timestampInMs":9}"#;
        assert!(matches!(parse_text(text), Err(InputError::Malformed(_))));
    }

    #[test]
    fn test_rejects_bad_buttons() {
        for button in ["3", "-1", "0.5"] {
            let text = format!(
                r#"{{"type":"mouseLeftClick","x":1,"y":2,"ctrlKey":0,"shiftKey":0,"mouseButton":{},"on":1,"timestampInMs":5}}"#,
                button
            );
            assert!(
                matches!(parse_text(&text), Err(InputError::InvalidButton(_))),
                "button {} accepted",
                button
            );
        }
    }

    #[test]
    fn test_rejects_unknown_and_incomplete_messages() {
        assert!(parse_text(r#"{"type":"keyDown","key":"a"}"#).is_err());
        assert!(parse_text(r#"{"type":"weel","deltaY":"up","timestampInMs":1}"#).is_err());
        assert!(parse_text(r#"{"type":"weel","timestampInMs":1}"#).is_err());
        assert!(parse_text(r#"{"deltaY":1,"timestampInMs":1}"#).is_err());
        assert!(parse_text("not json").is_err());
    }

    #[test]
    fn test_close_message() {
        assert_eq!(parse_text("close").unwrap(), Inbound::Close);
    }

    #[test]
    fn test_dispatch_enqueues_in_order() {
        let queue = CircularQueue::in_process(4).unwrap();
        let first = event(r#"{"type":"weel","deltaY":1,"timestampInMs":1}"#);
        let second = event(
            r#"{"type":"mouseMove","x":3,"y":4,"ctrlKey":0,"shiftKey":0,"timestampInMs":2}"#,
        );
        assert!(dispatch(&queue, &first));
        assert!(dispatch(&queue, &second));
        assert_eq!(queue.dequeue(), Some(first));
        assert_eq!(queue.dequeue(), Some(second));
    }
}

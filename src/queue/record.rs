//! Fixed-width input event records
//!
//! Each record is eight `f64` words, the layout the rendering loop reads:
//!
//! ```text
//! [event_type, wheel_delta, x, y, ctrl, shift, client_timestamp_ms, reserved]
//! ```
//!
//! Event type codes:
//!
//! | code | event |
//! |------|-------|
//! | 1 | wheel |
//! | 2 | mouse move |
//! | 3 / 4 | left press / release |
//! | 5 / 6 | middle press / release |
//! | 7 / 8 | right press / release |

/// Number of `f64` words per record
pub const RECORD_WORDS: usize = 8;
/// Size of one record in bytes
pub const RECORD_BYTES: usize = RECORD_WORDS * std::mem::size_of::<f64>();

const WHEEL_CODE: u8 = 1;
const MOUSE_MOVE_CODE: u8 = 2;

/// Mouse button, indexed the way browsers report `MouseEvent.button`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MouseButton {
    Left = 0,
    Middle = 1,
    Right = 2,
}

impl MouseButton {
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(MouseButton::Left),
            1 => Some(MouseButton::Middle),
            2 => Some(MouseButton::Right),
            _ => None,
        }
    }

    pub fn index(self) -> u8 {
        self as u8
    }
}

/// Kind of input event carried by a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Wheel,
    MouseMove,
    Button { button: MouseButton, released: bool },
}

impl EventKind {
    /// Numeric type code stored in word 0
    pub fn code(self) -> u8 {
        match self {
            EventKind::Wheel => WHEEL_CODE,
            EventKind::MouseMove => MOUSE_MOVE_CODE,
            EventKind::Button { button, released } => {
                (button.index() + 1) * 2 + released as u8 + 1
            }
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            WHEEL_CODE => Some(EventKind::Wheel),
            MOUSE_MOVE_CODE => Some(EventKind::MouseMove),
            3..=8 => {
                let button = MouseButton::from_index((code - 3) / 2)?;
                Some(EventKind::Button {
                    button,
                    released: (code - 3) % 2 == 1,
                })
            }
            _ => None,
        }
    }
}

/// One validated input event
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventRecord {
    pub kind: EventKind,
    pub wheel_delta: f64,
    pub x: f64,
    pub y: f64,
    pub ctrl: bool,
    pub shift: bool,
    /// Client-side event time in milliseconds since the Unix epoch
    pub timestamp_ms: f64,
}

impl EventRecord {
    pub fn wheel(delta: f64, timestamp_ms: f64) -> Self {
        Self {
            kind: EventKind::Wheel,
            wheel_delta: delta,
            x: 0.0,
            y: 0.0,
            ctrl: false,
            shift: false,
            timestamp_ms,
        }
    }

    pub fn mouse_move(x: f64, y: f64, ctrl: bool, shift: bool, timestamp_ms: f64) -> Self {
        Self {
            kind: EventKind::MouseMove,
            wheel_delta: 0.0,
            x,
            y,
            ctrl,
            shift,
            timestamp_ms,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn button(
        button: MouseButton,
        released: bool,
        x: f64,
        y: f64,
        ctrl: bool,
        shift: bool,
        timestamp_ms: f64,
    ) -> Self {
        Self {
            kind: EventKind::Button { button, released },
            wheel_delta: 0.0,
            x,
            y,
            ctrl,
            shift,
            timestamp_ms,
        }
    }

    pub fn event_type(&self) -> u8 {
        self.kind.code()
    }

    pub fn to_words(&self) -> [f64; RECORD_WORDS] {
        [
            self.kind.code() as f64,
            self.wheel_delta,
            self.x,
            self.y,
            self.ctrl as u8 as f64,
            self.shift as u8 as f64,
            self.timestamp_ms,
            0.0,
        ]
    }

    /// Decode a record, rejecting unknown type codes and out-of-range modifiers
    pub fn from_words(words: &[f64; RECORD_WORDS]) -> Option<Self> {
        let code = words[0];
        if code.fract() != 0.0 || !(0.0..=u8::MAX as f64).contains(&code) {
            return None;
        }
        let kind = EventKind::from_code(code as u8)?;
        Some(Self {
            kind,
            wheel_delta: words[1],
            x: words[2],
            y: words[3],
            ctrl: flag_from_word(words[4])?,
            shift: flag_from_word(words[5])?,
            timestamp_ms: words[6],
        })
    }

    pub fn to_bytes(&self) -> [u8; RECORD_BYTES] {
        let mut out = [0u8; RECORD_BYTES];
        for (chunk, word) in out.chunks_exact_mut(8).zip(self.to_words()) {
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        out
    }

    pub fn words_from_bytes(bytes: &[u8; RECORD_BYTES]) -> [f64; RECORD_WORDS] {
        let mut words = [0f64; RECORD_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = f64::from_ne_bytes(raw);
        }
        words
    }
}

fn flag_from_word(word: f64) -> Option<bool> {
    if word == 0.0 {
        Some(false)
    } else if word == 1.0 {
        Some(true)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_button_codes() {
        let press = EventKind::Button {
            button: MouseButton::Middle,
            released: false,
        };
        let release = EventKind::Button {
            button: MouseButton::Middle,
            released: true,
        };
        assert_eq!(press.code(), 5);
        assert_eq!(release.code(), 6);

        let left = EventKind::Button {
            button: MouseButton::Left,
            released: false,
        };
        let right_up = EventKind::Button {
            button: MouseButton::Right,
            released: true,
        };
        assert_eq!(left.code(), 3);
        assert_eq!(right_up.code(), 8);
    }

    #[test]
    fn test_codes_are_distinct_and_decodable() {
        for code in 1..=8u8 {
            let kind = EventKind::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(EventKind::from_code(0), None);
        assert_eq!(EventKind::from_code(9), None);
    }

    #[test]
    fn test_record_layout() {
        let record = EventRecord::mouse_move(10.5, 20.0, true, false, 1234.0);
        assert_eq!(
            record.to_words(),
            [2.0, 0.0, 10.5, 20.0, 1.0, 0.0, 1234.0, 0.0]
        );

        let wheel = EventRecord::wheel(-3.0, 99.0);
        assert_eq!(wheel.to_words()[0], 1.0);
        assert_eq!(wheel.to_words()[1], -3.0);
    }

    #[test]
    fn test_from_words_rejects_bad_modifiers() {
        let words = [2.0, 0.0, 1.0, 1.0, 2.0, 0.0, 0.0, 0.0];
        assert!(EventRecord::from_words(&words).is_none());

        let words = [3.5, 0.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        assert!(EventRecord::from_words(&words).is_none());
    }

    #[test]
    fn test_bytes_preserve_record() {
        let record = EventRecord::button(MouseButton::Right, false, 4.0, 5.0, false, true, 7.0);
        let words = EventRecord::words_from_bytes(&record.to_bytes());
        assert_eq!(EventRecord::from_words(&words), Some(record));
    }
}

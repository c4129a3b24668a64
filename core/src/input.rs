//! Input Router: decodes the wire format accepted by `POST
//! /api/sessions/:id/input` and the `/ws/input` WebSocket into raw bytes for
//! the PTY (spec §4.7). Composite behaviors (Alt+Left/Right, Alt+Backspace,
//! double-Escape) arrive pre-encoded as `Text` from the client and are
//! passed through unchanged — this router does not reinterpret them.

use serde::Deserialize;

/// One input message, matching the JSON body accepted by the HTTP input
/// endpoint: `{"text": "hello\n"}` or `{"key": "arrow_up"}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionInput {
    Text(String),
    Key(NamedKey),
}

/// Closed set of named keys with a canonical byte-sequence mapping. Anything
/// not in this set must be sent as `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedKey {
    Enter,
    Escape,
    Backspace,
    Tab,
    ShiftTab,
    ArrowUp,
    ArrowDown,
    ArrowLeft,
    ArrowRight,
    CtrlEnter,
    ShiftEnter,
    PageUp,
    PageDown,
    Home,
    End,
    Delete,
    F1,
    F2,
    F3,
    F4,
    F5,
    F6,
    F7,
    F8,
    F9,
    F10,
    F11,
    F12,
}

impl NamedKey {
    /// Canonical xterm byte sequence for this key.
    pub fn to_bytes(self) -> &'static [u8] {
        match self {
            NamedKey::Enter => b"\r",
            NamedKey::Escape => b"\x1b",
            NamedKey::Backspace => b"\x7f",
            NamedKey::Tab => b"\t",
            NamedKey::ShiftTab => b"\x1b[Z",
            NamedKey::ArrowUp => b"\x1b[A",
            NamedKey::ArrowDown => b"\x1b[B",
            NamedKey::ArrowRight => b"\x1b[C",
            NamedKey::ArrowLeft => b"\x1b[D",
            // xterm modifyOtherKeys-style sequences; a well-behaved PTY
            // client either consumes these directly or maps CR/LF itself.
            NamedKey::CtrlEnter => b"\n",
            NamedKey::ShiftEnter => b"\x1b\r",
            NamedKey::PageUp => b"\x1b[5~",
            NamedKey::PageDown => b"\x1b[6~",
            NamedKey::Home => b"\x1b[H",
            NamedKey::End => b"\x1b[F",
            NamedKey::Delete => b"\x1b[3~",
            NamedKey::F1 => b"\x1bOP",
            NamedKey::F2 => b"\x1bOQ",
            NamedKey::F3 => b"\x1bOR",
            NamedKey::F4 => b"\x1bOS",
            NamedKey::F5 => b"\x1b[15~",
            NamedKey::F6 => b"\x1b[17~",
            NamedKey::F7 => b"\x1b[18~",
            NamedKey::F8 => b"\x1b[19~",
            NamedKey::F9 => b"\x1b[20~",
            NamedKey::F10 => b"\x1b[21~",
            NamedKey::F11 => b"\x1b[23~",
            NamedKey::F12 => b"\x1b[24~",
        }
    }

    /// Parse a key name as used in the `/ws/input` null-wrapped convention
    /// (same snake_case tokens as the JSON `"key"` field). `None` if `token`
    /// doesn't name a known key.
    fn from_token(token: &str) -> Option<NamedKey> {
        serde_json::from_value(serde_json::Value::String(token.to_string())).ok()
    }
}

impl SessionInput {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            SessionInput::Text(s) => s.into_bytes(),
            SessionInput::Key(k) => k.to_bytes().to_vec(),
        }
    }

    /// Decode a `/ws/input` frame (spec §4.7). A bare payload is raw text
    /// sent straight to the PTY. A payload wrapped in a leading and
    /// trailing NUL byte (`\x00<token>\x00`) names a special key; an
    /// unrecognized token between the NULs is treated as text (the NULs
    /// themselves are stripped, not forwarded).
    pub fn decode_ws_frame(frame: &[u8]) -> Option<SessionInput> {
        if frame.len() >= 2 && frame.first() == Some(&0u8) && frame.last() == Some(&0u8) {
            let token = std::str::from_utf8(&frame[1..frame.len() - 1]).ok()?;
            return Some(match NamedKey::from_token(token) {
                Some(key) => SessionInput::Key(key),
                None => SessionInput::Text(token.to_string()),
            });
        }
        std::str::from_utf8(frame).ok().map(|s| SessionInput::Text(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_passes_through_as_utf8_bytes() {
        let input = SessionInput::Text("hello\n".to_string());
        assert_eq!(input.into_bytes(), b"hello\n");
    }

    #[test]
    fn enter_maps_to_carriage_return() {
        assert_eq!(NamedKey::Enter.to_bytes(), b"\r");
    }

    #[test]
    fn arrow_keys_map_to_csi_sequences() {
        assert_eq!(NamedKey::ArrowUp.to_bytes(), b"\x1b[A");
        assert_eq!(NamedKey::ArrowDown.to_bytes(), b"\x1b[B");
    }

    #[test]
    fn decode_ws_frame_bare_payload_is_text() {
        let decoded = SessionInput::decode_ws_frame(b"hello");
        assert!(matches!(decoded, Some(SessionInput::Text(s)) if s == "hello"));
    }

    #[test]
    fn decode_ws_frame_null_wrapped_known_token_is_key() {
        let decoded = SessionInput::decode_ws_frame(b"\x00arrow_up\x00");
        assert!(matches!(decoded, Some(SessionInput::Key(NamedKey::ArrowUp))));
    }

    #[test]
    fn decode_ws_frame_null_wrapped_unknown_token_is_text() {
        let decoded = SessionInput::decode_ws_frame(b"\x00not_a_key\x00");
        assert!(matches!(decoded, Some(SessionInput::Text(s)) if s == "not_a_key"));
    }

    #[test]
    fn decode_ws_frame_rejects_non_utf8() {
        assert!(SessionInput::decode_ws_frame(&[0xff, 0xfe]).is_none());
    }
}

//! Offer/answer payloads
//!
//! Both directions use the browser's `RTCSessionDescriptionInit` shape:
//! `{"sdp": "...", "type": "offer" | "answer"}`.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

impl SessionDescription {
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp: sdp.into(),
            sdp_type: "answer".to_string(),
        }
    }

    /// Reject anything that is not a non-empty offer
    pub fn validate_offer(&self) -> Result<()> {
        if self.sdp_type != "offer" {
            return Err(AppError::BadRequest(format!(
                "expected an offer, got type '{}'",
                self.sdp_type
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(AppError::BadRequest("empty SDP offer".to_string()));
        }
        Ok(())
    }
}

/// Connection state notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::New => write!(f, "new"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Failed => write!(f, "failed"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let offer: SessionDescription =
            serde_json::from_str(r#"{"sdp":"v=0\r\n","type":"offer"}"#).unwrap();
        assert!(offer.validate_offer().is_ok());

        let answer = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(answer, serde_json::json!({"sdp": "v=0", "type": "answer"}));
    }

    #[test]
    fn test_validate_offer() {
        let answer = SessionDescription::answer("v=0");
        assert!(answer.validate_offer().is_err());

        let empty = SessionDescription {
            sdp: "  ".into(),
            sdp_type: "offer".into(),
        };
        assert!(empty.validate_offer().is_err());
    }
}

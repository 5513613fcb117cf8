//! Call engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// ICE server entry (STUN or TURN)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// Server URLs (`stun:`, `turn:` or `turns:`)
    pub urls: Vec<String>,
    /// TURN username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// TURN credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// STUN server without credentials
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// TURN server with credentials
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// Public STUN servers plus the open relay TURN servers used as relay of
    /// last resort when direct connectivity is blocked
    pub fn defaults() -> Vec<Self> {
        vec![
            Self::stun("stun:stun.l.google.com:19302"),
            Self::stun("stun:stun1.l.google.com:19302"),
            Self::turn(
                "turn:openrelay.metered.ca:80",
                "openrelayproject",
                "openrelayproject",
            ),
            Self::turn(
                "turn:openrelay.metered.ca:443",
                "openrelayproject",
                "openrelayproject",
            ),
            Self::turn(
                "turn:openrelay.metered.ca:443?transport=tcp",
                "openrelayproject",
                "openrelayproject",
            ),
        ]
    }
}

/// Capture-side audio processing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioProcessing {
    /// Acoustic echo cancellation
    pub echo_cancellation: bool,
    /// Background noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioProcessing {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Media constraints for local capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    /// Audio capture settings; `None` disables audio
    pub audio: Option<AudioProcessing>,
    /// Enable camera video
    pub video: bool,
}

impl MediaConstraints {
    /// Audio-only call
    pub fn audio_only() -> Self {
        Self {
            audio: Some(AudioProcessing::default()),
            video: false,
        }
    }

    /// Video call with audio
    pub fn video_call() -> Self {
        Self {
            audio: Some(AudioProcessing::default()),
            video: true,
        }
    }

    /// Check if audio is enabled
    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Check if video is enabled
    pub fn has_video(&self) -> bool {
        self.video
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self::audio_only()
    }
}

/// Call engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Servers used for path discovery
    pub ice_servers: Vec<IceServer>,
    /// Time a transport may take to reach `Connected`
    pub connect_timeout_ms: u64,
    /// Time path discovery may take to complete
    pub ice_gathering_timeout_ms: u64,
    /// Time a `Disconnected` transport may take to recover
    pub disconnected_timeout_ms: u64,
    /// Delay between a terminal status and the reset to idle
    pub status_grace_ms: u64,
    /// Local capture constraints
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: IceServer::defaults(),
            connect_timeout_ms: 30_000,
            ice_gathering_timeout_ms: 15_000,
            disconnected_timeout_ms: 10_000,
            status_grace_ms: 3_000,
            media: MediaConstraints::default(),
        }
    }
}

impl CallConfig {
    /// Connection-establishment timeout
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Path-discovery timeout
    #[must_use]
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gathering_timeout_ms)
    }

    /// Recovery window for a disconnected transport
    #[must_use]
    pub fn disconnected_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnected_timeout_ms)
    }

    /// Grace delay before a terminal status is cleared
    #[must_use]
    pub fn status_grace(&self) -> Duration {
        Duration::from_millis(self.status_grace_ms)
    }

    /// Parse a JSON configuration; missing fields take their defaults
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.ice_gathering_timeout(), Duration::from_secs(15));
        assert_eq!(config.status_grace(), Duration::from_secs(3));
        assert!(config.media.has_audio());
        assert!(!config.media.has_video());
    }

    #[test]
    fn test_default_ice_servers_include_turn_relay() {
        let servers = IceServer::defaults();
        let stun = servers
            .iter()
            .filter(|s| s.urls[0].starts_with("stun:"))
            .count();
        let turn: Vec<_> = servers
            .iter()
            .filter(|s| s.urls[0].starts_with("turn:"))
            .collect();
        assert_eq!(stun, 2);
        assert_eq!(turn.len(), 3);
        assert!(turn.iter().all(|s| s.username.is_some() && s.credential.is_some()));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = CallConfig::from_json(r#"{"connect_timeout_ms": 5000}"#).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.ice_gathering_timeout_ms, 15_000);
        assert_eq!(config.ice_servers.len(), 5);
    }

    #[test]
    fn test_stun_server_omits_credentials() {
        let json = serde_json::to_string(&IceServer::stun("stun:example.org:3478")).unwrap();
        assert!(!json.contains("username"));
        assert!(!json.contains("credential"));
    }
}

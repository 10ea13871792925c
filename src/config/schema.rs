use serde::{Deserialize, Serialize};

use crate::shm::RegionSource;
use crate::video::format::Resolution;

pub use crate::webrtc::config::{TurnServer, WebRtcConfig};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Frame production and MJPEG settings
    pub stream: StreamConfig,
    /// Frame buffer regions
    pub shm: ShmConfig,
    /// Input event queue
    pub queue: QueueConfig,
    /// WebRTC settings
    pub webrtc: WebRtcConfig,
}

/// Web server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub host: String,
    /// Port of the streaming server
    pub webrtc_port: u16,
    /// Port of the input-only server
    pub interaction_port: u16,
    /// Enable HTTPS
    pub https_enabled: bool,
    /// Custom SSL certificate path
    pub ssl_cert_path: Option<String>,
    /// Custom SSL key path
    pub ssl_key_path: Option<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            webrtc_port: 8000,
            interaction_port: 8080,
            https_enabled: false,
            ssl_cert_path: None,
            ssl_key_path: None,
        }
    }
}

/// Stream configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Share one encoded track among all peers
    pub broadcast: bool,
    /// Frames per second of every track
    pub fps: u32,
    /// Serve `/video/mjpeg`
    pub mjpeg_enabled: bool,
    /// JPEG quality (1-100)
    pub jpeg_quality: u32,
    /// Frame size of the in-process buffer when no shared regions are named
    pub in_process_width: u32,
    pub in_process_height: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            broadcast: true,
            fps: 30,
            mjpeg_enabled: false,
            jpeg_quality: 80,
            in_process_width: 640,
            in_process_height: 480,
        }
    }
}

impl StreamConfig {
    pub fn in_process_resolution(&self) -> Resolution {
        Resolution::new(self.in_process_width, self.in_process_height)
    }
}

/// Shared frame buffer region names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShmConfig {
    /// Metadata region (6 x u64)
    pub info_buffer_name: Option<String>,
    /// One image region per slot
    pub image_buffer_names: Vec<String>,
}

impl ShmConfig {
    /// Shared regions are used only when both the metadata and an image region are named
    pub fn is_shared(&self) -> bool {
        self.info_buffer_name.as_deref().is_some_and(|n| !n.is_empty())
            && !self.image_buffer_names.is_empty()
    }

    pub fn info_source(&self) -> RegionSource {
        RegionSource::from_name(self.info_buffer_name.as_deref(), "frame-info")
    }

    pub fn image_sources(&self) -> Vec<RegionSource> {
        self.image_buffer_names
            .iter()
            .enumerate()
            .map(|(i, name)| RegionSource::from_name(Some(name), &format!("frame-image-{}", i)))
            .collect()
    }
}

/// Input event queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Accept input over `/ws`
    pub enabled: bool,
    /// Data region name
    pub buffer_name: Option<String>,
    /// Control region name
    pub head_tail_buffer_name: Option<String>,
    /// Slots in the queue when it is created here
    pub capacity: usize,
    /// Always create the regions instead of attaching
    pub create: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buffer_name: None,
            head_tail_buffer_name: None,
            capacity: 200,
            create: false,
        }
    }
}

impl QueueConfig {
    pub fn buffer_source(&self) -> RegionSource {
        RegionSource::from_name(self.buffer_name.as_deref(), "queue-buffer")
    }

    pub fn head_tail_source(&self) -> RegionSource {
        RegionSource::from_name(self.head_tail_buffer_name.as_deref(), "queue-head-tail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.web.host, "localhost");
        assert_eq!(config.web.webrtc_port, 8000);
        assert_eq!(config.web.interaction_port, 8080);
        assert!(config.stream.broadcast);
        assert_eq!(config.stream.fps, 30);
        assert_eq!(config.stream.jpeg_quality, 80);
        assert_eq!(config.queue.capacity, 200);
        assert!(config.webrtc.stun_servers.is_empty());
    }

    #[test]
    fn test_missing_sections_default() {
        let config: AppConfig = serde_json::from_str(r#"{"stream":{"fps":60}}"#).unwrap();
        assert_eq!(config.stream.fps, 60);
        assert!(config.stream.broadcast);
        assert_eq!(config.web, WebConfig::default());
    }

    #[test]
    fn test_region_sources() {
        let mut shm = ShmConfig::default();
        assert!(!shm.is_shared());
        assert!(!shm.info_source().is_named());

        shm.info_buffer_name = Some("info".into());
        shm.image_buffer_names = vec!["img0".into(), "img1".into()];
        assert!(shm.is_shared());
        assert_eq!(shm.info_source(), RegionSource::Named("info".into()));
        assert_eq!(shm.image_sources()[1], RegionSource::Named("img1".into()));

        let queue = QueueConfig {
            buffer_name: Some(String::new()),
            ..Default::default()
        };
        assert!(!queue.buffer_source().is_named());
    }
}

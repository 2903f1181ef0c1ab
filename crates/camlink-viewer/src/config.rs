use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use camlink_session::SessionConfig;
use camlink_stream::{assembler::Dialect, StreamConfig};

/// Requested stream quality; maps to the geometry the camera understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Quality {
    #[serde(rename = "480p")]
    Q480p,
    #[serde(rename = "720p")]
    Q720p,
    #[serde(rename = "1080p")]
    Q1080p,
}

impl Quality {
    /// (width, height, fps)
    pub fn geometry(self) -> (u32, u32, u32) {
        match self {
            Self::Q480p => (640, 480, 30),
            Self::Q720p => (1280, 720, 30),
            Self::Q1080p => (1920, 1080, 30),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "480p" => Some(Self::Q480p),
            "720p" => Some(Self::Q720p),
            "1080p" => Some(Self::Q1080p),
            _ => None,
        }
    }
}

/// Which fragment layout the camera firmware speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamDialect {
    DeclaredLength,
    MarkerDriven,
}

impl From<StreamDialect> for Dialect {
    fn from(d: StreamDialect) -> Self {
        match d {
            StreamDialect::DeclaredLength => Dialect::DeclaredLength,
            StreamDialect::MarkerDriven => Dialect::MarkerDriven,
        }
    }
}

/// Viewer configuration, loaded from a TOML file.
#[derive(Debug, Deserialize)]
pub struct ViewerConfig {
    /// Camera address on its hotspot network.
    #[serde(default = "default_camera_ip")]
    pub camera_ip: IpAddr,

    /// TCP control port.
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Local UDP port the video stream arrives on.
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_quality")]
    pub quality: Quality,

    #[serde(default = "default_dialect")]
    pub dialect: StreamDialect,

    /// When set, the raw UDP stream is also dumped to this pcap file.
    #[serde(default)]
    pub pcap_path: Option<PathBuf>,
}

fn default_camera_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
}

fn default_tcp_port() -> u16 {
    2223
}

fn default_udp_port() -> u16 {
    2224
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_quality() -> Quality {
    Quality::Q720p
}

fn default_dialect() -> StreamDialect {
    StreamDialect::DeclaredLength
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            camera_ip: default_camera_ip(),
            tcp_port: default_tcp_port(),
            udp_port: default_udp_port(),
            connect_timeout_secs: default_connect_timeout_secs(),
            quality: default_quality(),
            dialect: default_dialect(),
            pcap_path: None,
        }
    }
}

impl ViewerConfig {
    pub fn session_config(&self) -> SessionConfig {
        let (width, height, fps) = self.quality.geometry();
        SessionConfig {
            camera_ip: self.camera_ip,
            control_port: self.tcp_port,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            width,
            height,
            fps,
            ..SessionConfig::default()
        }
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            listen_port: self.udp_port,
            dialect: self.dialect.into(),
            pcap_path: self.pcap_path.clone(),
            ..StreamConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = ViewerConfig::default();
        assert_eq!(config.camera_ip, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(config.tcp_port, 2223);
        assert_eq!(config.udp_port, 2224);
        assert_eq!(config.quality, Quality::Q720p);
        assert_eq!(config.dialect, StreamDialect::DeclaredLength);
    }

    #[test]
    fn config_toml_deserialization() {
        let toml = r#"
            camera_ip = "192.168.42.1"
            tcp_port = 9000
            quality = "1080p"
            dialect = "marker-driven"
            pcap_path = "dump.pcap"
        "#;
        let config: ViewerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.camera_ip.to_string(), "192.168.42.1");
        assert_eq!(config.tcp_port, 9000);
        assert_eq!(config.udp_port, 2224); // default preserved
        assert_eq!(config.quality, Quality::Q1080p);
        assert_eq!(config.dialect, StreamDialect::MarkerDriven);
        assert_eq!(config.pcap_path, Some(PathBuf::from("dump.pcap")));
    }

    #[test]
    fn quality_geometry_mapping() {
        assert_eq!(Quality::Q480p.geometry(), (640, 480, 30));
        assert_eq!(Quality::Q720p.geometry(), (1280, 720, 30));
        assert_eq!(Quality::Q1080p.geometry(), (1920, 1080, 30));
        assert_eq!(Quality::parse("720p"), Some(Quality::Q720p));
        assert_eq!(Quality::parse("4k"), None);
    }
}

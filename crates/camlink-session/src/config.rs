use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Camera address on its hotspot network.
    pub camera_ip: IpAddr,
    /// TCP control port.
    pub control_port: u16,
    pub connect_timeout: Duration,
    /// Keep-alive period; the camera drops idle sessions.
    pub heartbeat_interval: Duration,
    /// Requested stream geometry.
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SessionConfig {
    pub fn camera_addr(&self) -> SocketAddr {
        SocketAddr::new(self.camera_ip, self.control_port)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            camera_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            control_port: 2223,
            connect_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            width: 1280,
            height: 720,
            fps: 30,
        }
    }
}

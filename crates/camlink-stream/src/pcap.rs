//! Pcap-format byte dump of the raw UDP stream, for offline protocol
//! analysis. Each datagram is wrapped in synthetic Ethernet/IPv4/UDP headers
//! so standard capture tools can open the file; only the UDP payload carries
//! real information.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const LINKTYPE_ETHERNET: u32 = 1;
const SNAPLEN: u32 = 65_535;

const ETH_HEADER_LEN: usize = 14;
const IP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Synthetic destination used in the fabricated IP header.
const FAKE_DST_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 100);

pub struct PcapWriter {
    path: PathBuf,
    file: BufWriter<File>,
    dst_port: u16,
    packets: u64,
}

impl PcapWriter {
    /// Create the dump file and write the pcap global header.
    pub fn create(path: &Path, dst_port: u16) -> io::Result<Self> {
        let mut file = BufWriter::new(File::create(path)?);

        file.write_all(&PCAP_MAGIC.to_le_bytes())?;
        file.write_all(&2u16.to_le_bytes())?; // version major
        file.write_all(&4u16.to_le_bytes())?; // version minor
        file.write_all(&0i32.to_le_bytes())?; // thiszone
        file.write_all(&0u32.to_le_bytes())?; // sigfigs
        file.write_all(&SNAPLEN.to_le_bytes())?;
        file.write_all(&LINKTYPE_ETHERNET.to_le_bytes())?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            dst_port,
            packets: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn packet_count(&self) -> u64 {
        self.packets
    }

    /// Append one raw datagram, wrapped in synthetic link/network headers.
    pub fn write_datagram(&mut self, payload: &[u8], src: SocketAddr) -> io::Result<()> {
        let src_ip = match src.ip() {
            IpAddr::V4(ip) => ip,
            // The camera link is IPv4-only; map anything else to a marker.
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };

        let eth = ethernet_header();
        let ip = ip_header(payload.len(), src_ip);
        let udp = udp_header(payload.len(), src.port(), self.dst_port);

        let incl_len = (eth.len() + ip.len() + udp.len() + payload.len()) as u32;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();

        // Per-record header: ts_sec, ts_usec, incl_len, orig_len (LE).
        self.file.write_all(&(now.as_secs() as u32).to_le_bytes())?;
        self.file.write_all(&now.subsec_micros().to_le_bytes())?;
        self.file.write_all(&incl_len.to_le_bytes())?;
        self.file.write_all(&incl_len.to_le_bytes())?;

        self.file.write_all(&eth)?;
        self.file.write_all(&ip)?;
        self.file.write_all(&udp)?;
        self.file.write_all(payload)?;

        self.packets += 1;
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<(PathBuf, u64)> {
        self.file.flush()?;
        Ok((self.path, self.packets))
    }
}

fn ethernet_header() -> [u8; ETH_HEADER_LEN] {
    let mut buf = [0u8; ETH_HEADER_LEN];
    buf[..6].fill(0xFF); // broadcast destination MAC
    buf[6..12].copy_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC]); // fake source
    buf[12..14].copy_from_slice(&0x0800u16.to_be_bytes()); // IPv4 ethertype
    buf
}

fn ip_header(payload_len: usize, src: Ipv4Addr) -> [u8; IP_HEADER_LEN] {
    let total_len = (IP_HEADER_LEN + UDP_HEADER_LEN + payload_len) as u16;
    let mut buf = [0u8; IP_HEADER_LEN];
    buf[0] = 0x45; // version 4, IHL 5
    buf[2..4].copy_from_slice(&total_len.to_be_bytes());
    buf[4..6].copy_from_slice(&0x1234u16.to_be_bytes()); // identification
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // don't fragment
    buf[8] = 64; // TTL
    buf[9] = 17; // UDP
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&FAKE_DST_IP.octets());

    let checksum = ip_checksum(&buf);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());
    buf
}

fn udp_header(payload_len: usize, src_port: u16, dst_port: u16) -> [u8; UDP_HEADER_LEN] {
    let mut buf = [0u8; UDP_HEADER_LEN];
    buf[0..2].copy_from_slice(&src_port.to_be_bytes());
    buf[2..4].copy_from_slice(&dst_port.to_be_bytes());
    buf[4..6].copy_from_slice(&((UDP_HEADER_LEN + payload_len) as u16).to_be_bytes());
    // checksum 0: optional for IPv4
    buf
}

/// 16-bit ones-complement sum over the header (checksum field zeroed).
fn ip_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        let word = u16::from_be_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]) as u32;
        sum += word;
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
    }
    !(sum as u16)
}

//! PROXY protocol header generation.
//!
//! Builds the header that is written to the backend before any relayed
//! bytes, in either the v1 text form or the v2 binary form.
//!
//! v1 wire format: a single line
//! `PROXY <TCP4|TCP6> <src-ip> <dst-ip> <src-port> <dst-port>\r\n`,
//! or `PROXY UNKNOWN\r\n` when the address pair cannot be expressed.
//!
//! v2 wire format (from HAProxy PROXY protocol spec):
//! - 12 bytes signature
//! - 1 byte version and command
//! - 1 byte address family and transport protocol
//! - 2 bytes address length
//! - variable: addresses and ports

use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4, SocketAddrV6};

use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::PppxyError;

/// PROXY protocol v2 signature (12 bytes).
const PROXY_V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Version 2 with PROXY command (high nibble = version, low nibble = command).
const VERSION_COMMAND_PROXY: u8 = 0x21;

/// Version 2 with LOCAL command, used when the addresses are not forwarded.
const VERSION_COMMAND_LOCAL: u8 = 0x20;

/// Address family: AF_UNSPEC.
const AF_UNSPEC: u8 = 0x00;

/// Address family: AF_INET (IPv4).
const AF_INET: u8 = 0x10;

/// Address family: AF_INET6 (IPv6).
const AF_INET6: u8 = 0x20;

/// Transport protocol: UNSPEC.
const TRANSPORT_UNSPEC: u8 = 0x00;

/// Transport protocol: STREAM (TCP).
const TRANSPORT_STREAM: u8 = 0x01;

/// Signature + version/command + family/transport + length.
const V2_FIXED_LEN: usize = 16;

/// Length of IPv4 address block (4 + 4 + 2 + 2 = 12 bytes).
const IPV4_ADDR_LEN: u16 = 12;

/// Length of IPv6 address block (16 + 16 + 2 + 2 = 36 bytes).
const IPV6_ADDR_LEN: u16 = 36;

const V1_UNKNOWN: &str = "PROXY UNKNOWN\r\n";

/// Longest possible v1 line, CRLF included.
const V1_MAX_LEN: usize = 107;

/// Counts formatted bytes without storing them.
struct ByteCount(usize);

impl fmt::Write for ByteCount {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0 += s.len();
        Ok(())
    }
}

/// PROXY protocol version selected for a relay.
///
/// Only constructible from `1` or `2`, so an unsupported version is
/// rejected while the configuration is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "u8")]
pub enum ProtocolVersion {
    /// Human-readable text header.
    V1,
    /// Binary header.
    V2,
}

impl ProtocolVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = PppxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProtocolVersion::V1),
            2 => Ok(ProtocolVersion::V2),
            other => Err(PppxyError::UnsupportedVersion(other)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.as_u8())
    }
}

/// Source/destination pair as it will appear in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressPair {
    /// Both endpoints are IPv4.
    Tcp4 { src: SocketAddrV4, dst: SocketAddrV4 },
    /// Both endpoints are IPv6.
    Tcp6 { src: SocketAddrV6, dst: SocketAddrV6 },
    /// Mixed or otherwise unsupported families.
    Unknown,
}

impl AddressPair {
    /// Classify a connection's endpoints.
    ///
    /// IPv4-mapped IPv6 addresses (what a dual-stack listener reports for
    /// IPv4 clients) are treated as IPv4.
    pub fn from_addrs(src: SocketAddr, dst: SocketAddr) -> Self {
        match (canonical(src), canonical(dst)) {
            (SocketAddr::V4(src), SocketAddr::V4(dst)) => AddressPair::Tcp4 { src, dst },
            (SocketAddr::V6(src), SocketAddr::V6(dst)) => AddressPair::Tcp6 { src, dst },
            _ => AddressPair::Unknown,
        }
    }

    fn family_token(&self) -> &'static str {
        match self {
            AddressPair::Tcp4 { .. } => "TCP4",
            AddressPair::Tcp6 { .. } => "TCP6",
            AddressPair::Unknown => "UNKNOWN",
        }
    }
}

fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}

/// A PROXY protocol header for one forwarded connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: ProtocolVersion,
    pub addresses: AddressPair,
}

impl ProxyHeader {
    /// Create a header for the given connection.
    ///
    /// # Arguments
    /// * `src_addr` - Client address as seen by the relay
    /// * `dst_addr` - Local address the client connected to
    pub fn from_addrs(version: ProtocolVersion, src_addr: SocketAddr, dst_addr: SocketAddr) -> Self {
        Self {
            version,
            addresses: AddressPair::from_addrs(src_addr, dst_addr),
        }
    }

    /// Generate the header bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self.version {
            ProtocolVersion::V1 => self.encode_v1(),
            ProtocolVersion::V2 => self.encode_v2(),
        }
    }

    /// Size of the encoded header in bytes.
    pub fn encoded_len(&self) -> usize {
        match (self.version, &self.addresses) {
            (ProtocolVersion::V1, _) => self.v1_len(),
            (ProtocolVersion::V2, AddressPair::Tcp4 { .. }) => V2_FIXED_LEN + IPV4_ADDR_LEN as usize,
            (ProtocolVersion::V2, AddressPair::Tcp6 { .. }) => V2_FIXED_LEN + IPV6_ADDR_LEN as usize,
            (ProtocolVersion::V2, AddressPair::Unknown) => V2_FIXED_LEN,
        }
    }

    /// Write the whole header and flush.
    ///
    /// Returns the number of header bytes written.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = self.encode();
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(bytes.len())
    }

    fn encode_v1(&self) -> Vec<u8> {
        let mut line = String::with_capacity(V1_MAX_LEN);
        // Writing into a String cannot fail
        let _ = self.write_v1(&mut line);
        line.into_bytes()
    }

    fn v1_len(&self) -> usize {
        let mut count = ByteCount(0);
        let _ = self.write_v1(&mut count);
        count.0
    }

    fn write_v1<W: fmt::Write>(&self, out: &mut W) -> fmt::Result {
        match &self.addresses {
            AddressPair::Tcp4 { src, dst } => write!(
                out,
                "PROXY TCP4 {} {} {} {}\r\n",
                src.ip(),
                dst.ip(),
                src.port(),
                dst.port()
            ),
            AddressPair::Tcp6 { src, dst } => write!(
                out,
                "PROXY TCP6 {} {} {} {}\r\n",
                src.ip(),
                dst.ip(),
                src.port(),
                dst.port()
            ),
            AddressPair::Unknown => out.write_str(V1_UNKNOWN),
        }
    }

    fn encode_v2(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&PROXY_V2_SIGNATURE);

        match &self.addresses {
            AddressPair::Tcp4 { src, dst } => {
                buf.push(VERSION_COMMAND_PROXY);
                buf.push(AF_INET | TRANSPORT_STREAM);
                buf.extend_from_slice(&IPV4_ADDR_LEN.to_be_bytes());
                buf.extend_from_slice(&src.ip().octets());
                buf.extend_from_slice(&dst.ip().octets());
                buf.extend_from_slice(&src.port().to_be_bytes());
                buf.extend_from_slice(&dst.port().to_be_bytes());
            }
            AddressPair::Tcp6 { src, dst } => {
                buf.push(VERSION_COMMAND_PROXY);
                buf.push(AF_INET6 | TRANSPORT_STREAM);
                buf.extend_from_slice(&IPV6_ADDR_LEN.to_be_bytes());
                buf.extend_from_slice(&src.ip().octets());
                buf.extend_from_slice(&dst.ip().octets());
                buf.extend_from_slice(&src.port().to_be_bytes());
                buf.extend_from_slice(&dst.port().to_be_bytes());
            }
            AddressPair::Unknown => {
                // LOCAL command: the receiver uses the real connection endpoints
                buf.push(VERSION_COMMAND_LOCAL);
                buf.push(AF_UNSPEC | TRANSPORT_UNSPEC);
                buf.extend_from_slice(&0u16.to_be_bytes());
            }
        }

        buf
    }
}

impl fmt::Display for ProxyHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.version, self.addresses.family_token())?;
        match &self.addresses {
            AddressPair::Tcp4 { src, dst } => write!(f, " {src} -> {dst}"),
            AddressPair::Tcp6 { src, dst } => write!(f, " {src} -> {dst}"),
            AddressPair::Unknown => Ok(()),
        }
    }
}

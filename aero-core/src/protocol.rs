//! AeroSync wire protocol: discovery messages, handshake hello, file metadata.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::identity::{DeviceId, PublicKey};

/// Current protocol version. Used in announcements and the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Service type carried in every announcement; others are ignored.
pub const SERVICE_TYPE: &str = "_aerosync._tcp";

/// Kind of device, shown next to the display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Laptop,
    #[default]
    Desktop,
    Unknown,
}

impl FromStr for DeviceClass {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "mobile" | "phone" | "android" => DeviceClass::Mobile,
            "tablet" => DeviceClass::Tablet,
            "laptop" => DeviceClass::Laptop,
            "desktop" | "windows" | "mac" | "linux" => DeviceClass::Desktop,
            _ => DeviceClass::Unknown,
        })
    }
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Laptop => "laptop",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Discovery datagrams. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Advertise presence and how to reach us.
    Announce {
        protocol_version: u8,
        service: String,
        device_id: DeviceId,
        public_key: PublicKey,
        display_name: String,
        device_class: DeviceClass,
        /// Partial public-key fingerprint for out-of-band trust verification.
        fingerprint: String,
        listen_port: u16,
        /// Explicit host to dial; when absent the datagram source address is used.
        host: Option<String>,
    },
    /// Liveness heartbeat.
    Heartbeat { device_id: DeviceId },
    /// Graceful leave.
    Leave { device_id: DeviceId },
}

impl Message {
    pub fn device_id(&self) -> DeviceId {
        match self {
            Message::Announce { device_id, .. }
            | Message::Heartbeat { device_id }
            | Message::Leave { device_id } => *device_id,
        }
    }
}

/// First message each side sends on a new transport connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub device_id: DeviceId,
    pub public_key: PublicKey,
    pub display_name: String,
    pub device_class: DeviceClass,
    pub nonce: [u8; 32],
}

/// JSON metadata at the head of every file frame. Only `name` and `size` are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    /// Payload bytes that follow this header.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Whole file size; defaults to `size`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    /// File offset of the first payload byte.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset: u64,
    /// Hex SHA-256 of the whole file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Resume probe: asks the receiver for its confirmed offset. Carries no payload.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resume: bool,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl FileMeta {
    /// Plain `{name, size}` header for a whole file.
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            id: None,
            total: None,
            offset: 0,
            sha256: None,
            resume: false,
        }
    }

    pub fn total(&self) -> u64 {
        self.total.unwrap_or(self.offset.saturating_add(self.size))
    }

    /// Probe sent before resuming job `id` of a file of `total` bytes.
    pub fn resume_probe(name: impl Into<String>, id: impl Into<String>, total: u64) -> Self {
        Self {
            id: Some(id.into()),
            total: Some(total),
            resume: true,
            ..Self::new(name, 0)
        }
    }

    /// Receiver's answer to a probe: the length it has flushed for job `id`.
    pub fn resume_answer(name: impl Into<String>, id: impl Into<String>, offset: u64) -> Self {
        Self {
            id: Some(id.into()),
            offset,
            ..Self::new(name, 0)
        }
    }
}

/// Receiver acknowledgment after a payload.
pub const ACK_OK: [u8; 2] = *b"OK";
/// Receiver rejected the payload (checksum mismatch, cancelled, cannot resume).
pub const ACK_REJECT: [u8; 2] = *b"NO";

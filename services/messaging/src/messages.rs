//! Wire types exchanged over the message bus.
//!
//! Every message is JSON; binary media payloads travel base64-encoded
//! inside their envelope.

use serde::{Deserialize, Serialize};

/// A camera reporting as connected.
pub const CONNECTION_STATUS_ON: u8 = 1;
/// A camera reporting as disconnected or disabled.
pub const CONNECTION_STATUS_OFF: u8 = 0;

/// Per-camera configuration event, keyed by camera UUID on the cameras
/// topic. Only the latest message per camera matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    pub camera_uuid: String,
    #[serde(default)]
    pub main_rtsp_url: String,
    #[serde(default)]
    pub sub_rtsp_url: String,
    /// 1 = connected, 0 = off.
    pub status_code: u8,
    /// Zero means "do not archive".
    #[serde(default)]
    pub archive_retention_days: u32,
}

impl CameraConfig {
    pub fn is_on(&self) -> bool {
        self.status_code == CONNECTION_STATUS_ON
    }
}

/// One encoded media packet from a stream's packet topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPacket {
    /// Producer-assigned epoch milliseconds; non-decreasing per stream.
    pub timestamp: i64,
    /// Opaque encoded bytes, appended verbatim to the fragment file.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// A random-access pointer: where an index point landed inside its
/// fragment file. Keyed by stream UUID on the offsets topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetRecord {
    pub stream_uuid: String,
    /// Days since the Unix epoch.
    pub folder: i64,
    /// Fragment start, seconds since midnight.
    pub file: i64,
    /// Epoch milliseconds of the index point.
    pub timestamp: i64,
    /// Byte position inside the fragment file.
    pub offset: i64,
}

/// Base64 serialization helper for binary payload fields.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

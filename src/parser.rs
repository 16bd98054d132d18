use crate::error::{DecodeError, LineError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::{fmt, str::FromStr};

/// Size of one binary event record on the wire.
pub const FRAME_SIZE: usize = 13;

/// A 6-byte hardware address, rendered as `00:4B:12:3C:04:B0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = raw.trim().split(':');
        for slot in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("'{raw}' has fewer than 6 octets"))?;
            if part.len() != 2 {
                return Err(format!("octet '{part}' in '{raw}' is not two hex digits"));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| format!("octet '{part}' in '{raw}' is not hex"))?;
        }
        if parts.next().is_some() {
            return Err(format!("'{raw}' has more than 6 octets"));
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One deauthentication attack observation reported by a sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeauthEvent {
    attacker_mac: MacAddr,
    sensor_mac: MacAddr,
    rssi: i8,
    /// Host clock at decode time; the sensor has no clock of its own.
    timestamp: DateTime<Utc>,
}

impl DeauthEvent {
    pub fn new(
        attacker_mac: MacAddr,
        sensor_mac: MacAddr,
        rssi: i8,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            attacker_mac,
            sensor_mac,
            rssi,
            timestamp,
        }
    }

    /// Decodes a binary record stamped with the current host time.
    ///
    /// Layout: `[0..6)` attacker MAC, `[6..12)` sensor MAC, `[12]` RSSI as a
    /// two's-complement byte. Any correctly sized buffer is a valid event.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_at(frame, Utc::now())
    }

    pub fn decode_at(frame: &[u8], timestamp: DateTime<Utc>) -> Result<Self, DecodeError> {
        let Ok(frame) = <&[u8; FRAME_SIZE]>::try_from(frame) else {
            return Err(DecodeError::FrameSizeMismatch {
                expected: FRAME_SIZE,
                actual: frame.len(),
            });
        };
        let mut attacker = [0u8; 6];
        let mut sensor = [0u8; 6];
        attacker.copy_from_slice(&frame[0..6]);
        sensor.copy_from_slice(&frame[6..12]);
        Ok(Self {
            attacker_mac: MacAddr(attacker),
            sensor_mac: MacAddr(sensor),
            rssi: i8::from_ne_bytes([frame[12]]),
            timestamp,
        })
    }

    pub fn encode(&self) -> [u8; FRAME_SIZE] {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0..6].copy_from_slice(&self.attacker_mac.0);
        frame[6..12].copy_from_slice(&self.sensor_mac.0);
        frame[12] = self.rssi.to_ne_bytes()[0];
        frame
    }

    pub fn attacker_mac(&self) -> MacAddr {
        self.attacker_mac
    }

    pub fn sensor_mac(&self) -> MacAddr {
        self.sensor_mac
    }

    pub fn rssi(&self) -> i8 {
        self.rssi
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn to_persistence_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A reading from the line-oriented JSON firmware.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RssiReport {
    /// Device-side timestamp, kept verbatim.
    pub timestamp: Value,
    pub rssi: i8,
    pub source_mac: MacAddr,
    pub received_at: DateTime<Utc>,
    /// Fields beyond the required ones.
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawReport {
    timestamp: Option<Value>,
    rssi: Option<i64>,
    source_mac: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl RssiReport {
    pub fn from_line(line: &str) -> Result<Self, LineError> {
        let raw: RawReport = serde_json::from_str(line.trim())?;
        let timestamp = raw
            .timestamp
            .filter(|value| !value.is_null())
            .ok_or(LineError::MissingField("timestamp"))?;
        let rssi = raw.rssi.ok_or(LineError::MissingField("rssi"))?;
        let rssi = i8::try_from(rssi).map_err(|_| LineError::InvalidField {
            field: "rssi",
            reason: format!("{rssi} is outside -128..=127"),
        })?;
        let source_mac = raw
            .source_mac
            .ok_or(LineError::MissingField("source_mac"))?
            .parse()
            .map_err(|reason| LineError::InvalidField {
                field: "source_mac",
                reason,
            })?;
        Ok(Self {
            timestamp,
            rssi,
            source_mac,
            received_at: Utc::now(),
            extra: raw.extra,
        })
    }
}

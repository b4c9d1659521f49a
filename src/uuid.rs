//! Miniserver identifiers
//!
//! Every control, room, category and state channel is addressed by a fixed
//! 16-byte identifier. The wire layout matches the binary state frames: a
//! little-endian u32, two little-endian u16s, then eight raw bytes. The text
//! form is the Miniserver's own `xxxxxxxx-xxxx-xxxx-xxxxxxxxxxxxxxxx`
//! rendering, which is not an RFC 4122 UUID.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::LoxoneError;

/// A 16-byte Miniserver identifier, compared byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uuid([u8; 16]);

impl Uuid {
    /// Wrap raw wire bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Uuid(bytes)
    }

    /// Read an identifier from the first 16 bytes of `slice`.
    ///
    /// Callers guarantee the slice is long enough; state decoding only hands
    /// over full records.
    pub(crate) fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&slice[..16]);
        Uuid(bytes)
    }

    /// The raw wire bytes.
    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d1 = u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        let d2 = u16::from_le_bytes([self.0[4], self.0[5]]);
        let d3 = u16::from_le_bytes([self.0[6], self.0[7]]);
        write!(f, "{d1:08x}-{d2:04x}-{d3:04x}-")?;
        for b in &self.0[8..] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for Uuid {
    type Err = LoxoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || LoxoneError::parsing(format!("malformed identifier: {s:?}"));

        let mut parts = s.split('-');
        let (p1, p2, p3, p4) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), Some(d)) if parts.next().is_none() => (a, b, c, d),
            _ => return Err(malformed()),
        };
        if p1.len() != 8 || p2.len() != 4 || p3.len() != 4 || p4.len() != 16 {
            return Err(malformed());
        }

        let d1 = u32::from_str_radix(p1, 16).map_err(|_| malformed())?;
        let d2 = u16::from_str_radix(p2, 16).map_err(|_| malformed())?;
        let d3 = u16::from_str_radix(p3, 16).map_err(|_| malformed())?;
        let tail = hex::decode(p4).map_err(|_| malformed())?;

        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&d1.to_le_bytes());
        bytes[4..6].copy_from_slice(&d2.to_le_bytes());
        bytes[6..8].copy_from_slice(&d3.to_le_bytes());
        bytes[8..16].copy_from_slice(&tail);
        Ok(Uuid(bytes))
    }
}

impl Serialize for Uuid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Uuid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn text_round_trip() {
        let text = "0f86a2fe-0378-3632-ffff403fb0c34b9e";
        let uuid: Uuid = text.parse().unwrap();
        assert_eq!(uuid.to_string(), text);
    }

    #[test]
    fn wire_bytes_little_endian_prefix() {
        let uuid: Uuid = "0f86a2fe-0378-3632-ffff403fb0c34b9e".parse().unwrap();
        // First u32 is little-endian on the wire.
        assert_eq!(&uuid.as_bytes()[..4], &[0xfe, 0xa2, 0x86, 0x0f]);
        assert_eq!(&uuid.as_bytes()[4..6], &[0x78, 0x03]);
        assert_eq!(uuid.as_bytes()[15], 0x9e);
    }

    #[test]
    fn equality_is_structural() {
        let a = Uuid::from_bytes([7u8; 16]);
        let b = Uuid::from_bytes([7u8; 16]);
        let c = Uuid::from_bytes([8u8; 16]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn rejects_malformed_text() {
        assert!("not-a-uuid".parse::<Uuid>().is_err());
        assert!("0f86a2fe-0378-3632".parse::<Uuid>().is_err());
        assert!("0f86a2fe-0378-3632-ffff403fb0c34b".parse::<Uuid>().is_err());
        assert!("zf86a2fe-0378-3632-ffff403fb0c34b9e".parse::<Uuid>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let uuid: Uuid = "0f86a2fe-0378-3632-ffff403fb0c34b9e".parse().unwrap();
        let json = serde_json::to_string(&uuid).unwrap();
        assert_eq!(json, "\"0f86a2fe-0378-3632-ffff403fb0c34b9e\"");
        let back: Uuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uuid);
    }
}

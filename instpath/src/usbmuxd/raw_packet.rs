// Jackson Coxson

use crate::IdeviceError;

/// Size of the usbmuxd packet header
pub const HEADER_SIZE: usize = 16;

/// A usbmuxd packet
///
/// ```text
/// [length u32 LE][version u32 LE][message u32 LE][tag u32 LE][plist body]
/// ```
/// `length` counts the header as well as the body.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub version: u32,
    pub message: u32,
    pub tag: u32,
    pub plist: plist::Dictionary,
}

/// Parsed usbmuxd header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub size: u32,
    pub version: u32,
    pub message: u32,
    pub tag: u32,
}

impl RawPacket {
    pub fn new(plist: plist::Dictionary, version: u32, message: u32, tag: u32) -> Self {
        Self {
            version,
            message,
            tag,
            plist,
        }
    }

    /// Serializes the packet with an XML body
    pub fn encode(&self) -> Result<Vec<u8>, IdeviceError> {
        let mut body = Vec::new();
        plist::to_writer_xml(&mut body, &self.plist)?;

        let size = (HEADER_SIZE + body.len()) as u32;
        let mut packet = Vec::with_capacity(size as usize);
        packet.extend_from_slice(&size.to_le_bytes());
        packet.extend_from_slice(&self.version.to_le_bytes());
        packet.extend_from_slice(&self.message.to_le_bytes());
        packet.extend_from_slice(&self.tag.to_le_bytes());
        packet.extend_from_slice(&body);
        Ok(packet)
    }
}

impl RawHeader {
    pub fn parse(header: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        Self {
            size: word(0),
            version: word(4),
            message: word(8),
            tag: word(12),
        }
    }

    /// Length of the body following the header
    pub fn body_len(&self) -> Result<usize, IdeviceError> {
        (self.size as usize)
            .checked_sub(HEADER_SIZE)
            .ok_or_else(|| {
                IdeviceError::MalformedMessage(format!(
                    "usbmuxd packet size {} is smaller than its header",
                    self.size
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_describes_packet() {
        let mut dict = plist::Dictionary::new();
        dict.insert("MessageType".into(), "ListDevices".into());
        let raw = RawPacket::new(dict.clone(), 1, 8, 7).encode().unwrap();

        let header = RawHeader::parse(raw[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.size as usize, raw.len());
        assert_eq!((header.version, header.message, header.tag), (1, 8, 7));

        let body: plist::Dictionary = plist::from_bytes(&raw[HEADER_SIZE..]).unwrap();
        assert_eq!(body, dict);
    }

    #[test]
    fn undersized_header_is_malformed() {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = 4;
        assert!(RawHeader::parse(&bytes).body_len().is_err());
    }
}

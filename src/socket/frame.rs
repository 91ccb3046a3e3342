//! Length-prefixed packet framing.
//!
//! A frame is a fixed-size header followed by a body whose length is
//! encoded in the header. The layout is configurable: byte width and
//! offset of the length field, total header length (body offset), byte
//! order, and a hard maximum body length that bounds memory use and
//! rejects malformed length fields before any body byte is read.

use crate::base::error::SockError;

/// Byte order of the length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthOrder {
    BigEndian,
    LittleEndian,
}

/// Layout of a length-prefixed frame.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Width of the length field in bytes: 1, 2, 4, or 8.
    pub length_size: usize,
    /// Offset of the length field within the header.
    pub length_offset: usize,
    /// Offset at which the body begins, i.e. the header length.
    pub body_offset: usize,
    /// Maximum permitted body length.
    pub max_body_len: usize,
    /// Byte order of the length field.
    pub order: LengthOrder,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            length_size: 4,
            length_offset: 0,
            body_offset: 4,
            max_body_len: 2 * 1024 * 1024,
            order: LengthOrder::BigEndian,
        }
    }
}

impl FrameConfig {
    /// Bytes that must be read before the body length is known.
    pub fn header_len(&self) -> usize {
        self.body_offset.max(self.length_offset + self.length_size)
    }

    pub(crate) fn validate(&self) -> Result<(), SockError> {
        if !matches!(self.length_size, 1 | 2 | 4 | 8) {
            return Err(SockError::FrameConfig(format!(
                "unsupported length field width {}",
                self.length_size
            )));
        }
        if self.max_body_len == 0 {
            return Err(SockError::FrameConfig(
                "maximum body length must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Decode the body length from a complete header and check it against
    /// the maximum. `header` must be at least [`header_len`](Self::header_len)
    /// bytes.
    pub(crate) fn decode_body_len(&self, header: &[u8]) -> Result<usize, SockError> {
        debug_assert!(header.len() >= self.header_len());
        let field = &header[self.length_offset..self.length_offset + self.length_size];
        let mut value: u64 = 0;
        match self.order {
            LengthOrder::BigEndian => {
                for b in field {
                    value = (value << 8) | u64::from(*b);
                }
            }
            LengthOrder::LittleEndian => {
                for b in field.iter().rev() {
                    value = (value << 8) | u64::from(*b);
                }
            }
        }
        let length = value as usize;
        if value > self.max_body_len as u64 {
            return Err(SockError::FrameTooLarge {
                length,
                max: self.max_body_len,
            });
        }
        Ok(length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_four_byte_big_endian() {
        let f = FrameConfig::default();
        assert_eq!(f.header_len(), 4);
        assert_eq!(f.decode_body_len(&[0, 0, 1, 2]).unwrap(), 258);
    }

    #[test]
    fn little_endian_field() {
        let f = FrameConfig {
            order: LengthOrder::LittleEndian,
            ..FrameConfig::default()
        };
        assert_eq!(f.decode_body_len(&[2, 1, 0, 0]).unwrap(), 258);
    }

    #[test]
    fn offset_field_and_wider_header() {
        // 2-byte type tag, then a 2-byte length, then 4 reserved bytes.
        let f = FrameConfig {
            length_size: 2,
            length_offset: 2,
            body_offset: 8,
            max_body_len: 1024,
            order: LengthOrder::BigEndian,
        };
        assert_eq!(f.header_len(), 8);
        let header = [0xAA, 0xBB, 0x00, 0x10, 0, 0, 0, 0];
        assert_eq!(f.decode_body_len(&header).unwrap(), 16);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let f = FrameConfig {
            max_body_len: 1024,
            ..FrameConfig::default()
        };
        let header = 2048u32.to_be_bytes();
        match f.decode_body_len(&header) {
            Err(SockError::FrameTooLarge { length, max }) => {
                assert_eq!(length, 2048);
                assert_eq!(max, 1024);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn invalid_width_is_rejected() {
        let f = FrameConfig {
            length_size: 3,
            ..FrameConfig::default()
        };
        assert!(f.validate().is_err());
        assert!(FrameConfig::default().validate().is_ok());
    }
}

//! Bit-level primitives and charset handling shared by the revision encoder and decoder.

use std::str::FromStr;

/// Width of an action code in bits.
pub const ACTION_CODE_BITS: u8 = 3;
/// Width of each block size field in the header.
pub const BLOCK_SIZE_BITS: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DecodingError {
    #[error("invalid header code {0}, expected decoder data")]
    InvalidHeader(u64),
    #[error("unsupported operation code {0}")]
    UnsupportedAction(u64),
    #[error("unexpected end of encoded data")]
    UnexpectedEnd,
    #[error("{0} trailing bytes after end of diff")]
    TrailingData(usize),
    #[error("text payload is not valid {0}")]
    InvalidText(Charset),
    #[error("{action} at {start} with length {length} exceeds buffer of {buffer_len} chars")]
    OffsetOutOfRange {
        action: &'static str,
        start: usize,
        length: usize,
        buffer_len: usize,
    },
    #[error("paste of unknown block {0}")]
    UnknownBlock(u32),
    #[error("invalid base64 payload")]
    Base64(#[from] base64::DecodeError),
    #[error("failed to inflate payload")]
    Inflate(#[source] std::io::Error),
    #[error("failed to read payload")]
    Io(#[source] std::io::Error),
    #[error("stored payload column is {found}, expected {expected}")]
    UnexpectedColumnType {
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("value {value} does not fit into {bits} bits")]
    ValueTooLarge { value: u64, bits: u8 },
    #[error("text cannot be represented in {0}")]
    Unrepresentable(Charset),
    #[error("failed to deflate payload")]
    Deflate(#[source] std::io::Error),
}

/// Reads big-endian bit fields from a byte slice.
pub struct BitReader<'a> {
    data: &'a [u8],
    position: usize, // in bits
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn read(&mut self, bits: u8) -> Result<u64, DecodingError> {
        debug_assert!(bits <= 64);
        if self.position + bits as usize > self.data.len() * 8 {
            return Err(DecodingError::UnexpectedEnd);
        }

        let mut value = 0u64;
        for _ in 0..bits {
            let byte = self.data[self.position / 8];
            let bit = (byte >> (7 - self.position % 8)) & 1;
            value = (value << 1) | bit as u64;
            self.position += 1;
        }
        Ok(value)
    }

    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodingError> {
        if self.position + count * 8 > self.data.len() * 8 {
            return Err(DecodingError::UnexpectedEnd);
        }

        let mut bytes = Vec::with_capacity(count);
        if self.position % 8 == 0 {
            let start = self.position / 8;
            bytes.extend_from_slice(&self.data[start..start + count]);
            self.position += count * 8;
        } else {
            for _ in 0..count {
                bytes.push(self.read(8)? as u8);
            }
        }
        Ok(bytes)
    }

    /// Skips to the next byte boundary and returns the number of bytes left.
    pub fn finish(mut self) -> usize {
        self.position = self.position.div_ceil(8) * 8;
        self.data.len() - self.position / 8
    }
}

/// Writes big-endian bit fields, zero-padding the final byte.
#[derive(Default)]
pub struct BitWriter {
    data: Vec<u8>,
    position: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, value: u64, bits: u8) -> Result<(), EncodingError> {
        if bits < 64 && value >> bits != 0 {
            return Err(EncodingError::ValueTooLarge { value, bits });
        }

        for i in (0..bits).rev() {
            if self.position % 8 == 0 {
                self.data.push(0);
            }
            let bit = ((value >> i) & 1) as u8;
            if let Some(last) = self.data.last_mut() {
                *last |= bit << (7 - self.position % 8);
            }
            self.position += 1;
        }
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), EncodingError> {
        if self.position % 8 == 0 {
            self.data.extend_from_slice(bytes);
            self.position += bytes.len() * 8;
            return Ok(());
        }
        for &byte in bytes {
            self.write(byte as u64, 8)?;
        }
        Ok(())
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Number of bits needed to represent `value`.
pub fn bit_width(value: u64) -> u8 {
    (u64::BITS - value.leading_zeros()) as u8
}

/// Character set of the text payloads inside an encoded diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
    Utf16Be,
    Utf16Le,
}

#[derive(Debug, thiserror::Error)]
#[error("unsupported charset `{0}`")]
pub struct UnknownCharset(pub String);

impl FromStr for Charset {
    type Err = UnknownCharset;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized = name.trim().to_ascii_lowercase().replace('_', "-");
        match normalized.as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => Ok(Charset::Latin1),
            "utf-16" | "utf-16be" | "utf16" | "utf16be" => Ok(Charset::Utf16Be),
            "utf-16le" | "utf16le" => Ok(Charset::Utf16Le),
            _ => Err(UnknownCharset(name.to_string())),
        }
    }
}

impl std::fmt::Display for Charset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Charset::Utf8 => "UTF-8",
            Charset::Latin1 => "ISO-8859-1",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Utf16Le => "UTF-16LE",
        };
        f.write_str(name)
    }
}

impl Charset {
    pub fn decode(self, bytes: Vec<u8>) -> Result<String, DecodingError> {
        match self {
            Charset::Utf8 => String::from_utf8(bytes).map_err(|_| DecodingError::InvalidText(self)),
            Charset::Latin1 => Ok(bytes.into_iter().map(char::from).collect()),
            Charset::Utf16Be | Charset::Utf16Le => {
                if bytes.len() % 2 != 0 {
                    return Err(DecodingError::InvalidText(self));
                }
                let units: Vec<u16> = bytes
                    .chunks_exact(2)
                    .map(|pair| {
                        let pair = [pair[0], pair[1]];
                        if self == Charset::Utf16Be {
                            u16::from_be_bytes(pair)
                        } else {
                            u16::from_le_bytes(pair)
                        }
                    })
                    .collect();
                String::from_utf16(&units).map_err(|_| DecodingError::InvalidText(self))
            }
        }
    }

    pub fn encode(self, text: &str) -> Result<Vec<u8>, EncodingError> {
        match self {
            Charset::Utf8 => Ok(text.as_bytes().to_vec()),
            Charset::Latin1 => text
                .chars()
                .map(|c| u8::try_from(c as u32).map_err(|_| EncodingError::Unrepresentable(self)))
                .collect(),
            Charset::Utf16Be => Ok(text.encode_utf16().flat_map(u16::to_be_bytes).collect()),
            Charset::Utf16Le => Ok(text.encode_utf16().flat_map(u16::to_le_bytes).collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_cross_byte_boundaries() {
        let mut writer = BitWriter::new();
        writer.write(0b101, 3).unwrap();
        writer.write(0x1ff, 9).unwrap();
        writer.write_bytes(b"ok").unwrap();
        writer.write(0, 3).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(3).unwrap(), 0b101);
        assert_eq!(reader.read(9).unwrap(), 0x1ff);
        assert_eq!(reader.read_bytes(2).unwrap(), b"ok");
        assert_eq!(reader.read(3).unwrap(), 0);
        assert_eq!(reader.finish(), 0);
    }

    #[test]
    fn test_reader_reports_truncation() {
        let mut reader = BitReader::new(&[0xff]);
        assert_eq!(reader.read(5).unwrap(), 0b11111);
        assert!(matches!(reader.read(4), Err(DecodingError::UnexpectedEnd)));
    }

    #[test]
    fn test_writer_rejects_oversized_values() {
        let mut writer = BitWriter::new();
        assert!(matches!(
            writer.write(8, 3),
            Err(EncodingError::ValueTooLarge { value: 8, bits: 3 })
        ));
    }

    #[test]
    fn test_zero_width_fields() {
        let mut writer = BitWriter::new();
        writer.write(0, 0).unwrap();
        assert!(writer.into_bytes().is_empty());
        assert_eq!(BitReader::new(&[]).read(0).unwrap(), 0);
    }

    #[test]
    fn test_bit_width() {
        assert_eq!(bit_width(0), 0);
        assert_eq!(bit_width(1), 1);
        assert_eq!(bit_width(255), 8);
        assert_eq!(bit_width(256), 9);
    }

    #[test]
    fn test_charset_names() {
        assert_eq!("UTF-8".parse::<Charset>().unwrap(), Charset::Utf8);
        assert_eq!("utf8".parse::<Charset>().unwrap(), Charset::Utf8);
        assert_eq!("ISO_8859_1".parse::<Charset>().unwrap(), Charset::Latin1);
        assert_eq!("UTF-16".parse::<Charset>().unwrap(), Charset::Utf16Be);
        assert!("EBCDIC".parse::<Charset>().is_err());
    }

    #[test]
    fn test_charset_round_trip() {
        let text = "Größe ✓";
        for charset in [Charset::Utf8, Charset::Utf16Be, Charset::Utf16Le] {
            let bytes = charset.encode(text).unwrap();
            assert_eq!(charset.decode(bytes).unwrap(), text);
        }

        let latin = Charset::Latin1.encode("Größe").unwrap();
        assert_eq!(latin.len(), 5);
        assert_eq!(Charset::Latin1.decode(latin).unwrap(), "Größe");
        assert!(Charset::Latin1.encode("✓").is_err());
    }

    #[test]
    fn test_invalid_utf8_payload() {
        assert!(matches!(
            Charset::Utf8.decode(vec![0xc3]),
            Err(DecodingError::InvalidText(Charset::Utf8))
        ));
    }
}

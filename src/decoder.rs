use std::io::Read;

use base64::Engine;
use flate2::read::ZlibDecoder;

use crate::{
    codec::{BitReader, Charset, DecodingError, ACTION_CODE_BITS, BLOCK_SIZE_BITS},
    diff::{Diff, DiffAction, DiffPart},
};

/// Stored form of an encoded diff, as found in the `Revision` column.
#[derive(Debug, Clone, Copy)]
pub enum EncodedPayload<'a> {
    /// Long-varbinary column.
    Binary(&'a [u8]),
    /// Character column holding the base64 form.
    Text(&'a str),
}

impl EncodedPayload<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            EncodedPayload::Binary(_) => "binary",
            EncodedPayload::Text(_) => "text",
        }
    }
}

/// Field widths declared in the header of an encoded diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BlockSizes {
    pub start: u8,
    pub length: u8,
    pub block: u8,
    pub text_length: u8,
}

#[derive(Debug, Clone, Copy)]
pub struct RevisionDecoder {
    charset: Charset,
    zip_compression: bool,
}

impl RevisionDecoder {
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            zip_compression: false,
        }
    }

    /// Expect payloads that were zlib-compressed before storage.
    pub fn with_zip_compression(mut self, enabled: bool) -> Self {
        self.zip_compression = enabled;
        self
    }

    pub fn charset(&self) -> Charset {
        self.charset
    }

    pub fn decode(&self, payload: EncodedPayload<'_>) -> Result<Diff, DecodingError> {
        match payload {
            EncodedPayload::Binary(bytes) => self.decode_binary(bytes),
            EncodedPayload::Text(text) => self.decode_str(text),
        }
    }

    pub fn decode_str(&self, input: &str) -> Result<Diff, DecodingError> {
        let bytes = base64::engine::general_purpose::STANDARD.decode(input.trim())?;
        self.decode_binary(&bytes)
    }

    pub fn decode_reader(&self, mut input: impl Read) -> Result<Diff, DecodingError> {
        let mut bytes = Vec::new();
        input.read_to_end(&mut bytes).map_err(DecodingError::Io)?;
        self.decode_binary(&bytes)
    }

    pub fn decode_binary(&self, input: &[u8]) -> Result<Diff, DecodingError> {
        if self.zip_compression {
            let mut inflated = Vec::new();
            ZlibDecoder::new(input)
                .read_to_end(&mut inflated)
                .map_err(DecodingError::Inflate)?;
            self.decode_bits(&inflated)
        } else {
            self.decode_bits(input)
        }
    }

    fn decode_bits(&self, input: &[u8]) -> Result<Diff, DecodingError> {
        let mut reader = BitReader::new(input);

        let header = reader.read(ACTION_CODE_BITS)?;
        if header != DiffAction::DecoderData.code() as u64 {
            return Err(DecodingError::InvalidHeader(header));
        }
        let sizes = BlockSizes {
            start: reader.read(BLOCK_SIZE_BITS)? as u8,
            length: reader.read(BLOCK_SIZE_BITS)? as u8,
            block: reader.read(BLOCK_SIZE_BITS)? as u8,
            text_length: reader.read(BLOCK_SIZE_BITS)? as u8,
        };

        let mut diff = Diff::new();
        while let Some(part) = self.decode_part(&mut reader, sizes)? {
            diff.push(part);
        }

        let trailing = reader.finish();
        if trailing > 0 {
            if cfg!(feature = "strict") {
                return Err(DecodingError::TrailingData(trailing));
            }
            tracing::warn!(
                message = "Ignoring trailing data after end of diff",
                trailing
            );
        }

        Ok(diff)
    }

    fn decode_part(
        &self,
        reader: &mut BitReader<'_>,
        sizes: BlockSizes,
    ) -> Result<Option<DiffPart>, DecodingError> {
        let code = reader.read(ACTION_CODE_BITS)?;
        let action = DiffAction::from_code(code as u8)
            .ok_or(DecodingError::UnsupportedAction(code))?;

        let part = match action {
            DiffAction::DecoderData => return Ok(None),
            DiffAction::FullRevisionUncompressed => DiffPart::FullRevision {
                text: self.read_text(reader, sizes)?,
            },
            DiffAction::Insert => DiffPart::Insert {
                start: reader.read(sizes.start)? as usize,
                text: self.read_text(reader, sizes)?,
            },
            DiffAction::Delete => DiffPart::Delete {
                start: reader.read(sizes.start)? as usize,
                length: reader.read(sizes.length)? as usize,
            },
            DiffAction::Replace => DiffPart::Replace {
                start: reader.read(sizes.start)? as usize,
                length: reader.read(sizes.length)? as usize,
                text: self.read_text(reader, sizes)?,
            },
            DiffAction::Cut => DiffPart::Cut {
                start: reader.read(sizes.start)? as usize,
                length: reader.read(sizes.length)? as usize,
                block: reader.read(sizes.block)? as u32,
            },
            DiffAction::Paste => DiffPart::Paste {
                start: reader.read(sizes.start)? as usize,
                block: reader.read(sizes.block)? as u32,
            },
        };
        Ok(Some(part))
    }

    fn read_text(
        &self,
        reader: &mut BitReader<'_>,
        sizes: BlockSizes,
    ) -> Result<String, DecodingError> {
        let byte_length = reader.read(sizes.text_length)? as usize;
        let bytes = reader.read_bytes(byte_length)?;
        self.charset.decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BitWriter;

    // hand-assembled payload, independent of the encoder
    fn header(writer: &mut BitWriter, sizes: [u64; 4]) {
        writer.write(0, 3).unwrap();
        for size in sizes {
            writer.write(size, 5).unwrap();
        }
    }

    #[test]
    fn test_decode_hand_assembled_diff() {
        let mut writer = BitWriter::new();
        header(&mut writer, [4, 3, 0, 3]);
        // insert "D" at 3
        writer.write(2, 3).unwrap();
        writer.write(3, 4).unwrap();
        writer.write(1, 3).unwrap();
        writer.write_bytes(b"D").unwrap();
        // delete 1 char at 0
        writer.write(3, 3).unwrap();
        writer.write(0, 4).unwrap();
        writer.write(1, 3).unwrap();
        writer.write(0, 3).unwrap();

        let diff = RevisionDecoder::new(Charset::Utf8)
            .decode_binary(&writer.into_bytes())
            .unwrap();
        assert_eq!(
            diff.parts(),
            &[
                DiffPart::Insert {
                    start: 3,
                    text: "D".into()
                },
                DiffPart::Delete {
                    start: 0,
                    length: 1
                },
            ]
        );
    }

    #[test]
    fn test_invalid_header() {
        let result = RevisionDecoder::new(Charset::Utf8).decode_binary(&[0b0100_0000, 0, 0, 0]);
        assert!(matches!(result, Err(DecodingError::InvalidHeader(2))));
    }

    #[test]
    fn test_unsupported_action() {
        let mut writer = BitWriter::new();
        header(&mut writer, [1, 1, 1, 1]);
        writer.write(7, 3).unwrap();
        let result = RevisionDecoder::new(Charset::Utf8).decode_binary(&writer.into_bytes());
        assert!(matches!(result, Err(DecodingError::UnsupportedAction(7))));
    }

    #[test]
    fn test_truncated_text_payload() {
        let mut writer = BitWriter::new();
        header(&mut writer, [0, 0, 0, 8]);
        writer.write(1, 3).unwrap();
        writer.write(200, 8).unwrap();
        writer.write_bytes(b"short").unwrap();
        let result = RevisionDecoder::new(Charset::Utf8).decode_binary(&writer.into_bytes());
        assert!(matches!(result, Err(DecodingError::UnexpectedEnd)));
    }

    #[test]
    fn test_missing_end_marker() {
        let mut writer = BitWriter::new();
        header(&mut writer, [2, 2, 0, 0]);
        writer.write(3, 3).unwrap();
        writer.write(1, 2).unwrap();
        writer.write(1, 2).unwrap();
        // 30 bits written, the two padding bits cannot hold a 3 bit code
        let result = RevisionDecoder::new(Charset::Utf8).decode_binary(&writer.into_bytes());
        assert!(matches!(result, Err(DecodingError::UnexpectedEnd)));
    }

    #[test]
    fn test_invalid_base64() {
        let result = RevisionDecoder::new(Charset::Utf8).decode_str("not base64!");
        assert!(matches!(result, Err(DecodingError::Base64(_))));
    }

    #[test]
    fn test_latin1_text_payload() {
        let mut writer = BitWriter::new();
        header(&mut writer, [0, 0, 0, 3]);
        writer.write(1, 3).unwrap();
        writer.write(2, 3).unwrap();
        writer.write_bytes(&[0x47, 0xf6]).unwrap();
        writer.write(0, 3).unwrap();

        let diff = RevisionDecoder::new(Charset::Latin1)
            .decode_binary(&writer.into_bytes())
            .unwrap();
        assert_eq!(diff, Diff::full("Gö"));
    }

    #[test]
    fn test_decode_from_reader() {
        let diff = Diff::from_iter([
            DiffPart::Replace {
                start: 1,
                length: 2,
                text: "ü".into(),
            },
            DiffPart::Insert {
                start: 0,
                text: "[[".into(),
            },
        ]);
        let bytes = crate::encoder::RevisionEncoder::new(Charset::Utf8)
            .with_zip_compression(true)
            .encode_binary(&diff)
            .unwrap();

        let decoded = RevisionDecoder::new(Charset::Utf8)
            .with_zip_compression(true)
            .decode_reader(std::io::Cursor::new(bytes))
            .unwrap();
        assert_eq!(decoded, diff);
    }

    #[test]
    fn test_reader_failure() {
        struct BrokenPipe;

        impl Read for BrokenPipe {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "stream closed",
                ))
            }
        }

        let result = RevisionDecoder::new(Charset::Utf8).decode_reader(BrokenPipe);
        assert!(matches!(result, Err(DecodingError::Io(err)) if err.kind() == std::io::ErrorKind::BrokenPipe));
    }
}

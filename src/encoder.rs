use std::io::Write;

use base64::Engine;
use flate2::{write::ZlibEncoder, Compression};

use crate::{
    codec::{bit_width, BitWriter, Charset, EncodingError, ACTION_CODE_BITS, BLOCK_SIZE_BITS},
    decoder::BlockSizes,
    diff::{Diff, DiffAction, DiffPart},
};

/// Produces the stored form of a [`Diff`], readable by [`crate::decoder::RevisionDecoder`].
#[derive(Debug, Clone, Copy)]
pub struct RevisionEncoder {
    charset: Charset,
    zip_compression: bool,
}

impl RevisionEncoder {
    pub fn new(charset: Charset) -> Self {
        Self {
            charset,
            zip_compression: false,
        }
    }

    pub fn with_zip_compression(mut self, enabled: bool) -> Self {
        self.zip_compression = enabled;
        self
    }

    /// Encodes for a character column (base64 of the binary form).
    pub fn encode_text(&self, diff: &Diff) -> Result<String, EncodingError> {
        let bytes = self.encode_binary(diff)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn encode_binary(&self, diff: &Diff) -> Result<Vec<u8>, EncodingError> {
        let bytes = self.encode_bits(diff)?;
        if !self.zip_compression {
            return Ok(bytes);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&bytes).map_err(EncodingError::Deflate)?;
        encoder.finish().map_err(EncodingError::Deflate)
    }

    fn encode_bits(&self, diff: &Diff) -> Result<Vec<u8>, EncodingError> {
        // text payloads are needed twice, once for sizing and once for writing
        let payloads = diff
            .iter()
            .map(|part| part.text().map(|text| self.charset.encode(text)).transpose())
            .collect::<Result<Vec<_>, _>>()?;

        let mut sizes = BlockSizes {
            start: 0,
            length: 0,
            block: 0,
            text_length: 0,
        };
        for (part, payload) in diff.iter().zip(&payloads) {
            sizes.start = sizes.start.max(bit_width(part.start() as u64));
            sizes.length = sizes.length.max(bit_width(part.length() as u64));
            if let Some(block) = part.block() {
                sizes.block = sizes.block.max(bit_width(block as u64));
            }
            if let Some(payload) = payload {
                sizes.text_length = sizes.text_length.max(bit_width(payload.len() as u64));
            }
        }

        let mut writer = BitWriter::new();
        writer.write(DiffAction::DecoderData.code() as u64, ACTION_CODE_BITS)?;
        for size in [sizes.start, sizes.length, sizes.block, sizes.text_length] {
            writer.write(size as u64, BLOCK_SIZE_BITS)?;
        }

        for (part, payload) in diff.iter().zip(&payloads) {
            writer.write(part.action().code() as u64, ACTION_CODE_BITS)?;
            match part {
                DiffPart::FullRevision { .. } => {}
                DiffPart::Insert { start, .. } => {
                    writer.write(*start as u64, sizes.start)?;
                }
                DiffPart::Delete { start, length } | DiffPart::Replace { start, length, .. } => {
                    writer.write(*start as u64, sizes.start)?;
                    writer.write(*length as u64, sizes.length)?;
                }
                DiffPart::Cut {
                    start,
                    length,
                    block,
                } => {
                    writer.write(*start as u64, sizes.start)?;
                    writer.write(*length as u64, sizes.length)?;
                    writer.write(*block as u64, sizes.block)?;
                }
                DiffPart::Paste { start, block } => {
                    writer.write(*start as u64, sizes.start)?;
                    writer.write(*block as u64, sizes.block)?;
                }
            }
            if let Some(payload) = payload {
                writer.write(payload.len() as u64, sizes.text_length)?;
                writer.write_bytes(payload)?;
            }
        }

        writer.write(DiffAction::DecoderData.code() as u64, ACTION_CODE_BITS)?;
        Ok(writer.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        decoder::{EncodedPayload, RevisionDecoder},
        reconstruction::replay_chain,
        test_support::prelude::*,
    };

    fn sample_diff() -> Diff {
        [
            DiffPart::Replace {
                start: 12,
                length: 3,
                text: "Straße".into(),
            },
            DiffPart::Cut {
                start: 0,
                length: 4,
                block: 2,
            },
            DiffPart::Paste { start: 20, block: 2 },
            DiffPart::Delete {
                start: 1000,
                length: 70000,
            },
            DiffPart::Insert {
                start: 0,
                text: String::new(),
            },
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_decoder_reads_encoder_output() {
        for charset in [Charset::Utf8, Charset::Utf16Le] {
            for zip in [false, true] {
                let encoder = RevisionEncoder::new(charset).with_zip_compression(zip);
                let decoder = RevisionDecoder::new(charset).with_zip_compression(zip);

                let binary = encoder.encode_binary(&sample_diff()).unwrap();
                assert_eq!(
                    decoder.decode(EncodedPayload::Binary(&binary)).unwrap(),
                    sample_diff()
                );

                let text = encoder.encode_text(&sample_diff()).unwrap();
                assert_eq!(
                    decoder.decode(EncodedPayload::Text(&text)).unwrap(),
                    sample_diff()
                );
            }
        }
    }

    #[test]
    fn test_empty_diff_is_header_and_end_marker() {
        let bytes = RevisionEncoder::new(Charset::Utf8)
            .encode_binary(&Diff::new())
            .unwrap();
        // 3 + 4 * 5 + 3 bits
        assert_eq!(bytes.len(), 4);
        assert!(RevisionDecoder::new(Charset::Utf8)
            .decode_binary(&bytes)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unrepresentable_text() {
        let result = RevisionEncoder::new(Charset::Latin1).encode_binary(&Diff::full("€"));
        assert!(matches!(result, Err(EncodingError::Unrepresentable(Charset::Latin1))));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 1000,
            ..ProptestConfig::default()
        })]
        #[test]
        fn stored_chain_replays_to_the_same_text(
            base in "\\PC{0,40}",
            edits in proptest::collection::vec(proptest_support::edit_strategy(), 0..8),
            zip in any::<bool>(),
        ) {
            let chain = proptest_support::chain_from_edits(&base, &edits);
            let encoder = RevisionEncoder::new(Charset::Utf8).with_zip_compression(zip);
            let decoder = RevisionDecoder::new(Charset::Utf8).with_zip_compression(zip);

            let stored: Vec<Diff> = chain
                .iter()
                .map(|diff| decoder.decode_str(&encoder.encode_text(diff).unwrap()).unwrap())
                .collect();
            prop_assert_eq!(replay_chain(&stored).unwrap(), replay_chain(&chain).unwrap());
        }
    }
}

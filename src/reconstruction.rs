//! Replays diff chains into revision texts.
//!
//! All offsets are counted in `char`s and are cumulative within one [`Diff`]: each part
//! addresses the buffer as left behind by the parts before it. Out-of-range offsets are
//! treated as a corrupt chain and never clamped.

use rustc_hash::FxHashMap;

use crate::{
    codec::DecodingError,
    diff::{Diff, DiffPart},
};

/// Role of a stored row within its full-revision run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowKind {
    /// Carries the complete text; any previous text is discarded.
    Full,
    /// Edits without a preceding text, applied against an empty base.
    PartialFirst,
    Partial,
    /// Last edit row of its run.
    PartialLast,
}

impl RowKind {
    /// Classifies row `position` (0-based) of a run of `run_length` rows.
    pub fn classify(diff: &Diff, position: usize, run_length: usize) -> Self {
        if diff.is_full_revision() {
            RowKind::Full
        } else if position == 0 {
            RowKind::PartialFirst
        } else if position + 1 == run_length {
            RowKind::PartialLast
        } else {
            RowKind::Partial
        }
    }
}

/// Applies `diff` to `previous` and returns the resulting text.
///
/// `previous` is `None` for the first row of a chain.
pub fn build_revision(previous: Option<&str>, diff: &Diff) -> Result<String, DecodingError> {
    let mut replayer = match previous {
        Some(text) => ChainReplayer::from_text(text),
        None => ChainReplayer::new(),
    };
    replayer.apply(diff)?;
    Ok(replayer.text())
}

/// Incrementally replays the rows of one chain.
///
/// The buffer is kept as `char`s between rows so that each diff is applied without
/// re-scanning the text for char boundaries.
#[derive(Debug, Default, Clone)]
pub struct ChainReplayer {
    buffer: Vec<char>,
    rows: usize,
}

impl ChainReplayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_text(text: &str) -> Self {
        Self {
            buffer: text.chars().collect(),
            rows: 1,
        }
    }

    /// Number of rows applied so far (a seeded text counts as one).
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn text(&self) -> String {
        self.buffer.iter().collect()
    }

    pub fn into_text(self) -> String {
        self.buffer.into_iter().collect()
    }

    pub fn apply(&mut self, diff: &Diff) -> Result<(), DecodingError> {
        // cut blocks only live for the duration of one diff
        let mut clipboard: FxHashMap<u32, Vec<char>> = FxHashMap::default();

        for part in diff {
            match part {
                DiffPart::FullRevision { text } => {
                    self.buffer.clear();
                    self.buffer.extend(text.chars());
                }
                DiffPart::Insert { start, text } => {
                    self.check_range("insert", *start, 0)?;
                    self.buffer.splice(*start..*start, text.chars());
                }
                DiffPart::Delete { start, length } => {
                    self.check_range("delete", *start, *length)?;
                    self.buffer.drain(*start..*start + *length);
                }
                DiffPart::Replace {
                    start,
                    length,
                    text,
                } => {
                    self.check_range("replace", *start, *length)?;
                    self.buffer.splice(*start..*start + *length, text.chars());
                }
                DiffPart::Cut {
                    start,
                    length,
                    block,
                } => {
                    self.check_range("cut", *start, *length)?;
                    let removed = self.buffer.drain(*start..*start + *length).collect();
                    clipboard.insert(*block, removed);
                }
                DiffPart::Paste { start, block } => {
                    self.check_range("paste", *start, 0)?;
                    let chars = clipboard
                        .remove(block)
                        .ok_or(DecodingError::UnknownBlock(*block))?;
                    self.buffer.splice(*start..*start, chars);
                }
            }
        }

        self.rows += 1;
        Ok(())
    }

    fn check_range(
        &self,
        action: &'static str,
        start: usize,
        length: usize,
    ) -> Result<(), DecodingError> {
        match start.checked_add(length) {
            Some(end) if end <= self.buffer.len() => Ok(()),
            _ => Err(DecodingError::OffsetOutOfRange {
                action,
                start,
                length,
                buffer_len: self.buffer.len(),
            }),
        }
    }
}

/// Reconstructs the text after the last of `diffs`.
pub fn replay_chain<'a>(diffs: impl IntoIterator<Item = &'a Diff>) -> Result<String, DecodingError> {
    let mut replayer = ChainReplayer::new();
    for diff in diffs {
        replayer.apply(diff)?;
    }
    Ok(replayer.into_text())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::prelude::*;

    fn insert(start: usize, text: &str) -> DiffPart {
        DiffPart::Insert {
            start,
            text: text.into(),
        }
    }

    fn delete(start: usize, length: usize) -> DiffPart {
        DiffPart::Delete { start, length }
    }

    #[test]
    fn test_chain_replay() {
        let chain = [
            Diff::full("ABC"),
            Diff::from_iter([insert(3, "D")]),
            Diff::from_iter([delete(0, 1)]),
        ];

        assert_eq!(replay_chain(&chain[..1]).unwrap(), "ABC");
        assert_eq!(replay_chain(&chain[..2]).unwrap(), "ABCD");
        assert_eq!(replay_chain(&chain).unwrap(), "BCD");
    }

    #[test]
    fn test_offsets_are_cumulative() {
        // the second insert is only in range after the first one was applied
        let diff = Diff::from_iter([insert(2, "xyz"), insert(5, "!"), delete(0, 1)]);
        assert_eq!(build_revision(Some("ab"), &diff).unwrap(), "bxyz!");
    }

    #[test]
    fn test_offsets_count_chars() {
        let diff = Diff::from_iter([
            DiffPart::Replace {
                start: 1,
                length: 1,
                text: "ö".into(),
            },
            insert(3, "ß"),
        ]);
        assert_eq!(build_revision(Some("Größe"), &diff).unwrap(), "Göößße");
    }

    #[test]
    fn test_first_row_without_base() {
        let diff = Diff::from_iter([insert(0, "Hello"), insert(5, " World")]);
        assert_eq!(build_revision(None, &diff).unwrap(), "Hello World");

        let with_delete = Diff::from_iter([delete(0, 1)]);
        assert!(matches!(
            build_revision(None, &with_delete),
            Err(DecodingError::OffsetOutOfRange { buffer_len: 0, .. })
        ));
    }

    #[test]
    fn test_full_row_discards_previous() {
        assert_eq!(build_revision(Some("old"), &Diff::full("new")).unwrap(), "new");
    }

    #[test]
    fn test_cut_and_paste() {
        let diff = Diff::from_iter([
            DiffPart::Cut {
                start: 0,
                length: 6,
                block: 1,
            },
            DiffPart::Paste { start: 6, block: 1 },
        ]);
        assert_eq!(build_revision(Some("first second"), &diff).unwrap(), "secondfirst ");
    }

    #[test]
    fn test_paste_requires_cut_in_same_diff() {
        let cut = Diff::from_iter([DiffPart::Cut {
            start: 0,
            length: 1,
            block: 4,
        }]);
        let paste = Diff::from_iter([DiffPart::Paste { start: 0, block: 4 }]);

        let mut replayer = ChainReplayer::from_text("abc");
        replayer.apply(&cut).unwrap();
        assert!(matches!(
            replayer.apply(&paste),
            Err(DecodingError::UnknownBlock(4))
        ));
    }

    #[test]
    fn test_out_of_range_is_not_clamped() {
        let diff = Diff::from_iter([delete(2, 5)]);
        assert!(matches!(
            build_revision(Some("abcd"), &diff),
            Err(DecodingError::OffsetOutOfRange {
                action: "delete",
                start: 2,
                length: 5,
                buffer_len: 4
            })
        ));
        let diff = Diff::from_iter([insert(5, "x")]);
        assert!(build_revision(Some("abcd"), &diff).is_err());
    }

    #[test]
    fn test_row_kinds() {
        let edit = Diff::from_iter([insert(0, "x")]);
        assert_eq!(RowKind::classify(&Diff::full("a"), 0, 3), RowKind::Full);
        assert_eq!(RowKind::classify(&edit, 0, 3), RowKind::PartialFirst);
        assert_eq!(RowKind::classify(&edit, 1, 3), RowKind::Partial);
        assert_eq!(RowKind::classify(&edit, 2, 3), RowKind::PartialLast);

        assert_eq!(RowKind::classify(&Diff::full("b"), 2, 3), RowKind::Full);
        assert_eq!(RowKind::classify(&edit, 0, 1), RowKind::PartialFirst);

        let mut replayer = ChainReplayer::new();
        replayer.apply(&edit).unwrap();
        replayer.apply(&edit).unwrap();
        replayer.apply(&Diff::full("a")).unwrap();
        assert_eq!(replayer.rows(), 3);
        assert_eq!(replayer.text(), "a");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 2000,
            ..ProptestConfig::default()
        })]
        #[test]
        fn replay_is_idempotent(base in "\\PC{0,40}", edits in proptest::collection::vec(proptest_support::edit_strategy(), 0..12)) {
            let chain = proptest_support::chain_from_edits(&base, &edits);

            let first = replay_chain(&chain);
            let second = replay_chain(&chain);
            prop_assert!(first.is_ok());
            prop_assert_eq!(first.unwrap(), second.unwrap());
        }
    }
}

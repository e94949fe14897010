use std::ops::Range;

use imara_diff::{
    intern::{Interner, Token},
    Algorithm,
};

use crate::diff::{Diff, DiffPart};

/// Computes the [`Diff`] that turns one revision text into the next.
///
/// Works on `char` granularity with the histogram algorithm. Hunks are emitted as
/// insert/delete/replace parts with cumulative offsets.
pub struct DiffCalculator {
    interner: Interner<char>,
    old_tokens: Vec<Token>,
    new_tokens: Vec<Token>,
}

impl Default for DiffCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffCalculator {
    pub fn new() -> Self {
        Self {
            interner: Interner::new(256),
            old_tokens: Vec::new(),
            new_tokens: Vec::new(),
        }
    }

    pub fn diff(&mut self, old: &str, new: &str) -> Diff {
        // token buffers are reused across calls, the interner only grows with the alphabet
        self.old_tokens.clear();
        self.new_tokens.clear();
        for c in old.chars() {
            self.old_tokens.push(self.interner.intern(c));
        }
        for c in new.chars() {
            self.new_tokens.push(self.interner.intern(c));
        }
        let new_chars: Vec<char> = new.chars().collect();

        let mut diff = Diff::new();
        let mut shift: isize = 0;
        imara_diff::diff_with_tokens(
            Algorithm::Histogram,
            &self.old_tokens,
            &self.new_tokens,
            self.interner.num_tokens(),
            |before: Range<u32>, after: Range<u32>| {
                let start = (before.start as isize + shift) as usize;
                let length = before.len();
                let text = || -> String {
                    new_chars[after.start as usize..after.end as usize]
                        .iter()
                        .collect()
                };

                let part = match (before.is_empty(), after.is_empty()) {
                    (true, _) => DiffPart::Insert {
                        start,
                        text: text(),
                    },
                    (false, true) => DiffPart::Delete { start, length },
                    (false, false) => DiffPart::Replace {
                        start,
                        length,
                        text: text(),
                    },
                };
                diff.push(part);
                shift += after.len() as isize - before.len() as isize;
            },
        );

        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{reconstruction::build_revision, test_support::prelude::*};

    #[test]
    fn test_identical_texts_produce_empty_diff() {
        let mut calculator = DiffCalculator::new();
        assert!(calculator.diff("same text", "same text").is_empty());
    }

    #[test]
    fn test_simple_edits() {
        let mut calculator = DiffCalculator::new();
        let diff = calculator.diff("ABC", "ABCD");
        assert_eq!(
            diff.parts(),
            &[DiffPart::Insert {
                start: 3,
                text: "D".into()
            }]
        );

        let diff = calculator.diff("ABCD", "BCD");
        assert_eq!(diff.parts(), &[DiffPart::Delete { start: 0, length: 1 }]);
    }

    #[test]
    fn test_multiple_hunks_use_cumulative_offsets() {
        let mut calculator = DiffCalculator::new();
        let old = "one two three four";
        let new = "one 2 three four five";
        let diff = calculator.diff(old, new);
        assert!(diff.len() > 1);
        assert_eq!(build_revision(Some(old), &diff).unwrap(), new);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 5000,
            ..ProptestConfig::default()
        })]
        #[test]
        fn calculated_diff_reproduces_target(old in "(a|b|c| |ä|\n){0,60}", new in "(a|b|c| |ä|\n){0,60}") {
            let mut calculator = DiffCalculator::new();
            let diff = calculator.diff(&old, &new);
            prop_assert_eq!(build_revision(Some(&old), &diff).unwrap(), new);
        }
    }
}

use std::fmt::Debug;

/// Operation codes of the storage format.
///
/// The numeric values are part of the on-disk format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffAction {
    /// Header of an encoded diff, also used as its end marker.
    DecoderData,
    FullRevisionUncompressed,
    Insert,
    Delete,
    Replace,
    Cut,
    Paste,
}

impl DiffAction {
    pub const fn code(self) -> u8 {
        match self {
            DiffAction::DecoderData => 0,
            DiffAction::FullRevisionUncompressed => 1,
            DiffAction::Insert => 2,
            DiffAction::Delete => 3,
            DiffAction::Replace => 4,
            DiffAction::Cut => 5,
            DiffAction::Paste => 6,
        }
    }

    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DiffAction::DecoderData),
            1 => Some(DiffAction::FullRevisionUncompressed),
            2 => Some(DiffAction::Insert),
            3 => Some(DiffAction::Delete),
            4 => Some(DiffAction::Replace),
            5 => Some(DiffAction::Cut),
            6 => Some(DiffAction::Paste),
            _ => None,
        }
    }
}

/// One atomic edit.
///
/// `start` and `length` count `char`s and are relative to the buffer as left by
/// all preceding parts of the same [`Diff`] (cumulative offsets).
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum DiffPart {
    /// Replaces the whole buffer. Only found in the first row of a run.
    FullRevision { text: String },
    Insert { start: usize, text: String },
    Delete { start: usize, length: usize },
    Replace { start: usize, length: usize, text: String },
    /// Removes `length` chars at `start` and parks them under `block`.
    Cut { start: usize, length: usize, block: u32 },
    /// Inserts the chars parked under `block` at `start`.
    Paste { start: usize, block: u32 },
}

impl DiffPart {
    pub fn action(&self) -> DiffAction {
        match self {
            DiffPart::FullRevision { .. } => DiffAction::FullRevisionUncompressed,
            DiffPart::Insert { .. } => DiffAction::Insert,
            DiffPart::Delete { .. } => DiffAction::Delete,
            DiffPart::Replace { .. } => DiffAction::Replace,
            DiffPart::Cut { .. } => DiffAction::Cut,
            DiffPart::Paste { .. } => DiffAction::Paste,
        }
    }

    pub fn start(&self) -> usize {
        match self {
            DiffPart::FullRevision { .. } => 0,
            DiffPart::Insert { start, .. }
            | DiffPart::Delete { start, .. }
            | DiffPart::Replace { start, .. }
            | DiffPart::Cut { start, .. }
            | DiffPart::Paste { start, .. } => *start,
        }
    }

    /// Number of chars of the previous buffer this part consumes.
    pub fn length(&self) -> usize {
        match self {
            DiffPart::Delete { length, .. }
            | DiffPart::Replace { length, .. }
            | DiffPart::Cut { length, .. } => *length,
            _ => 0,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            DiffPart::FullRevision { text }
            | DiffPart::Insert { text, .. }
            | DiffPart::Replace { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn block(&self) -> Option<u32> {
        match self {
            DiffPart::Cut { block, .. } | DiffPart::Paste { block, .. } => Some(*block),
            _ => None,
        }
    }
}

impl Debug for DiffPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiffPart::FullRevision { text } => write!(f, "Full({} chars)", text.chars().count()),
            DiffPart::Insert { start, text } => write!(f, "Insert({start}, {text:?})"),
            DiffPart::Delete { start, length } => write!(f, "Delete({start}, {length})"),
            DiffPart::Replace {
                start,
                length,
                text,
            } => write!(f, "Replace({start}, {length}, {text:?})"),
            DiffPart::Cut {
                start,
                length,
                block,
            } => write!(f, "Cut({start}, {length}, #{block})"),
            DiffPart::Paste { start, block } => write!(f, "Paste({start}, #{block})"),
        }
    }
}

/// Ordered transformation from one revision's text to the next.
///
/// Parts are not commutative and must be applied in sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Diff {
    parts: Vec<DiffPart>,
}

impl Diff {
    pub fn new() -> Self {
        Self::default()
    }

    /// A diff that stores `text` verbatim.
    pub fn full(text: impl Into<String>) -> Self {
        Self {
            parts: vec![DiffPart::FullRevision { text: text.into() }],
        }
    }

    pub fn push(&mut self, part: DiffPart) {
        self.parts.push(part);
    }

    pub fn parts(&self) -> &[DiffPart] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Whether this diff carries a complete revision text rather than edits.
    pub fn is_full_revision(&self) -> bool {
        matches!(self.parts.first(), Some(DiffPart::FullRevision { .. }))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DiffPart> {
        self.parts.iter()
    }
}

impl FromIterator<DiffPart> for Diff {
    fn from_iter<I: IntoIterator<Item = DiffPart>>(iter: I) -> Self {
        Self {
            parts: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for Diff {
    type Item = DiffPart;
    type IntoIter = std::vec::IntoIter<DiffPart>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter()
    }
}

impl<'a> IntoIterator for &'a Diff {
    type Item = &'a DiffPart;
    type IntoIter = std::slice::Iter<'a, DiffPart>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.iter()
    }
}

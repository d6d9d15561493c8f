use serde::{Deserialize, Serialize};

/// A half-open byte range `[start, end)` over the context document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    /// Position in production order (0-based)
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl Span {
    #[must_use]
    pub const fn len(&self) -> usize {
        self.end - self.start
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// Stable identifier derived from production order.
    pub fn id(&self) -> String {
        format!("chunk_{:05}", self.index)
    }

    /// Borrow the spanned text. Spans always sit on char boundaries.
    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        &text[self.start..self.end]
    }
}

/// Smallest char boundary `>= idx` (clamped to `text.len()`).
pub(crate) fn ceil_char_boundary(text: &str, idx: usize) -> usize {
    let mut idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Assemble spans from successive `(start, end)` pairs, numbering them.
pub(crate) fn number(pairs: Vec<(usize, usize)>) -> Vec<Span> {
    pairs
        .into_iter()
        .enumerate()
        .map(|(index, (start, end))| Span { index, start, end })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceil_boundary_skips_into_next_char() {
        let text = "aé b";
        assert_eq!(ceil_char_boundary(text, 2), 3);
        assert_eq!(ceil_char_boundary(text, 1), 1);
        assert_eq!(ceil_char_boundary(text, 99), text.len());
    }

    #[test]
    fn ids_are_zero_padded() {
        let span = Span {
            index: 7,
            start: 0,
            end: 1,
        };
        assert_eq!(span.id(), "chunk_00007");
    }
}

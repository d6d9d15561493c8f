use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, Result};
use crate::span::{ceil_char_boundary, number, Span};
use crate::BoundaryProducer;
use std::time::Instant;

/// Fixed-size windows of `size` bytes stepping by `size - overlap`.
pub struct FixedSizeProducer {
    config: ChunkerConfig,
}

impl FixedSizeProducer {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate().map_err(ChunkerError::invalid_config)?;
        Ok(Self { config })
    }
}

impl BoundaryProducer for FixedSizeProducer {
    fn spans(&self, text: &str, deadline: Option<Instant>) -> Result<Vec<Span>> {
        walk(text, &self.config, deadline, |_, _| None)
    }
}

/// Shared window walk. `preferred_end(start, limit)` may propose an earlier
/// cut inside `(start + overlap, limit]`; anything else is ignored and the
/// fixed (optionally line-aligned) end is used.
///
/// Invariants enforced here for every producer:
/// - the next start is `>= end - overlap`, so adjacent overlap never exceeds
///   the configured overlap;
/// - the next start is `<= end`, so there are no gaps;
/// - the next start is `> start`, so the walk terminates.
pub(crate) fn walk(
    text: &str,
    config: &ChunkerConfig,
    deadline: Option<Instant>,
    mut preferred_end: impl FnMut(usize, usize) -> Option<usize>,
) -> Result<Vec<Span>> {
    if text.is_empty() {
        return Err(ChunkerError::EmptyContent);
    }

    let len = text.len();
    let size = config.size;
    let overlap = config.overlap;
    let mut pairs: Vec<(usize, usize)> = Vec::new();
    let mut start = 0usize;

    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ChunkerError::DeadlineExceeded);
        }
        if pairs.len() >= config.max_chunks {
            return Err(ChunkerError::TooManyChunks {
                produced: pairs.len() + 1,
                limit: config.max_chunks,
            });
        }

        let limit = start.saturating_add(size);
        let end = if limit >= len {
            len
        } else {
            let fixed = fixed_end(text, start, limit, overlap, config.align_to_lines);
            match preferred_end(start, limit) {
                Some(cut) if cut > start + overlap && cut <= limit && text.is_char_boundary(cut) => {
                    cut
                }
                _ => fixed,
            }
        };

        pairs.push((start, end));
        if end >= len {
            break;
        }

        let mut next = ceil_char_boundary(text, end - overlap.min(end));
        if next <= start || next > end {
            next = end;
        }
        start = next;
    }

    Ok(number(pairs))
}

fn fixed_end(text: &str, start: usize, limit: usize, overlap: usize, align: bool) -> usize {
    let end = ceil_char_boundary(text, limit);
    if !align || end >= text.len() {
        return end;
    }

    let min_cut = start + (end - start) / 2;
    match text[start..end].rfind('\n') {
        Some(pos) => {
            let cut = start + pos + 1;
            if cut >= min_cut && cut > start + overlap {
                cut
            } else {
                end
            }
        }
        None => end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn producer(size: usize, overlap: usize, align: bool) -> FixedSizeProducer {
        FixedSizeProducer::new(ChunkerConfig {
            size,
            overlap,
            align_to_lines: align,
            ..ChunkerConfig::default()
        })
        .expect("valid config")
    }

    fn assert_covering(text: &str, spans: &[Span], overlap: usize) -> std::result::Result<(), TestCaseError> {
        prop_assert!(!spans.is_empty());
        prop_assert_eq!(spans[0].start, 0);
        prop_assert_eq!(spans[spans.len() - 1].end, text.len());
        for (i, span) in spans.iter().enumerate() {
            prop_assert_eq!(span.index, i);
            prop_assert!(span.start < span.end);
            prop_assert!(text.is_char_boundary(span.start));
            prop_assert!(text.is_char_boundary(span.end));
        }
        for pair in spans.windows(2) {
            let (prev, next) = (pair[0], pair[1]);
            prop_assert!(next.start <= prev.end, "gap between {:?} and {:?}", prev, next);
            prop_assert!(next.start > prev.start);
            prop_assert!(prev.end - next.start <= overlap);
        }
        Ok(())
    }

    #[test]
    fn exact_windows_without_overlap() {
        let spans = producer(4, 0, false).spans("abcdefghij", None).unwrap();
        let pairs: Vec<(usize, usize)> = spans.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(pairs, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn windows_with_overlap_step_back() {
        let spans = producer(4, 1, false).spans("abcdefghij", None).unwrap();
        let pairs: Vec<(usize, usize)> = spans.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(pairs, vec![(0, 4), (3, 7), (6, 10)]);
    }

    #[test]
    fn line_alignment_cuts_after_newline() {
        let text = "aaaa\nbbbbbb\ncc";
        let spans = producer(8, 0, true).spans(text, None).unwrap();
        assert_eq!(spans[0].slice(text), "aaaa\n");
    }

    #[test]
    fn empty_text_is_rejected() {
        assert!(matches!(
            producer(4, 0, false).spans("", None),
            Err(ChunkerError::EmptyContent)
        ));
    }

    #[test]
    fn max_chunks_is_enforced() {
        let producer = FixedSizeProducer::new(ChunkerConfig {
            size: 2,
            overlap: 0,
            align_to_lines: false,
            max_chunks: 3,
            ..ChunkerConfig::default()
        })
        .unwrap();
        assert!(matches!(
            producer.spans("abcdefgh", None),
            Err(ChunkerError::TooManyChunks { limit: 3, .. })
        ));
    }

    #[test]
    fn expired_deadline_stops_production() {
        let deadline = Instant::now();
        assert!(matches!(
            producer(4, 0, false).spans("abcdefgh", Some(deadline)),
            Err(ChunkerError::DeadlineExceeded)
        ));
    }

    proptest! {
        #[test]
        fn spans_cover_text_and_respect_overlap(
            text in "[a-zé漢\\n ]{1,400}",
            size in 1usize..64,
            overlap_seed in 0usize..64,
            align in any::<bool>(),
        ) {
            let overlap = overlap_seed % size;
            let producer = FixedSizeProducer::new(ChunkerConfig {
                size,
                overlap,
                align_to_lines: align,
                max_chunks: usize::MAX,
                ..ChunkerConfig::default()
            }).unwrap();
            let spans = producer.spans(&text, None).unwrap();
            assert_covering(&text, &spans, overlap)?;
        }
    }
}

use crate::config::ChunkerConfig;
use crate::error::{ChunkerError, Result};
use crate::fixed::walk;
use crate::language::Language;
use crate::sections::parse_sections;
use crate::span::Span;
use crate::BoundaryProducer;
use std::time::Instant;
use tree_sitter::Parser;

/// Windows whose ends snap to the nearest preceding structural boundary: the
/// start of a file section, or the start of a top-level syntax item inside a
/// section whose language has a grammar. Falls back to fixed windows when no
/// boundary lies in the window.
pub struct StructureAwareProducer {
    config: ChunkerConfig,
}

impl StructureAwareProducer {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate().map_err(ChunkerError::invalid_config)?;
        Ok(Self { config })
    }

    /// Sorted, deduplicated candidate cut offsets. Parsing counts against
    /// `deadline` just like span production.
    pub fn boundaries(&self, text: &str, deadline: Option<Instant>) -> Result<Vec<usize>> {
        let mut cuts = Vec::new();
        let mut parsers: Vec<(Language, Parser)> = Vec::new();

        for section in parse_sections(text) {
            let remaining = match deadline {
                Some(deadline) => match deadline.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => Some(left),
                    _ => return Err(ChunkerError::DeadlineExceeded),
                },
                None => None,
            };
            cuts.push(section.header_start);

            let language = Language::from_path(&section.path);
            if !language.supports_ast() {
                continue;
            }
            let parser = match parsers.iter_mut().position(|(lang, _)| *lang == language) {
                Some(idx) => &mut parsers[idx].1,
                None => match new_parser(language) {
                    Ok(parser) => {
                        parsers.push((language, parser));
                        let last = parsers.len() - 1;
                        &mut parsers[last].1
                    }
                    Err(err) => {
                        log::warn!("structure-aware chunking disabled for {}: {err}", section.path);
                        continue;
                    }
                },
            };

            // 0 disables the parser timeout.
            let micros = remaining.map_or(0, |left| {
                u64::try_from(left.as_micros()).unwrap_or(u64::MAX).max(1)
            });
            parser.set_timeout_micros(micros);
            let body = section.body(text);
            let Some(tree) = parser.parse(body, None) else {
                if remaining.is_some() {
                    return Err(ChunkerError::DeadlineExceeded);
                }
                log::debug!("tree-sitter produced no tree for {}", section.path);
                continue;
            };
            let root = tree.root_node();
            let mut cursor = root.walk();
            for child in root.children(&mut cursor) {
                if child.is_extra() || child.start_byte() == 0 {
                    continue;
                }
                cuts.push(section.body_start + start_of_line(body, child.start_byte()));
            }
        }

        cuts.sort_unstable();
        cuts.dedup();
        Ok(cuts)
    }
}

fn new_parser(language: Language) -> Result<Parser> {
    let mut parser = Parser::new();
    parser
        .set_language(&language.tree_sitter_language()?)
        .map_err(|e| ChunkerError::tree_sitter(format!("Failed to set language: {e}")))?;
    Ok(parser)
}

/// Cutting at the start of the item's line keeps indentation and leading
/// attributes on the same side of the cut as the item.
fn start_of_line(body: &str, offset: usize) -> usize {
    body[..offset].rfind('\n').map(|pos| pos + 1).unwrap_or(0)
}

impl BoundaryProducer for StructureAwareProducer {
    fn spans(&self, text: &str, deadline: Option<Instant>) -> Result<Vec<Span>> {
        if text.is_empty() {
            return Err(ChunkerError::EmptyContent);
        }
        let cuts = self.boundaries(text, deadline)?;
        let min_fill = self.config.size / 4;
        walk(text, &self.config, deadline, |start, limit| {
            let upper = cuts.partition_point(|&c| c <= limit);
            let candidate = *cuts[..upper].last()?;
            (candidate >= start + min_fill).then_some(candidate)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render_section_header;

    fn config(size: usize, overlap: usize) -> ChunkerConfig {
        ChunkerConfig {
            size,
            overlap,
            align_to_lines: false,
            ..ChunkerConfig::default()
        }
    }

    fn context() -> String {
        let mut text = String::new();
        text.push_str(&render_section_header("src/lib.rs"));
        text.push_str("fn alpha() {\n    let x = 1;\n}\n\nfn beta() {\n    let y = 2;\n}\n");
        text.push_str(&render_section_header("notes.txt"));
        text.push_str("just some notes that are long enough to matter\n");
        text
    }

    #[test]
    fn boundaries_include_sections_and_items() {
        let text = context();
        let producer = StructureAwareProducer::new(config(64, 0)).unwrap();
        let cuts = producer.boundaries(&text, None).unwrap();

        let beta = text.find("fn beta").unwrap();
        let notes = text.find("### File: notes.txt").unwrap();
        assert!(cuts.contains(&0));
        assert!(cuts.contains(&beta));
        assert!(cuts.contains(&notes));
    }

    #[test]
    fn spans_end_on_item_boundaries_when_possible() {
        let text = context();
        let producer = StructureAwareProducer::new(config(70, 0)).unwrap();
        let spans = producer.spans(&text, None).unwrap();

        let beta = text.find("fn beta").unwrap();
        assert_eq!(spans[0].end, beta);
        assert_eq!(spans.last().unwrap().end, text.len());
        for pair in spans.windows(2) {
            assert!(pair[1].start <= pair[0].end);
        }
    }

    #[test]
    fn expired_deadline_stops_parsing() {
        let producer = StructureAwareProducer::new(config(64, 0)).unwrap();
        assert!(matches!(
            producer.boundaries(&context(), Some(Instant::now())),
            Err(ChunkerError::DeadlineExceeded)
        ));
        assert!(matches!(
            producer.spans(&context(), Some(Instant::now())),
            Err(ChunkerError::DeadlineExceeded)
        ));
    }

    #[test]
    fn text_without_sections_falls_back_to_fixed_windows() {
        let producer = StructureAwareProducer::new(config(4, 1)).unwrap();
        let spans = producer.spans("abcdefghij", None).unwrap();
        let pairs: Vec<(usize, usize)> = spans.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(pairs, vec![(0, 4), (3, 7), (6, 10)]);
    }
}

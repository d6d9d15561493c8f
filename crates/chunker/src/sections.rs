/// Every file in a context document is introduced by a line
/// `### File: <relative path>`.
pub const FILE_HEADER_PREFIX: &str = "### File: ";

/// One file section of a context document, as byte offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSection {
    pub path: String,
    /// Offset of the `### File:` line
    pub header_start: usize,
    /// Offset of the first byte after the header line
    pub body_start: usize,
    /// Offset one past the last byte of the section
    pub end: usize,
}

impl ContextSection {
    pub fn body<'a>(&self, text: &'a str) -> &'a str {
        &text[self.body_start..self.end]
    }

    /// 1-based line number, within the file, of a context offset that falls
    /// inside this section's body.
    pub fn file_line_at(&self, text: &str, offset: usize) -> usize {
        let offset = offset.clamp(self.body_start, self.end);
        text[self.body_start..offset].matches('\n').count() + 1
    }
}

pub fn render_section_header(path: &str) -> String {
    format!("{FILE_HEADER_PREFIX}{path}\n")
}

/// Locate every file section in `text`, in document order.
pub fn parse_sections(text: &str) -> Vec<ContextSection> {
    let mut headers: Vec<(usize, usize, String)> = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        if let Some(path) = line.strip_prefix(FILE_HEADER_PREFIX) {
            let path = path.trim_end_matches(['\n', '\r']).to_string();
            headers.push((offset, offset + line.len(), path));
        }
        offset += line.len();
    }

    let mut sections = Vec::with_capacity(headers.len());
    for (idx, (header_start, body_start, path)) in headers.iter().enumerate() {
        let end = headers
            .get(idx + 1)
            .map(|(next_start, _, _)| *next_start)
            .unwrap_or(text.len());
        sections.push(ContextSection {
            path: path.clone(),
            header_start: *header_start,
            body_start: *body_start,
            end,
        });
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn finds_sections_in_order() {
        let text = format!(
            "{}fn a() {{}}\n{}def b():\n    pass\n",
            render_section_header("src/a.rs"),
            render_section_header("b.py")
        );
        let sections = parse_sections(&text);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].path, "src/a.rs");
        assert_eq!(sections[0].body(&text), "fn a() {}\n");
        assert_eq!(sections[1].path, "b.py");
        assert_eq!(sections[1].end, text.len());
        let body_line_two = sections[1].body_start + "def b():\n".len();
        assert_eq!(sections[1].file_line_at(&text, body_line_two), 2);
    }

    #[test]
    fn text_without_headers_has_no_sections() {
        assert!(parse_sections("plain text\nmore").is_empty());
    }
}

//! The fixed text transform applied to every transcript entry.
//!
//! Four rules, nothing more: fenced blocks, `**bold**`, `` `inline code` `` and
//! line breaks. This is not a markdown parser. The fence rule is non-greedy, so
//! nested fences close at the first inner ```` ``` ````, and an unterminated
//! fence is shown literally until its closing backticks arrive.

use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Prose,
    Code,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    Text(String),
    Strong(String),
    Code(String),
}

impl Span {
    pub fn text(&self) -> &str {
        match self {
            Span::Text(s) | Span::Strong(s) | Span::Code(s) => s,
        }
    }

    fn with_text(&self, text: &str) -> Span {
        match self {
            Span::Text(_) => Span::Text(text.to_string()),
            Span::Strong(_) => Span::Strong(text.to_string()),
            Span::Code(_) => Span::Code(text.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub kind: LineKind,
    pub spans: Vec<Span>,
}

impl Line {
    fn prose() -> Self {
        Self {
            kind: LineKind::Prose,
            spans: Vec::new(),
        }
    }

    fn code(text: &str) -> Self {
        let spans = if text.is_empty() {
            Vec::new()
        } else {
            vec![Span::Code(text.to_string())]
        };
        Self {
            kind: LineKind::Code,
            spans,
        }
    }

    /// Concatenated span text, without styling.
    pub fn plain(&self) -> String {
        self.spans.iter().map(Span::text).collect()
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```(\w*)\n?([\s\S]*?)```").expect("valid fence regex"))
}

fn inline_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\*\*(.*?)\*\*|`([^`]+)`").expect("valid inline regex"))
}

/// Format `text` into display lines.
pub fn format(text: &str) -> Vec<Line> {
    let mut out = LineBuilder::default();
    let mut last = 0;

    for caps in fence_re().captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        out.prose(&text[last..whole.start()]);

        let code = caps.get(2).map_or("", |m| m.as_str());
        out.block(code.strip_suffix('\n').unwrap_or(code));

        last = whole.end();
        // The block already ends the line.
        if text[last..].starts_with('\n') {
            last += 1;
        }
    }
    out.prose(&text[last..]);
    out.finish()
}

#[derive(Default)]
struct LineBuilder {
    lines: Vec<Line>,
    /// The last line is a prose line still accepting spans.
    open: bool,
}

impl LineBuilder {
    fn prose(&mut self, text: &str) {
        let mut last = 0;
        for caps in inline_re().captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            self.span(Span::Text(text[last..whole.start()].to_string()));
            if let Some(bold) = caps.get(1) {
                self.span(Span::Strong(bold.as_str().to_string()));
            } else if let Some(code) = caps.get(2) {
                self.span(Span::Code(code.as_str().to_string()));
            }
            last = whole.end();
        }
        self.span(Span::Text(text[last..].to_string()));
    }

    /// Append a span to the open line, breaking lines at every `\n`.
    fn span(&mut self, span: Span) {
        for (i, piece) in span.text().split('\n').enumerate() {
            if i > 0 {
                self.line_break();
            }
            if !piece.is_empty() {
                self.append(span.with_text(piece));
            }
        }
    }

    fn append(&mut self, span: Span) {
        if !self.open {
            self.lines.push(Line::prose());
            self.open = true;
        }
        let Some(line) = self.lines.last_mut() else { return };
        match (line.spans.last_mut(), &span) {
            (Some(Span::Text(prev)), Span::Text(next)) => prev.push_str(next),
            _ => line.spans.push(span),
        }
    }

    fn line_break(&mut self) {
        if !self.open {
            self.lines.push(Line::prose());
        }
        self.lines.push(Line::prose());
        self.open = true;
    }

    fn block(&mut self, code: &str) {
        // A break right before the fence is absorbed by the block itself.
        if self.open && self.lines.last().is_some_and(|l| l.spans.is_empty()) {
            self.lines.pop();
        }
        self.lines.extend(code.split('\n').map(Line::code));
        self.open = false;
    }

    fn finish(mut self) -> Vec<Line> {
        if self.lines.is_empty() {
            self.lines.push(Line::prose());
        }
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(lines: &[Line]) -> Vec<String> {
        lines.iter().map(Line::plain).collect()
    }

    #[test]
    fn test_plain_text_single_line() {
        let lines = format("Hi there!");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].spans, vec![Span::Text("Hi there!".to_string())]);
    }

    #[test]
    fn test_bold_and_inline_code() {
        let lines = format("use **care** with `unwrap`");
        assert_eq!(
            lines[0].spans,
            vec![
                Span::Text("use ".to_string()),
                Span::Strong("care".to_string()),
                Span::Text(" with ".to_string()),
                Span::Code("unwrap".to_string()),
            ]
        );
    }

    #[test]
    fn test_newlines_break_lines() {
        let lines = format("one\ntwo\n\nthree");
        assert_eq!(plain(&lines), vec!["one", "two", "", "three"]);
        assert!(lines.iter().all(|l| l.kind == LineKind::Prose));
    }

    #[test]
    fn test_bold_does_not_cross_newline() {
        let lines = format("**a\nb**");
        assert_eq!(plain(&lines), vec!["**a", "b**"]);
        assert!(lines.iter().flat_map(|l| &l.spans).all(|s| matches!(s, Span::Text(_))));
    }

    #[test]
    fn test_fenced_block() {
        let lines = format("Example:\n```rust\nfn main() {}\nlet x = 1;\n```\nDone.");
        assert_eq!(plain(&lines), vec!["Example:", "fn main() {}", "let x = 1;", "Done."]);
        assert_eq!(lines[0].kind, LineKind::Prose);
        assert_eq!(lines[1].kind, LineKind::Code);
        assert_eq!(lines[2].kind, LineKind::Code);
        assert_eq!(lines[3].kind, LineKind::Prose);
    }

    #[test]
    fn test_fence_content_is_not_styled() {
        let lines = format("```\n**not bold**\n```");
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].kind, LineKind::Code);
        assert_eq!(lines[0].spans, vec![Span::Code("**not bold**".to_string())]);
    }

    #[test]
    fn test_unterminated_fence_is_literal() {
        let lines = format("```py\nprint(1)");
        assert_eq!(plain(&lines), vec!["```py", "print(1)"]);
        assert!(lines.iter().all(|l| l.kind == LineKind::Prose));
    }

    #[test]
    fn test_empty_input() {
        let lines = format("");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].spans.is_empty());
    }
}

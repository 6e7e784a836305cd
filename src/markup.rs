//! Splits message text into plain runs, inline code and fenced code blocks.
//!
//! The parser is a pure function of its input and is re-run on every growth
//! of a streamed message, so a fence only becomes a [`Segment::CodeBlock`]
//! once its closing marker has arrived. Until then the fence and everything
//! after it stays plain text.

use std::ops::Range;

pub const DEFAULT_LANGUAGE: &str = "text";

const FENCE: &str = "```";
const TICK: char = '`';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    PlainText(String),
    InlineCode(String),
    CodeBlock { language: String, content: String },
}

impl Segment {
    pub fn plain(content: impl Into<String>) -> Self {
        Segment::PlainText(content.into())
    }

    pub fn inline(content: impl Into<String>) -> Self {
        Segment::InlineCode(content.into())
    }

    pub fn code_block(language: impl Into<String>, content: impl Into<String>) -> Self {
        Segment::CodeBlock { language: language.into(), content: content.into() }
    }

    pub fn is_code_block(&self) -> bool {
        matches!(self, Segment::CodeBlock { .. })
    }
}

/// A segment together with the byte range of the source it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub segment: Segment,
    pub span: Range<usize>,
}

pub fn parse(text: &str) -> Vec<Segment> {
    parse_spanned(text).into_iter().map(|s| s.segment).collect()
}

/// Like [`parse`], keeping source ranges. The ranges are contiguous and
/// cover `text` exactly.
pub fn parse_spanned(text: &str) -> Vec<Spanned> {
    let mut out = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = text[cursor..].find(FENCE) {
        let open = cursor + rel;
        let body_start = open + FENCE.len();
        let Some(rel_close) = text[body_start..].find(FENCE) else {
            scan_inline(text, cursor..open, &mut out);
            push_plain(&mut out, text, open..text.len());
            return out;
        };
        let close = body_start + rel_close;
        let end = close + FENCE.len();

        scan_inline(text, cursor..open, &mut out);
        out.push(Spanned { segment: code_block(&text[body_start..close]), span: open..end });
        cursor = end;
    }

    scan_inline(text, cursor..text.len(), &mut out);
    out
}

fn code_block(body: &str) -> Segment {
    let (language, content) = match body.find('\n') {
        Some(nl) => (language_tag(&body[..nl]), &body[nl + 1..]),
        None => (DEFAULT_LANGUAGE, body),
    };
    Segment::code_block(language, content.trim())
}

fn language_tag(info: &str) -> &str {
    match info.split_whitespace().next() {
        Some(tag) if tag.chars().all(|c| c.is_ascii_alphanumeric() || "_+-#.".contains(c)) => tag,
        _ => DEFAULT_LANGUAGE,
    }
}

/// Finds `` `code` `` spans inside a region that holds no fences.
fn scan_inline(text: &str, region: Range<usize>, out: &mut Vec<Spanned>) {
    let mut plain_start = region.start;
    let mut pos = region.start;

    while let Some(rel) = text[pos..region.end].find(TICK) {
        let open = pos + rel;
        let Some(rel_close) = text[open + 1..region.end].find(TICK) else {
            break;
        };
        let close = open + 1 + rel_close;
        if close == open + 1 {
            // "``" has no content; the second tick may still open a span.
            pos = close;
            continue;
        }
        push_plain(out, text, plain_start..open);
        out.push(Spanned {
            segment: Segment::inline(&text[open + 1..close]),
            span: open..close + 1,
        });
        pos = close + 1;
        plain_start = pos;
    }

    push_plain(out, text, plain_start..region.end);
}

fn push_plain(out: &mut Vec<Spanned>, text: &str, range: Range<usize>) {
    if range.is_empty() {
        return;
    }
    if let Some(Spanned { segment: Segment::PlainText(content), span }) = out.last_mut() {
        if span.end == range.start {
            content.push_str(&text[range.clone()]);
            span.end = range.end;
            return;
        }
    }
    out.push(Spanned { segment: Segment::plain(&text[range.clone()]), span: range });
}

/// Re-parses a growing message without rescanning what can no longer change.
///
/// Everything up to the end of the last closed fence is fixed once the text
/// only grows, so [`update`](Self::update) parses just the remainder. A
/// snapshot that is not an extension of the previous one resets the cache.
#[derive(Debug, Default)]
pub struct StreamingMarkup {
    text: String,
    segments: Vec<Spanned>,
    stable_len: usize,
    stable_end: usize,
}

impl StreamingMarkup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.text.clear();
        self.segments.clear();
        self.stable_len = 0;
        self.stable_end = 0;
    }

    /// Returns the segments of `text`, identical to [`parse_spanned`].
    pub fn update(&mut self, text: &str) -> &[Spanned] {
        if text.starts_with(self.text.as_str()) {
            self.text.push_str(&text[self.text.len()..]);
        } else {
            self.reset();
            self.text.push_str(text);
        }

        let offset = self.stable_end;
        self.segments.truncate(self.stable_len);
        self.segments.extend(parse_spanned(&self.text[offset..]).into_iter().map(|mut s| {
            s.span = s.span.start + offset..s.span.end + offset;
            s
        }));

        if let Some(last_block) = self.segments.iter().rposition(|s| s.segment.is_code_block()) {
            self.stable_len = last_block + 1;
            self.stable_end = self.segments[last_block].span.end;
        }
        &self.segments
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter().map(|s| &s.segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn concat_sources(text: &str) -> String {
        parse_spanned(text).iter().map(|s| &text[s.span.clone()]).collect()
    }

    #[test]
    fn mixed_inline_and_fenced() {
        let text = "see `x=1` and then:\n```python\nprint(1)\n```";
        assert_eq!(
            parse(text),
            vec![
                Segment::plain("see "),
                Segment::inline("x=1"),
                Segment::plain(" and then:\n"),
                Segment::code_block("python", "print(1)"),
            ]
        );
    }

    #[test]
    fn empty_input_has_no_segments() {
        assert!(parse("").is_empty());
    }

    #[test]
    fn plain_text_only() {
        assert_eq!(parse("just words\nand lines"), vec![Segment::plain("just words\nand lines")]);
    }

    #[test]
    fn missing_or_odd_language_defaults_to_text() {
        assert_eq!(parse("```\nls -la\n```"), vec![Segment::code_block("text", "ls -la")]);
        assert_eq!(parse("```{weird}\nx\n```"), vec![Segment::code_block("text", "x")]);
        assert_eq!(parse("```print(1)```"), vec![Segment::code_block("text", "print(1)")]);
        assert_eq!(parse("```c++ main\nint x;\n```"), vec![Segment::code_block("c++", "int x;")]);
    }

    #[test]
    fn text_after_block_continues_scanning() {
        let text = "```rust\nfn a() {}\n```\nthen `b` and\n```\nc\n```tail";
        assert_eq!(
            parse(text),
            vec![
                Segment::code_block("rust", "fn a() {}"),
                Segment::plain("\nthen "),
                Segment::inline("b"),
                Segment::plain(" and\n"),
                Segment::code_block("text", "c"),
                Segment::plain("tail"),
            ]
        );
    }

    #[test]
    fn unterminated_fence_stays_plain() {
        let text = "intro `a`\n```python\nprint(`x`)\n";
        let segments = parse(text);
        assert_eq!(
            segments,
            vec![
                Segment::plain("intro "),
                Segment::inline("a"),
                Segment::plain("\n```python\nprint(`x`)\n"),
            ]
        );
        assert!(!segments.iter().any(Segment::is_code_block));
    }

    #[test]
    fn unterminated_fence_after_closed_block() {
        let text = "```js\n1\n```\nmore\n```py\n2";
        assert_eq!(
            parse(text),
            vec![Segment::code_block("js", "1"), Segment::plain("\nmore\n```py\n2")]
        );
    }

    #[test]
    fn lone_and_empty_backticks_are_plain() {
        assert_eq!(parse("a ` b"), vec![Segment::plain("a ` b")]);
        assert_eq!(parse("a `` b"), vec![Segment::plain("a `` b")]);
        assert_eq!(
            parse("``a`"),
            vec![Segment::plain("`"), Segment::inline("a")]
        );
    }

    #[test]
    fn inline_code_may_span_lines() {
        assert_eq!(
            parse("x `a\nb` y"),
            vec![Segment::plain("x "), Segment::inline("a\nb"), Segment::plain(" y")]
        );
    }

    #[test]
    fn sources_concatenate_back_to_input() {
        let samples = [
            "",
            "plain",
            "see `x=1` and then:\n```python\nprint(1)\n```",
            "``````",
            "a```b```c```d",
            "`one` `two``three`",
            "```rust\nlet s = \"`\";\n```\n`tail",
            "caf\u{e9} `\u{1f980}` ```\u{e9}\n\u{1f980}\n```",
        ];
        for text in samples {
            assert_eq!(concat_sources(text), text, "input {text:?}");
        }
    }

    #[test]
    fn every_prefix_is_lossless_and_never_has_open_blocks() {
        let text = "Here:\n```python\ndef f():\n    return `x`\n```\nand `inline` done";
        let close_end = text.rfind("```").unwrap() + 3;
        for (i, _) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
            let prefix = &text[..i];
            assert_eq!(concat_sources(prefix), prefix);
            let has_block = parse(prefix).iter().any(Segment::is_code_block);
            assert_eq!(has_block, i >= close_end, "prefix length {i}");
        }
    }

    #[test]
    fn parse_is_deterministic() {
        let text = "x `y` ```z\nw\n``` v";
        assert_eq!(parse(text), parse(text));
    }

    #[test]
    fn streaming_markup_matches_full_parse_on_every_prefix() {
        let text = "Intro `a`.\n```rust\nfn main() {}\n```\nMid `b`\n```\nplain\n```\nEnd ```py\nx";
        let mut cache = StreamingMarkup::new();
        for (i, _) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
            let prefix = &text[..i];
            assert_eq!(cache.update(prefix), parse_spanned(prefix).as_slice(), "prefix length {i}");
        }
        assert_eq!(cache.segments().cloned().collect::<Vec<_>>(), parse(text));
    }

    #[test]
    fn streaming_markup_resets_on_rewrite() {
        let mut cache = StreamingMarkup::new();
        cache.update("```a\n1\n```tail");
        let rewritten = "other `text`";
        assert_eq!(cache.update(rewritten), parse_spanned(rewritten).as_slice());
    }
}

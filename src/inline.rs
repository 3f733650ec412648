use regex::Regex;
use std::sync::LazyLock;

static INLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"`([^`]+)`|\*\*([^*]+)\*\*").expect("valid inline span regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineSpan {
    Text(String),
    Code(String),
    Bold(String),
}

impl InlineSpan {
    pub fn text(&self) -> &str {
        match self {
            InlineSpan::Text(s) | InlineSpan::Code(s) | InlineSpan::Bold(s) => s,
        }
    }
}

/// Splits one line into plain text, inline code and bold segments.
///
/// Unmatched delimiters stay in the surrounding `Text` segment, so nothing in
/// the line is ever dropped.
pub fn tokenize_inline(line: &str) -> Vec<InlineSpan> {
    let mut spans = Vec::new();
    let mut last = 0usize;
    for caps in INLINE_RE.captures_iter(line) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() > last {
            spans.push(InlineSpan::Text(line[last..whole.start()].to_string()));
        }
        if let Some(code) = caps.get(1) {
            spans.push(InlineSpan::Code(code.as_str().to_string()));
        } else if let Some(bold) = caps.get(2) {
            spans.push(InlineSpan::Bold(bold.as_str().to_string()));
        }
        last = whole.end();
    }
    if last < line.len() {
        spans.push(InlineSpan::Text(line[last..].to_string()));
    }
    spans
}

pub fn plain_text(spans: &[InlineSpan]) -> String {
    spans.iter().map(InlineSpan::text).collect()
}

#[cfg(test)]
mod tests {
    use super::{plain_text, tokenize_inline, InlineSpan};

    fn with_delimiters(spans: &[InlineSpan]) -> String {
        spans
            .iter()
            .map(|span| match span {
                InlineSpan::Text(s) => s.clone(),
                InlineSpan::Code(s) => format!("`{s}`"),
                InlineSpan::Bold(s) => format!("**{s}**"),
            })
            .collect()
    }

    #[test]
    fn plain_line_is_single_text_span() {
        let spans = tokenize_inline("just words here");
        assert_eq!(spans, vec![InlineSpan::Text("just words here".to_string())]);
    }

    #[test]
    fn empty_line_has_no_spans() {
        assert!(tokenize_inline("").is_empty());
    }

    #[test]
    fn code_and_bold_are_split_in_order() {
        let spans = tokenize_inline("call `enqueue()` on the **default** queue");
        assert_eq!(
            spans,
            vec![
                InlineSpan::Text("call ".to_string()),
                InlineSpan::Code("enqueue()".to_string()),
                InlineSpan::Text(" on the ".to_string()),
                InlineSpan::Bold("default".to_string()),
                InlineSpan::Text(" queue".to_string()),
            ]
        );
    }

    #[test]
    fn unterminated_delimiters_stay_literal() {
        let line = "a `dangling tick and **open bold";
        let spans = tokenize_inline(line);
        assert_eq!(spans, vec![InlineSpan::Text(line.to_string())]);
    }

    #[test]
    fn bold_inside_code_is_not_styled() {
        let spans = tokenize_inline("`**not bold**` after");
        assert_eq!(spans[0], InlineSpan::Code("**not bold**".to_string()));
        assert_eq!(spans[1], InlineSpan::Text(" after".to_string()));
    }

    #[test]
    fn delimiters_reassemble_to_input() {
        for line in [
            "**a** and `b` and ``",
            "x ** y ** z",
            "`one` `two`**three**",
            "trailing `",
        ] {
            assert_eq!(with_delimiters(&tokenize_inline(line)), line);
        }
    }

    #[test]
    fn plain_text_strips_delimiters() {
        let spans = tokenize_inline("use **`Queue`** now");
        assert_eq!(plain_text(&spans), "use `Queue` now");
        let spans = tokenize_inline("run `pytest` **fast**");
        assert_eq!(plain_text(&spans), "run pytest fast");
    }
}

use crate::inline::{plain_text, tokenize_inline, InlineSpan};
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

const FENCE: &str = "```";

static ORDINAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+\.) (.*)$").expect("valid ordinal regex"));
static FILE_COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:#|//|--|;)\s*-*\s*(.+?)\s*-*\s*$").expect("valid file comment regex")
});

/// Set of file paths a code block may target.
pub trait KnownPaths {
    fn is_known(&self, path: &str) -> bool;
}

impl KnownPaths for BTreeSet<String> {
    fn is_known(&self, path: &str) -> bool {
        self.contains(path)
    }
}

impl KnownPaths for HashSet<String> {
    fn is_known(&self, path: &str) -> bool {
        self.contains(path)
    }
}

/// Receiver of an "apply" action from an applicable code block.
pub trait ApplyCode {
    /// Writes `content` into `path`. Returns false when `path` is unknown.
    fn apply_code(&mut self, path: &str, content: &str) -> bool;
}

pub struct RenderContext<'a> {
    pub known_paths: &'a dyn KnownPaths,
}

impl<'a> RenderContext<'a> {
    pub fn new(known_paths: &'a dyn KnownPaths) -> Self {
        Self { known_paths }
    }
}

/// Index of the source line a block starts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey(pub usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    pub language: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph(Vec<InlineSpan>),
    Heading(String),
    Bullet(Vec<InlineSpan>),
    NumberedBullet {
        ordinal: String,
        spans: Vec<InlineSpan>,
    },
    LineBreak,
    CodeBlock(CodeBlock),
    ApplicableCodeBlock {
        filename: String,
        code: CodeBlock,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderBlock {
    pub key: BlockKey,
    pub kind: BlockKind,
}

impl RenderBlock {
    pub fn is_code(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::CodeBlock(_) | BlockKind::ApplicableCodeBlock { .. }
        )
    }

    pub fn code(&self) -> Option<&CodeBlock> {
        match &self.kind {
            BlockKind::CodeBlock(code) | BlockKind::ApplicableCodeBlock { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn apply_target(&self) -> Option<&str> {
        match &self.kind {
            BlockKind::ApplicableCodeBlock { filename, .. } => Some(filename),
            _ => None,
        }
    }

    /// Pushes the block's content into `target`. Only applicable blocks do
    /// anything; everything else returns false.
    pub fn apply_to(&self, target: &mut dyn ApplyCode) -> bool {
        match &self.kind {
            BlockKind::ApplicableCodeBlock { filename, code } => {
                target.apply_code(filename, &code.content)
            }
            _ => false,
        }
    }

    /// Single-line plain rendering, used by the headless `render` command.
    pub fn summary(&self) -> String {
        match &self.kind {
            BlockKind::Paragraph(spans) => format!("paragraph: {}", plain_text(spans)),
            BlockKind::Heading(text) => format!("heading: {text}"),
            BlockKind::Bullet(spans) => format!("bullet: {}", plain_text(spans)),
            BlockKind::NumberedBullet { ordinal, spans } => {
                format!("numbered: {ordinal} {}", plain_text(spans))
            }
            BlockKind::LineBreak => "break".to_string(),
            BlockKind::CodeBlock(code) => format!(
                "code[{}]: {} lines",
                code.language.as_deref().unwrap_or(""),
                line_count(&code.content)
            ),
            BlockKind::ApplicableCodeBlock { filename, code } => format!(
                "code[{}] -> {filename}: {} lines",
                code.language.as_deref().unwrap_or(""),
                line_count(&code.content)
            ),
        }
    }
}

struct OpenFence {
    key: BlockKey,
    info: String,
    lines: Vec<String>,
}

impl OpenFence {
    fn into_block(self, ctx: &RenderContext<'_>) -> RenderBlock {
        let language = self.info.split_whitespace().next().map(str::to_string);
        let code = CodeBlock {
            language,
            content: self.lines.join("\n"),
        };
        let kind = match infer_filename(&self.info, &self.lines, ctx.known_paths) {
            Some(filename) => BlockKind::ApplicableCodeBlock { filename, code },
            None => BlockKind::CodeBlock(code),
        };
        RenderBlock {
            key: self.key,
            kind,
        }
    }

    fn into_unterminated(self) -> RenderBlock {
        let language = self.info.split_whitespace().next().map(str::to_string);
        RenderBlock {
            key: self.key,
            kind: BlockKind::CodeBlock(CodeBlock {
                language,
                content: self.lines.join("\n"),
            }),
        }
    }
}

/// Turns an assistant message into display blocks in one pass over its lines.
pub fn render_message(content: &str, ctx: &RenderContext<'_>) -> Vec<RenderBlock> {
    let mut blocks = Vec::new();
    if content.is_empty() {
        return blocks;
    }

    let mut fence: Option<OpenFence> = None;
    for (idx, raw) in content.split('\n').enumerate() {
        let line = raw.strip_suffix('\r').unwrap_or(raw);
        let key = BlockKey(idx);

        if let Some(info) = fence_info(line) {
            match fence.take() {
                Some(open) => blocks.push(open.into_block(ctx)),
                None => {
                    fence = Some(OpenFence {
                        key,
                        info: info.trim().to_string(),
                        lines: Vec::new(),
                    });
                }
            }
            continue;
        }

        if let Some(open) = fence.as_mut() {
            open.lines.push(line.to_string());
            continue;
        }

        blocks.push(RenderBlock {
            key,
            kind: classify_line(line),
        });
    }

    if let Some(open) = fence.take() {
        blocks.push(open.into_unterminated());
    }
    blocks
}

fn fence_info(line: &str) -> Option<&str> {
    line.trim_start().strip_prefix(FENCE)
}

fn classify_line(line: &str) -> BlockKind {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return BlockKind::LineBreak;
    }
    if trimmed.len() > 4 && trimmed.starts_with("**") && trimmed.ends_with("**") {
        return BlockKind::Heading(trimmed[2..trimmed.len() - 2].to_string());
    }
    let lead = line.trim_start();
    if let Some(rest) = lead.strip_prefix("* ").or_else(|| lead.strip_prefix("- ")) {
        return BlockKind::Bullet(tokenize_inline(rest));
    }
    if let Some(caps) = ORDINAL_RE.captures(lead) {
        let ordinal = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let rest = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        return BlockKind::NumberedBullet {
            ordinal: ordinal.to_string(),
            spans: tokenize_inline(rest),
        };
    }
    BlockKind::Paragraph(tokenize_inline(line))
}

/// Guesses which known file a fenced block replaces.
///
/// Tries the fence info string (`lang path`) first, then a decorated comment
/// on the first code line (`# path`, `# --- path ---`). Only exact matches
/// against `known` count.
pub fn infer_filename(
    info: &str,
    lines: &[String],
    known: &dyn KnownPaths,
) -> Option<String> {
    let mut tokens = info.split_whitespace();
    if tokens.next().is_some() {
        let rest: Vec<&str> = tokens.collect();
        if !rest.is_empty() {
            let candidate = rest.join(" ");
            if known.is_known(&candidate) {
                return Some(candidate);
            }
        }
    }

    let first = lines.first()?;
    let caps = FILE_COMMENT_RE.captures(first)?;
    let candidate = caps.get(1)?.as_str();
    known.is_known(candidate).then(|| candidate.to_string())
}

fn line_count(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        text.split('\n').count()
    }
}

#[cfg(test)]
mod tests {
    use super::{
        infer_filename, render_message, ApplyCode, BlockKey, BlockKind, RenderContext,
    };
    use crate::inline::{plain_text, InlineSpan};
    use std::collections::{BTreeMap, BTreeSet};

    fn known(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| p.to_string()).collect()
    }

    fn render(content: &str, paths: &[&str]) -> Vec<super::RenderBlock> {
        let set = known(paths);
        render_message(content, &RenderContext::new(&set))
    }

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    struct Buffers(BTreeMap<String, String>);

    impl ApplyCode for Buffers {
        fn apply_code(&mut self, path: &str, content: &str) -> bool {
            match self.0.get_mut(path) {
                Some(text) => {
                    *text = content.to_string();
                    true
                }
                None => false,
            }
        }
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(render("", &[]).is_empty());
    }

    #[test]
    fn bold_line_is_heading_without_delimiters() {
        let blocks = render("**Header**", &[]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].kind, BlockKind::Heading("Header".to_string()));
    }

    #[test]
    fn bare_bold_delimiters_are_not_a_heading() {
        let blocks = render("****", &[]);
        assert!(matches!(blocks[0].kind, BlockKind::Paragraph(_)));
    }

    #[test]
    fn dash_and_star_bullets_strip_marker() {
        let blocks = render("- item\n* other `x`", &[]);
        match &blocks[0].kind {
            BlockKind::Bullet(spans) => assert_eq!(plain_text(spans), "item"),
            other => panic!("expected bullet, got {other:?}"),
        }
        match &blocks[1].kind {
            BlockKind::Bullet(spans) => {
                assert_eq!(spans[1], InlineSpan::Code("x".to_string()));
            }
            other => panic!("expected bullet, got {other:?}"),
        }
    }

    #[test]
    fn numbered_bullet_keeps_ordinal() {
        let blocks = render("12. run **tests**", &[]);
        match &blocks[0].kind {
            BlockKind::NumberedBullet { ordinal, spans } => {
                assert_eq!(ordinal, "12.");
                assert_eq!(spans[1], InlineSpan::Bold("tests".to_string()));
            }
            other => panic!("expected numbered bullet, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_only_line_is_break() {
        let blocks = render("a\n   \nb", &[]);
        assert_eq!(blocks[1].kind, BlockKind::LineBreak);
        assert_eq!(blocks.len(), 3);
    }

    #[test]
    fn keys_follow_line_positions() {
        let blocks = render("intro\n```\ncode\n```\n- after", &[]);
        let keys: Vec<BlockKey> = blocks.iter().map(|b| b.key).collect();
        assert_eq!(keys, vec![BlockKey(0), BlockKey(1), BlockKey(4)]);
    }

    #[test]
    fn one_code_block_per_fence_pair() {
        let text = "a\n```rust\nfn a() {}\n```\nb\n```\n```\n```py\nx = 1\ny = 2\n```";
        let blocks = render(text, &[]);
        let code: Vec<_> = blocks.iter().filter(|b| b.is_code()).collect();
        assert_eq!(code.len(), 3);
        assert_eq!(code[1].code().map(|c| c.content.as_str()), Some(""));
        assert_eq!(code[2].code().map(|c| c.content.as_str()), Some("x = 1\ny = 2"));
    }

    #[test]
    fn fenced_lines_are_not_classified() {
        let blocks = render("```\n**bold**\n- dash\n\n```", &[]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(
            blocks[0].code().map(|c| c.content.as_str()),
            Some("**bold**\n- dash\n")
        );
    }

    #[test]
    fn unterminated_fence_keeps_all_content() {
        let set = known(&["rq/queue.py"]);
        let blocks = render_message(
            "text\n```python rq/queue.py\nline one\nline two",
            &RenderContext::new(&set),
        );
        assert_eq!(blocks.len(), 2);
        match &blocks[1].kind {
            BlockKind::CodeBlock(code) => {
                assert_eq!(code.content, "line one\nline two");
                assert_eq!(code.language.as_deref(), Some("python"));
            }
            other => panic!("expected plain code block, got {other:?}"),
        }
    }

    #[test]
    fn info_string_path_makes_block_applicable() {
        let blocks = render("```python rq/queue.py\nanything at all\n```", &["rq/queue.py"]);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].apply_target(), Some("rq/queue.py"));
    }

    #[test]
    fn comment_first_line_makes_block_applicable() {
        let blocks = render("```python\n# rq/queue.py\nclass Queue: ...\n```", &["rq/queue.py"]);
        assert_eq!(blocks[0].apply_target(), Some("rq/queue.py"));
        assert_eq!(
            blocks[0].code().map(|c| c.content.as_str()),
            Some("# rq/queue.py\nclass Queue: ...")
        );
    }

    #[test]
    fn language_only_fence_without_comment_is_plain() {
        let blocks = render("```python\nimport os\n```", &["rq/queue.py"]);
        assert!(matches!(blocks[0].kind, BlockKind::CodeBlock(_)));
    }

    #[test]
    fn unknown_path_is_plain() {
        let blocks = render("```python rq/other.py\nx\n```", &["rq/queue.py"]);
        assert!(matches!(blocks[0].kind, BlockKind::CodeBlock(_)));
    }

    #[test]
    fn crlf_renders_like_lf() {
        let lf = render("**H**\n- a\n```py rq/job.py\nx\n```", &["rq/job.py"]);
        let crlf = render("**H**\r\n- a\r\n```py rq/job.py\r\nx\r\n```", &["rq/job.py"]);
        assert_eq!(lf, crlf);
    }

    #[test]
    fn decorated_comment_forms() {
        let set = known(&["rq/queue.py"]);
        for first in ["# rq/queue.py", "# --- rq/queue.py ---", "#rq/queue.py", "// rq/queue.py"] {
            assert_eq!(
                infer_filename("python", &lines(&[first, "x"]), &set),
                Some("rq/queue.py".to_string()),
                "first line {first:?}"
            );
        }
    }

    #[test]
    fn inference_requires_exact_match() {
        let set = known(&["rq/queue.py"]);
        assert_eq!(infer_filename("python queue.py", &lines(&["x"]), &set), None);
        assert_eq!(infer_filename("", &lines(&["# rq/queue"]), &set), None);
        assert_eq!(infer_filename("", &lines(&["rq/queue.py"]), &set), None);
        assert_eq!(infer_filename("python", &[], &set), None);
    }

    #[test]
    fn info_string_wins_over_comment() {
        let set = known(&["rq/queue.py", "rq/job.py"]);
        assert_eq!(
            infer_filename("python rq/job.py", &lines(&["# rq/queue.py"]), &set),
            Some("rq/job.py".to_string())
        );
    }

    #[test]
    fn apply_writes_only_named_buffer() {
        let mut buffers = Buffers(BTreeMap::from([
            ("rq/queue.py".to_string(), "old".to_string()),
            ("rq/job.py".to_string(), "job".to_string()),
        ]));
        let blocks = render("```python rq/queue.py\nnew body\n```", &["rq/queue.py", "rq/job.py"]);
        assert!(blocks[0].apply_to(&mut buffers));
        assert_eq!(buffers.0["rq/queue.py"], "new body");
        assert_eq!(buffers.0["rq/job.py"], "job");
    }

    #[test]
    fn plain_blocks_do_not_apply() {
        let mut buffers = Buffers(BTreeMap::new());
        let blocks = render("hello\n```\nx\n```", &[]);
        assert!(blocks.iter().all(|b| !b.apply_to(&mut buffers)));
    }
}

use crate::backend::{CaseStatus, SubmissionResult, TestResult};
use crate::chat::Role;
use crate::inline::InlineSpan;
use crate::render::{BlockKey, BlockKind, CodeBlock};
use crate::session::Session;
use crate::theme::UiPalette;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use syntect::easy::HighlightLines;
use syntect::highlighting::{FontStyle, Theme};
use syntect::parsing::{SyntaxReference, SyntaxSet};
use syntect::util::LinesWithEndings;

#[derive(Debug, Clone, Copy)]
pub struct ChatStyles {
    pub base: Style,
    pub heading: Style,
    pub inline_code: Style,
    pub prefix: Style,
    pub code_border: Style,
    pub code_bg: Option<Color>,
    pub apply_hint: Style,
    pub applied: Style,
    pub selected: Style,
    pub user_label: Style,
    pub assistant_label: Style,
    pub ok: Style,
    pub error: Style,
}

pub fn styles_from_palette(ui: UiPalette) -> ChatStyles {
    let base = Style::default().fg(ui.base_fg).bg(bg_or_reset(ui.base_bg));
    let code_bg = ui.code_bg.or_else(|| adjust_bg(ui.base_bg, -0.08)).or(ui.base_bg);
    ChatStyles {
        base,
        heading: Style::default().fg(ui.accent).add_modifier(Modifier::BOLD),
        inline_code: Style::default().fg(ui.accent).bg(bg_or_reset(code_bg)),
        prefix: Style::default().fg(ui.muted),
        code_border: Style::default().fg(ui.border),
        code_bg,
        apply_hint: Style::default().fg(ui.accent).add_modifier(Modifier::BOLD),
        applied: Style::default().fg(ui.ok),
        selected: Style::default().fg(ui.accent).add_modifier(Modifier::REVERSED),
        user_label: Style::default().fg(ui.muted).add_modifier(Modifier::BOLD),
        assistant_label: Style::default().fg(ui.accent).add_modifier(Modifier::BOLD),
        ok: Style::default().fg(ui.ok),
        error: Style::default().fg(ui.error),
    }
}

/// Chat transcript as terminal lines, plus where each applicable block's
/// header landed so the selection can be scrolled into view.
pub struct ChatView {
    pub lines: Vec<Line<'static>>,
    pub anchors: Vec<(usize, BlockKey, usize)>,
}

pub struct Highlighter<'a> {
    pub syntax_set: &'a SyntaxSet,
    pub theme: Option<&'a Theme>,
}

pub fn build_chat_view(
    session: &Session,
    styles: &ChatStyles,
    highlighter: &Highlighter<'_>,
    selected: Option<(usize, BlockKey)>,
) -> ChatView {
    let mut lines: Vec<Line<'static>> = Vec::new();
    let mut anchors = Vec::new();

    for (idx, message) in session.conversation.messages().iter().enumerate() {
        if idx > 0 {
            lines.push(Line::from(""));
        }
        match message.role {
            Role::User => {
                lines.push(Line::from(Span::styled("you", styles.user_label)));
                for text in message.content.lines() {
                    lines.push(Line::from(Span::styled(text.to_string(), styles.base)));
                }
            }
            Role::Assistant => {
                lines.push(Line::from(Span::styled("assistant", styles.assistant_label)));
                for block in session.render(idx) {
                    match &block.kind {
                        BlockKind::Paragraph(spans) => {
                            lines.push(Line::from(inline_spans(spans, styles)));
                        }
                        BlockKind::Heading(text) => {
                            lines.push(Line::from(Span::styled(text.clone(), styles.heading)));
                        }
                        BlockKind::Bullet(spans) => {
                            let mut out = vec![Span::styled("  • ", styles.prefix)];
                            out.extend(inline_spans(spans, styles));
                            lines.push(Line::from(out));
                        }
                        BlockKind::NumberedBullet { ordinal, spans } => {
                            let mut out = vec![Span::styled(format!("  {ordinal} "), styles.prefix)];
                            out.extend(inline_spans(spans, styles));
                            lines.push(Line::from(out));
                        }
                        BlockKind::LineBreak => lines.push(Line::from("")),
                        BlockKind::CodeBlock(code) => {
                            lines.push(code_header(code, None, styles));
                            push_code_lines(code, styles, highlighter, &mut lines);
                            lines.push(Line::from(Span::styled("└─", styles.code_border)));
                        }
                        BlockKind::ApplicableCodeBlock { filename, code } => {
                            let applied = session.applied.is_applied(idx, block.key);
                            let is_selected = selected == Some((idx, block.key));
                            anchors.push((idx, block.key, lines.len()));
                            let hint = if applied {
                                Span::styled(" [applied]", styles.applied)
                            } else {
                                let style = if is_selected {
                                    styles.selected
                                } else {
                                    styles.apply_hint
                                };
                                Span::styled(format!(" [a] apply → {filename}"), style)
                            };
                            lines.push(code_header(code, Some(hint), styles));
                            push_code_lines(code, styles, highlighter, &mut lines);
                            lines.push(Line::from(Span::styled("└─", styles.code_border)));
                        }
                    }
                }
            }
        }
    }

    if session.pending.prompt {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("assistant is thinking…", styles.prefix)));
    }
    if session.conversation.is_empty() && !session.pending.prompt {
        lines.push(Line::from(Span::styled(
            "Ask the assistant about the codebase. Enter sends.",
            styles.prefix,
        )));
    }

    ChatView { lines, anchors }
}

fn inline_spans(spans: &[InlineSpan], styles: &ChatStyles) -> Vec<Span<'static>> {
    spans
        .iter()
        .map(|span| match span {
            InlineSpan::Text(s) => Span::styled(s.clone(), styles.base),
            InlineSpan::Code(s) => Span::styled(s.clone(), styles.inline_code),
            InlineSpan::Bold(s) => {
                Span::styled(s.clone(), styles.base.add_modifier(Modifier::BOLD))
            }
        })
        .collect()
}

fn code_header(code: &CodeBlock, hint: Option<Span<'static>>, styles: &ChatStyles) -> Line<'static> {
    let label = code
        .language
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("code");
    let mut spans = vec![Span::styled(format!("┌─ {label}"), styles.code_border)];
    if let Some(hint) = hint {
        spans.push(hint);
    }
    Line::from(spans)
}

fn push_code_lines(
    code: &CodeBlock,
    styles: &ChatStyles,
    highlighter: &Highlighter<'_>,
    lines: &mut Vec<Line<'static>>,
) {
    let border = Span::styled("│ ", styles.code_border);
    let Some(theme) = highlighter.theme else {
        for text in code.content.lines() {
            lines.push(Line::from(vec![
                border.clone(),
                Span::styled(text.to_string(), styles.base),
            ]));
        }
        return;
    };
    let syntax = resolve_syntax(highlighter.syntax_set, code.language.as_deref());
    let mut hl = HighlightLines::new(syntax, theme);
    for text in LinesWithEndings::from(&code.content) {
        let mut line = highlight_line_with(&mut hl, highlighter.syntax_set, text, styles.code_bg, styles.base);
        line.spans.insert(0, border.clone());
        lines.push(line);
    }
}

pub fn resolve_syntax<'a>(syntax_set: &'a SyntaxSet, lang: Option<&str>) -> &'a SyntaxReference {
    let Some(lang) = lang.map(str::trim).filter(|l| !l.is_empty()) else {
        return syntax_set.find_syntax_plain_text();
    };
    let token = lang.strip_prefix("language-").unwrap_or(lang);
    syntax_set
        .find_syntax_by_token(token)
        .or_else(|| syntax_set.find_syntax_by_extension(token))
        .unwrap_or_else(|| syntax_set.find_syntax_plain_text())
}

pub fn syntax_for_path<'a>(syntax_set: &'a SyntaxSet, path: &str) -> &'a SyntaxReference {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext);
    resolve_syntax(syntax_set, ext)
}

pub fn highlight_line_with(
    highlighter: &mut HighlightLines,
    syntax_set: &SyntaxSet,
    line: &str,
    base_bg: Option<Color>,
    base_style: Style,
) -> Line<'static> {
    let ranges = match highlighter.highlight_line(line, syntax_set) {
        Ok(r) => r,
        Err(_) => vec![(syntect::highlighting::Style::default(), line)],
    };
    let mut spans = Vec::new();
    for (style, text) in ranges {
        let text = text.trim_end_matches('\n');
        if text.is_empty() {
            continue;
        }
        spans.push(Span::styled(
            text.to_string(),
            syntect_to_ratatui_style(style, base_bg),
        ));
    }
    if spans.is_empty() {
        spans.push(Span::styled("", base_style));
    }
    Line::from(spans)
}

fn syntect_to_ratatui_style(style: syntect::highlighting::Style, base_bg: Option<Color>) -> Style {
    let mut out = Style::default().fg(Color::Rgb(
        style.foreground.r,
        style.foreground.g,
        style.foreground.b,
    ));
    if let Some(bg) = base_bg {
        out = out.bg(bg);
    }
    if style.font_style.contains(FontStyle::BOLD) {
        out = out.add_modifier(Modifier::BOLD);
    }
    if style.font_style.contains(FontStyle::ITALIC) {
        out = out.add_modifier(Modifier::ITALIC);
    }
    if style.font_style.contains(FontStyle::UNDERLINE) {
        out = out.add_modifier(Modifier::UNDERLINED);
    }
    out
}

pub fn test_result_lines(result: &TestResult, styles: &ChatStyles) -> Vec<Line<'static>> {
    let mut lines = vec![Line::from(vec![
        Span::styled(format!("{} passed", result.passed), styles.ok),
        Span::styled(", ", styles.prefix),
        Span::styled(
            format!("{} failed", result.failed),
            if result.failed > 0 { styles.error } else { styles.prefix },
        ),
        Span::styled(format!(" in {} ms", result.duration_ms), styles.prefix),
    ])];
    for case in &result.cases {
        let (mark, style) = match case.status {
            CaseStatus::Passed => ("✓", styles.ok),
            CaseStatus::Failed => ("✗", styles.error),
            CaseStatus::Skipped => ("-", styles.prefix),
        };
        lines.push(Line::from(vec![
            Span::styled(format!("  {mark} "), style),
            Span::styled(case.name.clone(), styles.base),
        ]));
        if case.status != CaseStatus::Passed {
            for text in case.message.as_deref().unwrap_or("").lines() {
                lines.push(Line::from(Span::styled(format!("      {text}"), styles.prefix)));
            }
        }
    }
    lines
}

pub fn report_lines(
    session: &Session,
    result: &SubmissionResult,
    styles: &ChatStyles,
) -> Vec<Line<'static>> {
    let mut lines = vec![
        Line::from(Span::styled(
            format!("Assessment report: {}", session.info.candidate),
            styles.heading,
        )),
        Line::from(Span::styled(
            format!("session {}", session.info.session_id),
            styles.prefix,
        )),
        Line::from(""),
        Line::from(vec![
            Span::styled("Score ", styles.base),
            Span::styled(format!("{}/100", result.score), styles.heading),
        ]),
        Line::from(Span::styled(result.summary.clone(), styles.base)),
        Line::from(""),
    ];
    for item in &result.breakdown {
        lines.push(Line::from(vec![
            Span::styled(format!("{:<16}", item.criterion), styles.base),
            Span::styled(format!("{:>3} ", item.score), styles.heading),
            Span::styled(item.comment.clone(), styles.prefix),
        ]));
    }

    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled("Changes", styles.heading)));
    let diffs = session.workspace.diff_stats();
    if diffs.is_empty() {
        lines.push(Line::from(Span::styled("  no files changed", styles.prefix)));
    }
    for (path, stat) in diffs {
        lines.push(Line::from(vec![
            Span::styled(format!("  {path} "), styles.base),
            Span::styled(format!("+{}", stat.added), styles.ok),
            Span::styled(format!(" -{}", stat.removed), styles.error),
        ]));
    }

    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        format!(
            "{} prompts, {} suggestions applied, {} checkpoints",
            session.conversation.prompt_count(),
            session.applied.len(),
            session.workspace.checkpoints().len()
        ),
        styles.prefix,
    )));

    if let Some(tests) = &session.tests {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled("Last test run", styles.heading)));
        lines.extend(test_result_lines(tests, styles));
    }

    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        "n: new session   q: quit",
        styles.prefix,
    )));
    lines
}

fn bg_or_reset(color: Option<Color>) -> Color {
    color.unwrap_or(Color::Reset)
}

fn adjust_bg(color: Option<Color>, delta: f32) -> Option<Color> {
    match color {
        Some(Color::Rgb(r, g, b)) => Some(Color::Rgb(
            adjust_channel(r, delta),
            adjust_channel(g, delta),
            adjust_channel(b, delta),
        )),
        _ => None,
    }
}

fn adjust_channel(value: u8, delta: f32) -> u8 {
    let v = value as f32 / 255.0;
    let adjusted = (v + delta).clamp(0.0, 1.0);
    (adjusted * 255.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::{build_chat_view, styles_from_palette, syntax_for_path, Highlighter};
    use crate::backend::SessionInfo;
    use crate::chat::ChatMessage;
    use crate::render::BlockKey;
    use crate::session::Session;
    use crate::theme::UiPalette;
    use crate::workspace::Workspace;
    use ratatui::style::Modifier;
    use ratatui::text::Line;
    use std::time::Instant;
    use syntect::parsing::SyntaxSet;

    fn text_of(line: &Line<'_>) -> String {
        line.spans.iter().map(|s| s.content.as_ref()).collect()
    }

    fn session() -> Session {
        let info = SessionInfo {
            session_id: "s".to_string(),
            candidate: "c".to_string(),
            duration_secs: 60,
        };
        let ws = Workspace::from_files([("rq/queue.py", "old")]);
        Session::start(info, ws, Instant::now())
    }

    #[test]
    fn applicable_block_shows_hint_then_applied_marker() {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let hl = Highlighter {
            syntax_set: &syntax_set,
            theme: None,
        };
        let styles = styles_from_palette(UiPalette::plain());
        let mut s = session();
        let idx = s.conversation.push(ChatMessage::assistant(
            "**Fix**\n- step `one`\n```python rq/queue.py\nnew = 1\n```",
        ));

        let view = build_chat_view(&s, &styles, &hl, Some((idx, BlockKey(2))));
        let rendered: Vec<String> = view.lines.iter().map(text_of).collect();
        assert_eq!(rendered[0], "assistant");
        assert_eq!(rendered[1], "Fix");
        assert_eq!(rendered[2], "  • step one");
        assert!(rendered[3].contains("apply → rq/queue.py"));
        assert_eq!(rendered[4], "│ new = 1");
        assert_eq!(view.anchors, vec![(idx, BlockKey(2), 3)]);
        let hint = &view.lines[3].spans[1];
        assert!(hint.style.add_modifier.contains(Modifier::REVERSED));

        s.apply_block(idx, BlockKey(2));
        let view = build_chat_view(&s, &styles, &hl, None);
        assert!(text_of(&view.lines[3]).ends_with("[applied]"));
    }

    #[test]
    fn highlighted_code_keeps_text() {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let themes = syntect::highlighting::ThemeSet::load_defaults();
        let hl = Highlighter {
            syntax_set: &syntax_set,
            theme: themes.themes.get("base16-ocean.dark"),
        };
        let styles = styles_from_palette(UiPalette::plain());
        let mut s = session();
        s.conversation
            .push(ChatMessage::assistant("```python\nx = 1\n```"));
        let view = build_chat_view(&s, &styles, &hl, None);
        assert_eq!(text_of(&view.lines[2]), "│ x = 1");
    }

    #[test]
    fn pending_prompt_shows_indicator() {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let hl = Highlighter {
            syntax_set: &syntax_set,
            theme: None,
        };
        let styles = styles_from_palette(UiPalette::plain());
        let mut s = session();
        s.push_prompt("hello");
        let view = build_chat_view(&s, &styles, &hl, None);
        let last = view.lines.last().map(text_of).unwrap_or_default();
        assert!(last.contains("thinking"));
    }

    #[test]
    fn empty_conversation_shows_hint() {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        let styles = styles_from_palette(UiPalette::plain());
        let hl = Highlighter {
            syntax_set: &syntax_set,
            theme: None,
        };
        let view = build_chat_view(&session(), &styles, &hl, None);
        assert_eq!(view.lines.len(), 1);
        assert!(text_of(&view.lines[0]).starts_with("Ask the assistant"));
    }

    #[test]
    fn syntax_follows_file_extension() {
        let syntax_set = SyntaxSet::load_defaults_newlines();
        assert_eq!(syntax_for_path(&syntax_set, "rq/queue.py").name, "Python");
        assert_eq!(syntax_for_path(&syntax_set, "LICENSE").name, "Plain Text");
    }
}

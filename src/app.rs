use crate::backend::{BackendReply, BackendRequest, BackendWorker, EventKind, SessionInfo, Tagged};
use crate::config::Config;
use crate::render::BlockKey;
use crate::session::{ApplyOutcome, Session, TimerEvent};
use crate::theme::{ThemeManager, UiPalette};
use crate::view::{
    build_chat_view, highlight_line_with, report_lines, styles_from_palette, syntax_for_path,
    test_result_lines, ChatStyles, Highlighter,
};
use crate::workspace::Workspace;
use anyhow::Result;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, ExecutableCommand};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::Terminal;
use ropey::Rope;
use std::io::{self, Stdout};
use std::time::{Duration, Instant};
use syntect::easy::HighlightLines;
use syntect::parsing::SyntaxSet;
use tracing::{debug, info, warn};
use unicode_width::UnicodeWidthChar;

pub fn run_app(
    info: SessionInfo,
    workspace: Workspace,
    worker: BackendWorker,
    config: Config,
) -> Result<()> {
    let theme_manager = ThemeManager::load(&config)?;
    let mut app = App::new(info, workspace, worker, config, theme_manager);

    let mut terminal = setup_terminal()?;
    let _guard = TerminalGuard;

    let tick_rate = Duration::from_millis(50);

    loop {
        let size = terminal.size()?;
        let layout = app.layout(size);
        app.ensure_cursor_visible(layout.editor_height);

        terminal.draw(|f| ui(f, &mut app, &layout))?;

        if event::poll(tick_rate)? {
            if let Event::Key(key) = event::read()? {
                if app.handle_key(key, layout.editor_height) {
                    break;
                }
            }
        }

        while let Some(tagged) = app.worker.try_recv() {
            app.on_backend_reply(tagged);
        }

        if app.session.timer.tick(Instant::now()) == TimerEvent::Expired {
            info!("session timer expired");
            app.status = Some("Time is up, submitting".to_string());
            app.submit();
        }
    }

    Ok(())
}

struct TerminalGuard;

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let mut stdout = io::stdout();
        let _ = stdout.execute(LeaveAlternateScreen);
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Focus {
    Files,
    Editor,
    Chat,
    Prompt,
}

impl Focus {
    fn next(self) -> Self {
        match self {
            Focus::Files => Focus::Editor,
            Focus::Editor => Focus::Chat,
            Focus::Chat => Focus::Prompt,
            Focus::Prompt => Focus::Files,
        }
    }

    fn prev(self) -> Self {
        match self {
            Focus::Files => Focus::Prompt,
            Focus::Editor => Focus::Files,
            Focus::Chat => Focus::Editor,
            Focus::Prompt => Focus::Chat,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Focus::Files => "files",
            Focus::Editor => "edit",
            Focus::Chat => "chat",
            Focus::Prompt => "prompt",
        }
    }
}

struct LayoutInfo {
    status: Rect,
    files: Rect,
    editor: Rect,
    chat: Rect,
    prompt: Rect,
    report: Rect,
    editor_width: u16,
    editor_height: u16,
    chat_height: u16,
}

struct App {
    config: Config,
    theme_manager: ThemeManager,
    syntax_set: SyntaxSet,
    ui: UiPalette,
    styles: ChatStyles,
    worker: BackendWorker,
    session: Session,
    focus: Focus,
    file_selected: usize,
    cursor_char: usize,
    preferred_col: Option<usize>,
    edit_scroll: usize,
    editor_lines: Vec<Line<'static>>,
    editor_cache_dirty: bool,
    prompt_input: String,
    chat_scroll: usize,
    chat_selected: Option<(usize, BlockKey)>,
    confirm_submit: bool,
    show_tests: bool,
    status: Option<String>,
}

impl App {
    fn new(
        info: SessionInfo,
        workspace: Workspace,
        worker: BackendWorker,
        config: Config,
        theme_manager: ThemeManager,
    ) -> Self {
        let ui = theme_manager.ui_palette(&config.theme);
        let styles = styles_from_palette(ui);
        let mut session = Session::start(info, workspace, Instant::now());
        let first = session.workspace.paths().next().map(str::to_string);
        if let Some(path) = first.as_deref() {
            session.workspace.open(path);
        }
        let mut app = Self {
            config,
            theme_manager,
            syntax_set: SyntaxSet::load_defaults_newlines(),
            ui,
            styles,
            worker,
            session,
            focus: Focus::Prompt,
            file_selected: 0,
            cursor_char: 0,
            preferred_col: None,
            edit_scroll: 0,
            editor_lines: Vec::new(),
            editor_cache_dirty: true,
            prompt_input: String::new(),
            chat_scroll: 0,
            chat_selected: None,
            confirm_submit: false,
            show_tests: false,
            status: Some("Tab switches panes, Ctrl-t runs tests, Ctrl-s submits".to_string()),
        };
        app.forward_last_event();
        app
    }

    fn layout(&self, size: Rect) -> LayoutInfo {
        let vertical = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(1), Constraint::Length(1)])
            .split(size);
        let main = vertical[0];
        let status = vertical[1];

        let files_width = self.config.file_list_width.min(main.width.saturating_sub(40));
        let chat_pct = self.config.chat_width_percent;
        let horiz = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([
                Constraint::Length(files_width),
                Constraint::Percentage(100 - chat_pct),
                Constraint::Percentage(chat_pct),
            ])
            .split(main);
        let right = Layout::default()
            .direction(Direction::Vertical)
            .constraints([Constraint::Min(3), Constraint::Length(3)])
            .split(horiz[2]);

        let editor = horiz[1];
        LayoutInfo {
            status,
            files: horiz[0],
            editor,
            chat: right[0],
            prompt: right[1],
            report: main,
            editor_width: editor.width.saturating_sub(2).max(1),
            editor_height: editor.height.saturating_sub(2).max(1),
            chat_height: right[0].height.saturating_sub(2).max(1),
        }
    }

    fn log_event(&mut self, kind: EventKind, detail: impl Into<String>) {
        let event = self.session.record(kind, detail);
        self.worker.dispatch(self.session.epoch, BackendRequest::LogEvent(event));
    }

    /// Sends the most recent event the session recorded on its own.
    fn forward_last_event(&mut self) {
        if let Some(event) = self.session.events.last().cloned() {
            self.worker.dispatch(self.session.epoch, BackendRequest::LogEvent(event));
        }
    }

    fn handle_key(&mut self, key: KeyEvent, content_height: u16) -> bool {
        if self.session.is_finished() {
            return self.handle_report_key(key);
        }

        if key.modifiers.contains(KeyModifiers::CONTROL) {
            match key.code {
                KeyCode::Char('q') | KeyCode::Char('c') => return true,
                KeyCode::Char('t') => {
                    self.run_tests();
                    return false;
                }
                KeyCode::Char('s') => {
                    if self.confirm_submit {
                        self.submit();
                    } else {
                        self.confirm_submit = true;
                        self.status = Some("Press Ctrl-s again to submit, Esc to cancel".to_string());
                    }
                    return false;
                }
                KeyCode::Char('k') => {
                    self.checkpoint();
                    return false;
                }
                KeyCode::Char('r') => {
                    self.restore_latest_checkpoint();
                    return false;
                }
                KeyCode::Char('n') => {
                    self.new_session();
                    return false;
                }
                KeyCode::Char('o') => {
                    self.show_tests = !self.show_tests;
                    return false;
                }
                _ => {}
            }
        }

        match key.code {
            KeyCode::Esc => {
                self.confirm_submit = false;
                self.status = None;
                return false;
            }
            KeyCode::Tab => {
                self.focus = self.focus.next();
                return false;
            }
            KeyCode::BackTab => {
                self.focus = self.focus.prev();
                return false;
            }
            _ => {}
        }

        match self.focus {
            Focus::Files => self.handle_files_key(key),
            Focus::Editor => self.handle_editor_key(key, content_height),
            Focus::Chat => self.handle_chat_key(key),
            Focus::Prompt => self.handle_prompt_key(key),
        }
        false
    }

    fn handle_report_key(&mut self, key: KeyEvent) -> bool {
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => true,
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => true,
            KeyCode::Char('n') => {
                self.new_session();
                false
            }
            _ => false,
        }
    }

    fn handle_files_key(&mut self, key: KeyEvent) {
        if self.session.workspace.is_empty() {
            return;
        }
        let total = self.session.workspace.len();
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => {
                self.file_selected = self.file_selected.saturating_sub(1);
            }
            KeyCode::Down | KeyCode::Char('j') => {
                self.file_selected = (self.file_selected + 1).min(total - 1);
            }
            KeyCode::Enter => {
                let path = self.session.workspace.paths().nth(self.file_selected).map(str::to_string);
                if let Some(path) = path {
                    self.switch_to(&path);
                    self.focus = Focus::Editor;
                }
            }
            _ => {}
        }
    }

    fn handle_chat_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Up | KeyCode::Char('k') => self.select_block(-1),
            KeyCode::Down | KeyCode::Char('j') => self.select_block(1),
            KeyCode::PageUp => self.chat_scroll = self.chat_scroll.saturating_sub(10),
            KeyCode::PageDown => self.chat_scroll = self.chat_scroll.saturating_add(10),
            KeyCode::Char('a') | KeyCode::Enter => self.apply_selected(),
            _ => {}
        }
    }

    fn handle_prompt_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => self.send_prompt(),
            KeyCode::Backspace => {
                self.prompt_input.pop();
            }
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                self.prompt_input.push(c);
            }
            _ => {}
        }
    }

    fn handle_editor_key(&mut self, key: KeyEvent, content_height: u16) {
        match key.code {
            KeyCode::Left => self.move_cursor_left(),
            KeyCode::Right => self.move_cursor_right(),
            KeyCode::Up => self.move_cursor_up(),
            KeyCode::Down => self.move_cursor_down(),
            KeyCode::PageUp => self.move_cursor_page(-(content_height as isize)),
            KeyCode::PageDown => self.move_cursor_page(content_height as isize),
            KeyCode::Home => self.move_cursor_line_start(),
            KeyCode::End => self.move_cursor_line_end(),
            KeyCode::Backspace => self.backspace(),
            KeyCode::Delete => self.delete(),
            KeyCode::Enter => self.insert_str("\n"),
            KeyCode::Char(c) if !key.modifiers.contains(KeyModifiers::CONTROL) => {
                let mut buf = [0u8; 4];
                self.insert_str(c.encode_utf8(&mut buf));
            }
            _ => {}
        }
    }

    fn send_prompt(&mut self) {
        let text = self.prompt_input.trim().to_string();
        if text.is_empty() {
            return;
        }
        if self.session.pending.prompt {
            self.status = Some("Waiting for the assistant".to_string());
            return;
        }
        self.prompt_input.clear();
        self.session.push_prompt(&text);
        self.log_event(EventKind::Prompt, text);
        self.worker.dispatch(self.session.epoch, BackendRequest::Prompt {
            history: self.session.conversation.messages().to_vec(),
            files: self.session.workspace.snapshot(),
        });
    }

    fn run_tests(&mut self) {
        if self.session.pending.tests {
            return;
        }
        self.session.pending.tests = true;
        self.show_tests = true;
        self.log_event(EventKind::TestRun, "manual");
        self.worker.dispatch(self.session.epoch, BackendRequest::RunTests {
            files: self.session.workspace.snapshot(),
        });
        self.status = Some("Running tests".to_string());
    }

    fn submit(&mut self) {
        self.confirm_submit = false;
        if self.session.pending.submit || self.session.is_finished() {
            return;
        }
        self.session.timer.cancel();
        self.session.pending.submit = true;
        match self.session.conversation.to_json() {
            Ok(transcript) => debug!(%transcript, "submitting transcript"),
            Err(err) => warn!(error = %err, "transcript not serialisable"),
        }
        let remaining = self.session.timer.format(Instant::now());
        self.log_event(EventKind::Submit, remaining);
        self.worker.dispatch(self.session.epoch, BackendRequest::Submit {
            files: self.session.workspace.snapshot(),
            history: self.session.conversation.messages().to_vec(),
        });
        self.status = Some("Submitting".to_string());
    }

    fn checkpoint(&mut self) {
        let name = format!("checkpoint {}", self.session.workspace.checkpoints().len() + 1);
        let idx = self.session.workspace.checkpoint(name);
        let label = self.session.workspace.checkpoints()[idx].label();
        self.log_event(EventKind::Checkpoint, label.clone());
        self.status = Some(format!("Saved {label}"));
    }

    fn restore_latest_checkpoint(&mut self) {
        let count = self.session.workspace.checkpoints().len();
        if count == 0 {
            self.status = Some("No checkpoints yet (Ctrl-k saves one)".to_string());
            return;
        }
        self.session.workspace.restore(count - 1);
        let label = self.session.workspace.checkpoints()[count - 1].label();
        self.log_event(EventKind::Restore, label.clone());
        self.reset_cursor();
        self.status = Some(format!("Restored {label}"));
    }

    fn new_session(&mut self) {
        self.session.reset(Instant::now());
        self.forward_last_event();
        let first = self.session.workspace.paths().next().map(str::to_string);
        if let Some(path) = first {
            self.session.workspace.open(&path);
        }
        self.prompt_input.clear();
        self.chat_scroll = 0;
        self.chat_selected = None;
        self.confirm_submit = false;
        self.show_tests = false;
        self.focus = Focus::Prompt;
        self.reset_cursor();
        self.status = Some("New session started".to_string());
    }

    fn on_backend_reply(&mut self, tagged: Tagged) {
        let Tagged { epoch, reply } = tagged;
        if epoch != self.session.epoch && !matches!(reply, BackendReply::Logged(_)) {
            debug!(epoch, current = self.session.epoch, "dropping reply from a previous session");
            return;
        }
        match reply {
            BackendReply::Prompt(result) => {
                self.session.pending.prompt = false;
                match result {
                    Ok(message) => {
                        let idx = self.session.conversation.push(message);
                        let targets = self.session.render(idx);
                        let first = targets.iter().find(|b| b.apply_target().is_some());
                        if let Some(block) = first {
                            self.chat_selected = Some((idx, block.key));
                            self.status = Some("Suggestion ready: focus chat and press a to apply".to_string());
                        } else {
                            self.status = None;
                        }
                        self.chat_scroll = usize::MAX;
                    }
                    Err(err) => {
                        warn!(error = %err, "prompt failed");
                        self.status = Some(format!("Assistant error: {err}"));
                    }
                }
            }
            BackendReply::Tests(result) => {
                self.session.pending.tests = false;
                match result {
                    Ok(tests) => {
                        self.status = Some(format!(
                            "Tests: {} passed, {} failed",
                            tests.passed, tests.failed
                        ));
                        self.session.tests = Some(tests);
                    }
                    Err(err) => {
                        warn!(error = %err, "test run failed");
                        self.status = Some(format!("Test run failed: {err}"));
                    }
                }
            }
            BackendReply::Submission(result) => {
                self.session.pending.submit = false;
                match result {
                    Ok(submission) => {
                        info!(score = submission.score, "submission received");
                        self.session.submission = Some(submission);
                        self.status = None;
                    }
                    Err(err) => {
                        warn!(error = %err, "submission failed");
                        self.status = Some(format!("Submission failed: {err} (Ctrl-s to retry)"));
                    }
                }
            }
            BackendReply::Logged(result) => {
                if let Err(err) = result {
                    warn!(error = %err, "event log failed");
                }
            }
        }
    }

    fn select_block(&mut self, delta: isize) {
        let blocks = self.session.applicable_blocks();
        if blocks.is_empty() {
            self.chat_selected = None;
            return;
        }
        let current = self
            .chat_selected
            .and_then(|sel| blocks.iter().position(|(m, k, _)| (*m, *k) == sel));
        let next = match current {
            None => blocks.len() - 1,
            Some(i) if delta < 0 => i.saturating_sub(1),
            Some(i) => (i + 1).min(blocks.len() - 1),
        };
        let (m, k, _) = &blocks[next];
        self.chat_selected = Some((*m, *k));
    }

    fn apply_selected(&mut self) {
        let Some((message, key)) = self.chat_selected else {
            self.status = Some("No suggestion selected".to_string());
            return;
        };
        match self.session.apply_block(message, key) {
            ApplyOutcome::Applied(path) => {
                self.forward_last_event();
                if let Some(pos) = self.session.workspace.paths().position(|p| p == path) {
                    self.file_selected = pos;
                }
                self.reset_cursor();
                self.status = Some(format!("Applied to {path}"));
            }
            ApplyOutcome::AlreadyApplied => {
                self.status = Some("Already applied".to_string());
            }
            ApplyOutcome::NotApplicable => {
                self.status = Some("Block does not target a known file".to_string());
            }
        }
    }

    fn switch_to(&mut self, path: &str) {
        if self.session.workspace.open(path) {
            self.reset_cursor();
        }
    }

    fn reset_cursor(&mut self) {
        self.cursor_char = 0;
        self.edit_scroll = 0;
        self.preferred_col = None;
        self.editor_cache_dirty = true;
    }

    fn active_path(&self) -> Option<String> {
        self.session.workspace.active().map(str::to_string)
    }

    fn rope(&self) -> Option<&Rope> {
        self.session.workspace.active().and_then(|p| self.session.workspace.get(p))
    }

    fn len_chars(&self) -> usize {
        self.rope().map(Rope::len_chars).unwrap_or(0)
    }

    fn insert_str(&mut self, text: &str) {
        let Some(path) = self.active_path() else {
            return;
        };
        let cursor = self.cursor_char;
        if let Some(rope) = self.session.workspace.buffer_mut(&path) {
            rope.insert(cursor.min(rope.len_chars()), text);
            self.cursor_char = cursor.saturating_add(text.chars().count());
            self.preferred_col = None;
            self.editor_cache_dirty = true;
        }
    }

    fn backspace(&mut self) {
        if self.cursor_char == 0 {
            return;
        }
        let Some(path) = self.active_path() else {
            return;
        };
        let prev = self.cursor_char - 1;
        if let Some(rope) = self.session.workspace.buffer_mut(&path) {
            rope.remove(prev..self.cursor_char);
            self.cursor_char = prev;
            self.preferred_col = None;
            self.editor_cache_dirty = true;
        }
    }

    fn delete(&mut self) {
        if self.cursor_char >= self.len_chars() {
            return;
        }
        let Some(path) = self.active_path() else {
            return;
        };
        let cursor = self.cursor_char;
        if let Some(rope) = self.session.workspace.buffer_mut(&path) {
            rope.remove(cursor..cursor + 1);
            self.preferred_col = None;
            self.editor_cache_dirty = true;
        }
    }

    fn move_cursor_left(&mut self) {
        if self.cursor_char > 0 {
            self.cursor_char -= 1;
        }
        self.preferred_col = None;
    }

    fn move_cursor_right(&mut self) {
        if self.cursor_char < self.len_chars() {
            self.cursor_char += 1;
        }
        self.preferred_col = None;
    }

    fn move_cursor_up(&mut self) {
        let (line, _) = self.cursor_line_col();
        if line > 0 {
            self.move_cursor_to_line(line - 1);
        }
    }

    fn move_cursor_down(&mut self) {
        let (line, _) = self.cursor_line_col();
        let max_line = self.rope().map(|r| r.len_lines().saturating_sub(1)).unwrap_or(0);
        if line < max_line {
            self.move_cursor_to_line(line + 1);
        }
    }

    fn move_cursor_page(&mut self, delta: isize) {
        let (line, _) = self.cursor_line_col();
        let max_line = self.rope().map(|r| r.len_lines().saturating_sub(1)).unwrap_or(0);
        let target_line = if delta.is_negative() {
            line.saturating_sub(delta.unsigned_abs())
        } else {
            (line + delta as usize).min(max_line)
        };
        self.move_cursor_to_line(target_line);
    }

    fn move_cursor_to_line(&mut self, target_line: usize) {
        let (_, col) = self.cursor_line_col();
        let Some(rope) = self.rope() else {
            return;
        };
        let desired = self.preferred_col.unwrap_or(col);
        let target_col = desired.min(line_len_chars(rope, target_line));
        self.cursor_char = rope.line_to_char(target_line) + target_col;
        self.preferred_col = Some(desired);
    }

    fn move_cursor_line_start(&mut self) {
        let (line, _) = self.cursor_line_col();
        if let Some(rope) = self.rope() {
            self.cursor_char = rope.line_to_char(line);
        }
        self.preferred_col = None;
    }

    fn move_cursor_line_end(&mut self) {
        let (line, _) = self.cursor_line_col();
        if let Some(rope) = self.rope() {
            self.cursor_char = rope.line_to_char(line) + line_len_chars(rope, line);
        }
        self.preferred_col = None;
    }

    fn cursor_line_col(&self) -> (usize, usize) {
        let Some(rope) = self.rope() else {
            return (0, 0);
        };
        let cursor = self.cursor_char.min(rope.len_chars());
        let line = rope.char_to_line(cursor);
        let line_start = rope.line_to_char(line);
        (line, cursor.saturating_sub(line_start))
    }

    fn ensure_cursor_visible(&mut self, height: u16) {
        self.cursor_char = self.cursor_char.min(self.len_chars());
        let (line, _) = self.cursor_line_col();
        let height = height as usize;
        if line < self.edit_scroll {
            self.edit_scroll = line;
        } else if line >= self.edit_scroll + height {
            self.edit_scroll = line.saturating_sub(height.saturating_sub(1));
        }
    }

    fn ensure_editor_cache(&mut self) {
        if !self.editor_cache_dirty && !self.editor_lines.is_empty() {
            return;
        }
        self.editor_lines = self.build_editor_cache();
        self.editor_cache_dirty = false;
    }

    fn build_editor_cache(&self) -> Vec<Line<'static>> {
        let (Some(path), Some(rope)) = (self.session.workspace.active(), self.rope()) else {
            return vec![Line::from(Span::styled(
                "Select a file (Tab to the file list, Enter to open)",
                self.styles.prefix,
            ))];
        };
        let Some(theme) = self.theme_manager.get(&self.config.theme) else {
            return rope
                .lines()
                .map(|l| Line::from(Span::styled(l.to_string().trim_end_matches('\n').to_string(), self.styles.base)))
                .collect();
        };
        let syntax = syntax_for_path(&self.syntax_set, path);
        let mut highlighter = HighlightLines::new(syntax, theme);
        let mut lines: Vec<Line<'static>> = rope
            .lines()
            .map(|line| {
                let text = expand_tabs(&line.to_string(), self.config.tab_width);
                highlight_line_with(
                    &mut highlighter,
                    &self.syntax_set,
                    &text,
                    self.ui.base_bg,
                    self.styles.base,
                )
            })
            .collect();
        if lines.is_empty() {
            lines.push(Line::from(Span::styled("", self.styles.base)));
        }
        lines
    }

    fn edit_cursor_screen_position(&self, layout: &LayoutInfo) -> Option<(u16, u16)> {
        let (line, col) = self.cursor_line_col();
        if line < self.edit_scroll {
            return None;
        }
        let visible_line = line - self.edit_scroll;
        if visible_line >= layout.editor_height as usize {
            return None;
        }
        let rope = self.rope()?;
        let mut line_str = rope.line(line).to_string();
        if line_str.ends_with('\n') {
            line_str.pop();
        }
        let mut width = 0usize;
        for ch in line_str.chars().take(col) {
            width += if ch == '\t' {
                self.config.tab_width.max(1)
            } else {
                UnicodeWidthChar::width(ch).unwrap_or(0)
            };
        }
        let x = layout
            .editor
            .x
            .saturating_add(1)
            .saturating_add(width.min(layout.editor_width as usize).try_into().ok()?);
        let y = layout
            .editor
            .y
            .saturating_add(1)
            .saturating_add(visible_line.try_into().ok()?);
        Some((x, y))
    }

    fn prompt_cursor_position(&self, layout: &LayoutInfo) -> Option<(u16, u16)> {
        let width: usize = self
            .prompt_input
            .chars()
            .map(|c| UnicodeWidthChar::width(c).unwrap_or(0))
            .sum();
        let inner = layout.prompt.width.saturating_sub(2) as usize;
        let x = layout
            .prompt
            .x
            .saturating_add(1)
            .saturating_add(width.min(inner).try_into().ok()?);
        Some((x, layout.prompt.y.saturating_add(1)))
    }

    fn status_line(&self) -> Line<'static> {
        let muted = Style::default().fg(self.ui.muted);
        let accent = Style::default().fg(self.ui.accent);
        let now = Instant::now();
        let mut parts = vec![Span::styled(
            "pairbench",
            accent.add_modifier(Modifier::BOLD),
        )];
        parts.push(Span::styled(" | ", muted));
        parts.push(Span::styled(self.session.info.candidate.clone(), self.styles.base));
        parts.push(Span::styled(" | ", muted));
        let remaining = self.session.timer.remaining_secs(now);
        let timer_style = if self.session.timer.is_stopped() {
            muted
        } else if remaining < 300 {
            self.styles.error
        } else {
            accent
        };
        parts.push(Span::styled(self.session.timer.format(now), timer_style));
        parts.push(Span::styled(" | ", muted));
        parts.push(Span::styled(self.focus.label(), accent));

        let pending = &self.session.pending;
        if pending.any() {
            let mut busy = Vec::new();
            if pending.prompt {
                busy.push("assistant");
            }
            if pending.tests {
                busy.push("tests");
            }
            if pending.submit {
                busy.push("submit");
            }
            parts.push(Span::styled(" | ", muted));
            parts.push(Span::styled(format!("⏳ {}", busy.join(", ")), accent));
        }
        if let Some(tests) = &self.session.tests {
            parts.push(Span::styled(" | ", muted));
            let style = if tests.failed == 0 { self.styles.ok } else { self.styles.error };
            parts.push(Span::styled(
                format!("tests {}/{}", tests.passed, tests.passed + tests.failed),
                style,
            ));
        }
        if let Some(msg) = &self.status {
            parts.push(Span::styled(" | ", muted));
            parts.push(Span::styled(msg.clone(), accent));
        }
        Line::from(parts)
    }

    fn pane_block(&self, title: String, focused: bool) -> Block<'static> {
        let border = if focused { self.ui.accent } else { self.ui.border };
        Block::bordered()
            .title(title)
            .border_type(BorderType::Rounded)
            .border_style(Style::default().fg(border))
            .style(self.styles.base)
    }
}

fn ui(f: &mut ratatui::Frame, app: &mut App, layout: &LayoutInfo) {
    f.render_widget(
        Paragraph::new(app.status_line()).style(app.styles.base),
        layout.status,
    );

    if let Some(result) = app.session.submission.clone() {
        let lines = report_lines(&app.session, &result, &app.styles);
        let report = Paragraph::new(Text::from(lines))
            .block(app.pane_block(" Report ".to_string(), true))
            .wrap(Wrap { trim: false });
        f.render_widget(report, layout.report);
        return;
    }

    let highlight_fg = app.ui.base_bg.unwrap_or(app.ui.base_fg);
    let highlight_style = Style::default().bg(app.ui.accent).fg(highlight_fg);
    let items: Vec<ListItem> = app
        .session
        .workspace
        .paths()
        .map(|path| {
            let workspace = &app.session.workspace;
            let modified = if workspace.is_modified(path) { "*" } else { " " };
            let open = if workspace.open_files().iter().any(|p| p == path) { "•" } else { " " };
            ListItem::new(format!("{open}{modified}{path}"))
        })
        .collect();
    let mut state = ListState::default();
    state.select(Some(app.file_selected));
    let list = List::new(items)
        .block(app.pane_block(" Files ".to_string(), app.focus == Focus::Files))
        .style(app.styles.base)
        .highlight_style(highlight_style);
    f.render_stateful_widget(list, layout.files, &mut state);

    if app.show_tests && (app.session.tests.is_some() || app.session.pending.tests) {
        let lines = match &app.session.tests {
            Some(tests) if !app.session.pending.tests => test_result_lines(tests, &app.styles),
            _ => vec![Line::from(Span::styled("running…", app.styles.prefix))],
        };
        let panel = Paragraph::new(Text::from(lines))
            .block(app.pane_block(" Tests (Ctrl-o hides) ".to_string(), false))
            .wrap(Wrap { trim: false });
        f.render_widget(panel, layout.editor);
    } else {
        let title = match app.session.workspace.active() {
            Some(path) if app.session.workspace.is_modified(path) => format!(" *{path} "),
            Some(path) => format!(" {path} "),
            None => " editor ".to_string(),
        };
        app.ensure_editor_cache();
        let editor = Paragraph::new(Text::from(app.editor_lines.clone()))
            .block(app.pane_block(title, app.focus == Focus::Editor))
            .style(app.styles.base)
            .scroll((app.edit_scroll as u16, 0));
        f.render_widget(editor, layout.editor);
    }

    let theme = app.theme_manager.get(&app.config.theme);
    let highlighter = Highlighter {
        syntax_set: &app.syntax_set,
        theme,
    };
    let view = build_chat_view(&app.session, &app.styles, &highlighter, app.chat_selected);
    let max_scroll = view.lines.len().saturating_sub(layout.chat_height as usize);
    if app.focus == Focus::Chat {
        if let Some((_, _, line)) = view
            .anchors
            .iter()
            .find(|(m, k, _)| Some((*m, *k)) == app.chat_selected)
        {
            let height = layout.chat_height as usize;
            if *line < app.chat_scroll {
                app.chat_scroll = *line;
            } else if *line >= app.chat_scroll + height {
                app.chat_scroll = line.saturating_sub(height / 2);
            }
        }
    }
    app.chat_scroll = app.chat_scroll.min(max_scroll);
    let chat = Paragraph::new(Text::from(view.lines))
        .block(app.pane_block(" Assistant ".to_string(), app.focus == Focus::Chat))
        .wrap(Wrap { trim: false })
        .scroll((app.chat_scroll as u16, 0));
    f.render_widget(chat, layout.chat);

    let prompt = Paragraph::new(Line::from(Span::styled(
        app.prompt_input.clone(),
        app.styles.base,
    )))
    .block(app.pane_block(" Ask ".to_string(), app.focus == Focus::Prompt));
    f.render_widget(prompt, layout.prompt);

    let cursor = match app.focus {
        Focus::Editor if !app.show_tests => app.edit_cursor_screen_position(layout),
        Focus::Prompt => app.prompt_cursor_position(layout),
        _ => None,
    };
    if let Some((x, y)) = cursor {
        f.set_cursor(x, y);
    }
}

fn line_len_chars(rope: &Rope, line: usize) -> usize {
    if line >= rope.len_lines() {
        return 0;
    }
    let slice = rope.line(line);
    let mut len = slice.len_chars();
    if len == 0 {
        return 0;
    }
    if slice.char(len - 1) == '\n' {
        len = len.saturating_sub(1);
    }
    len
}

fn expand_tabs(text: &str, tab_width: usize) -> String {
    if text.contains('\t') {
        text.replace('\t', &" ".repeat(tab_width.max(1)))
    } else {
        text.to_string()
    }
}

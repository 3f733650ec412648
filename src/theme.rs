use crate::config::Config;
use anyhow::{Context, Result};
use ratatui::style::Color;
use syntect::highlighting::{Theme, ThemeSet};
use tracing::debug;

const FALLBACK_THEME: &str = "base16-ocean.dark";

pub struct ThemeManager {
    theme_set: ThemeSet,
    theme_names: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct UiPalette {
    pub base_fg: Color,
    pub base_bg: Option<Color>,
    pub accent: Color,
    pub muted: Color,
    pub code_bg: Option<Color>,
    pub border: Color,
    pub ok: Color,
    pub error: Color,
}

impl ThemeManager {
    pub fn load(config: &Config) -> Result<Self> {
        let mut theme_set = ThemeSet::load_defaults();

        if let Some(dir) = config.theme_dir.as_ref().filter(|dir| dir.exists()) {
            let extra = ThemeSet::load_from_folder(dir)
                .with_context(|| format!("Failed to load themes from {}", dir.display()))?;
            debug!(dir = %dir.display(), count = extra.themes.len(), "extra themes loaded");
            theme_set.themes.extend(extra.themes);
        }

        let mut theme_names: Vec<String> = theme_set.themes.keys().cloned().collect();
        theme_names.sort();

        Ok(Self {
            theme_set,
            theme_names,
        })
    }

    pub fn theme_names(&self) -> &[String] {
        &self.theme_names
    }

    /// Resolves `name`, falling back to the bundled default and then to any
    /// loaded theme.
    pub fn get(&self, name: &str) -> Option<&Theme> {
        self.theme_set
            .themes
            .get(name)
            .or_else(|| self.theme_set.themes.get(FALLBACK_THEME))
            .or_else(|| self.theme_set.themes.values().next())
    }

    pub fn ui_palette(&self, name: &str) -> UiPalette {
        match self.get(name) {
            Some(theme) => palette_from_theme(theme),
            None => UiPalette::plain(),
        }
    }
}

impl UiPalette {
    pub fn plain() -> Self {
        Self {
            base_fg: Color::Gray,
            base_bg: None,
            accent: Color::Cyan,
            muted: Color::DarkGray,
            code_bg: None,
            border: Color::DarkGray,
            ok: Color::Green,
            error: Color::Red,
        }
    }
}

fn palette_from_theme(theme: &Theme) -> UiPalette {
    let settings = &theme.settings;
    let plain = UiPalette::plain();
    let base_fg = settings.foreground.map(to_ratatui).unwrap_or(plain.base_fg);
    let base_bg = settings.background.map(to_ratatui);
    let accent = settings
        .selection_foreground
        .or(settings.caret)
        .or(settings.foreground)
        .map(to_ratatui)
        .unwrap_or(plain.accent);
    let muted = settings
        .gutter_foreground
        .or(settings.foreground)
        .map(to_ratatui)
        .unwrap_or(plain.muted);
    let code_bg = settings
        .line_highlight
        .or(settings.selection)
        .or(settings.background)
        .map(to_ratatui);

    UiPalette {
        base_fg,
        base_bg,
        accent,
        muted,
        code_bg,
        border: muted,
        ok: plain.ok,
        error: plain.error,
    }
}

fn to_ratatui(color: syntect::highlighting::Color) -> Color {
    Color::Rgb(color.r, color.g, color.b)
}

#[cfg(test)]
mod tests {
    use super::ThemeManager;
    use crate::config::Config;

    fn manager() -> ThemeManager {
        let cfg = Config {
            theme_dir: None,
            ..Config::default()
        };
        ThemeManager::load(&cfg).expect("themes")
    }

    #[test]
    fn bundled_themes_are_sorted() {
        let mgr = manager();
        let names = mgr.theme_names();
        assert!(names.iter().any(|n| n == "base16-ocean.dark"));
        assert!(names.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn unknown_theme_falls_back() {
        let mgr = manager();
        assert!(mgr.get("no-such-theme").is_some());
        let palette = mgr.ui_palette("no-such-theme");
        assert_eq!(palette.border, palette.muted);
    }
}

//! Terminal color and symbol handling.
//!
//! Colors and emoji are switched off by:
//! - the `--no-color` CLI flag
//! - `NO_COLOR` (https://no-color.org/) or `FUNDUS_NO_COLOR`
//! - `TERM=dumb`
//! - stderr not being a TTY

use colored::ColoredString;
use std::io::{stderr, IsTerminal};
use std::sync::OnceLock;

static COLOR_CONFIG: OnceLock<ColorConfig> = OnceLock::new();

fn should_disable_colors_from_env() -> bool {
    !std::env::var("NO_COLOR").unwrap_or_default().is_empty()
        || !std::env::var("FUNDUS_NO_COLOR").unwrap_or_default().is_empty()
        || std::env::var("TERM").unwrap_or_default() == "dumb"
        || !stderr().is_terminal()
}

#[derive(Debug, Clone)]
struct ColorConfig {
    colors_enabled: bool,
}

impl ColorConfig {
    fn new(no_color_flag: bool) -> Self {
        Self {
            colors_enabled: !no_color_flag && !should_disable_colors_from_env(),
        }
    }
}

/// Initialize once at startup, after argument parsing.
pub fn init_color_config(no_color_flag: bool) {
    if COLOR_CONFIG.set(ColorConfig::new(no_color_flag)).is_err() {
        log::debug!("Color configuration already initialized");
    }
}

fn colors_enabled() -> bool {
    COLOR_CONFIG
        .get()
        .map(|config| config.colors_enabled)
        .unwrap_or_else(|| !should_disable_colors_from_env())
}

pub fn maybe_color_stderr<F>(text: &str, color_fn: F) -> String
where
    F: FnOnce(&str) -> ColoredString,
{
    if colors_enabled() {
        color_fn(text).to_string()
    } else {
        text.to_string()
    }
}

pub mod colors {
    use super::maybe_color_stderr;
    use colored::Colorize;

    pub fn error_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.red().bold())
    }

    pub fn warning_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.yellow())
    }

    pub fn info_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.green())
    }

    pub fn debug_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.blue())
    }

    pub fn trace_level(text: &str) -> String {
        maybe_color_stderr(text, |s| s.magenta())
    }
}

/// Emoji when colors are on, plain tags (or nothing) otherwise.
pub mod symbols {
    use super::colors_enabled;

    fn pick(emoji: &'static str, plain: &'static str) -> &'static str {
        if colors_enabled() {
            emoji
        } else {
            plain
        }
    }

    pub fn screening_start() -> &'static str {
        pick("🔬", "")
    }

    pub fn validation_start() -> &'static str {
        pick("🔎", "")
    }

    pub fn explain_start() -> &'static str {
        pick("🗺️ ", "[EXPLAIN]")
    }

    pub fn model_loaded() -> &'static str {
        pick("✅", "")
    }

    pub fn fallback_mode() -> &'static str {
        pick("🎲", "[FALLBACK]")
    }

    pub fn rejected() -> &'static str {
        pick("🚫", "[REJECTED]")
    }

    pub fn operation_failed() -> &'static str {
        pick("❌", "[FAILED]")
    }

    pub fn system_setup() -> &'static str {
        pick("⚙️ ", "")
    }

    pub fn resources_found() -> &'static str {
        pick("🎯", "")
    }

    pub fn completed_successfully() -> &'static str {
        pick("✅", "[SUCCESS]")
    }

    pub fn completed_partially_successfully() -> &'static str {
        pick("⚠️ ", "[PARTIAL-SUCCESS]")
    }

    pub fn warning() -> &'static str {
        pick("⚠️ ", "")
    }

    pub fn save_file() -> &'static str {
        pick("💾", "")
    }
}

pub mod progress {
    use crate::progress::add_progress_bar;

    use super::colors_enabled;
    use indicatif::{ProgressBar, ProgressStyle};
    use std::io::{stderr, IsTerminal};

    /// Batch progress bar, only for more than one image on an interactive stderr.
    pub fn create_batch_progress_bar(total: usize) -> Option<ProgressBar> {
        if total <= 1 || !stderr().is_terminal() {
            return None;
        }
        let pb = ProgressBar::new(total as u64);
        add_progress_bar(pb.clone());
        let (template, chars) = if colors_enabled() {
            (
                "[{elapsed_precise}] [{bar:30.cyan/black}] ({percent}%) {msg}\n{prefix}",
                "█▓▒░",
            )
        } else {
            ("[{elapsed_precise}] [{bar:30}] ({percent}%) {msg}\n{prefix}", "#> ")
        };
        // Templates are constants; a parse failure would only lose styling
        if let Ok(style) = ProgressStyle::default_bar().template(template) {
            pb.set_style(style.progress_chars(chars));
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_color_config_respects_no_color_flag() {
        assert!(!ColorConfig::new(true).colors_enabled);
    }

    #[test]
    #[serial]
    fn test_color_config_respects_no_color_env() {
        std::env::set_var("NO_COLOR", "1");
        let config = ColorConfig::new(false);
        std::env::remove_var("NO_COLOR");
        assert!(!config.colors_enabled);
    }

    #[test]
    #[serial]
    fn test_color_config_respects_fundus_no_color() {
        std::env::set_var("FUNDUS_NO_COLOR", "1");
        let config = ColorConfig::new(false);
        std::env::remove_var("FUNDUS_NO_COLOR");
        assert!(!config.colors_enabled);
    }

    #[test]
    #[serial]
    fn test_color_config_respects_term_dumb() {
        let original = std::env::var("TERM");
        std::env::set_var("TERM", "dumb");
        let config = ColorConfig::new(false);
        match original {
            Ok(v) => std::env::set_var("TERM", v),
            Err(_) => std::env::remove_var("TERM"),
        }
        assert!(!config.colors_enabled);
    }

    #[test]
    fn test_plain_text_when_disabled() {
        use colored::Colorize;
        COLOR_CONFIG
            .set(ColorConfig {
                colors_enabled: false,
            })
            .ok();
        if !colors_enabled() {
            assert_eq!(maybe_color_stderr("plain", |s| s.red()), "plain");
            assert_eq!(symbols::rejected(), "[REJECTED]");
        }
    }
}

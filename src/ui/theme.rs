//! Terminal output mode and colour palette
//!
//! `INVREFRESH_QUIET=1` hides progress bars; `NO_COLOR` or a non-terminal
//! stdout drops colours. Both are read once per process.

use owo_colors::Style;
use std::sync::OnceLock;

static MODE: OnceLock<OutputMode> = OnceLock::new();
static PALETTE: OnceLock<Palette> = OnceLock::new();

const QUIET_VAR: &str = "INVREFRESH_QUIET";

/// How decorated terminal output may be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputMode {
    /// Progress bars and spinners are hidden
    pub quiet: bool,
    pub color: bool,
}

impl OutputMode {
    pub fn detect() -> Self {
        Self::from_env(
            std::env::var(QUIET_VAR).ok().as_deref(),
            std::env::var("NO_COLOR").ok().as_deref(),
            console::Term::stdout().is_term(),
        )
    }

    fn from_env(quiet: Option<&str>, no_color: Option<&str>, terminal: bool) -> Self {
        let quiet = quiet.is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
        let no_color = no_color.is_some_and(|v| !v.is_empty());
        Self {
            quiet: quiet || !terminal,
            color: terminal && !quiet && !no_color,
        }
    }
}

pub fn output_mode() -> OutputMode {
    *MODE.get_or_init(OutputMode::detect)
}

/// Styles by the role of the text they decorate.
#[derive(Debug, Clone)]
pub struct Palette {
    pub title: Style,
    pub label: Style,
    pub ok: Style,
    pub failure: Style,
    pub caution: Style,
    /// Layer numbers and summary icons
    pub accent: Style,
}

impl Palette {
    pub fn for_mode(mode: OutputMode) -> Self {
        if !mode.color {
            let plain = Style::new();
            return Self {
                title: plain,
                label: plain,
                ok: plain,
                failure: plain,
                caution: plain,
                accent: plain,
            };
        }
        Self {
            title: Style::new().cyan().bold(),
            label: Style::new().white().dimmed(),
            ok: Style::new().green().bold(),
            failure: Style::new().red().bold(),
            caution: Style::new().yellow().bold(),
            accent: Style::new().magenta(),
        }
    }
}

pub fn palette() -> &'static Palette {
    PALETTE.get_or_init(|| Palette::for_mode(output_mode()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_mode_from_env() {
        let mode = OutputMode::from_env(None, None, true);
        assert!(mode.color && !mode.quiet);

        let mode = OutputMode::from_env(Some("TRUE"), None, true);
        assert!(mode.quiet && !mode.color);

        let mode = OutputMode::from_env(Some("0"), Some("1"), true);
        assert!(!mode.quiet && !mode.color);

        // an empty NO_COLOR does not disable colours
        assert!(OutputMode::from_env(None, Some(""), true).color);

        let piped = OutputMode::from_env(None, None, false);
        assert!(piped.quiet && !piped.color);
    }
}

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

/// Terminal feedback for the offline scanner. Progress goes to stderr so the
/// JSON summary on stdout stays machine-readable.
#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    is_tty: bool,
}

impl Ui {
    pub fn new(mode: UiMode, is_tty: bool) -> Self {
        Self { mode, is_tty }
    }

    pub fn from_flag(ui_flag: Option<&str>, is_tty: bool) -> Self {
        let mode = match ui_flag {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        };
        Self::new(mode, is_tty)
    }

    fn pretty(&self) -> bool {
        self.is_tty && self.mode != UiMode::Plain
    }

    /// Progress over video frames. `hint` is the advertised frame count and
    /// may be 0 or wrong. A spinner started without a hint turns into a bar
    /// once `update` sees one; the bar grows when the real count exceeds it.
    pub fn frames(&self, label: &str, hint: u64) -> FrameProgress {
        let bar = if self.pretty() {
            let bar = if hint > 0 {
                ProgressBar::new(hint)
            } else {
                ProgressBar::new_spinner()
            };
            bar.set_draw_target(ProgressDrawTarget::stderr());
            bar.set_style(frame_style(hint > 0));
            bar.set_message(label.to_string());
            Some(bar)
        } else {
            eprintln!("==> {label}");
            None
        };
        FrameProgress {
            label: label.to_string(),
            start: Instant::now(),
            bar,
            last_plain: 0,
        }
    }
}

fn frame_style(sized: bool) -> ProgressStyle {
    let template = if sized {
        "{msg} [{bar:30}] {pos}/{len} frames ({per_sec})"
    } else {
        "{spinner} {msg} {pos} frames ({per_sec})"
    };
    ProgressStyle::with_template(template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

pub struct FrameProgress {
    label: String,
    start: Instant,
    bar: Option<ProgressBar>,
    last_plain: u64,
}

const PLAIN_EVERY: u64 = 100;

impl FrameProgress {
    pub fn update(&mut self, processed: u64, hint: u64) {
        match &self.bar {
            Some(bar) => {
                if bar.length().is_none() && hint > 0 {
                    bar.set_length(hint.max(processed));
                    bar.set_style(frame_style(true));
                } else if bar.length().is_some_and(|len| processed > len) {
                    bar.set_length(processed);
                }
                bar.set_position(processed);
            }
            None => {
                if processed >= self.last_plain + PLAIN_EVERY {
                    self.last_plain = processed;
                    eprintln!("    {processed}/{hint} frames");
                }
            }
        }
    }
}

impl Drop for FrameProgress {
    fn drop(&mut self) {
        let message = format!("✔ {} ({})", self.label, format_duration(self.start.elapsed()));
        if let Some(bar) = &self.bar {
            bar.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

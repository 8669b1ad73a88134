//! Progress spinner shown while a backend is generating

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct WaitSpinner {
    bar: ProgressBar,
    active: bool,
}

impl WaitSpinner {
    pub fn new() -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("  {spinner:.cyan} {msg} ({elapsed})") {
            bar.set_style(style.tick_strings(&[
                "\u{2800}", "\u{2801}", "\u{2803}", "\u{2807}", "\u{280f}", "\u{281f}",
                "\u{283f}", "\u{287f}", "\u{28ff}", "\u{28fe}", "\u{28fc}", "\u{28f8}",
                "\u{28f0}", "\u{28e0}", "\u{28c0}", "\u{2880}", "\u{2800}",
            ]));
        }
        Self { bar, active: false }
    }

    pub fn start(&mut self, msg: impl Into<String>) {
        self.bar.set_message(msg.into());
        self.bar.enable_steady_tick(Duration::from_millis(80));
        self.active = true;
    }

    pub fn stop(&mut self) {
        if self.active {
            self.bar.finish_and_clear();
            self.active = false;
        }
    }
}

impl Drop for WaitSpinner {
    fn drop(&mut self) {
        self.stop();
    }
}

use std::io::{self, Write};

/// Console progress bar for the training loop, drawn on stderr.
pub struct ProgressBar {
    total: usize,
    current: usize,
    prefix: String,
    status: String,
    width: usize,
}

impl ProgressBar {
    #[must_use]
    pub fn new(total: usize, prefix: &str) -> Self {
        Self {
            total,
            current: 0,
            prefix: prefix.to_string(),
            status: String::new(),
            width: 30,
        }
    }

    /// Advances by one step and shows `status` (typically the current loss).
    pub fn inc(&mut self, status: impl Into<String>) {
        self.current = (self.current + 1).min(self.total);
        self.status = status.into();
        self.render();
    }

    pub fn finish(&self) {
        eprintln!();
        let _ = io::stderr().flush();
    }

    fn filled(&self) -> usize {
        if self.total == 0 {
            0
        } else {
            (self.current * self.width / self.total).min(self.width)
        }
    }

    fn render(&self) {
        let filled = self.filled();
        let bar = "█".repeat(filled) + &"░".repeat(self.width - filled);
        eprint!("\r{} [{}] {}/{} {}", self.prefix, bar, self.current, self.total, self.status);
        let _ = io::stderr().flush();
    }
}

impl Drop for ProgressBar {
    fn drop(&mut self) {
        self.finish();
    }
}

use std::future::Future;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

/// Progress spinner shown on stderr while a command waits on the printer.
#[derive(Debug)]
pub(crate) struct Spinner {
    enabled: bool,
}

impl Spinner {
    pub(crate) fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Runs `operation`, spinning with `message` when enabled.
    pub(crate) async fn with_spinner<F, Fut, T>(&self, message: &str, operation: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.enabled {
            return operation().await;
        }

        let spinner = ProgressBar::new_spinner();
        spinner.set_style(spinner_style());
        spinner.set_message(message.to_string());
        spinner.enable_steady_tick(Duration::from_millis(90));
        let result = operation().await;
        spinner.finish_and_clear();
        result
    }
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed:.dim}")
        .unwrap_or_else(|_error| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::disabled(false)]
    #[case::enabled(true)]
    #[tokio::test]
    async fn with_spinner_returns_operation_result(#[case] enabled: bool) {
        let spinner = Spinner::new(enabled);
        let result = spinner.with_spinner("printing", || async { "done" }).await;
        assert_eq!("done", result);
    }
}

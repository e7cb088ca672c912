use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use deltarepo_dl::types::Progress;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::utils::progress_enabled;

/// Shared MultiProgress instance for suspend/stop from other modules.
static MULTI: LazyLock<Arc<MultiProgress>> = LazyLock::new(|| Arc::new(MultiProgress::new()));

/// Pause progress display, run the closure, then resume.
pub fn suspend<F: FnOnce()>(f: F) {
    MULTI.suspend(f);
}

/// Stop and clear all progress bars.
pub fn stop() {
    MULTI.clear().ok();
}

fn download_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.cyan} {prefix}  {wide_bar:.cyan/dim}  {bytes}/{total_bytes}  {eta}",
    )
    .unwrap()
    .progress_chars("━━─")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.cyan} {msg}").unwrap()
}

/// Create a download progress bar with bytes and ETA.
pub fn create_download_job(prefix: &str) -> ProgressBar {
    let pb = if progress_enabled() {
        MULTI.add(ProgressBar::new(0))
    } else {
        MULTI.add(ProgressBar::hidden())
    };
    pb.set_style(download_style());
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Create a spinner job.
pub fn create_spinner_job(message: &str) -> ProgressBar {
    let pb = if progress_enabled() {
        MULTI.add(ProgressBar::new_spinner())
    } else {
        MULTI.add(ProgressBar::hidden())
    };
    pb.set_style(spinner_style());
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

pub fn handle_download_progress(state: Progress, pb: &ProgressBar) {
    match state {
        Progress::Starting {
            total,
        } => {
            pb.set_length(total);
        }
        Progress::Chunk {
            current, ..
        } => {
            pb.set_position(current);
        }
        Progress::Complete {
            ..
        } => {
            pb.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_progress_updates_bar() {
        let pb = ProgressBar::hidden();
        handle_download_progress(Progress::Starting { total: 100 }, &pb);
        assert_eq!(pb.length(), Some(100));
        handle_download_progress(
            Progress::Chunk {
                current: 40,
                total: 100,
            },
            &pb,
        );
        assert_eq!(pb.position(), 40);
        handle_download_progress(Progress::Complete { total: 100 }, &pb);
        assert!(pb.is_finished());
    }
}

//! Progress bar utilities for downloads

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

const DOWNLOAD_TEMPLATE: &str =
    "{msg:24} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})";
const UNKNOWN_SIZE_TEMPLATE: &str = "{msg:24} {spinner:.green} {bytes} ({bytes_per_sec})";

/// Container for concurrent download bars; hidden when progress is disabled
#[derive(Clone)]
pub struct DownloadProgress {
    multi: MultiProgress,
    enabled: bool,
}

impl DownloadProgress {
    pub fn new(enabled: bool) -> Self {
        let multi = if enabled {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };
        Self { multi, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Bar for one file; a spinner when the size is unknown
    pub fn file_bar(&self, name: &str, size: Option<u64>) -> ProgressBar {
        if !self.enabled {
            return ProgressBar::hidden();
        }

        let pb = match size {
            Some(total) => {
                let style = ProgressStyle::default_bar()
                    .template(DOWNLOAD_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("#>-");
                ProgressBar::new(total).with_style(style)
            },
            None => {
                let style = ProgressStyle::default_spinner()
                    .template(UNKNOWN_SIZE_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner());
                ProgressBar::new_spinner().with_style(style)
            },
        };
        let pb = self.multi.add(pb);
        pb.set_message(name.to_string());
        pb
    }
}

//! Progress bars for download runs.

use std::path::{Path, PathBuf};

use courier_core::ProgressListener;
use courier_core::request::RequestId;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use url::Url;

const BAR_TEMPLATE: &str = "{spinner} {msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})";

/// Creates the shared bar container, hidden when output is quiet.
pub(crate) fn multi_progress(enabled: bool) -> MultiProgress {
    if enabled {
        MultiProgress::new()
    } else {
        MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
    }
}

/// One download's bar, fed by the engine's progress callbacks.
pub(crate) struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub(crate) fn new(multi: &MultiProgress, label: &str) -> Self {
        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(
            ProgressStyle::with_template(BAR_TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(label.to_string());
        Self { bar }
    }

    pub(crate) fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressListener for BarProgress {
    fn on_progress(&self, _request_id: RequestId, bytes_read: u64, total: Option<u64>) {
        if let Some(total) = total {
            self.bar.set_length(total);
        }
        self.bar.set_position(bytes_read);
    }
}

/// File name for a download of `url`: the last path segment, or `index.html`.
pub(crate) fn download_file_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "index.html".to_string())
}

/// Target path inside `dir`, suffixed with the input position to keep names unique.
pub(crate) fn download_path(dir: &Path, url: &str, index: usize, total: usize) -> PathBuf {
    let name = download_file_name(url);
    if total > 1 {
        dir.join(format!("{index}-{name}"))
    } else {
        dir.join(name)
    }
}

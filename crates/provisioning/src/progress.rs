// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Progress reporting for long-running image operations

use log::{error, info};

/// Receives progress of an operation
pub trait ProgressSink {
    /// `done` of `total` bytes have been processed
    fn update(&mut self, done: u64, total: u64);

    /// The operation completed successfully
    fn finish(&mut self);

    /// The operation failed
    fn fail(&mut self);
}

/// Discards all progress
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn update(&mut self, _done: u64, _total: u64) {}

    fn finish(&mut self) {}

    fn fail(&mut self) {}
}

/// Logs progress each time a new whole percentage is reached
#[derive(Debug)]
pub struct LogProgress {
    message: String,
    percent: Option<u64>,
}

impl LogProgress {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            percent: None,
        }
    }

    /// Last percentage that was logged
    pub fn percent(&self) -> Option<u64> {
        self.percent
    }
}

/// Percentage of `total` that `done` represents, rounded down
pub fn percentage(done: u64, total: u64) -> u64 {
    if total == 0 {
        return 100;
    }
    ((done as u128 * 100) / total as u128).min(100) as u64
}

impl ProgressSink for LogProgress {
    fn update(&mut self, done: u64, total: u64) {
        let percent = percentage(done, total);
        if self.percent == Some(percent) {
            return;
        }
        self.percent = Some(percent);
        info!(
            "{}: {percent}% complete ({} of {})",
            self.message,
            format_size(done),
            format_size(total)
        );
    }

    fn finish(&mut self) {
        info!("{}: 100% complete...done.", self.message);
    }

    fn fail(&mut self) {
        error!("{}: {}% complete...failed.", self.message, self.percent.unwrap_or(0));
    }
}

/// Format a byte size into a human-readable string with appropriate units
///
/// # Examples
///
/// ```
/// use provisioning::progress::format_size;
/// assert_eq!(format_size(1536), "1.5KiB");
/// assert_eq!(format_size(1024 * 1024), "1.0MiB");
/// ```
pub fn format_size(size: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let size = size as f64;
    if size >= TB {
        format!("{:.1}TiB", size / TB)
    } else if size >= GB {
        format!("{:.1}GiB", size / GB)
    } else if size >= MB {
        format!("{:.1}MiB", size / MB)
    } else if size >= KB {
        format!("{:.1}KiB", size / KB)
    } else {
        format!("{}B", size)
    }
}

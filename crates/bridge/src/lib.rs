//! Bridge types shared between the engine and UI
//!
//! Everything here is plain data: the engine produces it, a presentation
//! layer renders it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a tracked download
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DownloadId(pub u64);

impl fmt::Display for DownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Source a download belongs to
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    LocalMedia,
    YouTube,
    SocialMedia,
    Torrent,
    Audio,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::LocalMedia,
        Category::YouTube,
        Category::SocialMedia,
        Category::Torrent,
        Category::Audio,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::LocalMedia => "Local Media",
            Category::YouTube => "YouTube",
            Category::SocialMedia => "Social Media",
            Category::Torrent => "Torrent",
            Category::Audio => "Audio",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Lifecycle status of a download
///
/// ```text
/// Queued -> Downloading -> Completed
///              |  ^   \
///              v  |    -> Failed
///             Paused
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
}

impl Default for DownloadStatus {
    fn default() -> Self {
        DownloadStatus::Queued
    }
}

impl DownloadStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DownloadStatus::Queued => "Queued",
            DownloadStatus::Downloading => "Downloading",
            DownloadStatus::Paused => "Paused",
            DownloadStatus::Completed => "Completed",
            DownloadStatus::Failed => "Failed",
        }
    }

    /// Completed and Failed never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadStatus::Completed | DownloadStatus::Failed)
    }

    /// Whether `next` is a legal successor of this status
    pub fn can_transition_to(&self, next: DownloadStatus) -> bool {
        use DownloadStatus::*;
        matches!(
            (self, next),
            (Queued, Downloading)
                | (Downloading, Completed)
                | (Downloading, Paused)
                | (Downloading, Failed)
                | (Paused, Downloading)
        )
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What moves an entry's progress forward
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    /// Advanced by the engine's periodic tick
    Simulated,
    /// Advanced only by progress reports from a platform service
    External,
}

impl Default for Driver {
    fn default() -> Self {
        Driver::Simulated
    }
}

/// A tracked download as seen by the UI
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DownloadEntry {
    pub id: DownloadId,
    pub name: String,
    pub category: Category,
    pub status: DownloadStatus,
    /// Percentage, 0.0 to 100.0
    pub progress: f64,
    pub size_bytes: u64,
    pub driver: Driver,
    /// Failure reason, only set when status is Failed
    pub error: Option<String>,
    /// Latest status line from the platform service, display only
    #[serde(default)]
    pub status_text: Option<String>,
    /// Creation time, milliseconds since the Unix epoch
    pub added_at_ms: u64,
}

impl DownloadEntry {
    pub fn new(
        id: DownloadId,
        name: impl Into<String>,
        category: Category,
        size_bytes: u64,
        driver: Driver,
        added_at_ms: u64,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            category,
            status: DownloadStatus::Queued,
            progress: 0.0,
            size_bytes,
            driver,
            error: None,
            status_text: None,
            added_at_ms,
        }
    }

    /// Bytes implied by the current progress
    pub fn downloaded_bytes(&self) -> u64 {
        ((self.size_bytes as f64) * self.progress / 100.0).round() as u64
    }

    /// Queued, downloading or paused
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Query over a set of entries; empty filter matches everything
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadFilter {
    pub category: Option<Category>,
    pub status: Option<DownloadStatus>,
    pub active_only: bool,
}

impl DownloadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn category(category: Category) -> Self {
        Self {
            category: Some(category),
            ..Self::default()
        }
    }

    pub fn status(status: DownloadStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn active() -> Self {
        Self {
            active_only: true,
            ..Self::default()
        }
    }

    pub fn matches(&self, entry: &DownloadEntry) -> bool {
        self.category.map_or(true, |c| c == entry.category)
            && self.status.map_or(true, |s| s == entry.status)
            && (!self.active_only || entry.is_active())
    }
}

/// Dashboard counters
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStats {
    pub total: usize,
    pub queued: usize,
    pub downloading: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
}

impl DownloadStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a DownloadEntry>) -> Self {
        let mut stats = Self::default();
        for entry in entries {
            stats.total += 1;
            stats.total_bytes += entry.size_bytes;
            stats.downloaded_bytes += entry.downloaded_bytes();
            match entry.status {
                DownloadStatus::Queued => stats.queued += 1,
                DownloadStatus::Downloading => stats.downloading += 1,
                DownloadStatus::Paused => stats.paused += 1,
                DownloadStatus::Completed => stats.completed += 1,
                DownloadStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Nothing left that can still change
    pub fn is_settled(&self) -> bool {
        self.queued == 0 && self.downloading == 0 && self.paused == 0
    }
}

/// Transition notification
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum DownloadEvent {
    Added {
        id: DownloadId,
        name: String,
        category: Category,
    },
    Started {
        id: DownloadId,
    },
    Paused {
        id: DownloadId,
        progress: f64,
    },
    Resumed {
        id: DownloadId,
    },
    Completed {
        id: DownloadId,
        name: String,
    },
    Failed {
        id: DownloadId,
        name: String,
        reason: String,
    },
    Removed {
        id: DownloadId,
    },
    Cleared {
        count: usize,
    },
}

impl DownloadEvent {
    /// Entry the event refers to, if any
    pub fn id(&self) -> Option<DownloadId> {
        match self {
            DownloadEvent::Added { id, .. }
            | DownloadEvent::Started { id }
            | DownloadEvent::Paused { id, .. }
            | DownloadEvent::Resumed { id }
            | DownloadEvent::Completed { id, .. }
            | DownloadEvent::Failed { id, .. }
            | DownloadEvent::Removed { id } => Some(*id),
            DownloadEvent::Cleared { .. } => None,
        }
    }

    /// Status the entry is in after this event
    pub fn status(&self) -> Option<DownloadStatus> {
        match self {
            DownloadEvent::Added { .. } => Some(DownloadStatus::Queued),
            DownloadEvent::Started { .. } | DownloadEvent::Resumed { .. } => {
                Some(DownloadStatus::Downloading)
            }
            DownloadEvent::Paused { .. } => Some(DownloadStatus::Paused),
            DownloadEvent::Completed { .. } => Some(DownloadStatus::Completed),
            DownloadEvent::Failed { .. } => Some(DownloadStatus::Failed),
            DownloadEvent::Removed { .. } | DownloadEvent::Cleared { .. } => None,
        }
    }
}

/// Human readable size, e.g. `1.5 MB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

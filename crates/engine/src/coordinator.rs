//! Download lifecycle coordinator
//!
//! The only interface callers use. Owns the record store and the progress
//! loop; the loop starts on construction and stops on [`Coordinator::shutdown`]
//! or drop.
//!
//! Lifecycle operations never fail. An operation that does not apply (unknown
//! id, wrong status) is a logged no-op and returns `false`.

use crate::config::Config;
use crate::error::{EngineError, Rejection};
use crate::simulator::{self, LoopControl, Simulator};
use crate::store::{Snapshot, Store};
use bridge::{
    Category, DownloadEntry, DownloadEvent, DownloadFilter, DownloadId, DownloadStats,
    DownloadStatus, Driver,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub struct Coordinator {
    store: Arc<Store>,
    control: LoopControl,
    stop_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
    config: Config,
}

impl Coordinator {
    /// Validate `config` and start the progress loop on the current runtime
    pub fn new(config: Config) -> Result<Self, EngineError> {
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let store = Arc::new(Store::new(config.event_capacity));
        let control = LoopControl {
            cancelled: Arc::new(AtomicBool::new(false)),
            history_enabled: Arc::new(AtomicBool::new(config.history_enabled)),
        };
        // Subscribe before spawning so an early stop is never missed.
        let (stop_tx, stop_rx) = broadcast::channel(1);

        let period = config.tick_interval();
        let task = handle.spawn(simulator::run(
            store.clone(),
            Simulator::new(&config),
            period,
            Instant::now() + period,
            control.clone(),
            stop_rx,
        ));

        info!("Download coordinator started, tick every {:?}", period);

        Ok(Self {
            store,
            control,
            stop_tx,
            task: Some(task),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Start a simulated download
    pub fn add_download(
        &self,
        name: impl Into<String>,
        category: Category,
        size_bytes: u64,
    ) -> DownloadId {
        let name = name.into();
        info!("Adding {} download: {}", category, name);
        self.store.insert(name, category, size_bytes)
    }

    /// Start several simulated downloads, published as one snapshot
    pub fn add_downloads<I>(&self, requests: I) -> Vec<DownloadId>
    where
        I: IntoIterator<Item = (String, Category, u64)>,
    {
        let ids = self.store.insert_many(requests.into_iter().map(|(name, category, size)| {
            (name, category, size, Driver::Simulated)
        }));
        info!("Added {} downloads", ids.len());
        ids
    }

    /// Track a download whose progress comes from a platform service
    pub fn track_download(
        &self,
        name: impl Into<String>,
        category: Category,
        size_bytes: u64,
    ) -> DownloadId {
        let name = name.into();
        info!("Tracking external {} download: {}", category, name);
        self.store.insert_with(name, category, size_bytes, Driver::External)
    }

    /// Downloading -> Paused
    pub fn pause_download(&self, id: DownloadId) -> bool {
        self.apply(id, "pause", |entry| {
            if entry.status != DownloadStatus::Downloading {
                return Err(invalid(entry, "pause"));
            }
            entry.status = DownloadStatus::Paused;
            Ok(vec![DownloadEvent::Paused {
                id,
                progress: entry.progress,
            }])
        })
    }

    /// Paused -> Downloading
    pub fn resume_download(&self, id: DownloadId) -> bool {
        self.apply(id, "resume", |entry| {
            if entry.status != DownloadStatus::Paused {
                return Err(invalid(entry, "resume"));
            }
            entry.status = DownloadStatus::Downloading;
            Ok(vec![DownloadEvent::Resumed { id }])
        })
    }

    pub fn remove_download(&self, id: DownloadId) -> bool {
        let removed = self.store.remove(id);
        if removed {
            info!("Removed download {}", id);
        } else {
            debug!("{}", Rejection::NotFound(id));
        }
        removed
    }

    pub fn clear_all(&self) -> usize {
        let count = self.store.clear();
        info!("Cleared {} downloads", count);
        count
    }

    /// Remove Completed and Failed entries
    pub fn clear_finished(&self) -> usize {
        self.store.retain_unfinished()
    }

    /// Progress callback from a platform service.
    ///
    /// Only applies to externally driven entries that are Queued or
    /// Downloading. Progress never goes backwards; reaching 100 completes.
    pub fn report_progress(&self, id: DownloadId, progress: f64) -> bool {
        self.apply(id, "report progress for", |entry| {
            if entry.driver != Driver::External {
                return Err(Rejection::NotExternal(id));
            }
            if !progress.is_finite() {
                return Err(Rejection::InvalidProgress { id, value: progress });
            }
            let reported = progress.clamp(0.0, 100.0);
            let mut events = Vec::new();

            match entry.status {
                DownloadStatus::Queued if reported > 0.0 => {
                    entry.status = DownloadStatus::Downloading;
                    events.push(DownloadEvent::Started { id });
                }
                DownloadStatus::Queued | DownloadStatus::Downloading => {}
                _ => return Err(invalid(entry, "report progress for")),
            }
            if entry.status != DownloadStatus::Downloading || reported <= entry.progress {
                return Ok(events);
            }

            if reported >= 100.0 {
                simulator::complete(entry, &mut events);
            } else {
                entry.progress = reported;
            }
            Ok(events)
        })
    }

    /// Status line callback from a platform service, e.g. "Connecting to peers...".
    ///
    /// Display only: the text is stored on the entry but never changes its
    /// status. Ignored for simulated, finished and removed entries.
    pub fn report_status(&self, id: DownloadId, text: impl Into<String>) -> bool {
        let text = text.into();
        self.apply(id, "report status for", |entry| {
            if entry.driver != Driver::External {
                return Err(Rejection::NotExternal(id));
            }
            if entry.status.is_terminal() {
                return Err(invalid(entry, "report status for"));
            }
            entry.status_text = Some(text);
            Ok(Vec::new())
        })
    }

    /// Downloading -> Failed, keeping `reason` for display
    pub fn report_failure(&self, id: DownloadId, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.apply(id, "fail", |entry| {
            if !entry.status.can_transition_to(DownloadStatus::Failed) {
                return Err(invalid(entry, "fail"));
            }
            warn!("Download {} failed: {}", entry.name, reason);
            entry.status = DownloadStatus::Failed;
            entry.error = Some(reason.clone());
            Ok(vec![DownloadEvent::Failed {
                id,
                name: entry.name.clone(),
                reason,
            }])
        })
    }

    /// Live view of the entry list
    pub fn observe(&self) -> Observer {
        Observer {
            rx: self.store.subscribe(),
        }
    }

    /// Every transition, in order; lagging receivers lose the oldest events
    pub fn events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.store.events()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.store.snapshot()
    }

    pub fn get(&self, id: DownloadId) -> Option<DownloadEntry> {
        self.store.get(id)
    }

    pub fn downloads(&self, filter: &DownloadFilter) -> Vec<DownloadEntry> {
        self.store.query(filter)
    }

    pub fn stats(&self) -> DownloadStats {
        self.store.stats()
    }

    pub fn history_enabled(&self) -> bool {
        self.control.history_enabled.load(Ordering::SeqCst)
    }

    /// With history off, finished entries are dropped as soon as they finish
    pub fn set_history_enabled(&self, enabled: bool) {
        self.control.history_enabled.store(enabled, Ordering::SeqCst);
        info!("Download history {}", if enabled { "enabled" } else { "disabled" });
        if !enabled {
            self.store.retain_unfinished();
        }
    }

    /// Flip the history setting, returning the new value
    pub fn toggle_history(&self) -> bool {
        let enabled = !self.history_enabled();
        self.set_history_enabled(enabled);
        enabled
    }

    /// Stop the progress loop and wait for it to exit.
    ///
    /// Once this returns no tick will touch the store again.
    pub async fn shutdown(mut self) {
        self.cancel();
        let _ = self.stop_tx.send(());
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Progress loop ended abnormally: {}", e);
            }
        }
        info!("Download coordinator stopped");
    }

    /// Set the cancel flag, then wait out any tick already holding the store
    /// lock. Ticks check the flag under that lock, so none can start after.
    fn cancel(&self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
        self.store.batch(|_| ());
    }

    fn apply(
        &self,
        id: DownloadId,
        action: &'static str,
        f: impl FnOnce(&mut DownloadEntry) -> Result<Vec<DownloadEvent>, Rejection>,
    ) -> bool {
        let outcome = self.store.batch(|batch| -> Result<bool, Rejection> {
            let (events, changed) = match batch.modify_tracked(id, f) {
                Some((events, changed)) => (events?, changed),
                None => return Err(Rejection::NotFound(id)),
            };
            let finished = events.iter().any(|e| {
                matches!(e, DownloadEvent::Completed { .. } | DownloadEvent::Failed { .. })
            });
            for event in events {
                batch.emit(event);
            }
            if finished && !self.history_enabled() {
                batch.drop_finished();
            }
            Ok(changed)
        });

        match outcome {
            Ok(changed) => changed,
            Err(rejection) => {
                debug!("Ignoring {} request: {}", action, rejection);
                false
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.cancel();
            let _ = self.stop_tx.send(());
            task.abort();
        }
    }
}

fn invalid(entry: &DownloadEntry, action: &'static str) -> Rejection {
    Rejection::InvalidTransition {
        id: entry.id,
        from: entry.status,
        action,
    }
}

/// Push-based view of the store's snapshots.
///
/// Intermediate snapshots may be skipped when the consumer is slow, but the
/// latest one is always delivered.
#[derive(Clone)]
pub struct Observer {
    rx: watch::Receiver<Snapshot>,
}

impl Observer {
    pub fn current(&self) -> Snapshot {
        self.rx.borrow().clone()
    }

    /// Wait for the next snapshot; `None` once the coordinator is gone
    pub async fn changed(&mut self) -> Option<Snapshot> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until a snapshot satisfies `pred`, checking the current one first
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&[Arc<DownloadEntry>]) -> bool,
    ) -> Option<Snapshot> {
        loop {
            let snapshot = self.rx.borrow_and_update().clone();
            if pred(&snapshot) {
                return Some(snapshot);
            }
            self.rx.changed().await.ok()?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Ticks every hour so the loop never interferes with these tests.
    fn idle() -> Coordinator {
        Coordinator::new(Config {
            tick_interval_ms: 3_600_000,
            ..Config::default()
        })
        .unwrap()
    }

    fn downloading(coordinator: &Coordinator, progress: f64) -> DownloadId {
        let id = coordinator.track_download("show.mkv", Category::Torrent, 1000);
        assert!(coordinator.report_progress(id, progress));
        id
    }

    #[test]
    fn test_new_without_runtime_fails() {
        assert!(matches!(
            Coordinator::new(Config::default()),
            Err(EngineError::NoRuntime)
        ));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let config = Config {
            max_increment: 150.0,
            ..Config::default()
        };
        assert!(matches!(
            Coordinator::new(config),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_pause_requires_downloading() {
        let c = idle();
        let queued = c.add_download("clip", Category::YouTube, 10);
        assert!(!c.pause_download(queued));
        assert!(!c.resume_download(queued));
        assert_eq!(c.get(queued).unwrap().status, DownloadStatus::Queued);
        assert!(!c.pause_download(DownloadId(999)));
    }

    #[tokio::test]
    async fn test_pause_is_idempotent() {
        let c = idle();
        let id = downloading(&c, 30.0);

        assert!(c.pause_download(id));
        let once = c.get(id).unwrap();
        assert!(!c.pause_download(id));
        assert_eq!(c.get(id).unwrap(), once);
        assert_eq!(once.status, DownloadStatus::Paused);

        assert!(c.resume_download(id));
        assert_eq!(c.get(id).unwrap().status, DownloadStatus::Downloading);
    }

    #[tokio::test]
    async fn test_report_progress_walks_state_machine() {
        let c = idle();
        let mut events = c.events();
        let id = c.track_download("album.flac", Category::Audio, 5000);

        assert!(!c.report_progress(id, 0.0));
        assert_eq!(c.get(id).unwrap().status, DownloadStatus::Queued);

        assert!(c.report_progress(id, 40.0));
        assert!(!c.report_progress(id, 20.0));
        assert_eq!(c.get(id).unwrap().progress, 40.0);

        assert!(c.report_progress(id, 250.0));
        let done = c.get(id).unwrap();
        assert_eq!(done.status, DownloadStatus::Completed);
        assert_eq!(done.progress, 100.0);
        assert!(!c.report_progress(id, 100.0));

        let statuses: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|e| e.status())
            .collect();
        assert_eq!(
            statuses,
            vec![
                DownloadStatus::Queued,
                DownloadStatus::Downloading,
                DownloadStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_report_progress_reports_forward_moves() {
        let c = idle();
        let mut events = c.events();
        let id = downloading(&c, 10.0);
        while events.try_recv().is_ok() {}

        assert!(c.report_progress(id, 60.0));
        assert_eq!(c.get(id).unwrap().progress, 60.0);
        assert!(events.try_recv().is_err());

        assert!(!c.report_progress(id, 60.0));
    }

    #[tokio::test]
    async fn test_report_status_is_display_only() {
        let c = idle();
        let id = c.track_download("season.mkv", Category::Torrent, 1000);

        assert!(c.report_status(id, "Connecting to peers..."));
        let entry = c.get(id).unwrap();
        assert_eq!(entry.status, DownloadStatus::Queued);
        assert_eq!(entry.status_text.as_deref(), Some("Connecting to peers..."));
        assert!(!c.report_status(id, "Connecting to peers..."));

        assert!(c.report_progress(id, 30.0));
        assert!(c.report_status(id, "Downloading: 30%"));
        assert_eq!(c.get(id).unwrap().status, DownloadStatus::Downloading);

        c.pause_download(id);
        assert!(c.report_status(id, "Paused by user"));
        assert_eq!(c.get(id).unwrap().status, DownloadStatus::Paused);
    }

    #[tokio::test]
    async fn test_report_status_ignored_when_not_applicable() {
        let c = idle();
        let sim = c.add_download("clip", Category::YouTube, 10);
        assert!(!c.report_status(sim, "Connecting..."));
        assert_eq!(c.get(sim).unwrap().status_text, None);

        let done = downloading(&c, 50.0);
        c.report_status(done, "Downloading: 50%");
        c.report_progress(done, 100.0);
        assert!(!c.report_status(done, "Downloading: 100%"));
        assert_eq!(
            c.get(done).unwrap().status_text.as_deref(),
            Some("Downloading: 50%")
        );

        let gone = c.track_download("gone", Category::Audio, 10);
        c.remove_download(gone);
        assert!(!c.report_status(gone, "Connecting..."));
        assert!(c.get(gone).is_none());
    }

    #[tokio::test]
    async fn test_add_downloads_publishes_once() {
        let c = idle();
        let mut observer = c.observe();
        let mut events = c.events();

        let ids = c.add_downloads(
            (0..3).map(|i| (format!("part-{}", i), Category::LocalMedia, 100)),
        );
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));

        let snapshot = observer.changed().await.unwrap();
        assert_eq!(snapshot.len(), 3);
        assert!(!observer.rx.has_changed().unwrap());

        let added = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, DownloadEvent::Added { .. }))
            .count();
        assert_eq!(added, 3);
        assert!(c.add_downloads(Vec::new()).is_empty());
    }

    #[tokio::test]
    async fn test_report_progress_ignored_while_paused() {
        let c = idle();
        let id = downloading(&c, 10.0);
        c.pause_download(id);
        assert!(!c.report_progress(id, 60.0));
        assert_eq!(c.get(id).unwrap().progress, 10.0);
    }

    #[tokio::test]
    async fn test_report_progress_rejects_simulated_and_nan() {
        let c = idle();
        let sim = c.add_download("clip", Category::SocialMedia, 10);
        assert!(!c.report_progress(sim, 50.0));

        let ext = c.track_download("clip", Category::SocialMedia, 10);
        assert!(!c.report_progress(ext, f64::NAN));
        assert_eq!(c.get(ext).unwrap().progress, 0.0);
    }

    #[tokio::test]
    async fn test_report_failure() {
        let c = idle();
        let queued = c.track_download("a", Category::Torrent, 10);
        assert!(!c.report_failure(queued, "no peers"));

        let id = downloading(&c, 15.0);
        assert!(c.report_failure(id, "Insufficient space"));
        let failed = c.get(id).unwrap();
        assert_eq!(failed.status, DownloadStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("Insufficient space"));
        assert!(!c.report_failure(id, "again"));
        assert!(!c.resume_download(id));
    }

    #[tokio::test]
    async fn test_history_toggle_prunes_finished() {
        let c = idle();
        let done = downloading(&c, 10.0);
        c.report_progress(done, 100.0);
        let active = downloading(&c, 10.0);

        assert!(c.history_enabled());
        assert!(!c.toggle_history());
        assert!(c.get(done).is_none());
        assert!(c.get(active).is_some());

        c.report_progress(active, 100.0);
        assert!(c.get(active).is_none());

        assert!(c.toggle_history());
    }

    #[tokio::test]
    async fn test_queries() {
        let c = idle();
        c.add_download("a", Category::YouTube, 100);
        c.add_download("b", Category::Audio, 200);
        let ext = downloading(&c, 50.0);
        c.report_progress(ext, 100.0);

        assert_eq!(c.downloads(&DownloadFilter::category(Category::Audio)).len(), 1);
        assert_eq!(c.downloads(&DownloadFilter::active()).len(), 2);
        let stats = c.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.completed, 1);

        assert_eq!(c.clear_finished(), 1);
        assert_eq!(c.clear_all(), 2);
        assert!(c.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_latest() {
        let c = idle();
        let mut observer = c.observe();
        assert!(observer.current().is_empty());

        let id = c.add_download("a", Category::LocalMedia, 10);
        c.remove_download(id);
        let b = c.add_download("b", Category::LocalMedia, 10);

        // Coalesced: only the latest state matters.
        let latest = observer.changed().await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, b);
    }

    #[tokio::test]
    async fn test_observer_ends_after_shutdown() {
        let c = idle();
        let mut observer = c.observe();
        c.shutdown().await;
        assert!(observer.changed().await.is_none());
    }
}

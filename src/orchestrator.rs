//! Paged batch driver shared by every long-running task.
//!
//! Fetches a page, hands each item to the task's processor, reports
//! progress after every item and pauses between full pages. A failing item
//! is logged and recorded; it never stops the batch. Cancellation is
//! checked before every item and before every page fetch.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::models::media::{MediaItem, Paged, Performer};
use crate::stats::{BatchStats, ItemFailure};
use crate::utils::logging::ProgressSink;

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How the next page is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageMode {
    /// Processing removes items from the filter. The same page is re-read,
    /// items already attempted in this run are skipped, and the page only
    /// advances once it holds nothing new.
    Shrinking,
    /// The result set does not change; pages advance one by one.
    Stable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub limit: Option<usize>,
    pub cooldown: Duration,
    pub mode: PageMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Anything a batch can iterate over.
pub trait BatchItem {
    fn item_id(&self) -> &str;
}

impl BatchItem for MediaItem {
    fn item_id(&self) -> &str {
        &self.id
    }
}

impl BatchItem for Performer {
    fn item_id(&self) -> &str {
        &self.id
    }
}

pub fn thread_sleep(duration: Duration) {
    std::thread::sleep(duration);
}

pub struct BatchRunner<'a> {
    options: BatchOptions,
    progress: &'a dyn ProgressSink,
    cancel: &'a CancelToken,
    sleep: &'a dyn Fn(Duration),
}

impl<'a> BatchRunner<'a> {
    pub fn new(
        options: BatchOptions,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancelToken,
        sleep: &'a dyn Fn(Duration),
    ) -> Self {
        Self { options, progress, cancel, sleep }
    }

    fn cancelled(&self, stats: &BatchStats) -> Result<()> {
        if self.cancel.is_cancelled() {
            info!("Task cancelled after {} item(s)", stats.processed());
            return Err(PipelineError::Cancelled { processed: stats.processed() as usize });
        }
        Ok(())
    }

    /// Drive `process` over every item `fetch` yields. `fetch` takes a
    /// 1-based page number and a page size. Errors from `fetch` end the
    /// batch; errors from `process` are recorded per item.
    pub fn run<T, F, P>(&self, name: &str, mut fetch: F, mut process: P) -> Result<BatchResult>
    where
        T: BatchItem,
        F: FnMut(usize, usize) -> Result<Paged<T>>,
        P: FnMut(&T) -> Result<()>,
    {
        let per_page = self.options.batch_size.max(1);
        let stats = BatchStats::new();
        let mut attempted: HashSet<String> = HashSet::new();
        let mut total: Option<usize> = None;
        let mut page = 1;

        'pages: loop {
            self.cancelled(&stats)?;
            let processed = stats.processed() as usize;
            if self.options.limit.map_or(false, |limit| processed >= limit) {
                info!("Reached limit of {} item(s)", processed);
                break;
            }

            let batch = fetch(page, per_page)?;
            let expected = *total.get_or_insert_with(|| {
                let expected = self.options.limit.map_or(batch.total, |limit| limit.min(batch.total));
                info!("{}: {} item(s) to process", name, expected);
                expected
            });
            if batch.items.is_empty() {
                break;
            }

            let fresh: Vec<&T> = match self.options.mode {
                PageMode::Shrinking => batch.items.iter().filter(|i| !attempted.contains(i.item_id())).collect(),
                PageMode::Stable => batch.items.iter().collect(),
            };
            if fresh.is_empty() {
                debug!("Page {} holds only attempted items, advancing", page);
                page += 1;
                continue;
            }
            debug!("{}: page {} with {} new item(s)", name, page, fresh.len());

            for item in fresh {
                self.cancelled(&stats)?;
                if self.options.limit.map_or(false, |limit| stats.processed() as usize >= limit) {
                    info!("Reached limit of {} item(s)", stats.processed());
                    break 'pages;
                }

                let id = item.item_id().to_string();
                attempted.insert(id.clone());
                info!("[{}/{}] {} {}", stats.processed() + 1, expected, name, id);
                match process(item) {
                    Ok(()) => stats.record_success(),
                    Err(e) => {
                        warn!("Failed to process {}: {}", id, e);
                        stats.record_failure(&id, &e);
                    }
                }
                self.progress.progress(progress_fraction(stats.processed() as usize, expected));
            }

            if batch.items.len() < per_page {
                break;
            }
            if self.options.mode == PageMode::Stable {
                page += 1;
            }
            let processed = stats.processed() as usize;
            if processed < expected && !self.options.cooldown.is_zero() {
                info!("Cooling down for {:?}", self.options.cooldown);
                (self.sleep)(self.options.cooldown);
            }
        }

        self.progress.progress(1.0);
        let result = BatchResult {
            total: total.unwrap_or(0),
            processed: stats.processed() as usize,
            succeeded: stats.succeeded() as usize,
            failed: stats.failed() as usize,
            failures: stats.failures(),
        };
        info!(
            "{} finished: {} succeeded, {} failed in {:.1}s ({:.2} items/s)",
            name,
            result.succeeded,
            result.failed,
            stats.elapsed_secs(),
            stats.items_per_sec()
        );
        Ok(result)
    }
}

fn progress_fraction(processed: usize, total: usize) -> f64 {
    if total == 0 {
        1.0
    } else {
        (processed as f64 / total as f64).min(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::media::MediaKind;
    use crate::utils::logging::RecordingProgress;
    use parking_lot::Mutex;

    fn items(ids: std::ops::Range<usize>) -> Vec<MediaItem> {
        ids.map(|i| MediaItem::new(MediaKind::Image, i.to_string(), format!("/m/{}.jpg", i))).collect()
    }

    fn page_of(all: &[MediaItem], page: usize, per_page: usize) -> Paged<MediaItem> {
        let start = (page - 1) * per_page;
        Paged { total: all.len(), items: all.iter().skip(start).take(per_page).cloned().collect() }
    }

    fn options(batch_size: usize, limit: Option<usize>, mode: PageMode) -> BatchOptions {
        BatchOptions { batch_size, limit, cooldown: Duration::from_secs(5), mode }
    }

    #[test]
    fn test_stable_visits_every_item_once() {
        let all = items(0..7);
        let progress = RecordingProgress::new();
        let cancel = CancelToken::new();
        let sleeps = Mutex::new(Vec::new());
        let sleep = |d: Duration| sleeps.lock().push(d);
        let runner = BatchRunner::new(options(3, None, PageMode::Stable), &progress, &cancel, &sleep);

        let mut seen = Vec::new();
        let result = runner
            .run("test", |p, n| Ok(page_of(&all, p, n)), |item: &MediaItem| {
                seen.push(item.id.clone());
                Ok(())
            })
            .unwrap();

        assert_eq!(seen, (0..7).map(|i| i.to_string()).collect::<Vec<_>>());
        assert_eq!(result.processed, 7);
        assert_eq!(result.succeeded, 7);
        // Cooldown after each full page that leaves work behind.
        assert_eq!(sleeps.lock().len(), 2);
        assert_eq!(progress.last(), Some(1.0));
    }

    #[test]
    fn test_shrinking_skips_attempted_items() {
        // Items leave the filter on success; item 2 always fails and stays.
        let remaining = Mutex::new(items(0..5));
        let progress = RecordingProgress::new();
        let cancel = CancelToken::new();
        let sleep = |_d: Duration| {};
        let runner = BatchRunner::new(options(2, None, PageMode::Shrinking), &progress, &cancel, &sleep);

        let mut calls = Vec::new();
        let result = runner
            .run(
                "test",
                |p, n| Ok(page_of(&remaining.lock(), p, n)),
                |item: &MediaItem| {
                    calls.push(item.id.clone());
                    if item.id == "2" {
                        return Err(PipelineError::transient("vision", "boom"));
                    }
                    remaining.lock().retain(|i| i.id != item.id);
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(calls, vec!["0", "1", "2", "3", "4"]);
        assert_eq!(result.succeeded, 4);
        assert_eq!(result.failed, 1);
        assert_eq!(result.failures[0].item_id, "2");
    }

    #[test]
    fn test_limit_stops_early() {
        let all = items(0..10);
        let progress = RecordingProgress::new();
        let cancel = CancelToken::new();
        let sleep = |_d: Duration| {};
        let runner = BatchRunner::new(options(4, Some(6), PageMode::Stable), &progress, &cancel, &sleep);

        let result = runner.run("test", |p, n| Ok(page_of(&all, p, n)), |_item: &MediaItem| Ok(())).unwrap();
        assert_eq!(result.total, 6);
        assert_eq!(result.processed, 6);
    }

    #[test]
    fn test_cancellation_between_items() {
        let all = items(0..10);
        let progress = RecordingProgress::new();
        let cancel = CancelToken::new();
        let sleep = |_d: Duration| {};
        let runner = BatchRunner::new(options(10, None, PageMode::Stable), &progress, &cancel, &sleep);

        let mut seen = 0;
        let err = runner
            .run("test", |p, n| Ok(page_of(&all, p, n)), |_item: &MediaItem| {
                seen += 1;
                if seen == 5 {
                    cancel.cancel();
                }
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled { processed: 5 }));
        assert_eq!(seen, 5);
    }

    #[test]
    fn test_empty_result_reports_done() {
        let progress = RecordingProgress::new();
        let cancel = CancelToken::new();
        let sleep = |_d: Duration| {};
        let runner = BatchRunner::new(options(5, None, PageMode::Stable), &progress, &cancel, &sleep);
        let result = runner.run("test", |_p, _n| Ok(Paged::<MediaItem>::empty()), |_item: &MediaItem| Ok(())).unwrap();
        assert_eq!(result, BatchResult::empty());
        assert_eq!(progress.values(), vec![1.0]);
    }

    #[test]
    fn test_zero_cooldown_never_sleeps() {
        let all = items(0..6);
        let progress = RecordingProgress::new();
        let cancel = CancelToken::new();
        let sleeps = Mutex::new(0);
        let sleep = |_d: Duration| *sleeps.lock() += 1;
        let mut opts = options(2, None, PageMode::Stable);
        opts.cooldown = Duration::ZERO;
        let runner = BatchRunner::new(opts, &progress, &cancel, &sleep);
        runner.run("test", |p, n| Ok(page_of(&all, p, n)), |_item: &MediaItem| Ok(())).unwrap();
        assert_eq!(*sleeps.lock(), 0);
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(progress_fraction(0, 0), 1.0);
        assert_eq!(progress_fraction(1, 4), 0.25);
        assert_eq!(progress_fraction(9, 4), 1.0);
    }
}

use crate::db::{ActivityStore, StoreError};
use crate::models::{ActivityRecord, Category, MODE_SWITCH_COLLECTION};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store did not answer within {0:?}; the write may still complete")]
    Timeout(Duration),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("audit queue is full")]
    QueueFull,
    #[error("audit queue is closed")]
    QueueClosed,
}

/// Storage collection for a category. Lanes and mode switches never share one.
pub fn collection_for(category: &Category) -> String {
    match category {
        Category::Lane(lane) => lane.collection(),
        Category::ModeSwitch => MODE_SWITCH_COLLECTION.to_string(),
    }
}

#[derive(Clone)]
pub struct ActivityRecorder {
    store: Arc<dyn ActivityStore>,
    timeout: Duration,
}

impl ActivityRecorder {
    pub fn new(store: Arc<dyn ActivityStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Appends one timestamped record for `category`.
    ///
    /// The blocking store call runs off the async workers and is abandoned
    /// after the configured timeout.
    pub async fn record(&self, category: &Category) -> Result<i64, RecordError> {
        let collection = collection_for(category);
        let record = ActivityRecord::now(category);
        let store = self.store.clone();

        let task = tokio::task::spawn_blocking(move || store.add(&collection, &record));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(joined) => Ok(joined??),
            Err(_) => Err(RecordError::Timeout(self.timeout)),
        }
    }

    /// Starts the background writer. It exits once every handle is dropped
    /// and the queue has been drained.
    pub fn spawn(self, capacity: usize) -> (RecorderHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Category>(capacity);

        let worker = tokio::spawn(async move {
            while let Some(category) = rx.recv().await {
                match self.record(&category).await {
                    Ok(id) => info!(
                        "Recorded activity '{}' in '{}' (id {}).",
                        category,
                        collection_for(&category),
                        id
                    ),
                    Err(e @ RecordError::Timeout(_)) => {
                        warn!("Audit event outcome unknown for '{}': {}", category, e)
                    }
                    Err(e) => error!("Lost audit event for '{}': {}", category, e),
                }
            }
            debug!("Activity recorder drained and stopped.");
        });

        (RecorderHandle { tx }, worker)
    }
}

/// Cheap, cloneable submitter feeding the background writer.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Category>,
}

impl RecorderHandle {
    /// Queues a record without waiting.
    pub fn submit(&self, category: Category) -> Result<(), RecordError> {
        self.tx.try_send(category).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RecordError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RecordError::QueueClosed,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::LaneSet;
    use std::sync::Mutex;

    /// Store spy keeping every append in memory.
    #[derive(Default)]
    pub(crate) struct SpyStore {
        pub(crate) added: Mutex<Vec<(String, ActivityRecord)>>,
        pub(crate) fail: bool,
        pub(crate) delay: Option<Duration>,
    }

    impl SpyStore {
        pub(crate) fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.added.lock().unwrap().len()
        }
    }

    impl ActivityStore for SpyStore {
        fn add(&self, collection: &str, record: &ActivityRecord) -> Result<i64, StoreError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let mut added = self.added.lock().unwrap();
            added.push((collection.to_string(), record.clone()));
            if self.fail {
                return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
            }
            Ok(added.len() as i64)
        }
    }

    /// Collects formatted log lines emitted on the current thread.
    #[derive(Clone, Default)]
    pub(crate) struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl LogCapture {
        /// Routes this thread's events here until the guard is dropped.
        pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
            let subscriber = tracing_subscriber::fmt()
                .with_writer(self.clone())
                .with_ansi(false)
                .without_time()
                .with_max_level(tracing::Level::DEBUG)
                .finish();
            tracing::subscriber::set_default(subscriber)
        }

        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogCapture {
        type Writer = LogCapture;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn lanes_and_mode_switches_use_distinct_collections() {
        let lanes = LaneSet::default();
        let a = Category::Lane(lanes.resolve("Lane A").unwrap());
        let b = Category::Lane(lanes.resolve("Lane B").unwrap());

        assert_eq!(collection_for(&a), "LaneA");
        assert_eq!(collection_for(&b), "LaneB");
        assert_eq!(collection_for(&Category::ModeSwitch), "ModeSwitch");
    }

    #[tokio::test]
    async fn record_stamps_and_appends() {
        let store = Arc::new(SpyStore::default());
        let recorder = ActivityRecorder::new(store.clone(), Duration::from_secs(1));

        let id = recorder.record(&Category::ModeSwitch).await.unwrap();
        assert_eq!(id, 1);

        let added = store.added.lock().unwrap();
        assert_eq!(added[0].0, "ModeSwitch");
        assert_eq!(added[0].1.category, "smart");
    }

    #[tokio::test]
    async fn record_reports_store_failure() {
        let store = Arc::new(SpyStore::failing());
        let recorder = ActivityRecorder::new(store.clone(), Duration::from_secs(1));

        let result = recorder.record(&Category::ModeSwitch).await;
        assert!(matches!(result, Err(RecordError::Store(_))));
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let store = Arc::new(SpyStore {
            delay: Some(Duration::from_millis(500)),
            ..Default::default()
        });
        let recorder = ActivityRecorder::new(store, Duration::from_millis(20));

        let result = recorder.record(&Category::ModeSwitch).await;
        assert!(matches!(result, Err(RecordError::Timeout(_))));
    }

    #[tokio::test]
    async fn worker_drains_queue_after_handles_drop() {
        let store = Arc::new(SpyStore::default());
        let recorder = ActivityRecorder::new(store.clone(), Duration::from_secs(1));
        let (handle, worker) = recorder.spawn(8);

        for _ in 0..3 {
            handle.submit(Category::ModeSwitch).unwrap();
        }
        drop(handle);
        worker.await.unwrap();

        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn timed_out_write_is_reported_as_unknown_not_lost() {
        let logs = LogCapture::default();
        let _guard = logs.install();
        let store = Arc::new(SpyStore {
            delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let recorder = ActivityRecorder::new(store.clone(), Duration::from_millis(20));
        let (handle, worker) = recorder.spawn(4);

        handle.submit(Category::ModeSwitch).unwrap();
        drop(handle);
        worker.await.unwrap();

        let output = logs.contents();
        assert!(output.contains("Audit event outcome unknown for 'smart'"), "{output}");
        assert!(!output.contains("Lost audit event"), "{output}");

        // The abandoned write still lands once the store answers.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn full_queue_is_reported() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = RecorderHandle { tx };

        handle.submit(Category::ModeSwitch).unwrap();
        assert!(matches!(
            handle.submit(Category::ModeSwitch),
            Err(RecordError::QueueFull)
        ));
    }
}

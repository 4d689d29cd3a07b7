//! In-process task queue for dumps triggered by events.
//!
//! A bounded channel feeds a fixed pool of workers. Each task has a key
//! derived from its content. A submission whose key is already waiting to
//! run is dropped. A task whose key is running when a worker takes it is
//! parked and run right after the current run finishes, so one course never
//! has two dumps in flight and a publish during a dump is never lost.
//! Failed tasks are logged and counted, never retried.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use aspects_shared::{AspectsError, CourseKey, DispatcherConfig, DumpRun, Result};

use crate::pipeline;
use crate::sinks::{self, ModelSink, SinkContext};

/// A unit of background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    /// Dump a course, gated by staleness unless `force` is set.
    DumpCourse { course_key: CourseKey, force: bool },
    /// Dump one object through the named model sink.
    DumpModel { sink: String, object_id: String },
}

impl Task {
    /// Content-derived dedupe key. A forced and an unforced dump of the same
    /// course share a key.
    pub fn dedupe_key(&self) -> String {
        let canonical = match self {
            Task::DumpCourse { course_key, .. } => {
                format!("dump_course:{}", course_key.for_branch_none())
            }
            Task::DumpModel { sink, object_id } => format!("dump_model:{sink}:{object_id}"),
        };
        let digest = Sha256::digest(canonical.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn label(&self) -> String {
        match self {
            Task::DumpCourse { course_key, .. } => format!("dump_course {course_key}"),
            Task::DumpModel { sink, object_id } => format!("dump_model {sink} {object_id}"),
        }
    }
}

/// Counters for one dispatcher lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub submitted: usize,
    pub deduplicated: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicUsize,
    deduplicated: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            deduplicated: self.deduplicated.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Dedupe bookkeeping shared by `submit` and the workers.
#[derive(Default)]
struct KeyState {
    /// Sent to the channel, not yet taken by a worker.
    queued: HashSet<String>,
    /// Being run by a worker.
    running: HashSet<String>,
    /// Taken while the same key was running; runs next on that worker.
    parked: HashMap<String, Task>,
}

impl KeyState {
    /// A worker took `task` off the queue. Returns it back when it may run
    /// now, or `None` when it was parked behind a running task.
    fn take(&mut self, key: &str, task: Task) -> Option<Task> {
        self.queued.remove(key);
        if self.running.contains(key) {
            self.parked.insert(key.to_string(), task);
            None
        } else {
            self.running.insert(key.to_string());
            Some(task)
        }
    }

    /// The run for `key` ended. Returns the parked follow-up, which stays
    /// marked as running.
    fn finish(&mut self, key: &str) -> Option<Task> {
        let next = self.parked.remove(key);
        if next.is_none() {
            self.running.remove(key);
        }
        next
    }
}

/// Handle to a running worker pool.
pub struct Dispatcher {
    sender: mpsc::Sender<Task>,
    keys: Arc<Mutex<KeyState>>,
    counters: Arc<Counters>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn `config.workers` workers on the current tokio runtime.
    pub fn start(ctx: SinkContext, config: &DispatcherConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Task>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let keys = Arc::new(Mutex::new(KeyState::default()));
        let counters = Arc::new(Counters::default());
        let sinks = Arc::new(sinks::registry(&ctx));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let keys = keys.clone();
                let counters = counters.clone();
                let ctx = ctx.clone();
                let sinks = sinks.clone();
                tokio::spawn(async move {
                    loop {
                        // Lock only while waiting for the next task.
                        let next = receiver.lock().await.recv().await;
                        let Some(task) = next else { break };

                        let key = task.dedupe_key();
                        let mut current = keys.lock().await.take(&key, task.clone());
                        if current.is_none() {
                            debug!(worker, task = %task.label(), "task parked behind running run");
                        }

                        while let Some(task) = current {
                            match run_task(&ctx, &sinks, &task).await {
                                Ok(()) => {
                                    counters.succeeded.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => {
                                    error!(worker, task = %task.label(), error = %e, "task failed");
                                    counters.failed.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            current = keys.lock().await.finish(&key);
                        }
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();

        info!(
            workers = config.workers.max(1),
            queue_capacity = config.queue_capacity,
            "dispatcher started"
        );

        Self {
            sender,
            keys,
            counters,
            workers,
        }
    }

    /// Queue `task`. Returns `false` when an identical task is already
    /// waiting to run and this one was dropped. A task identical to one that
    /// is running is queued and runs after it.
    pub async fn submit(&self, task: Task) -> Result<bool> {
        let key = task.dedupe_key();
        {
            let mut keys = self.keys.lock().await;
            if keys.parked.contains_key(&key) || !keys.queued.insert(key.clone()) {
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                debug!(task = %task.label(), "duplicate task dropped");
                return Ok(false);
            }
        }

        let label = task.label();
        if self.sender.send(task).await.is_err() {
            self.keys.lock().await.queued.remove(&key);
            return Err(AspectsError::Dispatch(format!(
                "queue closed while submitting {label}"
            )));
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        debug!(task = %label, "task queued");
        Ok(true)
    }

    /// Counters so far.
    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Close the queue, let the workers drain it, and return the final counters.
    #[instrument(skip_all)]
    pub async fn shutdown(self) -> Result<DispatchStats> {
        let Dispatcher {
            sender,
            counters,
            workers,
            ..
        } = self;
        drop(sender);

        for handle in workers {
            handle
                .await
                .map_err(|e| AspectsError::Dispatch(format!("worker panicked: {e}")))?;
        }

        let stats = counters.snapshot();
        if stats.failed > 0 {
            warn!(failed = stats.failed, "some tasks failed");
        }
        info!(
            submitted = stats.submitted,
            deduplicated = stats.deduplicated,
            succeeded = stats.succeeded,
            failed = stats.failed,
            "dispatcher drained"
        );
        Ok(stats)
    }
}

async fn run_task(
    ctx: &SinkContext,
    sinks: &BTreeMap<&'static str, Arc<dyn ModelSink>>,
    task: &Task,
) -> Result<()> {
    match task {
        Task::DumpCourse { course_key, force } => {
            pipeline::dump_course(ctx, course_key, *force).await?;
        }
        Task::DumpModel { sink, object_id } => {
            let sink = sinks
                .get(sink.as_str())
                .ok_or_else(|| AspectsError::Dispatch(format!("unknown sink {sink:?}")))?;
            sink.dump(object_id, &DumpRun::new()).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use aspects_shared::{
        CourseSummary, CourseTree, ExternalIdRecord, SinkSettings, TreeNode,
    };

    use async_trait::async_trait;
    use tokio::sync::{Notify, Semaphore};

    use crate::adapters::TreeFetcher;
    use crate::memory::{InMemoryContentStore, RecordingWarehouse};
    use crate::sinks::tables;

    fn key() -> CourseKey {
        CourseKey::new("edX", "DemoX", "Demo")
    }

    fn ctx() -> (SinkContext, Arc<RecordingWarehouse>) {
        let wh = Arc::new(RecordingWarehouse::new());
        (
            SinkContext::new(Arc::new(store()), wh.clone(), SinkSettings::default()),
            wh,
        )
    }

    /// Tree fetcher that holds every fetch until the test opens the gate.
    struct GatedTrees {
        inner: InMemoryContentStore,
        fetches: AtomicUsize,
        entered: Notify,
        gate: Semaphore,
    }

    #[async_trait]
    impl TreeFetcher for GatedTrees {
        async fn get_tree(&self, course_key: &CourseKey) -> Result<CourseTree> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            self.entered.notify_one();
            let _permit = self.gate.acquire().await.unwrap();
            self.inner.get_tree(course_key).await
        }
    }

    fn store() -> InMemoryContentStore {
        let root = TreeNode::leaf(key().root_location());
        InMemoryContentStore::new()
            .with_course(
                CourseSummary::new(key()),
                CourseTree {
                    root: root.clone(),
                    all_nodes: vec![root],
                },
            )
            .with_external_id(ExternalIdRecord {
                id: 1,
                external_user_id: "ext".into(),
                external_id_type: "xapi".into(),
                user_id: 3,
                username: "u".into(),
                created: None,
            })
    }

    #[test]
    fn key_state_parks_behind_a_running_key() {
        let task = Task::DumpCourse {
            course_key: key(),
            force: false,
        };
        let k = task.dedupe_key();
        let mut keys = KeyState::default();

        keys.queued.insert(k.clone());
        assert!(keys.take(&k, task.clone()).is_some());
        assert!(keys.queued.is_empty());

        keys.queued.insert(k.clone());
        assert!(keys.take(&k, task.clone()).is_none());
        assert!(keys.parked.contains_key(&k));

        assert_eq!(keys.finish(&k), Some(task));
        assert!(keys.running.contains(&k));
        assert!(keys.finish(&k).is_none());
        assert!(keys.running.is_empty());
    }

    #[tokio::test]
    async fn publish_during_a_running_dump_runs_afterwards() {
        let (mut ctx, wh) = ctx();
        let trees = Arc::new(GatedTrees {
            inner: store(),
            fetches: AtomicUsize::new(0),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        });
        ctx.trees = trees.clone() as Arc<dyn TreeFetcher>;
        let dispatcher = Dispatcher::start(ctx, &DispatcherConfig::default());
        let task = Task::DumpCourse {
            course_key: key(),
            force: false,
        };

        assert!(dispatcher.submit(task.clone()).await.unwrap());
        // First dump is now inside get_tree.
        trees.entered.notified().await;

        assert!(dispatcher.submit(task.clone()).await.unwrap());
        // Still waiting behind the running dump: dropped.
        assert!(!dispatcher.submit(task).await.unwrap());

        trees.gate.add_permits(2);
        let stats = dispatcher.shutdown().await.unwrap();

        assert_eq!(trees.fetches.load(Ordering::Relaxed), 2);
        assert_eq!(stats.submitted, 2);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(wh.rows_for(tables::COURSE_OVERVIEWS).await.len(), 2);
    }

    #[test]
    fn dedupe_key_is_content_derived() {
        let a = Task::DumpCourse {
            course_key: key(),
            force: false,
        };
        let mut qualified = key();
        qualified.branch = Some("published-branch".into());
        let b = Task::DumpCourse {
            course_key: qualified,
            force: true,
        };
        assert_eq!(a.dedupe_key(), b.dedupe_key());
        assert_eq!(a.dedupe_key().len(), 64);

        let c = Task::DumpModel {
            sink: "external_id".into(),
            object_id: "1".into(),
        };
        assert_ne!(a.dedupe_key(), c.dedupe_key());
    }

    #[tokio::test]
    async fn runs_tasks_and_reports_stats() {
        let (ctx, wh) = ctx();
        let dispatcher = Dispatcher::start(ctx, &DispatcherConfig::default());

        assert!(
            dispatcher
                .submit(Task::DumpCourse {
                    course_key: key(),
                    force: false,
                })
                .await
                .unwrap()
        );
        assert!(
            dispatcher
                .submit(Task::DumpModel {
                    sink: "external_id".into(),
                    object_id: "1".into(),
                })
                .await
                .unwrap()
        );
        // unknown object: fails without retry
        dispatcher
            .submit(Task::DumpModel {
                sink: "external_id".into(),
                object_id: "404".into(),
            })
            .await
            .unwrap();

        let stats = dispatcher.shutdown().await.unwrap();
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.succeeded, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(wh.rows_for(tables::EXTERNAL_ID).await.len(), 1);
        assert_eq!(wh.rows_for(tables::COURSE_OVERVIEWS).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_submission_is_dropped_while_queued() {
        let (ctx, _wh) = ctx();
        // Single-threaded test runtime: workers cannot start before the
        // second submit, so the first task is still queued.
        let dispatcher = Dispatcher::start(ctx, &DispatcherConfig::default());
        let task = Task::DumpCourse {
            course_key: key(),
            force: false,
        };
        assert!(dispatcher.submit(task.clone()).await.unwrap());
        assert!(!dispatcher.submit(task).await.unwrap());

        let stats = dispatcher.shutdown().await.unwrap();
        assert_eq!(stats.submitted, 1);
        assert_eq!(stats.deduplicated, 1);
        assert_eq!(stats.succeeded, 1);
    }

    #[tokio::test]
    async fn key_is_released_after_completion() {
        let (ctx, _wh) = ctx();
        let dispatcher = Dispatcher::start(ctx, &DispatcherConfig::default());
        let task = Task::DumpModel {
            sink: "external_id".into(),
            object_id: "1".into(),
        };
        assert!(dispatcher.submit(task.clone()).await.unwrap());
        for _ in 0..100 {
            if dispatcher.stats().succeeded == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        // The key is released right after the counter moves.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(dispatcher.submit(task).await.unwrap());
        let stats = dispatcher.shutdown().await.unwrap();
        assert_eq!(stats.succeeded, 2);
    }

    #[tokio::test]
    async fn unknown_sink_counts_as_failure() {
        let (ctx, _wh) = ctx();
        let dispatcher = Dispatcher::start(ctx, &DispatcherConfig::default());
        dispatcher
            .submit(Task::DumpModel {
                sink: "grades".into(),
                object_id: "1".into(),
            })
            .await
            .unwrap();
        let stats = dispatcher.shutdown().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}

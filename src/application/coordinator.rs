//! Job admission, de-duplication and the per-job state machine.

use super::artifact_store::{ArtifactDraft, ArtifactLease, ArtifactStore};
use super::error::PipelineError;
use super::transcoder::{TranscodeRequest, Transcoder};
use crate::config::PipelineConfig;
use crate::domain::{
    ErrorKind, HandleId, JobFailure, JobKey, JobRequest, JobSnapshot, JobState, RetryPolicy,
    SourceReference,
};
use crate::ports::command::CommandRunner;
use crate::ports::fetcher::Fetcher;
use crate::ports::resolver::{ResolvedSource, SourceResolver};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub max_concurrent_jobs: usize,
    /// Jobs allowed to wait for a worker slot.
    pub max_queue_depth: usize,
    pub resolve_retry: RetryPolicy,
    /// How long a finished job stays queryable through its handles.
    pub handle_retention: Duration,
    pub work_dir: PathBuf,
}

impl CoordinatorSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_concurrent_jobs: config.max_concurrent_jobs,
            max_queue_depth: config.max_queue_depth,
            resolve_retry: RetryPolicy::new(config.resolve_attempts, config.fetch_backoff),
            handle_retention: config.handle_retention,
            work_dir: config.work_dir.clone(),
        }
    }
}

type Outcome = Result<ArtifactLease, JobFailure>;

/// State shared by a job's task and every handle attached to it.
struct JobShared {
    key: JobKey,
    state: watch::Sender<JobSnapshot>,
    cancel: CancellationToken,
    /// Handles still attached. Only changed under the registry lock.
    attached: AtomicUsize,
    /// Set before the terminal snapshot is published. Keeps the artifact
    /// leased for as long as handles can reach it.
    outcome: Mutex<Option<Outcome>>,
    finished_at: Mutex<Option<Instant>>,
}

impl JobShared {
    fn pending(key: JobKey, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(JobSnapshot::pending(key.clone()));
        Self {
            key,
            state,
            cancel,
            attached: AtomicUsize::new(0),
            outcome: Mutex::new(None),
            finished_at: Mutex::new(None),
        }
    }

    /// An already Ready job for a cache hit.
    fn cached(lease: ArtifactLease) -> Self {
        let key = lease.artifact().key.clone();
        let snapshot = JobSnapshot {
            state: JobState::Ready,
            artifact: Some(lease.artifact().clone()),
            ..JobSnapshot::pending(key.clone())
        };
        let (state, _) = watch::channel(snapshot);
        Self {
            key,
            state,
            cancel: CancellationToken::new(),
            attached: AtomicUsize::new(0),
            outcome: Mutex::new(Some(Ok(lease))),
            finished_at: Mutex::new(Some(Instant::now())),
        }
    }

    fn snapshot(&self) -> JobSnapshot {
        self.state.borrow().clone()
    }

    fn is_terminal(&self) -> bool {
        self.state.borrow().state.is_terminal()
    }

    fn advance(&self, next: JobState) {
        let moved = self.state.send_if_modified(|snapshot| {
            if !snapshot.state.can_transition_to(next) {
                return false;
            }
            snapshot.state = next;
            snapshot.updated_at = Utc::now();
            true
        });
        if moved {
            debug!(key = %self.key, state = %next, "job advanced");
        }
    }

    fn complete(&self, outcome: Result<ArtifactLease, PipelineError>) {
        let outcome = outcome.map_err(|e| e.to_failure());
        let (artifact, failure) = match &outcome {
            Ok(lease) => (Some(lease.artifact().clone()), None),
            Err(failure) => (None, Some(failure.clone())),
        };
        *self.outcome.lock() = Some(outcome);
        *self.finished_at.lock() = Some(Instant::now());

        self.state.send_if_modified(|snapshot| {
            let next = if artifact.is_some() {
                JobState::Ready
            } else {
                JobState::Failed
            };
            if !snapshot.state.can_transition_to(next) {
                return false;
            }
            snapshot.state = next;
            snapshot.updated_at = Utc::now();
            snapshot.artifact = artifact;
            snapshot.failure = failure;
            true
        });
    }

    fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().clone()
    }

    fn expired(&self, retention: Duration) -> bool {
        self.finished_at
            .lock()
            .map_or(false, |at| at.elapsed() >= retention)
    }
}

/// A caller's read-only view of a job.
pub struct JobHandle {
    id: HandleId,
    job: Arc<JobShared>,
    updates: watch::Receiver<JobSnapshot>,
}

impl JobHandle {
    fn attach(job: &Arc<JobShared>) -> Self {
        job.attached.fetch_add(1, Ordering::SeqCst);
        Self {
            id: HandleId::new(),
            job: job.clone(),
            updates: job.state.subscribe(),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn key(&self) -> &JobKey {
        &self.job.key
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.updates.borrow().clone()
    }

    /// Stream of snapshots; every state change is observable.
    pub fn subscribe(&self) -> watch::Receiver<JobSnapshot> {
        self.updates.clone()
    }

    /// Wait for the job to finish. Every handle of a job sees the same outcome.
    pub async fn wait(&self) -> Result<ArtifactLease, JobFailure> {
        let mut updates = self.updates.clone();
        if updates.wait_for(|s| s.state.is_terminal()).await.is_err() {
            return Err(JobFailure {
                kind: ErrorKind::Internal,
                message: "job vanished before finishing".to_string(),
                diagnostics: None,
            });
        }
        self.job.outcome().unwrap_or_else(|| {
            Err(JobFailure {
                kind: ErrorKind::Internal,
                message: "job finished without an outcome".to_string(),
                diagnostics: None,
            })
        })
    }
}

/// An admitted job waiting for a worker slot.
struct Queued {
    job: Arc<JobShared>,
    request: JobRequest,
}

#[derive(Default)]
struct Registry {
    /// Live (non-terminal) jobs by key; at most one per key.
    jobs: HashMap<JobKey, Arc<JobShared>>,
    handles: HashMap<HandleId, Arc<JobShared>>,
    /// Pending jobs in admission order.
    queue: VecDeque<Queued>,
}

impl Registry {
    fn forget(&mut self, job: &Arc<JobShared>) {
        if self
            .jobs
            .get(&job.key)
            .map_or(false, |live| Arc::ptr_eq(live, job))
        {
            self.jobs.remove(&job.key);
        }
    }

    /// Take a job out of the queue if it has not started yet.
    fn dequeue(&mut self, job: &Arc<JobShared>) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| !Arc::ptr_eq(&queued.job, job));
        self.queue.len() != before
    }
}

struct Inner<R, F, C> {
    resolver: Arc<R>,
    fetcher: Arc<F>,
    transcoder: Arc<Transcoder<C>>,
    store: Arc<ArtifactStore>,
    settings: CoordinatorSettings,
    permits: Arc<Semaphore>,
    registry: Mutex<Registry>,
    shutdown: CancellationToken,
}

pub struct JobCoordinator<R, F, C> {
    inner: Arc<Inner<R, F, C>>,
}

impl<R, F, C> Clone for JobCoordinator<R, F, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R, F, C> JobCoordinator<R, F, C>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    pub fn new(
        resolver: Arc<R>,
        fetcher: Arc<F>,
        transcoder: Arc<Transcoder<C>>,
        store: Arc<ArtifactStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(Inner {
                resolver,
                fetcher,
                transcoder,
                store,
                settings,
                permits,
                registry: Mutex::new(Registry::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.inner.store
    }

    /// Start or join the job for `request`, or answer from the store.
    pub fn submit(&self, request: JobRequest) -> Result<JobHandle, PipelineError> {
        let inner = &self.inner;
        let key = request.key();

        let mut registry = inner.registry.lock();
        if inner.shutdown.is_cancelled() {
            return Err(PipelineError::ShuttingDown);
        }
        inner.purge_expired(&mut registry);

        if let Some(job) = registry.jobs.get(&key).cloned() {
            let handle = JobHandle::attach(&job);
            registry.handles.insert(handle.id, job);
            info!(key = %key, handle = %handle.id, "joined in-flight job");
            return Ok(handle);
        }

        if let Some(lease) = inner.store.lookup(&key) {
            let store = inner.store.clone();
            let touched = lease.clone();
            tokio::spawn(async move { store.persist_access(&touched).await });
            let job = Arc::new(JobShared::cached(lease));
            let handle = JobHandle::attach(&job);
            registry.handles.insert(handle.id, job);
            info!(key = %key, handle = %handle.id, "served from store");
            return Ok(handle);
        }

        let capacity = inner.settings.max_concurrent_jobs + inner.settings.max_queue_depth;
        if registry.jobs.len() >= capacity {
            warn!(key = %key, live = registry.jobs.len(), "rejecting job, queue is full");
            return Err(PipelineError::Overloaded);
        }

        let job = Arc::new(JobShared::pending(key.clone(), inner.shutdown.child_token()));
        let handle = JobHandle::attach(&job);
        registry.jobs.insert(key.clone(), job.clone());
        registry.handles.insert(handle.id, job.clone());
        info!(key = %key, handle = %handle.id, source = %request.source, format = %request.format, "job admitted");
        registry.queue.push_back(Queued { job, request });
        inner.dispatch(&mut registry);
        Ok(handle)
    }

    /// Detach one caller. The last caller leaving aborts an unfinished job.
    pub fn cancel(&self, id: &HandleId) -> Result<(), PipelineError> {
        let mut registry = self.inner.registry.lock();
        let job = registry
            .handles
            .remove(id)
            .ok_or(PipelineError::NotFound(*id))?;

        let remaining = job.attached.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 && !job.is_terminal() {
            info!(key = %job.key, handle = %id, "last caller left, aborting job");
            // New submissions for this key start over instead of joining a
            // job that is being torn down.
            registry.forget(&job);
            job.cancel.cancel();
            if registry.dequeue(&job) {
                job.complete(Err(PipelineError::Cancelled));
            }
        } else {
            debug!(key = %job.key, handle = %id, remaining, "caller detached");
        }
        Ok(())
    }

    pub fn status(&self, id: &HandleId) -> Result<JobSnapshot, PipelineError> {
        let mut registry = self.inner.registry.lock();
        self.inner.purge_expired(&mut registry);
        registry
            .handles
            .get(id)
            .map(|job| job.snapshot())
            .ok_or(PipelineError::NotFound(*id))
    }

    /// The artifact behind a handle, once its job is Ready.
    pub fn artifact(&self, id: &HandleId) -> Result<Option<ArtifactLease>, PipelineError> {
        let mut registry = self.inner.registry.lock();
        self.inner.purge_expired(&mut registry);
        let job = registry.handles.get(id).ok_or(PipelineError::NotFound(*id))?;
        Ok(job.outcome().and_then(Result::ok))
    }

    pub fn live_jobs(&self) -> usize {
        self.inner.registry.lock().jobs.len()
    }

    /// Stop admitting work, abort every live job and wait for them to wind down.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let running: Vec<watch::Receiver<JobSnapshot>> = {
            let mut registry = self.inner.registry.lock();
            let queued: Vec<Queued> = registry.queue.drain(..).collect();
            for Queued { job, .. } in &queued {
                registry.forget(job);
                job.complete(Err(PipelineError::ShuttingDown));
            }
            info!(queued = queued.len(), running = registry.jobs.len(), "shutting down coordinator");
            registry.jobs.values().map(|job| job.state.subscribe()).collect()
        };
        for mut updates in running {
            let _ = updates.wait_for(|s| s.state.is_terminal()).await;
        }
    }
}

impl<R, F, C> Inner<R, F, C>
where
    R: SourceResolver + 'static,
    F: Fetcher + 'static,
    C: CommandRunner + 'static,
{
    /// Start queued jobs, oldest first, while worker slots are free.
    /// Called with the registry locked so admission order is start order.
    fn dispatch(self: &Arc<Self>, registry: &mut Registry) {
        while let Some(next) = registry.queue.front() {
            if next.job.cancel.is_cancelled() {
                registry.queue.pop_front();
                continue;
            }
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            if let Some(Queued { job, request }) = registry.queue.pop_front() {
                debug!(key = %job.key, waiting = registry.queue.len(), "job started");
                tokio::spawn(self.clone().run(job, request, permit));
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        job: Arc<JobShared>,
        request: JobRequest,
        permit: OwnedSemaphorePermit,
    ) {
        let outcome = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => Err(if self.shutdown.is_cancelled() {
                PipelineError::ShuttingDown
            } else {
                PipelineError::Cancelled
            }),
            result = self.pipeline(&job, &request) => result,
        };

        match &outcome {
            Ok(lease) => info!(key = %job.key, size_bytes = lease.artifact().size_bytes, "job ready"),
            Err(e) => warn!(key = %job.key, kind = %e.kind(), error = %e, "job failed"),
        }

        drop(permit);
        let mut registry = self.registry.lock();
        registry.forget(&job);
        job.complete(outcome);
        self.dispatch(&mut registry);
    }

    async fn pipeline(
        &self,
        job: &JobShared,
        request: &JobRequest,
    ) -> Result<ArtifactLease, PipelineError> {
        job.advance(JobState::Resolving);
        let resolved = self.resolve_with_retry(&job.key, &request.source).await?;

        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| PipelineError::Internal(format!("work dir unavailable: {}", e)))?;
        let workspace = tempfile::Builder::new()
            .prefix("job-")
            .tempdir_in(&self.settings.work_dir)
            .map_err(|e| PipelineError::Internal(format!("cannot create workspace: {}", e)))?;

        job.advance(JobState::Fetching);
        let payload = self
            .fetcher
            .fetch(&resolved.location, &workspace.path().join("payload"))
            .await?;

        job.advance(JobState::Transcoding);
        let transcode = TranscodeRequest {
            format: request.format,
            quality: request.quality,
            output: workspace
                .path()
                .join(format!("output.{}", request.format.extension())),
        };
        let output = self.transcoder.transcode(payload, &transcode).await?;

        let draft = ArtifactDraft {
            format: request.format,
            quality: request.quality,
            duration_secs: resolved.metadata.duration_secs,
            title: resolved.metadata.title.clone(),
        };
        let lease = self.store.put(&job.key, &output.path, draft).await?;
        Ok(lease)
    }

    async fn resolve_with_retry(
        &self,
        key: &JobKey,
        source: &SourceReference,
    ) -> Result<ResolvedSource, PipelineError> {
        let policy = self.settings.resolve_retry;
        let mut attempt = 1;
        loop {
            match self.resolver.resolve(source).await {
                Ok(resolved) => return Ok(resolved),
                Err(e) if e.is_transient() && attempt < policy.attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(key = %key, attempt, ?delay, error = %e, "transient resolution failure, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn purge_expired(&self, registry: &mut Registry) {
        let retention = self.settings.handle_retention;
        registry.handles.retain(|id, job| {
            let keep = !job.expired(retention);
            if !keep {
                debug!(handle = %id, key = %job.key, "handle expired");
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::command::{CommandOutput, MockCommandRunner, RunError};
    use crate::ports::fetcher::{FetchError, FetchedPayload, MockFetcher};
    use crate::ports::resolver::{
        MockSourceResolver, ResolveError, SourceMetadata, StreamLocation,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    struct Env {
        _root: TempDir,
        work: PathBuf,
        store: Arc<ArtifactStore>,
    }

    async fn env() -> Env {
        let root = tempfile::tempdir().unwrap();
        let store = ArtifactStore::open(root.path().join("store"), 1 << 20)
            .await
            .unwrap();
        Env {
            work: root.path().join("work"),
            _root: root,
            store: Arc::new(store),
        }
    }

    fn settings(env: &Env) -> CoordinatorSettings {
        CoordinatorSettings {
            max_concurrent_jobs: 2,
            max_queue_depth: 4,
            resolve_retry: RetryPolicy::new(3, Duration::from_millis(1)),
            handle_retention: Duration::from_secs(60),
            work_dir: env.work.clone(),
        }
    }

    fn request(url: &str) -> JobRequest {
        JobRequest::parse(url, "mp3", Some("high")).unwrap()
    }

    fn resolved() -> ResolvedSource {
        ResolvedSource {
            location: StreamLocation {
                url: "https://media.example.com/a.webm".to_string(),
                headers: Vec::new(),
            },
            metadata: SourceMetadata {
                title: Some("Track".to_string()),
                duration_secs: Some(61.0),
                ..Default::default()
            },
        }
    }

    fn resolver(times: usize) -> MockSourceResolver {
        let mut resolver = MockSourceResolver::new();
        resolver.expect_resolve().times(times).returning(|_| Ok(resolved()));
        resolver
    }

    fn fetcher(times: usize) -> MockFetcher {
        let mut fetcher = MockFetcher::new();
        fetcher.expect_fetch().times(times).returning(|_, dest| {
            std::fs::write(dest, b"raw").unwrap();
            Ok(FetchedPayload::new(dest, 3))
        });
        fetcher
    }

    fn transcoder(times: usize) -> Arc<Transcoder<MockCommandRunner>> {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().times(times).returning(|invocation, _| {
            std::fs::write(PathBuf::from(invocation.args.last().unwrap()), b"ID3\x04mp3 audio").unwrap();
            Ok(CommandOutput {
                exit_code: Some(0),
                ..Default::default()
            })
        });
        Arc::new(Transcoder::new(Arc::new(runner), "ffmpeg", Duration::from_secs(5)))
    }

    fn coordinator<R: SourceResolver + 'static, F: Fetcher + 'static>(
        env: &Env,
        resolver: R,
        fetcher: F,
        transcoder: Arc<Transcoder<MockCommandRunner>>,
    ) -> JobCoordinator<R, F, MockCommandRunner> {
        JobCoordinator::new(
            Arc::new(resolver),
            Arc::new(fetcher),
            transcoder,
            env.store.clone(),
            settings(env),
        )
    }

    /// Never finishes; the job can only end by cancellation.
    struct StallingFetcher;

    #[async_trait]
    impl Fetcher for StallingFetcher {
        async fn fetch(
            &self,
            _location: &StreamLocation,
            destination: &Path,
        ) -> Result<FetchedPayload, FetchError> {
            std::fs::write(destination, b"partial").unwrap();
            let payload = FetchedPayload::new(destination, 7);
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(payload)
        }
    }

    async fn wait_for_state(handle: &JobHandle, state: JobState) {
        let mut updates = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), updates.wait_for(|s| s.state == state))
            .await
            .expect("state reached in time")
            .unwrap();
    }

    #[tokio::test]
    async fn test_job_runs_to_ready() {
        let env = env().await;
        let coordinator = coordinator(&env, resolver(1), fetcher(1), transcoder(1));

        let handle = coordinator.submit(request("https://example.com/v/1")).unwrap();
        let mut updates = handle.subscribe();
        let lease = handle.wait().await.unwrap();

        assert_eq!(lease.artifact().title.as_deref(), Some("Track"));
        assert_eq!(lease.artifact().duration_secs, Some(61.0));
        assert!(env.store.verify(lease.artifact()).await.unwrap());
        assert_eq!(updates.borrow_and_update().state, JobState::Ready);

        let snapshot = coordinator.status(&handle.id()).unwrap();
        assert_eq!(snapshot.state, JobState::Ready);
        assert_eq!(snapshot.artifact.unwrap().checksum, lease.artifact().checksum);
        assert_eq!(coordinator.live_jobs(), 0);
        assert!(coordinator.artifact(&handle.id()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_submits_join_one_job() {
        let env = env().await;
        let coordinator = coordinator(&env, resolver(1), fetcher(1), transcoder(1));

        let first = coordinator.submit(request("https://example.com/v/2")).unwrap();
        let second = coordinator.submit(request("https://example.com/v/2")).unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.key(), second.key());
        assert_eq!(coordinator.live_jobs(), 1);

        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a.unwrap().artifact(), b.unwrap().artifact());
    }

    #[tokio::test]
    async fn test_submit_after_ready_is_served_from_store() {
        let env = env().await;
        let coordinator = coordinator(&env, resolver(1), fetcher(1), transcoder(1));

        let first = coordinator.submit(request("https://example.com/v/3")).unwrap();
        let produced = first.wait().await.unwrap();

        let again = coordinator.submit(request("https://example.com/v/3")).unwrap();
        assert_eq!(again.snapshot().state, JobState::Ready);
        assert_eq!(again.wait().await.unwrap().artifact(), produced.artifact());
    }

    #[tokio::test]
    async fn test_cache_hit_is_remembered_across_restarts() {
        use crate::application::artifact_store::EvictionPolicy;
        use chrono::DateTime;

        let env = env().await;
        let coordinator = coordinator(&env, resolver(2), fetcher(2), transcoder(2));
        let older = coordinator.submit(request("https://example.com/v/20")).unwrap().wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let newer = coordinator.submit(request("https://example.com/v/21")).unwrap().wait().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let hit = coordinator.submit(request("https://example.com/v/20")).unwrap();
        assert_eq!(hit.snapshot().state, JobState::Ready);

        let sidecar = older.path().with_file_name("meta.json");
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let meta: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&sidecar).unwrap()).unwrap();
            let last_access: DateTime<Utc> = meta["last_access"].as_str().unwrap().parse().unwrap();
            if last_access > older.artifact().created_at {
                break;
            }
            assert!(Instant::now() < deadline, "access time was never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let reopened = ArtifactStore::open(env.store.root(), 1 << 20).await.unwrap();
        let report = reopened
            .evict(&EvictionPolicy {
                max_total_bytes: newer.artifact().size_bytes,
            })
            .await;
        assert_eq!(report.removed, vec![newer.artifact().key.clone()]);
    }

    #[tokio::test]
    async fn test_unresolvable_source_fails_without_fetching() {
        let env = env().await;
        let mut resolver = MockSourceResolver::new();
        resolver
            .expect_resolve()
            .times(1)
            .returning(|_| Err(ResolveError::Unresolvable("Private video".into())));
        let coordinator = coordinator(&env, resolver, fetcher(0), transcoder(0));

        let handle = coordinator.submit(request("https://example.com/v/4")).unwrap();
        let failure = handle.wait().await.unwrap_err();

        assert_eq!(failure.kind, ErrorKind::UnresolvableSource);
        assert_eq!(handle.snapshot().state, JobState::Failed);
        assert_eq!(env.store.stats().entries, 0);
    }

    #[tokio::test]
    async fn test_transient_resolution_is_retried() {
        let env = env().await;
        let mut resolver = MockSourceResolver::new();
        let mut calls = 0;
        resolver.expect_resolve().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(ResolveError::Transient("HTTP Error 503".into()))
            } else {
                Ok(resolved())
            }
        });
        let coordinator = coordinator(&env, resolver, fetcher(1), transcoder(1));

        let handle = coordinator.submit(request("https://example.com/v/5")).unwrap();
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_transcode_timeout_fails_job() {
        let env = env().await;
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|_, timeout| {
            Err(RunError::TimedOut {
                program: "ffmpeg".into(),
                timeout,
            })
        });
        let transcoder = Arc::new(Transcoder::new(Arc::new(runner), "ffmpeg", Duration::from_millis(10)));
        let coordinator = coordinator(&env, resolver(1), fetcher(1), transcoder);

        let handle = coordinator.submit(request("https://example.com/v/6")).unwrap();
        let failure = handle.wait().await.unwrap_err();

        assert_eq!(failure.kind, ErrorKind::TranscodeTimeout);
        assert_eq!(std::fs::read_dir(&env.work).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_last_cancel_aborts_and_cleans_workspace() {
        let env = env().await;
        let coordinator = coordinator(&env, resolver(1), StallingFetcher, transcoder(0));

        let first = coordinator.submit(request("https://example.com/v/7")).unwrap();
        let second = coordinator.submit(request("https://example.com/v/7")).unwrap();
        wait_for_state(&first, JobState::Fetching).await;

        coordinator.cancel(&first.id()).unwrap();
        assert_eq!(first.snapshot().state, JobState::Fetching);

        coordinator.cancel(&second.id()).unwrap();
        let failure = second.wait().await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Cancelled);
        assert_eq!(std::fs::read_dir(&env.work).unwrap().count(), 0);

        assert!(matches!(
            coordinator.status(&second.id()),
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.cancel(&second.id()),
            Err(PipelineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_full_queue_is_overloaded() {
        let env = env().await;
        let mut settings = settings(&env);
        settings.max_concurrent_jobs = 1;
        settings.max_queue_depth = 1;
        // The queued job never gets a slot, so only one resolution happens.
        let coordinator = JobCoordinator::new(
            Arc::new(resolver(1)),
            Arc::new(StallingFetcher),
            transcoder(0),
            env.store.clone(),
            settings,
        );

        let running = coordinator.submit(request("https://example.com/v/8")).unwrap();
        let queued = coordinator.submit(request("https://example.com/v/9")).unwrap();
        wait_for_state(&running, JobState::Fetching).await;
        assert_eq!(queued.snapshot().state, JobState::Pending);

        assert!(matches!(
            coordinator.submit(request("https://example.com/v/10")),
            Err(PipelineError::Overloaded)
        ));
        // Joining an existing job needs no capacity.
        assert!(coordinator.submit(request("https://example.com/v/9")).is_ok());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_live_jobs_and_rejects_new_ones() {
        let env = env().await;
        let coordinator = coordinator(&env, resolver(1), StallingFetcher, transcoder(0));

        let handle = coordinator.submit(request("https://example.com/v/11")).unwrap();
        wait_for_state(&handle, JobState::Fetching).await;

        coordinator.shutdown().await;
        assert_eq!(handle.wait().await.unwrap_err().kind, ErrorKind::ShuttingDown);
        assert_eq!(coordinator.live_jobs(), 0);
        assert!(matches!(
            coordinator.submit(request("https://example.com/v/12")),
            Err(PipelineError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_finished_handles_expire() {
        let env = env().await;
        let mut settings = settings(&env);
        settings.handle_retention = Duration::ZERO;
        let coordinator = JobCoordinator::new(
            Arc::new(resolver(1)),
            Arc::new(fetcher(1)),
            transcoder(1),
            env.store.clone(),
            settings,
        );

        let handle = coordinator.submit(request("https://example.com/v/13")).unwrap();
        handle.wait().await.unwrap();
        assert!(matches!(
            coordinator.status(&handle.id()),
            Err(PipelineError::NotFound(_))
        ));
        // The handle itself still works after the registry forgot it.
        assert_eq!(handle.snapshot().state, JobState::Ready);
    }

    /// Holds the first resolution at a gate and records the order of all others.
    struct GatedResolver {
        gate: Semaphore,
        seen: Mutex<Vec<SourceReference>>,
    }

    #[async_trait]
    impl SourceResolver for GatedResolver {
        async fn resolve(&self, source: &SourceReference) -> Result<ResolvedSource, ResolveError> {
            let first = {
                let mut seen = self.seen.lock();
                seen.push(source.clone());
                seen.len() == 1
            };
            if first {
                let _ = self.gate.acquire().await.unwrap();
            }
            Ok(resolved())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_waiting_jobs_start_in_submission_order() {
        let env = env().await;
        let mut settings = settings(&env);
        settings.max_concurrent_jobs = 1;
        settings.max_queue_depth = 64;
        let resolver = Arc::new(GatedResolver {
            gate: Semaphore::new(0),
            seen: Mutex::new(Vec::new()),
        });
        let coordinator = JobCoordinator::new(
            resolver.clone(),
            Arc::new(fetcher(40)),
            transcoder(40),
            env.store.clone(),
            settings,
        );

        let requests: Vec<JobRequest> = (0..40)
            .map(|i| request(&format!("https://example.com/v/order-{}", i)))
            .collect();
        let first = coordinator.submit(requests[0].clone()).unwrap();
        wait_for_state(&first, JobState::Resolving).await;

        let mut handles = vec![first];
        for request in &requests[1..] {
            handles.push(coordinator.submit(request.clone()).unwrap());
        }
        assert!(handles[1..]
            .iter()
            .all(|h| h.snapshot().state == JobState::Pending));

        resolver.gate.add_permits(1);
        for handle in &handles {
            handle.wait().await.unwrap();
        }

        let expected: Vec<SourceReference> = requests.iter().map(|r| r.source.clone()).collect();
        assert_eq!(*resolver.seen.lock(), expected);
    }

    #[tokio::test]
    async fn test_cancelling_a_waiting_job_frees_its_place() {
        let env = env().await;
        let mut settings = settings(&env);
        settings.max_concurrent_jobs = 1;
        settings.max_queue_depth = 1;
        let coordinator = JobCoordinator::new(
            Arc::new(resolver(1)),
            Arc::new(StallingFetcher),
            transcoder(0),
            env.store.clone(),
            settings,
        );

        let running = coordinator.submit(request("https://example.com/v/14")).unwrap();
        let queued = coordinator.submit(request("https://example.com/v/15")).unwrap();
        wait_for_state(&running, JobState::Fetching).await;

        coordinator.cancel(&queued.id()).unwrap();
        assert_eq!(queued.wait().await.unwrap_err().kind, ErrorKind::Cancelled);
        assert_eq!(coordinator.live_jobs(), 1);
        assert!(coordinator.submit(request("https://example.com/v/16")).is_ok());

        coordinator.shutdown().await;
        assert_eq!(running.wait().await.unwrap_err().kind, ErrorKind::ShuttingDown);
    }
}

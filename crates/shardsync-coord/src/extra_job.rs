//! Background verification jobs that run alongside replication.
//!
//! Jobs are registered on a per-run [`ExtraJobScheduler`] and launched as
//! independent tasks. A job that returns an error has found a violation that
//! cannot be corrected after the fact; the scheduler escalates it through its
//! fatal handler, which by default terminates the process.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{Concern, ConnectMode, ConnectOptions, Connector, SourceClient};
use crate::error::{Result, SyncError};
use crate::types::{Namespace, Source};

/// Name of the unique-index verification job.
pub const NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB: &str = "CheckIndexExistsJob";

/// A long-running verification task.
#[async_trait]
pub trait ExtraJob: Send + Sync {
    /// Stable name, used for deduplication and logging.
    fn name(&self) -> &str;

    /// Poll interval.
    fn interval(&self) -> Duration;

    /// Run until cancelled. An error is a permanent violation.
    async fn run(&self, cancel: CancellationToken) -> Result<()>;
}

/// Immutable input of one job instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    /// Poll interval.
    pub interval: Duration,
    /// Namespaces to watch.
    pub namespaces: Vec<Namespace>,
    /// Sources to watch.
    pub sources: Vec<Source>,
    /// CA bundle for source connections.
    pub tls_root_ca: Option<PathBuf>,
}

/// Builds a job from its spec.
pub type JobConstructor =
    Arc<dyn Fn(JobSpec, Arc<dyn Connector>) -> Arc<dyn ExtraJob> + Send + Sync>;

/// Called when a job reports a violation.
pub type FatalHandler = Arc<dyn Fn(&SyncError) + Send + Sync>;

/// Job constructors keyed by name.
#[derive(Clone, Default)]
pub struct JobRegistry {
    constructors: HashMap<String, JobConstructor>,
}

impl JobRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in job.
    pub fn with_builtin_jobs() -> Self {
        let mut registry = Self::new();
        registry.register(
            NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB,
            Arc::new(|spec: JobSpec, connector: Arc<dyn Connector>| {
                Arc::new(CheckUniqueIndexJob::new(spec, connector)) as Arc<dyn ExtraJob>
            }),
        );
        registry
    }

    /// Add or replace a constructor.
    pub fn register(&mut self, name: &str, constructor: JobConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    /// Known job names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn build(
        &self,
        name: &str,
        spec: JobSpec,
        connector: Arc<dyn Connector>,
    ) -> Result<Arc<dyn ExtraJob>> {
        let constructor = self.constructors.get(name).ok_or_else(|| SyncError::Config {
            msg: format!("unknown extra job {}", name),
        })?;
        Ok(constructor(spec, connector))
    }
}

/// Log the violation and exit the process.
pub fn abort_process() -> FatalHandler {
    Arc::new(|err: &SyncError| {
        error!(error = %err, "extra job violation, aborting");
        std::process::exit(1);
    })
}

/// Per-run registry and launcher of extra jobs.
pub struct ExtraJobScheduler {
    registry: JobRegistry,
    connector: Arc<dyn Connector>,
    jobs: Mutex<BTreeMap<Duration, Vec<Arc<dyn ExtraJob>>>>,
    started: AtomicBool,
    on_fatal: FatalHandler,
}

impl ExtraJobScheduler {
    /// Create a scheduler escalating violations to `on_fatal`.
    pub fn new(registry: JobRegistry, connector: Arc<dyn Connector>, on_fatal: FatalHandler) -> Self {
        Self {
            registry,
            connector,
            jobs: Mutex::new(BTreeMap::new()),
            started: AtomicBool::new(false),
            on_fatal,
        }
    }

    fn lock_jobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<Duration, Vec<Arc<dyn ExtraJob>>>> {
        match self.jobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a job. Returns `false` when a job of the same name already
    /// runs at this interval.
    pub fn add_job(&self, name: &str, spec: JobSpec) -> Result<bool> {
        if self.started.load(Ordering::Acquire) {
            return Err(SyncError::Config {
                msg: format!("extra job {} registered after scheduling started", name),
            });
        }
        let interval = spec.interval;
        if interval.is_zero() {
            return Err(SyncError::Config {
                msg: format!("extra job {} needs a positive interval", name),
            });
        }

        let mut jobs = self.lock_jobs();
        let slot = jobs.entry(interval).or_default();
        if slot.iter().any(|job| job.name() == name) {
            debug!(job = name, ?interval, "extra job already registered");
            return Ok(false);
        }
        let job = self.registry.build(name, spec, self.connector.clone())?;
        info!(job = name, ?interval, "extra job registered");
        slot.push(job);
        Ok(true)
    }

    /// Number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.lock_jobs().values().map(Vec::len).sum()
    }

    /// Launch every registered job as its own task. Only the first call
    /// launches anything.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("extra job scheduler already started");
            return Vec::new();
        }

        let jobs: Vec<Arc<dyn ExtraJob>> = self.lock_jobs().values().flatten().cloned().collect();
        jobs.into_iter()
            .map(|job| {
                let cancel = cancel.clone();
                let on_fatal = self.on_fatal.clone();
                tokio::spawn(async move {
                    info!(job = job.name(), interval = ?job.interval(), "extra job start");
                    match job.run(cancel).await {
                        Ok(()) => info!(job = job.name(), "extra job exit"),
                        Err(e) => {
                            error!(job = job.name(), error = %e, "extra job failed");
                            on_fatal(&e);
                        }
                    }
                })
            })
            .collect()
    }
}

/// Fails when any watched collection carries a unique index other than the
/// identity index. Sharding incremental writes by object id is only safe
/// while no such constraint exists.
pub struct CheckUniqueIndexJob {
    spec: JobSpec,
    connector: Arc<dyn Connector>,
}

impl CheckUniqueIndexJob {
    /// Create the job.
    pub fn new(spec: JobSpec, connector: Arc<dyn Connector>) -> Self {
        Self { spec, connector }
    }

    async fn connect_all(&self) -> Option<Vec<(Source, Arc<dyn SourceClient>)>> {
        let opts = ConnectOptions {
            mode: ConnectMode::SecondaryPreferred,
            read_concern: Concern::Majority,
            write_concern: Concern::Default,
            tls_root_ca: self.spec.tls_root_ca.clone(),
        };
        let mut clients = Vec::with_capacity(self.spec.sources.len());
        for src in &self.spec.sources {
            match self.connector.source(&src.url, &opts).await {
                Ok(client) => clients.push((src.clone(), client)),
                Err(e) => {
                    error!(job = self.name(), source = %src, error = %e, "extra job connect source failed");
                    return None;
                }
            }
        }
        Some(clients)
    }

    async fn check_once(&self, clients: &[(Source, Arc<dyn SourceClient>)]) -> Result<()> {
        debug!(job = self.name(), "extra job check");
        for (src, client) in clients {
            for ns in &self.spec.namespaces {
                let indexes = match client.list_indexes(ns).await {
                    Ok(indexes) => indexes,
                    Err(e) => {
                        warn!(job = self.name(), source = %src, ns = %ns, error = %e, "list indexes failed");
                        continue;
                    }
                };
                if let Some(index) = indexes.iter().find(|i| i.unique && !i.is_identity()) {
                    return Err(SyncError::UniqueIndexViolation {
                        job: self.name().to_string(),
                        source_url: src.masked_url(),
                        ns: ns.to_string(),
                        index: index.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExtraJob for CheckUniqueIndexJob {
    fn name(&self) -> &str {
        NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB
    }

    fn interval(&self) -> Duration {
        self.spec.interval
    }

    async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let Some(clients) = self.connect_all().await else {
            return Ok(());
        };

        let period = self.spec.interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => self.check_once(&clients).await?,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ConfigServerClient, TargetClient};

    struct NoConnector;

    #[async_trait]
    impl Connector for NoConnector {
        async fn source(&self, url: &str, _: &ConnectOptions) -> Result<Arc<dyn SourceClient>> {
            Err(SyncError::Connect {
                url: url.to_string(),
                msg: "unreachable".to_string(),
            })
        }

        async fn config_server(
            &self,
            url: &str,
            _: &ConnectOptions,
        ) -> Result<Arc<dyn ConfigServerClient>> {
            Err(SyncError::Connect {
                url: url.to_string(),
                msg: "unreachable".to_string(),
            })
        }

        async fn target(&self, url: &str, _: &ConnectOptions) -> Result<Arc<dyn TargetClient>> {
            Err(SyncError::Connect {
                url: url.to_string(),
                msg: "unreachable".to_string(),
            })
        }
    }

    struct CountingJob {
        name: String,
        interval: Duration,
        fail: bool,
    }

    #[async_trait]
    impl ExtraJob for CountingJob {
        fn name(&self) -> &str {
            &self.name
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn run(&self, cancel: CancellationToken) -> Result<()> {
            if self.fail {
                return Err(SyncError::UniqueIndexViolation {
                    job: self.name.clone(),
                    source_url: "mongodb://h".to_string(),
                    ns: "app.users".to_string(),
                    index: "email_1".to_string(),
                });
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    fn spec(secs: u64) -> JobSpec {
        JobSpec {
            interval: Duration::from_secs(secs),
            namespaces: vec![Namespace::parse("app.users")],
            sources: vec![Source::new("mongodb://h1", "rs0")],
            tls_root_ca: None,
        }
    }

    fn registry(fail: bool) -> JobRegistry {
        let mut registry = JobRegistry::new();
        registry.register(
            "counting",
            Arc::new(move |spec: JobSpec, _: Arc<dyn Connector>| {
                Arc::new(CountingJob {
                    name: "counting".to_string(),
                    interval: spec.interval,
                    fail,
                }) as Arc<dyn ExtraJob>
            }),
        );
        registry
    }

    fn ignore_fatal() -> FatalHandler {
        Arc::new(|_: &SyncError| {})
    }

    mod job_registry {
        use super::*;

        #[test]
        fn test_builtin_jobs() {
            let registry = JobRegistry::with_builtin_jobs();
            assert_eq!(registry.names(), vec![NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB]);
        }

        #[test]
        fn test_unknown_name_rejected() {
            let scheduler =
                ExtraJobScheduler::new(JobRegistry::new(), Arc::new(NoConnector), ignore_fatal());
            assert!(matches!(
                scheduler.add_job("nope", spec(10)),
                Err(SyncError::Config { .. })
            ));
        }
    }

    mod scheduling {
        use super::*;

        #[test]
        fn test_dedupe_by_name_and_interval() {
            let scheduler = ExtraJobScheduler::new(registry(false), Arc::new(NoConnector), ignore_fatal());
            assert!(scheduler.add_job("counting", spec(10)).unwrap());
            assert!(!scheduler.add_job("counting", spec(10)).unwrap());
            assert!(scheduler.add_job("counting", spec(20)).unwrap());
            assert_eq!(scheduler.job_count(), 2);
        }

        #[test]
        fn test_zero_interval_rejected() {
            let scheduler = ExtraJobScheduler::new(registry(false), Arc::new(NoConnector), ignore_fatal());
            assert!(scheduler.add_job("counting", spec(0)).is_err());
        }

        #[tokio::test]
        async fn test_start_runs_until_cancelled() {
            let scheduler = ExtraJobScheduler::new(registry(false), Arc::new(NoConnector), ignore_fatal());
            scheduler.add_job("counting", spec(10)).unwrap();
            scheduler.add_job("counting", spec(30)).unwrap();

            let cancel = CancellationToken::new();
            let handles = scheduler.start(cancel.clone());
            assert_eq!(handles.len(), 2);
            assert!(scheduler.start(cancel.clone()).is_empty());
            assert!(scheduler.add_job("counting", spec(40)).is_err());

            cancel.cancel();
            for handle in handles {
                handle.await.unwrap();
            }
        }

        #[tokio::test]
        async fn test_failure_escalates() {
            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
            let on_fatal: FatalHandler = Arc::new(move |e: &SyncError| {
                let _ = tx.send(e.to_string());
            });
            let scheduler = ExtraJobScheduler::new(registry(true), Arc::new(NoConnector), on_fatal);
            scheduler.add_job("counting", spec(10)).unwrap();

            for handle in scheduler.start(CancellationToken::new()) {
                handle.await.unwrap();
            }
            let msg = rx.recv().await.unwrap();
            assert!(msg.contains("email_1"));
        }
    }

    #[tokio::test]
    async fn test_unique_job_connect_failure_ends_quietly() {
        let job = CheckUniqueIndexJob::new(spec(1), Arc::new(NoConnector));
        assert!(job.run(CancellationToken::new()).await.is_ok());
        assert_eq!(job.name(), NAME_CHECK_UNIQUE_INDEX_EXISTS_JOB);
    }
}

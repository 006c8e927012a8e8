//! Checkout and push orchestration.
//!
//! A sync runs in two steps: planning decides per path what has to move
//! (purely local, no network), executing negotiates the transfers in one
//! batch and runs them on a bounded worker pool.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::batch::{ObjectSpec, Operation, TransferAction};
use crate::client::BatchClient;
use crate::config::LfsConfig;
use crate::oid::VerifyingReader;
use crate::store::{copy_cancellable, ContentStore};
use crate::tree::{normalize_path, FsWorkingTree, WorkingTree};
use crate::{CancellationToken, Error, Oid, Pointer, Result};

/// What execution does for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Download the blob, then materialize it.
    Fetch,
    /// Upload the working file.
    Push,
    /// Nothing to transfer. Checkout still materializes from the store.
    Skip,
}

/// One path of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanItem {
    pub path: String,
    /// For pushes, the pointer to commit in place of the file.
    pub pointer: Pointer,
    pub action: SyncAction,
}

/// The outcome of planning a checkout or push.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    operation: Operation,
    items: Vec<PlanItem>,
    rejected: Vec<(String, Arc<Error>)>,
}

impl SyncPlan {
    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn items(&self) -> &[PlanItem] {
        &self.items
    }

    /// Paths that could not be planned, with the reason.
    pub fn rejected(&self) -> &[(String, Arc<Error>)] {
        &self.rejected
    }

    pub fn item(&self, path: &str) -> Option<&PlanItem> {
        let path = normalize_path(path);
        self.items.iter().find(|i| i.path == path)
    }

    /// Whether executing this plan talks to the server at all.
    pub fn needs_transfer(&self) -> bool {
        self.items.iter().any(|i| i.action != SyncAction::Skip)
    }

    /// Distinct objects that need a transfer.
    pub fn transfer_objects(&self) -> Vec<ObjectSpec> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .filter(|i| i.action != SyncAction::Skip)
            .filter(|i| seen.insert(*i.pointer.oid()))
            .map(|i| ObjectSpec::from(&i.pointer))
            .collect()
    }
}

/// A path that could not be synced.
#[derive(Debug, Clone)]
pub struct FailedItem {
    pub path: String,
    pub oid: Option<Oid>,
    /// Shared by every path of the same object.
    pub error: Arc<Error>,
}

/// Per-path result of executing a plan.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub succeeded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedItem>,
    pub cancelled: Vec<String>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }

    /// Distinct objects behind the failures.
    pub fn failed_oids(&self) -> Vec<Oid> {
        self.failed
            .iter()
            .filter_map(|f| f.oid)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn sort(&mut self) {
        self.succeeded.sort();
        self.skipped.sort();
        self.cancelled.sort();
        self.failed.sort_by(|a, b| a.path.cmp(&b.path));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ItemStatus {
    Succeeded,
    Skipped,
    Failed,
    Cancelled,
}

/// Emitted once per finished path.
#[derive(Debug, Clone)]
pub struct Progress {
    pub path: String,
    pub oid: Option<Oid>,
    pub status: ItemStatus,
    pub completed: usize,
    pub total: usize,
}

pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Collects per-path results from the worker threads.
struct Tracker<'a> {
    report: Mutex<SyncReport>,
    completed: AtomicUsize,
    total: usize,
    observer: Option<&'a ProgressFn>,
}

impl<'a> Tracker<'a> {
    fn new(total: usize, observer: Option<&'a ProgressFn>) -> Self {
        Tracker {
            report: Mutex::new(SyncReport::default()),
            completed: AtomicUsize::new(0),
            total,
            observer,
        }
    }

    fn record(&self, path: &str, oid: Option<Oid>, result: Result<ItemStatus>) {
        match result {
            Ok(status) => self.finish(path, oid, status, None),
            Err(e) => self.fail(path, oid, Arc::new(e)),
        }
    }

    fn fail(&self, path: &str, oid: Option<Oid>, error: Arc<Error>) {
        if error.is_cancelled() {
            self.finish(path, oid, ItemStatus::Cancelled, None);
        } else {
            debug!(path, error = %error, "sync item failed");
            self.finish(path, oid, ItemStatus::Failed, Some(error));
        }
    }

    fn finish(&self, path: &str, oid: Option<Oid>, status: ItemStatus, error: Option<Arc<Error>>) {
        {
            let mut report = self
                .report
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let path = path.to_string();
            match (status, error) {
                (ItemStatus::Succeeded, _) => report.succeeded.push(path),
                (ItemStatus::Skipped, _) => report.skipped.push(path),
                (ItemStatus::Cancelled, _) => report.cancelled.push(path),
                (ItemStatus::Failed, error) => report.failed.push(FailedItem {
                    path,
                    oid,
                    error: error.unwrap_or_else(|| Arc::new(Error::Cancelled)),
                }),
            }
        }

        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(observer) = self.observer {
            observer(&Progress {
                path: path.to_string(),
                oid,
                status,
                completed,
                total: self.total,
            });
        }
    }

    fn into_report(self) -> SyncReport {
        let mut report = self
            .report
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        report.sort();
        report
    }
}

enum Job {
    Transfer(TransferAction),
    /// Upload the server already has; only the local store needs it.
    Present(Oid),
}

/// Drives checkouts and pushes between a working tree, the local store and
/// the server.
pub struct SyncEngine {
    client: BatchClient,
    store: ContentStore,
    tree: Arc<dyn WorkingTree>,
    parallelism: usize,
    cache_limit: Option<u64>,
    progress: Option<ProgressFn>,
}

impl SyncEngine {
    pub fn new<T: WorkingTree + 'static>(client: BatchClient, store: ContentStore, tree: T) -> Self {
        SyncEngine {
            client,
            store,
            tree: Arc::new(tree),
            parallelism: 4,
            cache_limit: None,
            progress: None,
        }
    }

    /// Engine over the repository at `config.repo_root`.
    pub fn from_config(config: &LfsConfig) -> Result<Self> {
        let root = config
            .repo_root
            .as_ref()
            .ok_or_else(|| Error::Config("repo_root must be set".into()))?;
        let client = BatchClient::from_config(config)?;
        let store = ContentStore::for_repo(root.join(".git"));

        let mut engine = SyncEngine::new(client, store, FsWorkingTree::new(root))
            .with_parallelism(config.parallelism);
        engine.cache_limit = config.max_cache_bytes;
        Ok(engine)
    }

    /// Maximum number of concurrent transfers.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Keep the store under `max_bytes` after each execution.
    pub fn with_cache_limit(mut self, max_bytes: u64) -> Self {
        self.cache_limit = Some(max_bytes);
        self
    }

    pub fn with_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(&Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(observer));
        self
    }

    pub fn client(&self) -> &BatchClient {
        &self.client
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub fn tree(&self) -> &dyn WorkingTree {
        self.tree.as_ref()
    }

    /// Plan materializing the committed pointers of `paths`.
    ///
    /// Paths whose pointer cannot be read or parsed are rejected
    /// individually; the rest of the plan is unaffected.
    pub fn plan_checkout<S: AsRef<str>>(&self, paths: &[S]) -> Result<SyncPlan> {
        let mut plan = SyncPlan {
            operation: Operation::Download,
            items: Vec::new(),
            rejected: Vec::new(),
        };

        for path in paths {
            let path = normalize_path(path.as_ref());
            let pointer = match self
                .tree
                .read_committed(&path)
                .and_then(|text| Pointer::parse(&text))
            {
                Ok(pointer) => pointer,
                Err(e) => {
                    debug!(path = %path, error = %e, "not a valid pointer");
                    plan.rejected.push((path, Arc::new(e)));
                    continue;
                }
            };

            if pointer.size() == 0 && *pointer.oid() != Oid::from_content(b"") {
                debug!(path = %path, oid = %pointer.oid(), "empty pointer with non-empty digest");
                plan.rejected.push((
                    path,
                    Arc::new(Error::Integrity {
                        expected: Oid::from_content(b"").to_hex(),
                        actual: pointer.oid().to_hex(),
                    }),
                ));
                continue;
            }

            let action = if pointer.size() == 0 || self.store.has(pointer.oid()) {
                SyncAction::Skip
            } else {
                SyncAction::Fetch
            };
            plan.items.push(PlanItem {
                path,
                pointer,
                action,
            });
        }

        info!(
            items = plan.items.len(),
            rejected = plan.rejected.len(),
            fetch = plan.transfer_objects().len(),
            "planned checkout"
        );
        Ok(plan)
    }

    /// Plan uploading the working files at `paths`.
    ///
    /// Content the store already holds has been pushed before and is
    /// skipped, whichever path or commit it came from.
    pub fn plan_push<S: AsRef<str>>(&self, paths: &[S]) -> Result<SyncPlan> {
        let mut plan = SyncPlan {
            operation: Operation::Upload,
            items: Vec::new(),
            rejected: Vec::new(),
        };

        for path in paths {
            let path = normalize_path(path.as_ref());
            let pointer = match self
                .tree
                .open(&path)
                .and_then(|reader| Ok(Pointer::from_reader(reader)?))
            {
                Ok(pointer) => pointer,
                Err(e) => {
                    debug!(path = %path, error = %e, "cannot hash working file");
                    plan.rejected.push((path, Arc::new(e)));
                    continue;
                }
            };

            let action = if self.store.has(pointer.oid()) {
                SyncAction::Skip
            } else {
                SyncAction::Push
            };
            plan.items.push(PlanItem {
                path,
                pointer,
                action,
            });
        }

        info!(
            items = plan.items.len(),
            rejected = plan.rejected.len(),
            push = plan.transfer_objects().len(),
            "planned push"
        );
        Ok(plan)
    }

    /// Carry out a plan.
    ///
    /// Failures are recorded per path and do not stop other transfers.
    /// Authentication and protocol failures abort the whole execution and
    /// are returned as `Err`. After `cancel` fires, paths not yet done are
    /// reported as cancelled.
    pub fn execute(&self, plan: &SyncPlan, cancel: &CancellationToken) -> Result<SyncReport> {
        let tracker = Tracker::new(
            plan.items.len() + plan.rejected.len(),
            self.progress.as_ref(),
        );

        for (path, error) in &plan.rejected {
            tracker.fail(path, None, Arc::clone(error));
        }

        for item in plan.items.iter().filter(|i| i.action == SyncAction::Skip) {
            let result = match plan.operation {
                Operation::Download => self.materialize(item, cancel),
                Operation::Upload => cancel.check(),
            };
            tracker.record(
                &item.path,
                Some(*item.pointer.oid()),
                result.map(|()| ItemStatus::Skipped),
            );
        }

        let mut groups: BTreeMap<Oid, Vec<&PlanItem>> = BTreeMap::new();
        for item in plan.items.iter().filter(|i| i.action != SyncAction::Skip) {
            groups.entry(*item.pointer.oid()).or_default().push(item);
        }

        if groups.is_empty() {
            return Ok(self.finish(plan, tracker));
        }

        if cancel.is_cancelled() {
            for item in groups.values().flatten() {
                tracker.record(&item.path, Some(*item.pointer.oid()), Err(Error::Cancelled));
            }
            return Ok(self.finish(plan, tracker));
        }

        let objects: Vec<ObjectSpec> = groups
            .values()
            .filter_map(|items| items.first())
            .map(|item| ObjectSpec::from(&item.pointer))
            .collect();

        let negotiation = match self.client.negotiate(plan.operation, &objects) {
            Ok(negotiation) => negotiation,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "batch negotiation failed");
                let error = Arc::new(e);
                for (oid, items) in &groups {
                    for item in items {
                        tracker.fail(&item.path, Some(*oid), Arc::clone(&error));
                    }
                }
                return Ok(self.finish(plan, tracker));
            }
        };

        for (oid, error) in negotiation.rejected {
            let error = Arc::new(error);
            for item in groups.get(&oid).into_iter().flatten() {
                tracker.fail(&item.path, Some(oid), Arc::clone(&error));
            }
        }

        let mut jobs: Vec<(Job, &[&PlanItem])> = Vec::new();
        for action in negotiation.actions {
            if let Some(items) = groups.get(&action.oid) {
                jobs.push((Job::Transfer(action), items.as_slice()));
            }
        }
        for oid in negotiation.present {
            if let Some(items) = groups.get(&oid) {
                jobs.push((Job::Present(oid), items.as_slice()));
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .thread_name(|i| format!("ue-lfs-transfer-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("cannot start transfer pool: {}", e)))?;

        let abort = cancel.child();
        let fatal: Mutex<Option<Error>> = Mutex::new(None);

        pool.install(|| {
            jobs.par_iter().for_each(|(job, items)| {
                let oid = match job {
                    Job::Transfer(action) => action.oid,
                    Job::Present(oid) => *oid,
                };
                let result = abort.check().and_then(|()| match job {
                    Job::Transfer(action) if action.operation == Operation::Download => {
                        self.fetch(action, &abort)
                    }
                    Job::Transfer(action) => self.push(action, items, &abort),
                    Job::Present(oid) => self.adopt(oid, items, &abort),
                });

                match result {
                    Ok(()) => {
                        for item in items.iter() {
                            let outcome = match plan.operation {
                                Operation::Download => self.materialize(item, &abort),
                                Operation::Upload => Ok(()),
                            };
                            tracker.record(
                                &item.path,
                                Some(oid),
                                outcome.map(|()| ItemStatus::Succeeded),
                            );
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        warn!(%oid, error = %e, "aborting sync");
                        abort.cancel();
                        let mut slot = fatal.lock().unwrap_or_else(|p| p.into_inner());
                        slot.get_or_insert(e);
                    }
                    Err(e) => {
                        let error = Arc::new(e);
                        for item in items.iter() {
                            tracker.fail(&item.path, Some(oid), Arc::clone(&error));
                        }
                    }
                }
            });
        });

        if let Some(e) = fatal.into_inner().unwrap_or_else(|p| p.into_inner()) {
            return Err(e);
        }
        Ok(self.finish(plan, tracker))
    }

    fn finish(&self, plan: &SyncPlan, tracker: Tracker<'_>) -> SyncReport {
        if let Some(limit) = self.cache_limit {
            let keep: Vec<Oid> = plan.items.iter().map(|i| *i.pointer.oid()).collect();
            if let Err(e) = self.store.enforce_limit(limit, keep.iter()) {
                warn!(error = %e, "failed to enforce cache limit");
            }
        }

        let report = tracker.into_report();
        info!(
            operation = %plan.operation,
            succeeded = report.succeeded.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            cancelled = report.cancelled.len(),
            "sync finished"
        );
        report
    }

    fn fetch(&self, action: &TransferAction, cancel: &CancellationToken) -> Result<()> {
        self.with_refresh(action, |action| {
            self.client.download(action, &self.store, cancel).map(|_| ())
        })
    }

    /// Stage the working file, upload it, then commit it to the store.
    ///
    /// The store only gains the object once the server has it.
    fn push(
        &self,
        action: &TransferAction,
        items: &[&PlanItem],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let item = items
            .first()
            .ok_or_else(|| Error::Protocol(format!("no path for {}", action.oid)))?;

        let mut temp = self.store.reserve_temp(&action.oid)?;
        let mut reader = self.tree.open(&item.path)?;
        copy_cancellable(&mut reader, &mut temp, cancel)?;
        // The file may have changed since planning
        temp.check()?;

        self.with_refresh(action, |action| {
            self.client.upload_with(action, || temp.reopen(), cancel)
        })?;
        temp.commit()?;
        Ok(())
    }

    fn adopt(&self, oid: &Oid, items: &[&PlanItem], cancel: &CancellationToken) -> Result<()> {
        debug!(%oid, "server already has object");
        if self.store.has(oid) {
            return Ok(());
        }
        let item = items
            .first()
            .ok_or_else(|| Error::Protocol(format!("no path for {}", oid)))?;
        let reader = self.tree.open(&item.path)?;
        self.store.put_cancellable(oid, reader, cancel)?;
        Ok(())
    }

    /// Run `transfer`, negotiating a fresh action once if the first one expired.
    fn with_refresh<F>(&self, action: &TransferAction, mut transfer: F) -> Result<()>
    where
        F: FnMut(&TransferAction) -> Result<()>,
    {
        match transfer(action) {
            Err(Error::Expired(_)) => {
                debug!(oid = %action.oid, "transfer action expired, renegotiating");
                let object = ObjectSpec::new(&action.oid.to_hex(), action.size);
                let mut negotiation = self.client.negotiate(action.operation, &[object])?;
                if let Some((_, e)) = negotiation.rejected.pop() {
                    return Err(e);
                }
                match negotiation.actions.pop() {
                    Some(fresh) => transfer(&fresh),
                    None if !negotiation.present.is_empty() => Ok(()),
                    None => Err(Error::Expired(action.oid.to_hex())),
                }
            }
            other => other,
        }
    }

    /// Write the stored content of `item` into the working tree.
    ///
    /// The blob is re-hashed while it streams out. On a mismatch the working
    /// file keeps its pointer and the damaged blob is evicted, so the next
    /// checkout fetches it again.
    fn materialize(&self, item: &PlanItem, cancel: &CancellationToken) -> Result<()> {
        cancel.check()?;
        let oid = item.pointer.oid();
        if item.pointer.size() == 0 {
            self.tree.write(&item.path, &mut io::empty())?;
            return Ok(());
        }

        let mut blob = VerifyingReader::new(self.store.open(oid)?, *oid);
        let written = match self.tree.write(&item.path, &mut blob) {
            Ok(written) => written,
            Err(e) => {
                return match blob.mismatch() {
                    Some(actual) => {
                        warn!(path = %item.path, %oid, %actual, "stored blob is corrupt, evicting");
                        self.store.remove(oid)?;
                        Err(Error::Integrity {
                            expected: oid.to_hex(),
                            actual: actual.to_hex(),
                        })
                    }
                    None => Err(e),
                };
            }
        };
        if written != item.pointer.size() {
            return Err(Error::Integrity {
                expected: format!("{} bytes", item.pointer.size()),
                actual: format!("{} bytes", written),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;
    use url::Url;

    struct Fixture {
        _td: TempDir,
        root: std::path::PathBuf,
        engine: SyncEngine,
    }

    // Nothing listens on port 1, so any network call fails fast.
    fn fixture() -> Fixture {
        let td = TempDir::new().unwrap();
        let root = td.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        let client = BatchClient::with_url(Url::parse("http://127.0.0.1:1/lfs/").unwrap())
            .with_retry(crate::RetryPolicy::none());
        let store = ContentStore::for_repo(root.join(".git"));
        let engine = SyncEngine::new(client, store, FsWorkingTree::new(&root));
        Fixture {
            _td: td,
            root,
            engine,
        }
    }

    fn write_pointer(root: &std::path::Path, path: &str, content: &[u8]) -> Pointer {
        let pointer = Pointer::from_content(content);
        let file = root.join(path);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(file, pointer.encode()).unwrap();
        pointer
    }

    #[test]
    fn test_plan_checkout_classifies() {
        let f = fixture();
        let cached = write_pointer(&f.root, "Content/Cached.uasset", b"cached bytes");
        write_pointer(&f.root, "Content/Remote.uasset", b"remote bytes");
        fs::write(f.root.join("Content/Broken.uasset"), b"not a pointer").unwrap();
        f.engine.store().put(cached.oid(), &b"cached bytes"[..]).unwrap();

        let plan = f
            .engine
            .plan_checkout(&[
                "Content/Cached.uasset",
                "Content/Remote.uasset",
                "Content/Broken.uasset",
                "Content/Missing.uasset",
            ])
            .unwrap();

        assert_eq!(plan.item("Content/Cached.uasset").unwrap().action, SyncAction::Skip);
        assert_eq!(plan.item("Content/Remote.uasset").unwrap().action, SyncAction::Fetch);
        assert_eq!(plan.rejected().len(), 2);
        assert!(plan.needs_transfer());
        assert_eq!(plan.transfer_objects().len(), 1);
    }

    #[test]
    fn test_skip_materializes_without_network() {
        let f = fixture();
        let content = vec![7u8; 2048];
        let pointer = write_pointer(&f.root, "Content/Hero.uasset", &content);
        f.engine.store().put(pointer.oid(), &content[..]).unwrap();

        let plan = f.engine.plan_checkout(&["Content/Hero.uasset"]).unwrap();
        assert!(!plan.needs_transfer());

        let report = f.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert_eq!(report.skipped, vec!["Content/Hero.uasset"]);
        assert!(report.is_success());
        assert_eq!(fs::read(f.root.join("Content/Hero.uasset")).unwrap(), content);
    }

    #[test]
    fn test_tampered_blob_is_not_materialized() {
        let f = fixture();
        let content = vec![7u8; 2048];
        let pointer = write_pointer(&f.root, "Content/Hero.uasset", &content);
        f.engine.store().put(pointer.oid(), &content[..]).unwrap();

        let blob = f.engine.store().object_path(pointer.oid());
        let mut damaged = fs::read(&blob).unwrap();
        damaged[1000] ^= 0xff;
        fs::write(&blob, &damaged).unwrap();

        let plan = f.engine.plan_checkout(&["Content/Hero.uasset"]).unwrap();
        let report = f.engine.execute(&plan, &CancellationToken::new()).unwrap();

        assert!(report.skipped.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(*report.failed[0].error, Error::Integrity { .. }));
        // Pointer stays, the damaged blob is gone
        let on_disk = fs::read(f.root.join("Content/Hero.uasset")).unwrap();
        assert_eq!(Pointer::parse(&on_disk).unwrap(), pointer);
        assert!(!f.engine.store().has(pointer.oid()));
    }

    #[test]
    fn test_empty_pointer_needs_empty_digest() {
        let f = fixture();
        let empty = Pointer::from_content(b"");
        fs::write(f.root.join("Empty.uasset"), empty.encode()).unwrap();
        let bogus = Pointer::new(Oid::from_content(b"not empty"), 0);
        fs::write(f.root.join("Bogus.uasset"), bogus.encode()).unwrap();

        let plan = f
            .engine
            .plan_checkout(&["Empty.uasset", "Bogus.uasset"])
            .unwrap();
        assert_eq!(plan.item("Empty.uasset").unwrap().action, SyncAction::Skip);
        assert!(plan.item("Bogus.uasset").is_none());
        assert_eq!(plan.rejected().len(), 1);
        assert!(matches!(*plan.rejected()[0].1, Error::Integrity { .. }));

        let report = f.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert_eq!(report.skipped, vec!["Empty.uasset"]);
        assert!(fs::read(f.root.join("Empty.uasset")).unwrap().is_empty());
    }

    #[test]
    fn test_plan_push_dedups_against_store() {
        let f = fixture();
        fs::write(f.root.join("A.uasset"), b"shared texture").unwrap();
        fs::write(f.root.join("B.uasset"), b"shared texture").unwrap();
        fs::write(f.root.join("C.uasset"), b"new mesh").unwrap();
        f.engine
            .store()
            .put(&Oid::from_content(b"shared texture"), &b"shared texture"[..])
            .unwrap();

        let plan = f
            .engine
            .plan_push(&["A.uasset", "B.uasset", "C.uasset"])
            .unwrap();
        assert_eq!(plan.item("A.uasset").unwrap().action, SyncAction::Skip);
        assert_eq!(plan.item("B.uasset").unwrap().action, SyncAction::Skip);
        let c = plan.item("C.uasset").unwrap();
        assert_eq!(c.action, SyncAction::Push);
        assert_eq!(c.pointer, Pointer::from_content(b"new mesh"));
    }

    #[test]
    fn test_cancelled_before_transfer() {
        let f = fixture();
        write_pointer(&f.root, "Content/A.uasset", b"a");
        write_pointer(&f.root, "Content/B.uasset", b"b");
        let plan = f
            .engine
            .plan_checkout(&["Content/A.uasset", "Content/B.uasset"])
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = f.engine.execute(&plan, &cancel).unwrap();
        assert_eq!(report.cancelled.len(), 2);
        assert!(report.failed.is_empty());
        assert!(!report.is_success());
    }

    #[test]
    fn test_unreachable_server_fails_items() {
        let f = fixture();
        write_pointer(&f.root, "Content/A.uasset", b"a");
        let plan = f.engine.plan_checkout(&["Content/A.uasset"]).unwrap();

        let report = f.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed_oids(), vec![Oid::from_content(b"a")]);
    }

    #[test]
    fn test_progress_reports_every_item() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let engine = f.engine.with_progress(move |p: &Progress| {
            sink.lock().unwrap().push((p.path.clone(), p.status, p.completed, p.total));
        });

        fs::write(f.root.join("X.uasset"), b"x").unwrap();
        engine.store().put(&Oid::from_content(b"x"), &b"x"[..]).unwrap();
        let plan = engine.plan_push(&["X.uasset", "Missing.uasset"]).unwrap();
        engine.execute(&plan, &CancellationToken::new()).unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(
            seen,
            vec![
                ("Missing.uasset".to_string(), ItemStatus::Failed, 1, 2),
                ("X.uasset".to_string(), ItemStatus::Skipped, 2, 2),
            ]
        );
    }

    #[test]
    fn test_from_config_requires_repo_root() {
        let config = LfsConfig::new("https://example.com/team/game.git", "alice");
        assert!(matches!(SyncEngine::from_config(&config), Err(Error::Config(_))));
    }
}

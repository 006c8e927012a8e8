//! File locking against the LFS Locks API.
//!
//! Binary assets cannot be merged, so editors take an exclusive server-side
//! lock before touching them. The coordinator caches the locks it holds and
//! serializes requests for the same path.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::batch::RefInfo;
use crate::client::BatchClient;
use crate::tree::normalize_path;
use crate::{Error, Result};

const PAGE_LIMIT: usize = 100;

/// A lock as reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub id: String,
    pub path: String,
    /// Name of the identity holding the lock.
    pub owner: String,
    pub locked_at: DateTime<Utc>,
}

/// Where a path is in its lock lifecycle on this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    Unlocked,
    /// A request for this path is in flight.
    Pending,
    Locked,
}

/// Lock state of a path as seen by a given identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    NotLocked,
    /// Locked by the asking identity.
    Locked,
    /// Locked by someone else.
    LockedOther(String),
}

#[derive(Debug, Serialize)]
struct CreateLockRequest<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#ref: Option<RefInfo>,
    owner: OwnerWire,
}

#[derive(Debug, Serialize)]
struct UnlockRequest {
    force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    r#ref: Option<RefInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OwnerWire {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LockWire {
    id: String,
    path: String,
    #[serde(default)]
    owner: Option<OwnerWire>,
    #[serde(default)]
    locked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LockResponse {
    #[serde(default)]
    lock: Option<LockWire>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LockListResponse {
    #[serde(default)]
    locks: Vec<LockWire>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl From<LockWire> for LockRecord {
    fn from(wire: LockWire) -> Self {
        LockRecord {
            id: wire.id,
            path: normalize_path(&wire.path),
            owner: wire.owner.map(|o| o.name).unwrap_or_default(),
            locked_at: wire.locked_at.unwrap_or_else(Utc::now),
        }
    }
}

enum Reply {
    Granted(LockResponse),
    Refused(u16, LockResponse),
}

/// Client-side view of server locks.
pub struct LockCoordinator {
    client: BatchClient,
    held: Mutex<HashMap<String, LockRecord>>,
    pending: Mutex<HashSet<String>>,
    path_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockCoordinator {
    pub fn new(client: BatchClient) -> Self {
        LockCoordinator {
            client,
            held: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &BatchClient {
        &self.client
    }

    /// Take the lock on `path` for `identity`.
    ///
    /// Re-acquiring a lock already held by `identity` returns the existing
    /// record. A lock held by anybody else is reported as
    /// [`Error::LockConflict`], never overridden.
    pub fn acquire(&self, path: &str, identity: &str) -> Result<LockRecord> {
        let path = normalize_path(path);
        let guard = self.path_lock(&path);
        let result = {
            let _serialized = relock(&guard);
            self.acquire_serialized(path.clone(), identity)
        };
        self.prune_path_lock(&path, guard);
        result
    }

    fn acquire_serialized(&self, path: String, identity: &str) -> Result<LockRecord> {
        self.set_pending(&path, true);
        let reply = self.create_lock(&path, identity);
        self.set_pending(&path, false);

        let (status, body) = match reply? {
            Reply::Granted(body) => (None, body),
            Reply::Refused(status, body) => {
                debug!(path = %path, status, message = ?body.message, "lock request refused");
                (Some(status), body)
            }
        };
        let lock: LockRecord = body
            .lock
            .ok_or_else(|| Error::Protocol(format!("lock response for {} has no lock", path)))?
            .into();

        // A granted lock is ours whatever name the server files it under
        let ours = status.is_none()
            || lock.owner == identity
            || relock(&self.held)
                .get(&path)
                .map_or(false, |held| held.id == lock.id);
        if !ours {
            debug!(path = %path, owner = %lock.owner, "lock held by another user");
            return Err(Error::LockConflict {
                path,
                owner: lock.owner,
            });
        }

        let lock = if lock.owner.is_empty() {
            LockRecord {
                owner: identity.to_string(),
                ..lock
            }
        } else {
            lock
        };
        if status.is_some() {
            info!(path = %path, id = %lock.id, "adopted existing lock");
        } else {
            info!(path = %path, id = %lock.id, "acquired lock");
        }
        relock(&self.held).insert(path, lock.clone());
        Ok(lock)
    }

    fn create_lock(&self, path: &str, identity: &str) -> Result<Reply> {
        let url = self.client.endpoint("locks")?;
        let body = CreateLockRequest {
            path,
            r#ref: self.ref_info(),
            owner: OwnerWire {
                name: identity.to_string(),
            },
        };

        self.client.retry_policy().run("lock request", |attempt| {
            debug!(path, attempt, "POST locks");
            match self.client.api_request("POST", &url).send_json(&body) {
                Ok(response) => Ok(Reply::Granted(parse_body(response)?)),
                Err(ureq::Error::Status(409, response)) => {
                    Ok(Reply::Refused(409, parse_body(response)?))
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    /// Release a lock held by `identity`.
    ///
    /// A lock the server no longer knows about counts as released.
    pub fn release(&self, record: &LockRecord, identity: &str) -> Result<()> {
        let path = normalize_path(&record.path);
        let guard = self.path_lock(&path);
        let result = {
            let _serialized = relock(&guard);
            self.release_serialized(path.clone(), record, identity)
        };
        self.prune_path_lock(&path, guard);
        result
    }

    fn release_serialized(&self, path: String, record: &LockRecord, identity: &str) -> Result<()> {
        let mut url = self.client.endpoint("locks/")?;
        url.path_segments_mut()
            .map_err(|_| Error::InvalidUrl(self.client.lfs_url().to_string()))?
            .pop_if_empty()
            .push(&record.id)
            .push("unlock");
        let body = UnlockRequest {
            force: false,
            r#ref: self.ref_info(),
        };

        self.set_pending(&path, true);
        let reply = self
            .client
            .retry_policy()
            .run("unlock request", |attempt| {
                debug!(path = %path, id = %record.id, attempt, "POST locks/:id/unlock");
                match self.client.api_request("POST", &url).send_json(&body) {
                    Ok(response) => Ok(Reply::Granted(parse_body(response)?)),
                    Err(ureq::Error::Status(404, _)) => Ok(Reply::Refused(
                        404,
                        LockResponse {
                            lock: None,
                            message: None,
                        },
                    )),
                    Err(ureq::Error::Status(code @ (403 | 409), response)) => {
                        let body = parse_body(response).unwrap_or(LockResponse {
                            lock: None,
                            message: None,
                        });
                        Ok(Reply::Refused(code, body))
                    }
                    Err(e) => Err(e.into()),
                }
            });
        self.set_pending(&path, false);

        match reply? {
            Reply::Granted(_) => {
                info!(path = %path, id = %record.id, "released lock");
            }
            Reply::Refused(404, _) => {
                debug!(path = %path, id = %record.id, "lock already gone on server");
            }
            Reply::Refused(code, body) => {
                let owner = body
                    .lock
                    .and_then(|l| l.owner)
                    .map(|o| o.name)
                    .unwrap_or_else(|| record.owner.clone());
                if code == 403 && owner == identity {
                    return Err(Error::AuthRequired);
                }
                debug!(path = %path, owner = %owner, code, "unlock refused");
                return Err(Error::LockConflict { path, owner });
            }
        }

        relock(&self.held).remove(&path);
        Ok(())
    }

    /// List server locks whose path starts with `prefix`.
    ///
    /// Cached locks under `prefix` the server no longer reports are dropped.
    pub fn list_locks(&self, prefix: &str) -> Result<Vec<LockRecord>> {
        let prefix = normalize_path(prefix);
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = self.client.endpoint("locks")?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("limit", &PAGE_LIMIT.to_string());
                if let Some(cursor) = &cursor {
                    query.append_pair("cursor", cursor);
                }
                if let Some(ref_name) = self.client.ref_name() {
                    query.append_pair("refspec", ref_name);
                }
            }

            let page: LockListResponse = self.client.retry_policy().run("list locks", |attempt| {
                debug!(url = %url, attempt, "GET locks");
                let response = self.client.api_request("GET", &url).call()?;
                parse_body(response)
            })?;

            records.extend(
                page.locks
                    .into_iter()
                    .map(LockRecord::from)
                    .filter(|l| l.path.starts_with(&prefix)),
            );

            match page.next_cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }

        let live: HashSet<&str> = records.iter().map(|l| l.id.as_str()).collect();
        relock(&self.held).retain(|path, held| {
            let keep = !path.starts_with(&prefix) || live.contains(held.id.as_str());
            if !keep {
                debug!(path = %path, "dropping stale cached lock");
            }
            keep
        });

        debug!(prefix = %prefix, count = records.len(), "listed locks");
        Ok(records)
    }

    /// Lock state of each path, as seen by `identity`.
    ///
    /// Server locks owned by `identity` are adopted into the cache.
    pub fn lock_states(&self, paths: &[&str], identity: &str) -> Result<Vec<(String, LockState)>> {
        let by_path: HashMap<String, LockRecord> = self
            .list_locks("")?
            .into_iter()
            .map(|l| (l.path.clone(), l))
            .collect();

        let mut held = relock(&self.held);
        let states = paths
            .iter()
            .map(|path| {
                let path = normalize_path(path);
                let state = match by_path.get(&path) {
                    None => LockState::NotLocked,
                    Some(lock)
                        if lock.owner == identity
                            || held.get(&path).map_or(false, |h| h.id == lock.id) =>
                    {
                        held.entry(path.clone()).or_insert_with(|| lock.clone());
                        LockState::Locked
                    }
                    Some(lock) => LockState::LockedOther(lock.owner.clone()),
                };
                (path, state)
            })
            .collect();
        Ok(states)
    }

    /// Release every lock this coordinator holds. Returns how many were released.
    ///
    /// Keeps going past individual failures and returns the first of them.
    pub fn release_all(&self, identity: &str) -> Result<usize> {
        let mine = self.held_locks();

        let mut released = 0;
        let mut first_error = None;
        for record in &mine {
            match self.release(record, identity) {
                Ok(()) => released += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(path = %record.path, error = %e, "failed to release lock");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(released),
        }
    }

    /// Snapshot of the locks this client holds, ordered by path.
    pub fn held_locks(&self) -> Vec<LockRecord> {
        let mut locks: Vec<_> = relock(&self.held).values().cloned().collect();
        locks.sort_by(|a, b| a.path.cmp(&b.path));
        locks
    }

    pub fn phase(&self, path: &str) -> LockPhase {
        let path = normalize_path(path);
        if relock(&self.pending).contains(&path) {
            LockPhase::Pending
        } else if relock(&self.held).contains_key(&path) {
            LockPhase::Locked
        } else {
            LockPhase::Unlocked
        }
    }

    fn ref_info(&self) -> Option<RefInfo> {
        self.client.ref_name().map(|name| RefInfo {
            name: name.to_string(),
        })
    }

    fn set_pending(&self, path: &str, pending: bool) {
        let mut set = relock(&self.pending);
        if pending {
            set.insert(path.to_string());
        } else {
            set.remove(path);
        }
    }

    fn path_lock(&self, path: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            relock(&self.path_locks)
                .entry(path.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the per-path mutex once nobody else is waiting on it.
    fn prune_path_lock(&self, path: &str, guard: Arc<Mutex<()>>) {
        let mut locks = relock(&self.path_locks);
        // One reference in the map, one in `guard`
        if Arc::strong_count(&guard) == 2 {
            locks.remove(path);
        }
    }
}

/// Lock a mutex, ignoring poisoning: the guarded maps stay consistent.
fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn parse_body<T: DeserializeOwned>(response: ureq::Response) -> Result<T> {
    let body = response.into_string()?;
    serde_json::from_str(&body).map_err(|e| Error::Protocol(format!("malformed lock response: {}", e)))
}

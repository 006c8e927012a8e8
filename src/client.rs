//! LFS HTTP client: batch negotiation and object transfers.

use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::batch::{BatchRequest, BatchResponse, ObjectSpec, Operation, TransferAction, VerifyAction};
use crate::config::{LfsConfig, TimeoutConfig};
use crate::retry::RetryPolicy;
use crate::store::{copy_cancellable, BlobEntry, ContentStore};
use crate::{CancellationToken, Error, Oid, Result};

const LFS_MEDIA_TYPE: &str = "application/vnd.git-lfs+json";
const USER_AGENT: &str = "ue-lfs/0.1";

/// Credentials sent with every API request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Bearer token (OAuth/PAT)
    Bearer(String),
    /// Basic auth (username, password)
    Basic(String, String),
}

impl Credentials {
    /// Value of the `Authorization` header.
    pub fn authorization(&self) -> String {
        match self {
            Credentials::Bearer(token) => format!("Bearer {}", token),
            Credentials::Basic(username, password) => {
                let credentials = format!("{}:{}", username, password);
                let encoded = base64::Engine::encode(
                    &base64::engine::general_purpose::STANDARD,
                    credentials.as_bytes(),
                );
                format!("Basic {}", encoded)
            }
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Bearer(_) => f.write_str("Bearer(***)"),
            Credentials::Basic(user, _) => write!(f, "Basic({}, ***)", user),
        }
    }
}

/// Source of credentials, asked before every request.
///
/// Lets the host application refresh tokens without rebuilding the client.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Option<Credentials>;
}

impl CredentialProvider for Credentials {
    fn credentials(&self) -> Option<Credentials> {
        Some(self.clone())
    }
}

/// Outcome of one batch negotiation.
#[derive(Debug, Default)]
pub struct Negotiation {
    /// Objects that need a transfer.
    pub actions: Vec<TransferAction>,
    /// Objects the server already has (upload only).
    pub present: Vec<Oid>,
    /// Objects the server refused individually.
    pub rejected: Vec<(Oid, Error)>,
}

/// LFS client for communicating with an LFS server.
///
/// This type is cheaply cloneable - multiple clones share the same underlying
/// HTTP agent and configuration.
#[derive(Clone)]
pub struct BatchClient {
    inner: Arc<BatchClientInner>,
}

#[derive(Clone)]
struct BatchClientInner {
    /// The LFS API endpoint URL.
    lfs_url: Url,
    /// Optional authentication.
    credentials: Option<Arc<dyn CredentialProvider>>,
    /// HTTP agent for making requests.
    agent: ureq::Agent,
    /// Optional ref name for batch requests (e.g., "refs/heads/main").
    ref_name: Option<String>,
    /// Retry policy for API calls.
    retry: RetryPolicy,
    /// Attempts per object transfer.
    transfer_attempts: u32,
}

impl BatchClient {
    /// Create a new LFS client for a repository URL.
    ///
    /// The URL should be the Git remote URL (e.g., `https://github.com/owner/repo.git`).
    /// The LFS endpoint is derived by appending `/info/lfs` to the base URL.
    pub fn new(repo_url: &str) -> Result<Self> {
        let lfs_url = derive_lfs_url(repo_url)?;
        Ok(BatchClient::with_url(lfs_url))
    }

    /// Create a new LFS client with a specific LFS endpoint URL.
    pub fn with_url(lfs_url: Url) -> Self {
        BatchClient {
            inner: Arc::new(BatchClientInner {
                lfs_url: with_trailing_slash(lfs_url),
                credentials: None,
                agent: build_agent(&TimeoutConfig::default()),
                ref_name: None,
                retry: RetryPolicy::default(),
                transfer_attempts: 3,
            }),
        }
    }

    /// Create a client from settings.
    pub fn from_config(config: &LfsConfig) -> Result<Self> {
        config.validate()?;
        let lfs_url = match &config.lfs_url {
            Some(url) => Url::parse(url).map_err(|e| Error::InvalidUrl(e.to_string()))?,
            None => derive_lfs_url(&config.server_url)?,
        };

        let mut inner = BatchClientInner {
            lfs_url: with_trailing_slash(lfs_url),
            credentials: None,
            agent: build_agent(&config.timeouts),
            ref_name: config.ref_name.clone(),
            retry: RetryPolicy::from(&config.retry),
            transfer_attempts: config.transfer_attempts,
        };
        if inner.ref_name.as_deref() == Some("") {
            inner.ref_name = None;
        }
        Ok(BatchClient {
            inner: Arc::new(inner),
        })
    }

    fn map_inner(self, f: impl FnOnce(&mut BatchClientInner)) -> Self {
        let mut inner = (*self.inner).clone();
        f(&mut inner);
        BatchClient {
            inner: Arc::new(inner),
        }
    }

    /// Set basic authentication credentials.
    pub fn with_auth(self, username: &str, password: &str) -> Self {
        self.with_credentials(Credentials::Basic(
            username.to_string(),
            password.to_string(),
        ))
    }

    /// Set authentication from a bearer token (OAuth/PAT).
    pub fn with_token(self, token: &str) -> Self {
        self.with_credentials(Credentials::Bearer(token.to_string()))
    }

    /// Use a credential provider supplied by the host application.
    pub fn with_credentials<C: CredentialProvider + 'static>(self, provider: C) -> Self {
        let provider: Arc<dyn CredentialProvider> = Arc::new(provider);
        self.map_inner(|inner| inner.credentials = Some(provider))
    }

    /// Set the ref name for batch requests.
    ///
    /// The ref name is sent with batch requests to help servers with
    /// access control and locking decisions (e.g., "refs/heads/main").
    pub fn with_ref(self, ref_name: &str) -> Self {
        let ref_name = ref_name.to_string();
        self.map_inner(|inner| inner.ref_name = Some(ref_name))
    }

    /// Replace the retry policy for API calls.
    pub fn with_retry(self, retry: RetryPolicy) -> Self {
        self.map_inner(|inner| inner.retry = retry)
    }

    /// Set how many times one object transfer is attempted.
    pub fn with_transfer_attempts(self, attempts: u32) -> Self {
        self.map_inner(|inner| inner.transfer_attempts = attempts.max(1))
    }

    /// Replace network timeouts.
    pub fn with_timeouts(self, timeouts: &TimeoutConfig) -> Self {
        let agent = build_agent(timeouts);
        self.map_inner(|inner| inner.agent = agent)
    }

    /// Get the LFS endpoint URL.
    pub fn lfs_url(&self) -> &Url {
        &self.inner.lfs_url
    }

    pub fn ref_name(&self) -> Option<&str> {
        self.inner.ref_name.as_deref()
    }

    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url> {
        Ok(self.inner.lfs_url.join(path)?)
    }

    /// A request against the LFS API with auth and media type headers set.
    pub(crate) fn api_request(&self, method: &str, url: &Url) -> ureq::Request {
        let mut req = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", LFS_MEDIA_TYPE)
            .set("Content-Type", LFS_MEDIA_TYPE);

        if let Some(credentials) = self.inner.credentials.as_ref().and_then(|p| p.credentials()) {
            req = req.set("Authorization", &credentials.authorization());
        }
        req
    }

    /// Send a batch request to the LFS server.
    ///
    /// Transient failures are retried per the client's retry policy. A body
    /// that is not a valid batch response is a protocol error.
    pub fn batch(&self, request: &BatchRequest) -> Result<BatchResponse> {
        let url = self.endpoint("objects/batch")?;

        self.inner.retry.run("batch request", |attempt| {
            debug!(
                url = %url,
                operation = %request.operation,
                objects = request.objects.len(),
                attempt,
                "POST objects/batch"
            );
            let response = self.api_request("POST", &url).send_json(request)?;
            let body = response.into_string()?;
            serde_json::from_str::<BatchResponse>(&body)
                .map_err(|e| Error::Protocol(format!("malformed batch response: {}", e)))
        })
    }

    /// Ask the server how to move a set of objects.
    ///
    /// One round trip covers all objects. Objects the server already has (on
    /// upload) are returned in `present`, objects it refuses in `rejected`.
    pub fn negotiate(&self, operation: Operation, objects: &[ObjectSpec]) -> Result<Negotiation> {
        let mut seen = HashSet::new();
        let mut requested: Vec<(Oid, u64)> = Vec::new();
        for object in objects {
            let oid = Oid::from_hex(&object.oid)?;
            if seen.insert(oid) {
                requested.push((oid, object.size));
            }
        }
        if requested.is_empty() {
            return Ok(Negotiation::default());
        }

        let specs = requested
            .iter()
            .map(|(oid, size)| ObjectSpec::new(&oid.to_hex(), *size))
            .collect();
        let mut request = BatchRequest::new(operation, specs);
        if let Some(ref_name) = &self.inner.ref_name {
            request = request.with_ref(ref_name);
        }

        let response = self.batch(&request)?;
        let issued_at = Utc::now();

        if response.transfer != "basic" {
            return Err(Error::Protocol(format!(
                "server chose unsupported transfer adapter: {}",
                response.transfer
            )));
        }

        let mut by_oid = HashMap::new();
        for object in response.objects {
            let oid = Oid::from_hex(&object.oid).map_err(|_| {
                Error::Protocol(format!("invalid oid in batch response: {:?}", object.oid))
            })?;
            if !seen.contains(&oid) {
                return Err(Error::Protocol(format!(
                    "batch response contains unrequested object {}",
                    oid
                )));
            }
            by_oid.insert(oid, object);
        }

        let mut negotiation = Negotiation::default();
        for (oid, size) in requested {
            let object = by_oid.remove(&oid).ok_or_else(|| {
                Error::Protocol(format!("batch response is missing object {}", oid))
            })?;

            if let Some(err) = &object.error {
                let error = match err.code {
                    404 | 410 => Error::NotFound(format!("{}: {}", oid, err.message)),
                    code => Error::ServerError {
                        code,
                        message: err.message.clone(),
                    },
                };
                debug!(%oid, code = err.code, "object rejected by server");
                negotiation.rejected.push((oid, error));
                continue;
            }

            match object.action_for(operation) {
                Some(action) => {
                    let verify = match operation {
                        Operation::Upload => object.verify_action().map(|v| VerifyAction {
                            href: v.href.clone(),
                            headers: v.header.clone(),
                        }),
                        Operation::Download => None,
                    };
                    negotiation.actions.push(TransferAction {
                        oid,
                        size,
                        operation,
                        href: action.href.clone(),
                        headers: action.header.clone(),
                        expires_at: action.expiry(issued_at),
                        verify,
                    });
                }
                None => match operation {
                    // No upload action means the server already has it
                    Operation::Upload => negotiation.present.push(oid),
                    Operation::Download => negotiation.rejected.push((
                        oid,
                        Error::NotFound(format!("{}: no download action", oid)),
                    )),
                },
            }
        }

        info!(
            operation = %operation,
            transfers = negotiation.actions.len(),
            present = negotiation.present.len(),
            rejected = negotiation.rejected.len(),
            "negotiated batch"
        );
        Ok(negotiation)
    }

    fn transfer_policy(&self) -> RetryPolicy {
        self.inner
            .retry
            .with_max_attempts(self.inner.transfer_attempts)
    }

    /// Download an object straight into the store.
    ///
    /// The digest is verified before the blob becomes visible. Failed
    /// attempts discard their partial data and are retried.
    pub fn download(
        &self,
        action: &TransferAction,
        store: &ContentStore,
        cancel: &CancellationToken,
    ) -> Result<BlobEntry> {
        if action.operation != Operation::Download {
            return Err(Error::Protocol(format!(
                "expected a download action for {}",
                action.oid
            )));
        }

        let retryable = |e: &Error| e.is_transient() || matches!(e, Error::Integrity { .. });
        let result = self
            .transfer_policy()
            .run_with("download", cancel, retryable, |attempt| {
                if action.is_expired() {
                    return Err(Error::Expired(action.oid.to_hex()));
                }
                debug!(oid = %action.oid, attempt, "GET object");

                let mut req = self.inner.agent.get(&action.href);
                for (key, value) in &action.headers {
                    req = req.set(key, value);
                }
                let response = req.call().map_err(transfer_error)?;

                let mut temp = store.reserve_temp(&action.oid)?;
                let mut reader = response.into_reader();
                copy_cancellable(&mut reader, &mut temp, cancel)?;
                temp.commit()
            });

        match result {
            Ok(entry) => {
                info!(oid = %action.oid, size = entry.size, "downloaded object");
                Ok(entry)
            }
            Err(e) => Err(wrap_transfer_error(&action.oid, e)),
        }
    }

    /// Upload an object held by the store.
    pub fn upload_from_store(
        &self,
        action: &TransferAction,
        store: &ContentStore,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.upload_with(action, || store.open(&action.oid), cancel)
    }

    /// Upload a local file.
    pub fn upload_file(
        &self,
        action: &TransferAction,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.upload_with(action, || Ok(File::open(path)?), cancel)
    }

    /// Upload content produced by `open`, called once per attempt.
    ///
    /// Calls the verify action afterwards if the server asked for one.
    pub fn upload_with<R, F>(
        &self,
        action: &TransferAction,
        mut open: F,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: Read,
        F: FnMut() -> Result<R>,
    {
        if action.operation != Operation::Upload {
            return Err(Error::Protocol(format!(
                "expected an upload action for {}",
                action.oid
            )));
        }

        let policy = self.transfer_policy();
        let result = policy
            .run_cancellable("upload", cancel, |attempt| {
                if action.is_expired() {
                    return Err(Error::Expired(action.oid.to_hex()));
                }
                debug!(oid = %action.oid, attempt, "PUT object");

                let mut req = self.inner.agent.put(&action.href);
                for (key, value) in &action.headers {
                    req = req.set(key, value);
                }
                req = req.set("Content-Type", "application/octet-stream");
                req = req.set("Content-Length", &action.size.to_string());

                let body = CancellableReader {
                    inner: open()?,
                    cancel: cancel.clone(),
                };
                match req.send(body) {
                    Ok(_) => Ok(()),
                    Err(_) if cancel.is_cancelled() => Err(Error::Cancelled),
                    Err(e) => Err(transfer_error(e)),
                }
            })
            .and_then(|()| match &action.verify {
                Some(verify) => policy.run_cancellable("verify", cancel, |_| {
                    self.verify_upload(action, verify)
                }),
                None => Ok(()),
            });

        match result {
            Ok(()) => {
                info!(oid = %action.oid, size = action.size, "uploaded object");
                Ok(())
            }
            Err(e) => Err(wrap_transfer_error(&action.oid, e)),
        }
    }

    fn verify_upload(&self, action: &TransferAction, verify: &VerifyAction) -> Result<()> {
        let body = serde_json::json!({
            "oid": action.oid.to_hex(),
            "size": action.size
        });

        let mut req = self
            .inner
            .agent
            .post(&verify.href)
            .set("Accept", LFS_MEDIA_TYPE)
            .set("Content-Type", LFS_MEDIA_TYPE);
        for (key, value) in &verify.headers {
            req = req.set(key, value);
        }
        req.send_json(&body).map_err(transfer_error)?;
        Ok(())
    }
}

/// Map a failed object transfer request.
///
/// Object hrefs usually point at storage rather than the LFS API, so a
/// refused request there concerns that one object. Auth failures and
/// throttling keep their batch-wide meaning.
fn transfer_error(err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(code, response)
            if (400..500).contains(&code) && !matches!(code, 401 | 403 | 404 | 429) =>
        {
            let message = response
                .into_string()
                .unwrap_or_else(|_| "unknown error".into());
            Error::ServerError { code, message }
        }
        other => other.into(),
    }
}

/// Per-item failures are reported as transfer errors; batch-level and
/// control-flow errors keep their identity.
fn wrap_transfer_error(oid: &Oid, err: Error) -> Error {
    match err {
        e @ (Error::AuthRequired
        | Error::Protocol(_)
        | Error::Cancelled
        | Error::Expired(_)
        | Error::Transfer { .. }) => e,
        e => Error::Transfer {
            oid: oid.to_hex(),
            source: Box::new(e),
        },
    }
}

/// Request body that stops producing bytes once cancellation is requested.
struct CancellableReader<R> {
    inner: R,
    cancel: CancellationToken,
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "transfer cancelled"));
        }
        self.inner.read(buf)
    }
}

fn build_agent(timeouts: &TimeoutConfig) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeouts.connect())
        .timeout_read(timeouts.read())
        .timeout_write(timeouts.write())
        .user_agent(USER_AGENT)
        .build()
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Derive the LFS endpoint URL from a Git remote URL.
fn derive_lfs_url(repo_url: &str) -> Result<Url> {
    let repo_url = repo_url.trim();

    // Handle SSH URLs (git@github.com:owner/repo.git)
    if let Some(rest) = repo_url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            // Keep .git if present, add it if not - GitHub requires it
            let path = if path.ends_with(".git") {
                path.to_string()
            } else {
                format!("{}.git", path)
            };
            // Trailing slash needed for correct URL joining
            let url_str = format!("https://{}/{}/info/lfs/", host, path);
            return Url::parse(&url_str).map_err(|e| Error::InvalidUrl(e.to_string()));
        }
    }

    // Handle HTTPS URLs
    let mut url = Url::parse(repo_url).map_err(|e| Error::InvalidUrl(e.to_string()))?;

    // Keep .git if present, add it if not - GitHub requires it in the LFS path
    let path = url.path().trim_end_matches('/');
    let path = if path.ends_with(".git") {
        path.to_string()
    } else {
        format!("{}.git", path)
    };
    let new_path = format!("{}/info/lfs/", path);
    url.set_path(&new_path);

    Ok(url)
}

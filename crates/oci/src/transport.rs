//! Registry transport.
//!
//! [`RegistryTransport`] is the seam between the cache/publisher and the
//! network. [`OciTransport`] implements it on top of `oci-distribution` with
//! retry on transient failures and a per-repository authentication cache.

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use std::collections::HashSet;
use std::future::Future;
use std::path::Path;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::credentials::Credentials;
use crate::descriptor::{ACCEPTED_MANIFEST_TYPES, Descriptor, verify_digest};
use crate::retry::{RetryConfig, with_retry};
use crate::{Error, Result};

/// Raw registry operations used by pull and publish.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Fetch a manifest or index by tag or digest.
    ///
    /// Returns the raw bytes and the content digest.
    async fn pull_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)>;

    /// Download the blob named by `descriptor` into the file at `dest`.
    ///
    /// Any previous content of `dest` is replaced. The caller verifies the
    /// digest.
    async fn pull_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        dest: &Path,
    ) -> Result<()>;

    /// Upload a blob under its digest.
    async fn push_blob(&self, reference: &Reference, data: &[u8], digest: &str) -> Result<()>;

    /// Upload a blob stored in a file.
    ///
    /// The file is read when the upload starts and checked against `digest`,
    /// so a file changed after staging is never sent.
    async fn push_blob_file(&self, reference: &Reference, path: &Path, digest: &str) -> Result<()> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::io(e, path, "read staged file"))?;
        verify_digest(digest, &data)?;
        self.push_blob(reference, &data, digest).await
    }

    /// Upload a manifest or index under the reference's tag or digest.
    async fn push_manifest(
        &self,
        reference: &Reference,
        body: Vec<u8>,
        media_type: &str,
    ) -> Result<()>;
}

/// Race a future against a cancellation token.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = future => result,
    }
}

/// `oci-distribution` backed transport for one credential set.
pub struct OciTransport {
    client: Client,
    auth: RegistryAuth,
    retry: RetryConfig,
    cancel: CancellationToken,
    authenticated: Mutex<HashSet<(String, bool)>>,
}

impl std::fmt::Debug for OciTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OciTransport")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl OciTransport {
    /// Create a transport. `insecure` selects plain HTTP.
    #[must_use]
    pub fn new(credentials: &Credentials, insecure: bool) -> Self {
        let config = ClientConfig {
            protocol: if insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            auth: credentials.to_registry_auth(),
            retry: RetryConfig::default(),
            cancel: CancellationToken::new(),
            authenticated: Mutex::new(HashSet::new()),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Interrupt retry backoff when `cancel` fires.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Authenticate once per repository and operation.
    async fn ensure_auth(&self, reference: &Reference, operation: RegistryOperation) -> Result<()> {
        let push = matches!(operation, RegistryOperation::Push);
        let key = (
            format!("{}/{}", reference.registry(), reference.repository()),
            push,
        );
        let cached = self
            .authenticated
            .lock()
            .map_err(|_| Error::registry(reference.whole(), "auth", "auth cache poisoned", false))?
            .contains(&key);
        if cached {
            trace!(repository = %key.0, push, "Using cached registry auth");
            return Ok(());
        }

        with_retry(&self.retry, &self.cancel, || async {
            self.client
                .auth(reference, &self.auth, operation)
                .await
                .map(|_| ())
                .map_err(|e| classify(reference, "auth", e))
        })
        .await?;

        debug!(repository = %key.0, push, "Authenticated with registry");
        if let Ok(mut cache) = self.authenticated.lock() {
            cache.insert(key);
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryTransport for OciTransport {
    async fn pull_manifest(&self, reference: &Reference) -> Result<(Vec<u8>, String)> {
        self.ensure_auth(reference, RegistryOperation::Pull).await?;
        with_retry(&self.retry, &self.cancel, || async {
            self.client
                .pull_manifest_raw(reference, &self.auth, ACCEPTED_MANIFEST_TYPES)
                .await
                .map_err(|e| classify(reference, "pull manifest", e))
        })
        .await
    }

    async fn pull_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        dest: &Path,
    ) -> Result<()> {
        self.ensure_auth(reference, RegistryOperation::Pull).await?;
        let layer = OciDescriptor {
            media_type: descriptor.media_type.clone(),
            digest: descriptor.digest.clone(),
            size: i64::try_from(descriptor.size).unwrap_or(i64::MAX),
            ..Default::default()
        };
        with_retry(&self.retry, &self.cancel, || async {
            // Recreated per attempt so a retry never appends to a partial body.
            let mut file = tokio::fs::File::create(dest)
                .await
                .map_err(|e| Error::io(e, dest, "create"))?;
            self.client
                .pull_blob(reference, &layer, &mut file)
                .await
                .map_err(|e| classify(reference, "pull blob", e))?;
            file.flush().await.map_err(|e| Error::io(e, dest, "write"))?;
            trace!(digest = %descriptor.digest, dest = %dest.display(), "Downloaded blob");
            Ok(())
        })
        .await
    }

    async fn push_blob(&self, reference: &Reference, data: &[u8], digest: &str) -> Result<()> {
        self.ensure_auth(reference, RegistryOperation::Push).await?;
        with_retry(&self.retry, &self.cancel, || async {
            self.client
                .push_blob(reference, data, digest)
                .await
                .map(|_| ())
                .map_err(|e| classify(reference, "push blob", e))
        })
        .await
    }

    async fn push_manifest(
        &self,
        reference: &Reference,
        body: Vec<u8>,
        media_type: &str,
    ) -> Result<()> {
        self.ensure_auth(reference, RegistryOperation::Push).await?;
        with_retry(&self.retry, &self.cancel, || async {
            let content_type = media_type
                .parse()
                .map_err(|_| Error::invalid_input(format!("invalid media type '{media_type}'")))?;
            self.client
                .push_manifest_raw(reference, body.clone(), content_type)
                .await
                .map(|_| ())
                .map_err(|e| classify(reference, "push manifest", e))
        })
        .await
    }
}

/// Map a distribution error to [`Error::Registry`], marking retryable ones.
fn classify(reference: &Reference, operation: &str, error: OciDistributionError) -> Error {
    let transient = match &error {
        OciDistributionError::ServerError { code, .. } => *code >= 500 || *code == 429,
        OciDistributionError::RequestError(e) => e.is_timeout() || e.is_connect(),
        _ => false,
    };
    Error::registry(reference.whole(), operation, error.to_string(), transient)
}

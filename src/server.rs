//! Registry v2 server backing the fixtures.

use crate::auth::require_basic_auth;
use crate::config::RegistryConfig;
use crate::error::{HarnessError, Result};
use crate::storage::{create_storage, is_digest, ManifestEntry, Storage, DEFAULT_MANIFEST_TYPE};
use crate::tls::{install_crypto_provider, TlsMaterial};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{any, get},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const API_VERSION_HEADER: &str = "Docker-Distribution-API-Version";
const OCI_MANIFEST_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_CONFIG_TYPE: &str = "application/vnd.oci.image.config.v1+json";
const OCI_LAYER_TYPE: &str = "application/vnd.oci.image.layer.v1.tar";

fn strip_leading_slash(s: &str) -> &str {
    s.strip_prefix('/').unwrap_or(s)
}

/// `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

type SharedStorage = Arc<dyn Storage>;

#[derive(Clone)]
struct AppState {
    storage: SharedStorage,
}

#[derive(Serialize)]
struct ApiVersion {
    version: String,
}

#[derive(Deserialize)]
struct UploadParams {
    digest: Option<String>,
    mount: Option<String>,
}

/// Error codes of the registry error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorCode {
    BlobUnknown,
    BlobUploadUnknown,
    DigestInvalid,
    ManifestUnknown,
    NameUnknown,
    Unauthorized,
    Unsupported,
}

impl ErrorCode {
    fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BlobUnknown => "BLOB_UNKNOWN",
            ErrorCode::BlobUploadUnknown => "BLOB_UPLOAD_UNKNOWN",
            ErrorCode::DigestInvalid => "DIGEST_INVALID",
            ErrorCode::ManifestUnknown => "MANIFEST_UNKNOWN",
            ErrorCode::NameUnknown => "NAME_UNKNOWN",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Unsupported => "UNSUPPORTED",
        }
    }

    fn message(self) -> &'static str {
        match self {
            ErrorCode::BlobUnknown => "blob unknown to registry",
            ErrorCode::BlobUploadUnknown => "blob upload unknown to registry",
            ErrorCode::DigestInvalid => "provided digest did not match uploaded content",
            ErrorCode::ManifestUnknown => "manifest unknown",
            ErrorCode::NameUnknown => "repository name not known to registry",
            ErrorCode::Unauthorized => "authentication required",
            ErrorCode::Unsupported => "The operation is unsupported.",
        }
    }

    fn status(self) -> StatusCode {
        match self {
            ErrorCode::BlobUnknown
            | ErrorCode::BlobUploadUnknown
            | ErrorCode::ManifestUnknown
            | ErrorCode::NameUnknown => StatusCode::NOT_FOUND,
            ErrorCode::DigestInvalid => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Unsupported => StatusCode::METHOD_NOT_ALLOWED,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    errors: Vec<ErrorEntry>,
}

#[derive(Serialize)]
struct ErrorEntry {
    code: &'static str,
    message: &'static str,
    detail: String,
}

pub(crate) fn error_response(code: ErrorCode, detail: impl Into<String>) -> Response {
    let body = ErrorBody {
        errors: vec![ErrorEntry {
            code: code.as_str(),
            message: code.message(),
            detail: detail.into(),
        }],
    };
    (code.status(), Json(body)).into_response()
}

enum ShutdownSignal {
    Plain(oneshot::Sender<()>),
    Tls(axum_server::Handle),
}

struct Running {
    signal: ShutdownSignal,
    task: JoinHandle<std::io::Result<()>>,
}

/// The registry server.
///
/// Serves the registry v2 subset a copy/inspect client needs, optionally
/// behind basic auth and TLS. Stopped with [`RegistryServer::shutdown`] or,
/// as a fallback, when dropped.
pub struct RegistryServer {
    addr: SocketAddr,
    tls: Option<TlsMaterial>,
    storage: SharedStorage,
    running: Option<Running>,
}

impl RegistryServer {
    /// Creates and starts a new registry server with the given configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use registry_harness::{RegistryServer, RegistryConfig};
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let config = RegistryConfig::memory().with_auth();
    /// let server = RegistryServer::new(config).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn new(config: RegistryConfig) -> Result<Self> {
        let storage = create_storage(&config.storage).await?;

        let state = AppState {
            storage: storage.clone(),
        };

        let mut app = Router::new()
            .route("/v2/", get(api_version))
            .route("/v2/{*path}", any(dispatch));
        if let Some(credentials) = config.auth.clone() {
            app = app.route_layer(middleware::from_fn_with_state(
                Arc::new(credentials),
                require_basic_auth,
            ));
        }
        let app = app
            .layer(
                tower::ServiceBuilder::new()
                    .layer(axum::extract::DefaultBodyLimit::max(512 * 1024 * 1024))
                    .layer(TraceLayer::new_for_http()),
            )
            .with_state(state);

        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::AddrInUse => HarnessError::AddressInUse {
                    address: bind_addr.clone(),
                },
                _ => HarnessError::Io(e),
            })?;
        let addr = listener.local_addr()?;

        let tls = if config.tls {
            Some(TlsMaterial::self_signed(&config.host)?)
        } else {
            None
        };

        let running = match &tls {
            None => {
                let (tx, rx) = oneshot::channel::<()>();
                let task = tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move {
                            let _ = rx.await;
                        })
                        .await
                });
                Running {
                    signal: ShutdownSignal::Plain(tx),
                    task,
                }
            }
            Some(material) => {
                install_crypto_provider();
                let rustls = RustlsConfig::from_pem(
                    material.cert_pem.clone().into_bytes(),
                    material.key_pem.clone().into_bytes(),
                )
                .await
                .map_err(|e| HarnessError::Tls(e.to_string()))?;
                let handle = axum_server::Handle::new();
                let server =
                    axum_server::from_tcp_rustls(listener.into_std()?, rustls).handle(handle.clone());
                let task = tokio::spawn(async move { server.serve(app.into_make_service()).await });
                Running {
                    signal: ShutdownSignal::Tls(handle),
                    task,
                }
            }
        };

        info!(
            "Registry listening on {} (auth: {}, tls: {})",
            addr,
            config.auth.is_some(),
            config.tls
        );

        Ok(Self {
            addr,
            tls,
            storage,
            running: Some(running),
        })
    }

    /// Returns the socket address the server is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the full URL of the registry server.
    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        format!("{}://{}", scheme, self.addr)
    }

    /// Returns the port number the server is listening on.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn tls(&self) -> Option<&TlsMaterial> {
        self.tls.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stores a minimal single-layer OCI image as `repo:tag` and returns its
    /// manifest digest.
    pub async fn seed_image(&self, repo: &str, tag: &str) -> Result<String> {
        let layer = vec![0u8; 1024];
        let layer_digest = sha256_digest(&layer);

        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "created": "1970-01-01T00:00:00Z",
            "config": {},
            "rootfs": { "type": "layers", "diff_ids": [layer_digest] },
        }))?;
        let config_digest = sha256_digest(&config);

        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST_TYPE,
            "config": {
                "mediaType": OCI_CONFIG_TYPE,
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": [{
                "mediaType": OCI_LAYER_TYPE,
                "digest": layer_digest,
                "size": layer.len(),
            }],
        }))?;
        let manifest_digest = sha256_digest(&manifest);

        self.storage.store_blob(layer_digest, layer).await?;
        self.storage.store_blob(config_digest, config).await?;
        let entry = ManifestEntry {
            data: manifest,
            content_type: OCI_MANIFEST_TYPE.to_string(),
        };
        self.storage
            .store_manifest(repo, &manifest_digest, entry.clone())
            .await?;
        self.storage.store_manifest(repo, tag, entry).await?;

        info!("Seeded {}:{} ({})", repo, tag, manifest_digest);
        Ok(manifest_digest)
    }

    /// Stops serving and waits for the server task. Calling it again is a no-op.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        match running.signal {
            ShutdownSignal::Plain(tx) => {
                let _ = tx.send(());
            }
            ShutdownSignal::Tls(handle) => handle.graceful_shutdown(Some(SHUTDOWN_GRACE)),
        }

        let abort = running.task.abort_handle();
        let teardown = |reason: String| HarnessError::Teardown {
            address: self.addr.to_string(),
            reason,
        };
        match tokio::time::timeout(SHUTDOWN_GRACE * 2, running.task).await {
            Ok(Ok(Ok(()))) => {
                info!("Registry on {} stopped", self.addr);
                Ok(())
            }
            Ok(Ok(Err(e))) => Err(teardown(e.to_string())),
            Ok(Err(e)) => Err(teardown(e.to_string())),
            Err(_) => {
                abort.abort();
                Err(teardown("graceful shutdown timed out".to_string()))
            }
        }
    }
}

impl Drop for RegistryServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            if let ShutdownSignal::Tls(handle) = &running.signal {
                handle.shutdown();
            }
            running.task.abort();
        }
    }
}

enum Target<'a> {
    Tags(&'a str),
    Manifest(&'a str, &'a str),
    Upload(&'a str, Option<&'a str>),
    Blob(&'a str, &'a str),
}

/// Splits a `/v2/` sub-path into its repository name and endpoint. Names may
/// span several path segments.
fn parse_target(path: &str) -> Option<Target<'_>> {
    let path = strip_leading_slash(path);
    let target = if let Some(name) = path.strip_suffix("/tags/list") {
        Target::Tags(name)
    } else if let Some((name, reference)) = path.rsplit_once("/manifests/") {
        Target::Manifest(name, reference)
    } else if let Some((name, rest)) = path.rsplit_once("/blobs/uploads") {
        let uuid = rest.trim_start_matches('/');
        Target::Upload(name, (!uuid.is_empty()).then_some(uuid))
    } else if let Some((name, digest)) = path.rsplit_once("/blobs/") {
        Target::Blob(name, digest)
    } else {
        return None;
    };

    let name = match &target {
        Target::Tags(n) | Target::Manifest(n, _) | Target::Upload(n, _) | Target::Blob(n, _) => n,
    };
    if name.is_empty() {
        None
    } else {
        Some(target)
    }
}

async fn api_version() -> impl IntoResponse {
    (
        [(API_VERSION_HEADER, "registry/2.0")],
        Json(ApiVersion {
            version: "registry/2.0".to_string(),
        }),
    )
}

async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    Path(path): Path<String>,
    Query(params): Query<UploadParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(target) = parse_target(&path) else {
        return (StatusCode::NOT_FOUND, "404 page not found").into_response();
    };

    match (&method, target) {
        (&Method::GET, Target::Tags(name)) => list_tags(&state, name).await,
        (&Method::GET, Target::Manifest(name, reference)) => {
            get_manifest(&state, name, reference, true).await
        }
        (&Method::HEAD, Target::Manifest(name, reference)) => {
            get_manifest(&state, name, reference, false).await
        }
        (&Method::PUT, Target::Manifest(name, reference)) => {
            put_manifest(&state, name, reference, &headers, body).await
        }
        (&Method::GET, Target::Blob(name, digest)) => get_blob(&state, name, digest, true).await,
        (&Method::HEAD, Target::Blob(name, digest)) => get_blob(&state, name, digest, false).await,
        (&Method::POST, Target::Upload(name, None)) => start_upload(&state, name, params, body).await,
        (&Method::PATCH, Target::Upload(name, Some(uuid))) => {
            upload_chunk(&state, name, uuid, body).await
        }
        (&Method::PUT, Target::Upload(name, Some(uuid))) => {
            finish_upload(&state, name, uuid, params, &headers, body).await
        }
        _ => {
            debug!("Unsupported: {} /v2/{}", method, path);
            error_response(ErrorCode::Unsupported, format!("{} /v2/{}", method, path))
        }
    }
}

async fn list_tags(state: &AppState, name: &str) -> Response {
    info!("Listing tags: {}", name);

    match state.storage.list_tags(name).await {
        Ok(Some(tags)) => Json(json!({ "name": name, "tags": tags })).into_response(),
        Ok(None) => error_response(ErrorCode::NameUnknown, name),
        Err(e) => internal_error(e),
    }
}

async fn get_blob(state: &AppState, name: &str, digest: &str, with_body: bool) -> Response {
    info!("Getting blob: {}/{}", name, digest);

    match state.storage.get_blob(digest).await {
        Ok(Some(blob)) => {
            let headers = [
                ("Content-Length", blob.len().to_string()),
                ("Content-Type", "application/octet-stream".to_string()),
                ("Docker-Content-Digest", digest.to_string()),
            ];
            if with_body {
                (StatusCode::OK, headers, blob).into_response()
            } else {
                (StatusCode::OK, headers).into_response()
            }
        }
        Ok(None) if with_body => error_response(ErrorCode::BlobUnknown, digest),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

async fn start_upload(state: &AppState, name: &str, params: UploadParams, body: Bytes) -> Response {
    if let Some(mount) = params.mount.as_deref() {
        if let Ok(Some(_)) = state.storage.get_blob(mount).await {
            info!("Mounted blob {} into {}", mount, name);
            return blob_created(name, mount);
        }
    }

    if let Some(digest) = params.digest {
        debug!("Monolithic upload: {} ({} bytes)", name, body.len());
        return store_verified_blob(state, name, digest, body.to_vec()).await;
    }

    let uuid = uuid::Uuid::new_v4().to_string();
    info!("Starting upload: {} ({})", name, uuid);

    if let Err(e) = state.storage.create_upload(uuid.clone()).await {
        warn!("Failed to create upload: {}", e);
        return internal_error(e);
    }

    (
        StatusCode::ACCEPTED,
        [
            ("Location", format!("/v2/{}/blobs/uploads/{}", name, uuid)),
            ("Range", "0-0".to_string()),
            ("Docker-Upload-UUID", uuid),
        ],
    )
        .into_response()
}

async fn upload_chunk(state: &AppState, name: &str, uuid: &str, body: Bytes) -> Response {
    debug!("Uploading chunk: {}/{} ({} bytes)", name, uuid, body.len());

    match state.storage.append_upload(uuid, &body).await {
        Ok(size) => (
            StatusCode::ACCEPTED,
            [
                ("Location", format!("/v2/{}/blobs/uploads/{}", name, uuid)),
                ("Range", format!("0-{}", size.saturating_sub(1))),
                ("Docker-Upload-UUID", uuid.to_string()),
            ],
        )
            .into_response(),
        Err(_) => {
            warn!("Upload not found: {}", uuid);
            error_response(ErrorCode::BlobUploadUnknown, uuid)
        }
    }
}

async fn finish_upload(
    state: &AppState,
    name: &str,
    uuid: &str,
    params: UploadParams,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    debug!("Finishing upload: {}/{}", name, uuid);

    let upload_data = match state.storage.finish_upload(uuid).await {
        Ok(Some(mut data)) => {
            data.extend_from_slice(&body);
            data
        }
        _ => {
            warn!("Upload not found: {}", uuid);
            return error_response(ErrorCode::BlobUploadUnknown, uuid);
        }
    };

    let digest = params
        .digest
        .or_else(|| {
            headers
                .get("digest")
                .or_else(|| headers.get("Docker-Content-Digest"))
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
        .unwrap_or_else(|| sha256_digest(&upload_data));

    store_verified_blob(state, name, digest, upload_data).await
}

async fn store_verified_blob(state: &AppState, name: &str, digest: String, data: Vec<u8>) -> Response {
    let actual = sha256_digest(&data);
    if actual != digest {
        warn!("Digest mismatch for {}: claimed {}, got {}", name, digest, actual);
        return error_response(ErrorCode::DigestInvalid, digest);
    }

    if let Err(e) = state.storage.store_blob(digest.clone(), data).await {
        warn!("Failed to store blob: {}", e);
        return internal_error(e);
    }

    info!("Stored blob: {}", digest);
    blob_created(name, &digest)
}

fn blob_created(name: &str, digest: &str) -> Response {
    (
        StatusCode::CREATED,
        [
            ("Location", format!("/v2/{}/blobs/{}", name, digest)),
            ("Docker-Content-Digest", digest.to_string()),
        ],
    )
        .into_response()
}

async fn put_manifest(
    state: &AppState,
    name: &str,
    reference: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    info!("Putting manifest: {}/{}", name, reference);

    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_MANIFEST_TYPE)
        .to_string();

    let digest = sha256_digest(&body);
    if is_digest(reference) && reference != digest {
        warn!("Manifest digest mismatch: {} != {}", reference, digest);
        return error_response(ErrorCode::DigestInvalid, reference);
    }

    let entry = ManifestEntry {
        data: body.to_vec(),
        content_type: content_type.clone(),
    };

    if let Err(e) = state.storage.store_manifest(name, reference, entry.clone()).await {
        warn!("Failed to store manifest: {}", e);
        return internal_error(e);
    }

    if reference != digest {
        if let Err(e) = state.storage.store_manifest(name, &digest, entry).await {
            warn!("Failed to store manifest by digest: {}", e);
        }
    }

    info!(
        "Stored manifest with digest: {} (type: {})",
        digest, content_type
    );

    (
        StatusCode::CREATED,
        [
            ("Location", format!("/v2/{}/manifests/{}", name, digest)),
            ("Docker-Content-Digest", digest),
        ],
    )
        .into_response()
}

async fn get_manifest(state: &AppState, name: &str, reference: &str, with_body: bool) -> Response {
    info!("Getting manifest: {}/{}", name, reference);

    match state.storage.get_manifest(name, reference).await {
        Ok(Some(entry)) => {
            let headers = [
                ("Content-Type", entry.content_type),
                ("Content-Length", entry.data.len().to_string()),
                ("Docker-Content-Digest", sha256_digest(&entry.data)),
            ];
            if with_body {
                (StatusCode::OK, headers, entry.data).into_response()
            } else {
                (StatusCode::OK, headers).into_response()
            }
        }
        Ok(None) if with_body => error_response(ErrorCode::ManifestUnknown, reference),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: HarnessError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_multi_segment_names() {
        assert!(matches!(
            parse_target("library/busybox/manifests/latest"),
            Some(Target::Manifest("library/busybox", "latest"))
        ));
        assert!(matches!(
            parse_target("/a/b/c/tags/list"),
            Some(Target::Tags("a/b/c"))
        ));
        assert!(matches!(
            parse_target("busybox/blobs/uploads/"),
            Some(Target::Upload("busybox", None))
        ));
        assert!(matches!(
            parse_target("busybox/blobs/uploads/1234"),
            Some(Target::Upload("busybox", Some("1234")))
        ));
        assert!(matches!(
            parse_target("busybox/blobs/sha256:abc"),
            Some(Target::Blob("busybox", "sha256:abc"))
        ));
        assert!(parse_target("manifests/latest").is_none());
        assert!(parse_target("busybox").is_none());
    }

    #[test]
    fn test_sha256_digest_of_empty_input() {
        assert_eq!(
            sha256_digest(b""),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}

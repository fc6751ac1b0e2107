#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use ociclient::OciDigest;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub authorization: Option<String>,
}

#[derive(Debug, Default)]
pub struct RegistryState {
    pub blobs: HashMap<String, Vec<u8>>,
    pub manifests: HashMap<(String, String), (String, Vec<u8>)>,
    pub requests: Vec<RecordedRequest>,
    pub uploads: HashMap<String, String>,
    /// Bearer token every `/v2/` request must carry, when set
    pub required_token: Option<String>,
    /// Authorization header the token endpoint insists on, when set
    pub token_endpoint_basic: Option<String>,
    /// Token handed out instead of `required_token`, when set
    pub issued_token: Option<String>,
    /// Status returned by blob HEAD requests instead of the real lookup
    pub head_status: Option<StatusCode>,
    /// Status returned when an upload session is requested, instead of starting one
    pub upload_status: Option<StatusCode>,
    /// Status returned by manifest PUT requests instead of storing
    pub manifest_status: Option<StatusCode>,
    pub realm: String,
}

pub struct MockRegistry {
    pub state: Arc<Mutex<RegistryState>>,
    pub port: u16,
    server: JoinHandle<()>,
}

impl MockRegistry {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(Mutex::new(RegistryState {
            realm: format!("http://127.0.0.1:{}/token", port),
            ..Default::default()
        }));

        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));

        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { state, port, server }
    }

    /// Registry that answers unauthenticated requests with a Bearer challenge.
    pub async fn start_with_token_auth(token: &str, basic: Option<&str>) -> Self {
        let registry = Self::start().await;
        {
            let mut state = registry.state.lock().unwrap();
            state.required_token = Some(token.to_string());
            state.token_endpoint_basic = basic.map(|b| format!("Basic {}", b));
        }
        registry
    }

    pub fn host(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.lock().unwrap().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.lock().unwrap().requests.clear();
    }

    pub fn requests_matching(&self, method: Method, fragment: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path.contains(fragment))
            .collect()
    }

    pub fn has_blob(&self, digest: &OciDigest) -> bool {
        self.state.lock().unwrap().blobs.contains_key(&digest.to_string())
    }

    pub fn manifest(&self, repository: &str, tag: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), tag.to_string()))
            .map(|(_, body)| serde_json::from_slice(body).unwrap())
    }

    pub fn manifest_content_type(&self, repository: &str, tag: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .manifests
            .get(&(repository.to_string(), tag.to_string()))
            .map(|(content_type, _)| content_type.clone())
    }
}

impl Drop for MockRegistry {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn handle(
    State(state): State<Arc<Mutex<RegistryState>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let mut state = state.lock().unwrap();
    let path = uri.path().to_string();
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    state.requests.push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        query: uri.query().map(str::to_string),
        authorization: authorization.clone(),
    });

    if path == "/token" {
        if let Some(expected) = &state.token_endpoint_basic {
            if authorization.as_deref() != Some(expected.as_str()) {
                return StatusCode::UNAUTHORIZED.into_response();
            }
        }
        let token = state
            .issued_token
            .clone()
            .or_else(|| state.required_token.clone())
            .unwrap_or_default();
        return axum::Json(serde_json::json!({ "token": token })).into_response();
    }

    let Some(rest) = path.strip_prefix("/v2/") else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Some(token) = &state.required_token {
        if authorization.as_deref() != Some(format!("Bearer {}", token).as_str()) {
            let scope = repository_of(rest)
                .map(|repo| format!(",scope=\"repository:{}:pull,push\"", repo))
                .unwrap_or_default();
            let challenge = format!("Bearer realm=\"{}\",service=\"mock\"{}", state.realm, scope);
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, challenge)],
            )
                .into_response();
        }
    }

    if rest.is_empty() {
        return StatusCode::OK.into_response();
    }

    if let Some((repository, upload)) = rest.split_once("/blobs/uploads/") {
        return match (method, upload) {
            (Method::POST, "") => {
                if let Some(status) = state.upload_status {
                    return (status, "upload denied").into_response();
                }
                let id = uuid::Uuid::new_v4().to_string();
                state.uploads.insert(id.clone(), repository.to_string());
                (
                    StatusCode::ACCEPTED,
                    [(header::LOCATION, format!("/v2/{}/blobs/uploads/{}", repository, id))],
                )
                    .into_response()
            }
            (Method::PUT, id) if state.uploads.contains_key(id) => {
                let expected = uri
                    .query()
                    .and_then(|q| q.split('&').find_map(|p| p.strip_prefix("digest=")))
                    .map(|d| d.replace("%3A", ":"));
                let actual = OciDigest::sha256(&body).to_string();
                if expected.as_deref() != Some(actual.as_str()) {
                    return StatusCode::BAD_REQUEST.into_response();
                }
                state.uploads.remove(id);
                state.blobs.insert(actual, body.to_vec());
                StatusCode::CREATED.into_response()
            }
            _ => StatusCode::NOT_FOUND.into_response(),
        };
    }

    if let Some((_, digest)) = rest.rsplit_once("/blobs/") {
        if method == Method::HEAD {
            if let Some(status) = state.head_status {
                return status.into_response();
            }
            return if state.blobs.contains_key(digest) {
                StatusCode::OK.into_response()
            } else {
                StatusCode::NOT_FOUND.into_response()
            };
        }
    }

    if let Some((repository, tag)) = rest.rsplit_once("/manifests/") {
        if method == Method::PUT {
            if let Some(status) = state.manifest_status {
                return (status, "manifest rejected").into_response();
            }
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let digest = OciDigest::sha256(&body).to_string();
            state
                .manifests
                .insert((repository.to_string(), tag.to_string()), (content_type, body.to_vec()));
            return (StatusCode::CREATED, [("Docker-Content-Digest", digest)]).into_response();
        }
    }

    StatusCode::NOT_FOUND.into_response()
}

fn repository_of(rest: &str) -> Option<&str> {
    rest.split_once("/blobs/")
        .or_else(|| rest.split_once("/manifests/"))
        .map(|(repository, _)| repository)
}

/// Write a `docker save` style archive with the given config and layers.
pub fn write_image_archive(dir: &Path, config: &[u8], layers: &[(&str, &[u8])]) -> PathBuf {
    let index = serde_json::json!([{
        "Config": "abc.json",
        "RepoTags": ["svc:local"],
        "Layers": layers.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
    }]);
    let index = serde_json::to_vec(&index).unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut append = |path: &str, data: &[u8]| {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, data).unwrap();
    };
    append("manifest.json", &index);
    append("abc.json", config);
    for (name, data) in layers {
        append(name, data);
    }

    let path = dir.join("image.tar");
    std::fs::write(&path, builder.into_inner().unwrap()).unwrap();
    path
}

/// A minimal gzip stream, enough to carry the magic number.
pub fn gzip_bytes(content: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(content).unwrap();
    encoder.finish().unwrap()
}

mod common;

use assert_matches::assert_matches;
use axum::http::{Method, StatusCode};
use base64::Engine;
use bytes::Bytes;
use ociclient::models::media_types;
use ociclient::{
    Credentials, Error, OciDigest, PushOptions, RegistryClient, Transport, TransportOptions,
};
use reqwest::header::HeaderMap;

use common::{MockRegistry, gzip_bytes, write_image_archive};

const CONFIG: &[u8] = br#"{"architecture":"amd64","os":"linux"}"#;

async fn client_for(registry: &MockRegistry, options: PushOptions) -> RegistryClient {
    RegistryClient::connect(&registry.host(), None, &TransportOptions::default(), options)
        .await
        .unwrap()
}

#[tokio::test]
async fn pushes_layers_in_archive_order() {
    let registry = MockRegistry::start().await;
    let work = tempfile::tempdir().unwrap();
    let l1 = gzip_bytes(b"first layer");
    let l2 = b"second layer, uncompressed".to_vec();
    let archive = write_image_archive(work.path(), CONFIG, &[("l1.tar", l1.as_slice()), ("l2.tar", l2.as_slice())]);

    let client = client_for(&registry, PushOptions::default()).await;
    let outcome = client.push_image(&archive, "ns/svc", "v1.2.3").await.unwrap();

    let l1_digest = OciDigest::sha256(&l1);
    let l2_digest = OciDigest::sha256(&l2);
    assert_eq!(outcome.layers[0].digest, l1_digest);
    assert_eq!(outcome.layers[1].digest, l2_digest);
    assert_eq!(outcome.skipped_blobs(), 0);

    for digest in [&l1_digest, &l2_digest] {
        let heads = registry.requests_matching(Method::HEAD, &format!("/v2/ns/svc/blobs/{}", digest));
        assert_eq!(heads.len(), 1, "one existence check for {}", digest);
        assert!(registry.has_blob(digest));
    }
    assert_eq!(registry.requests_matching(Method::POST, "/v2/ns/svc/blobs/uploads/").len(), 3);

    let puts = registry.requests_matching(Method::PUT, "/manifests/");
    assert_eq!(puts.len(), 1);
    assert_eq!(puts[0].path, "/v2/ns/svc/manifests/v1.2.3");

    let manifest = registry.manifest("ns/svc", "v1.2.3").unwrap();
    assert_eq!(manifest["schemaVersion"], 2);
    assert_eq!(manifest["config"]["digest"], OciDigest::sha256(CONFIG).to_string());
    let layers = manifest["layers"].as_array().unwrap();
    assert_eq!(layers.len(), 2);
    assert_eq!(layers[0]["digest"], l1_digest.to_string());
    assert_eq!(layers[0]["mediaType"], media_types::LAYER_TAR_GZIP);
    assert_eq!(layers[0]["size"], l1.len());
    assert_eq!(layers[1]["digest"], l2_digest.to_string());
    assert_eq!(layers[1]["mediaType"], media_types::LAYER_TAR);
    assert_eq!(
        registry.manifest_content_type("ns/svc", "v1.2.3").as_deref(),
        Some(media_types::MANIFEST_V2)
    );
}

#[tokio::test]
async fn second_push_skips_every_blob() {
    let registry = MockRegistry::start().await;
    let work = tempfile::tempdir().unwrap();
    let archive = write_image_archive(
        work.path(),
        CONFIG,
        &[("a/layer.tar", b"layer a"), ("b/layer.tar", b"layer b")],
    );
    let client = client_for(&registry, PushOptions::default()).await;

    let first = client.push_image(&archive, "ns/svc", "v1").await.unwrap();
    registry.clear_requests();
    let second = client.push_image(&archive, "ns/svc", "v1").await.unwrap();

    assert_eq!(second.skipped_blobs(), 3);
    assert!(registry.requests_matching(Method::POST, "/blobs/uploads/").is_empty());
    assert_eq!(registry.requests_matching(Method::PUT, "/manifests/v1").len(), 1);
    assert_eq!(first.manifest_digest, second.manifest_digest);
}

#[tokio::test]
async fn concurrent_layer_uploads_keep_archive_order() {
    let registry = MockRegistry::start().await;
    let work = tempfile::tempdir().unwrap();
    let layers: Vec<(String, Vec<u8>)> = (0..5)
        .map(|i| (format!("l{}/layer.tar", i), format!("layer number {}", i).into_bytes()))
        .collect();
    let refs: Vec<(&str, &[u8])> = layers.iter().map(|(n, d)| (n.as_str(), d.as_slice())).collect();
    let archive = write_image_archive(work.path(), CONFIG, &refs);

    let client = client_for(&registry, PushOptions { max_concurrent_layers: 4 }).await;
    client.push_image(&archive, "ns/svc", "parallel").await.unwrap();

    let manifest = registry.manifest("ns/svc", "parallel").unwrap();
    let digests: Vec<String> = manifest["layers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|l| l["digest"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = layers
        .iter()
        .map(|(_, d)| OciDigest::sha256(d).to_string())
        .collect();
    assert_eq!(digests, expected);
}

#[tokio::test]
async fn pushes_from_spawned_tasks() {
    let registry = MockRegistry::start().await;
    let work = tempfile::tempdir().unwrap();
    let archive = write_image_archive(
        work.path(),
        CONFIG,
        &[("l1.tar", b"layer one"), ("l2.tar", b"layer two")],
    );
    let client = std::sync::Arc::new(client_for(&registry, PushOptions { max_concurrent_layers: 2 }).await);

    let handles: Vec<_> = ["v1", "v2"]
        .into_iter()
        .map(|tag| {
            let client = std::sync::Arc::clone(&client);
            let archive = archive.clone();
            tokio::spawn(async move { client.push_image(&archive, "ns/svc", tag).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert!(registry.manifest("ns/svc", "v1").is_some());
    assert!(registry.manifest("ns/svc", "v2").is_some());
}

#[tokio::test]
async fn bearer_challenge_upgrades_session_once() {
    let basic = base64::engine::general_purpose::STANDARD.encode("deployer:hunter2");
    let registry = MockRegistry::start_with_token_auth("tok-123", Some(&basic)).await;
    let credentials = Credentials::new("deployer", "hunter2");

    let transport = Transport::connect(&registry.host(), Some(&credentials), &TransportOptions::default())
        .await
        .unwrap();
    assert!(!transport.session().await.is_bearer());

    let response = transport
        .execute(Method::GET, "/v2/", None, HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(transport.session().await.is_bearer());

    let token_requests = registry.requests_matching(Method::GET, "/token");
    assert_eq!(token_requests.len(), 1);
    assert_eq!(token_requests[0].authorization.as_deref(), Some(format!("Basic {}", basic).as_str()));

    registry.clear_requests();
    transport
        .execute(Method::GET, "/v2/", None, HeaderMap::new())
        .await
        .unwrap();
    let requests = registry.requests();
    assert_eq!(requests.len(), 1, "no second challenge");
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer tok-123"));
}

#[tokio::test]
async fn token_request_carries_service_and_scope() {
    let registry = MockRegistry::start_with_token_auth("tok", None).await;
    let work = tempfile::tempdir().unwrap();
    let archive = write_image_archive(work.path(), CONFIG, &[("l.tar", b"layer")]);

    let client = client_for(&registry, PushOptions::default()).await;
    client.push_image(&archive, "ns/svc", "v1").await.unwrap();

    let token_requests = registry.requests_matching(Method::GET, "/token");
    assert_eq!(token_requests.len(), 1);
    let query = token_requests[0].query.clone().unwrap();
    assert!(query.contains("service=mock"));
    assert!(query.contains("scope=repository%3Ans%2Fsvc%3Apull%2Cpush"));
    assert!(registry.manifest("ns/svc", "v1").is_some());
}

#[tokio::test]
async fn second_unauthorized_response_is_terminal() {
    let registry = MockRegistry::start_with_token_auth("expected", None).await;
    registry.state.lock().unwrap().issued_token = Some("wrong".to_string());

    let transport = Transport::connect(&registry.host(), None, &TransportOptions::default())
        .await
        .unwrap();
    let err = transport
        .execute(Method::GET, "/v2/", None, HeaderMap::new())
        .await
        .unwrap_err();

    assert_matches!(err, Error::RegistryRequest { status, .. } if status == StatusCode::UNAUTHORIZED);
    assert_eq!(registry.requests_matching(Method::GET, "/token").len(), 1);
}

#[tokio::test]
async fn rejected_token_request_fails() {
    let registry = MockRegistry::start_with_token_auth("tok", Some("expected")).await;
    let transport = Transport::connect(
        &registry.host(),
        Some(&Credentials::new("someone", "else")),
        &TransportOptions::default(),
    )
    .await
    .unwrap();

    let err = transport
        .execute(Method::GET, "/v2/", None, HeaderMap::new())
        .await
        .unwrap_err();
    assert_matches!(err, Error::TokenRequest { .. });
}

#[tokio::test]
async fn failing_existence_check_still_uploads() {
    let registry = MockRegistry::start().await;
    registry.state.lock().unwrap().head_status = Some(StatusCode::METHOD_NOT_ALLOWED);
    let work = tempfile::tempdir().unwrap();
    let archive = write_image_archive(work.path(), CONFIG, &[("l.tar", b"layer")]);

    let client = client_for(&registry, PushOptions::default()).await;
    let outcome = client.push_image(&archive, "ns/svc", "v1").await.unwrap();

    assert_eq!(outcome.skipped_blobs(), 0);
    assert!(registry.has_blob(&OciDigest::sha256(b"layer")));
}

#[tokio::test]
async fn rejected_manifest_keeps_uploaded_blobs() {
    let registry = MockRegistry::start().await;
    registry.state.lock().unwrap().manifest_status = Some(StatusCode::BAD_REQUEST);
    let work = tempfile::tempdir().unwrap();
    let archive = write_image_archive(work.path(), CONFIG, &[("l.tar", b"layer")]);

    let client = client_for(&registry, PushOptions::default()).await;
    let err = client.push_image(&archive, "ns/svc", "v1").await.unwrap_err();

    assert_matches!(err, Error::ManifestPush { ref tag, .. } if tag == "v1");
    assert_eq!(err.status(), Some(StatusCode::BAD_REQUEST));
    assert!(registry.has_blob(&OciDigest::sha256(b"layer")));
}

#[tokio::test]
async fn upload_failure_is_a_blob_upload_error() {
    let registry = MockRegistry::start().await;
    registry.state.lock().unwrap().upload_status = Some(StatusCode::FORBIDDEN);
    let work = tempfile::tempdir().unwrap();
    let archive = write_image_archive(work.path(), CONFIG, &[("l.tar", b"layer")]);

    let client = client_for(&registry, PushOptions::default()).await;
    let err = client.push_image(&archive, "ns/svc", "v1").await.unwrap_err();

    assert_matches!(err, Error::BlobUpload { ref digest, .. } if *digest == OciDigest::sha256(CONFIG).to_string());
    assert_eq!(err.status(), Some(StatusCode::FORBIDDEN));
    assert!(registry.manifest("ns/svc", "v1").is_none());
}

#[tokio::test]
async fn broken_archive_never_reaches_the_registry() {
    let registry = MockRegistry::start().await;
    let work = tempfile::tempdir().unwrap();
    let path = work.path().join("image.tar");
    std::fs::write(&path, b"definitely not a tarball").unwrap();

    let client = client_for(&registry, PushOptions::default()).await;
    registry.clear_requests();
    let err = client.push_image(&path, "ns/svc", "v1").await.unwrap_err();

    assert_matches!(err, Error::ArchiveFormat(_));
    assert!(registry.requests().is_empty());
}

#[tokio::test]
async fn execute_sends_body_and_headers() {
    let registry = MockRegistry::start().await;
    let transport = Transport::connect(&registry.host(), None, &TransportOptions::default())
        .await
        .unwrap();

    let response = transport
        .execute(Method::POST, "/v2/ns/svc/blobs/uploads/", Some(Bytes::new()), HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert!(response.headers().contains_key("location"));
}

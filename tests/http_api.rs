//! End-to-end tests of the upload/download HTTP contract, driven through a
//! real server on an ephemeral port.

use axum::extract::DefaultBodyLimit;
use filedrop::{
    handlers::AppState,
    routes::routes::routes,
    services::burst::ArchiveUploader,
    services::retention_store::{RetentionPolicy, RetentionStore},
    services::upload_client::HttpUploader,
};
use std::{collections::HashSet, time::Duration};
use tokio::net::TcpListener;

const ADMIN_TOKEN: &str = "test-secret";

struct TestServer {
    base_url: String,
    _storage: tempfile::TempDir,
}

async fn spawn_server(retention: Duration, delete_on_download: bool) -> TestServer {
    let storage = tempfile::tempdir().unwrap();
    let allowed: HashSet<String> = ["txt", "pdf", "gz"].iter().map(|s| s.to_string()).collect();
    let store = RetentionStore::new(
        storage.path(),
        RetentionPolicy {
            retention,
            delete_on_download,
            max_size_bytes: 1024 * 1024,
            allowed_extensions: allowed,
        },
    );
    let state = AppState {
        store,
        admin_token: ADMIN_TOKEN.to_string(),
        public_base_url: None,
    };
    let app = routes()
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base_url: format!("http://{addr}"),
        _storage: storage,
    }
}

async fn upload(
    client: &reqwest::Client,
    base_url: &str,
    file_name: &str,
    content: &[u8],
) -> reqwest::Response {
    let part = reqwest::multipart::Part::bytes(content.to_vec()).file_name(file_name.to_string());
    let form = reqwest::multipart::Form::new().part("file", part);
    client
        .post(format!("{base_url}/upload"))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

async fn uploaded_url(
    client: &reqwest::Client,
    base_url: &str,
    file_name: &str,
    content: &[u8],
) -> String {
    let response = upload(client, base_url, file_name, content).await;
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    body["url"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn upload_then_download_roundtrip() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    let url = uploaded_url(&client, &server.base_url, "hello.txt", b"hello world").await;
    assert!(url.contains("/files/"));

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let disposition = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(disposition.contains("attachment"));
    assert!(disposition.contains("hello.txt"));
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello world");

    // Without delete-on-download, repeated downloads keep working.
    let again = client.get(&url).send().await.unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn delete_on_download_makes_link_single_use() {
    let server = spawn_server(Duration::from_secs(60), true).await;
    let client = reqwest::Client::new();

    let url = uploaded_url(&client, &server.base_url, "once.txt", b"payload").await;

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"payload");

    // Deletion fires after the stream completes; poll briefly.
    let mut last_status = reqwest::StatusCode::OK;
    for _ in 0..40 {
        last_status = client.get(&url).send().await.unwrap().status();
        if last_status == reqwest::StatusCode::NOT_FOUND {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(last_status, reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_file_returns_not_found() {
    let server = spawn_server(Duration::from_millis(80), false).await;
    let client = reqwest::Client::new();

    let url = uploaded_url(&client, &server.base_url, "fleeting.txt", b"x").await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    // Gone for good, not "temporarily unavailable".
    let again = client.get(&url).send().await.unwrap();
    assert_eq!(again.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn disallowed_extension_is_rejected_without_storing() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    let response = upload(&client, &server.base_url, "evil.exe", b"mz").await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("exe"));

    let listing: serde_json::Value = client
        .get(format!("{}/admin/files", server.base_url))
        .header("x-filedrop-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listing.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn upload_without_file_field_is_rejected() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    let form = reqwest::multipart::Form::new().text("note", "no file here");
    let response = client
        .post(format!("{}/upload", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_surface_requires_token_and_is_idempotent() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    let url = uploaded_url(&client, &server.base_url, "keep.txt", b"data").await;
    let id = url.rsplit('/').next().unwrap().to_string();

    // No token: denied.
    let response = client
        .get(format!("{}/admin/files", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    // With token: the file is listed with a usable link.
    let listing: serde_json::Value = client
        .get(format!("{}/admin/files", server.base_url))
        .header("x-filedrop-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let rows = listing.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"].as_str().unwrap(), id);
    assert_eq!(rows[0]["name"].as_str().unwrap(), "keep.txt");

    // Delete once: 204. Delete again: 404, never an error body surprise.
    let delete_url = format!("{}/admin/files/{}", server.base_url, id);
    let response = client
        .delete(&delete_url)
        .header("x-filedrop-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    let response = client
        .delete(&delete_url)
        .header("x-filedrop-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    // Download is gone too.
    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_all_reports_count() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    uploaded_url(&client, &server.base_url, "a.txt", b"1").await;
    uploaded_url(&client, &server.base_url, "b.txt", b"2").await;

    let body: serde_json::Value = client
        .delete(format!("{}/admin/files", server.base_url))
        .header("x-filedrop-admin-token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["deleted"].as_u64().unwrap(), 2);
}

#[tokio::test]
async fn http_uploader_round_trips_through_live_server() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    let scratch = tempfile::tempdir().unwrap();
    let archive = scratch.path().join("bundle.tar.gz");
    std::fs::write(&archive, b"pretend-archive-bytes").unwrap();

    let uploader = HttpUploader::new(format!("{}/upload", server.base_url));
    let url = uploader
        .upload(&archive, "bundle-1234.tar.gz")
        .await
        .unwrap();

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.bytes().await.unwrap().as_ref(),
        b"pretend-archive-bytes"
    );
}

#[tokio::test]
async fn http_uploader_streams_multi_chunk_archives() {
    let server = spawn_server(Duration::from_secs(60), false).await;
    let client = reqwest::Client::new();

    // Large enough to span many read chunks on the way up and down.
    let payload: Vec<u8> = (0..512 * 1024).map(|i| (i % 251) as u8).collect();
    let scratch = tempfile::tempdir().unwrap();
    let archive = scratch.path().join("big-bundle.tar.gz");
    std::fs::write(&archive, &payload).unwrap();

    let uploader = HttpUploader::new(format!("{}/upload", server.base_url));
    let url = uploader.upload(&archive, "big-bundle.tar.gz").await.unwrap();

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.bytes().await.unwrap();
    assert_eq!(body.len(), payload.len());
    assert_eq!(body.as_ref(), payload.as_slice());
}

#[tokio::test]
async fn http_uploader_surfaces_server_rejection() {
    let server = spawn_server(Duration::from_secs(60), false).await;

    let scratch = tempfile::tempdir().unwrap();
    let bad = scratch.path().join("program.exe");
    std::fs::write(&bad, b"mz").unwrap();

    let uploader = HttpUploader::new(format!("{}/upload", server.base_url));
    let err = uploader.upload(&bad, "program.exe").await.unwrap_err();
    assert!(err.to_string().contains("exe"));
}

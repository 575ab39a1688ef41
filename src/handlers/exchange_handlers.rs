//! HTTP handlers for the upload/download contract and the operator surface.
//! Streams bodies in both directions and delegates retention concerns to
//! `RetentionStore`.

use crate::{
    errors::AppError,
    handlers::AppState,
    models::stored_object::StoredObject,
    services::retention_store::RetentionStore,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio_util::io::ReaderStream;

/// Extra request bytes tolerated on top of the configured file limit,
/// covering multipart framing when checking Content-Length up front.
const MULTIPART_OVERHEAD_SLACK: u64 = 16 * 1024;

const ADMIN_TOKEN_HEADER: &str = "x-filedrop-admin-token";

/// `GET /` — plain banner.
pub async fn home() -> &'static str {
    "file exchange is running\n"
}

/// `POST /upload` — multipart upload, field name `file`.
///
/// Responds `{"url": ...}` with the single-use download link.
pub async fn upload_file(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    // Reject oversize requests before reading the body when the transport
    // exposes a length up front.
    if let Some(length) = content_length(&headers) {
        if length > state.store.max_size_bytes() + MULTIPART_OVERHEAD_SLACK {
            return Err(AppError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("request of {length} bytes exceeds the upload limit"),
            ));
        }
    }

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let declared_name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "file field has no name"))?;

        let stream = field.map(|chunk| {
            chunk.map_err(|err| io::Error::new(io::ErrorKind::Other, err))
        });
        let object = state.store.store(&declared_name, None, stream).await?;

        let url = download_url(&state, &headers, &object.id);
        return Ok(Json(json!({ "url": url })));
    }

    Err(AppError::new(StatusCode::BAD_REQUEST, "missing file field"))
}

/// `GET /files/{id}` — streams the object as an attachment.
///
/// 404 for unknown or expired ids. With delete-on-download configured the
/// object is removed once the stream reaches a clean EOF; an aborted
/// transfer keeps it so the client can retry.
pub async fn download_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (meta, file) = state.store.open_download(&id).await?;

    let stream = ReapOnEof {
        inner: ReaderStream::new(file),
        store: state.store.clone(),
        id: meta.id.clone(),
        finished: false,
    };
    let body = Body::from_stream(stream);

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// `GET /admin/files` — sweep, then list all surviving objects.
pub async fn list_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<ListedFile>>, AppError> {
    require_admin(&state, &headers)?;
    let objects = state.store.list_live().await?;
    let listing = objects
        .into_iter()
        .map(|object| ListedFile {
            url: download_url(&state, &headers, &object.id),
            id: object.id,
            name: object.original_name,
            size_bytes: object.size_bytes,
            created_at: object.created_at,
        })
        .collect();
    Ok(Json(listing))
}

/// `DELETE /admin/files/{id}` — idempotent single delete.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_admin(&state, &headers)?;
    if state.store.delete_one(&id).await? {
        Ok(StatusCode::NO_CONTENT.into_response())
    } else {
        Err(AppError::not_found(format!("file `{id}` not found")))
    }
}

/// `DELETE /admin/files` — remove everything, report the count.
pub async fn delete_all_files(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    require_admin(&state, &headers)?;
    let deleted = state.store.delete_all().await?;
    Ok(Json(json!({ "deleted": deleted })))
}

/// One row of the operator listing.
#[derive(Debug, Serialize)]
pub struct ListedFile {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

/// Shared-token gate for the operator surface. Not a real security
/// boundary; see DESIGN.md.
fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented != state.admin_token {
        return Err(AppError::new(StatusCode::FORBIDDEN, "access denied"));
    }
    Ok(())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn download_url(state: &AppState, headers: &HeaderMap, id: &str) -> String {
    let base = match &state.public_base_url {
        Some(base) => base.trim_end_matches('/').to_string(),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|value| value.to_str().ok())
                .unwrap_or("localhost");
            format!("http://{host}")
        }
    };
    format!("{base}/files/{id}")
}

fn set_download_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    let disposition = format!("attachment; filename=\"{}\"", meta.original_name);
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}

/// Stream adapter that fires the delete-on-download hook only after the
/// payload reached a clean EOF. Dropped mid-transfer, nothing happens and
/// the object stays retrievable.
struct ReapOnEof<S> {
    inner: S,
    store: RetentionStore,
    id: String,
    finished: bool,
}

impl<S> Stream for ReapOnEof<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Ready(None) => {
                if !this.finished {
                    this.finished = true;
                    let store = this.store.clone();
                    let id = this.id.clone();
                    tokio::spawn(async move { store.finish_download(&id).await });
                }
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

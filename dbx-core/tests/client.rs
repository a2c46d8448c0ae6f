use serde_json::json;
use wiremock::matchers::{body_bytes, body_json, header, header_regex, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use dbx_core::{ApiErrorClass, DbxError, DeleteBatchLaunch, DropboxClient, Metadata};

fn file_json(path: &str, size: u64, modified: &str) -> serde_json::Value {
    let name = path.rsplit('/').next().unwrap_or(path);
    json!({
        ".tag": "file",
        "name": name,
        "path_lower": path.to_lowercase(),
        "path_display": path,
        "id": format!("id:{name}"),
        "client_modified": modified,
        "server_modified": modified,
        "rev": "015f",
        "size": size
    })
}

#[tokio::test]
async fn list_folder_sends_bearer_token_and_path() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({ "path": "/Docs", "recursive": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                file_json("/Docs/A.txt", 3, "2024-01-01T00:00:00Z"),
                { ".tag": "folder", "name": "Sub", "path_lower": "/docs/sub", "path_display": "/Docs/Sub", "id": "id:sub" }
            ],
            "cursor": "cursor-1",
            "has_more": true
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_folder("/Docs", false).await.unwrap();

    assert_eq!(page.entries.len(), 2);
    assert!(page.entries[0].is_file());
    assert_eq!(page.entries[1].path(), "/Docs/Sub");
    assert_eq!(page.cursor, "cursor-1");
    assert!(page.has_more);
}

#[tokio::test]
async fn list_folder_continue_posts_cursor() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/list_folder/continue"))
        .and(body_json(json!({ "cursor": "cursor-1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [file_json("/Docs/B.txt", 1, "2024-01-02T00:00:00Z")],
            "cursor": "cursor-2",
            "has_more": false
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let page = client.list_folder_continue("cursor-1").await.unwrap();

    assert_eq!(page.entries[0].path(), "/Docs/B.txt");
    assert!(!page.has_more);
}

#[tokio::test]
async fn get_metadata_parses_file_fields() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/get_metadata"))
        .and(body_json(json!({ "path": "/x.txt" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("/x.txt", 12, "2024-02-01T10:00:00Z")),
        )
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let meta = client.get_metadata("/x.txt").await.unwrap();

    match meta {
        Metadata::File {
            size,
            server_modified,
            ..
        } => {
            assert_eq!(size, 12);
            assert_eq!(server_modified, "2024-02-01T10:00:00Z");
        }
        other => panic!("expected file metadata, got {other:?}"),
    }
}

#[tokio::test]
async fn upload_sends_overwrite_arg_and_body() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/upload"))
        .and(header_regex("dropbox-api-arg", r#""mode":"overwrite""#))
        .and(header_regex("dropbox-api-arg", r#""path":"/Docs/A.txt""#))
        .and(header("content-type", "application/octet-stream"))
        .and(body_bytes(b"payload"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("/Docs/A.txt", 7, "2024-01-01T00:00:00Z")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let meta = client.upload(b"payload".to_vec(), "/Docs/A.txt").await.unwrap();

    assert_eq!(meta.name(), "A.txt");
}

#[tokio::test]
async fn upload_session_round_trip_uses_cursor_offsets() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/upload_session/start"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "session_id": "s1" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload_session/append_v2"))
        .and(header_regex("dropbox-api-arg", r#""session_id":"s1""#))
        .and(header_regex("dropbox-api-arg", r#""offset":4"#))
        .and(body_bytes(b"efgh"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/2/files/upload_session/finish"))
        .and(header_regex("dropbox-api-arg", r#""offset":8"#))
        .and(header_regex("dropbox-api-arg", r#""path":"/big.bin""#))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(file_json("/big.bin", 8, "2024-01-01T00:00:00Z")),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let started = client.upload_session_start().await.unwrap();
    assert_eq!(started.session_id, "s1");
    client
        .upload_session_append(&started.session_id, 4, b"efgh".to_vec())
        .await
        .unwrap();
    let meta = client
        .upload_session_finish(&started.session_id, 8, "/big.bin")
        .await
        .unwrap();
    assert_eq!(meta.path(), "/big.bin");
}

#[tokio::test]
async fn download_reads_result_header() {
    let server = MockServer::start().await;
    let meta = file_json("/x.txt", 5, "2024-02-01T10:00:00Z");

    Mock::given(method("POST"))
        .and(path("/2/files/download"))
        .and(header_regex("dropbox-api-arg", r#""path":"/x.txt""#))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Dropbox-API-Result", meta.to_string().as_str())
                .set_body_bytes(b"hello"),
        )
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let (metadata, response) = client.download("/x.txt").await.unwrap();

    assert_eq!(metadata.path(), "/x.txt");
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"hello");
}

#[tokio::test]
async fn delete_batch_returns_async_job_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/delete_batch"))
        .and(body_json(json!({ "entries": [{ "path": "/a" }, { "path": "/b" }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            ".tag": "async_job_id",
            "async_job_id": "job-42"
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let launch = client
        .delete_batch(&["/a".to_string(), "/b".to_string()])
        .await
        .unwrap();

    assert_eq!(
        launch,
        DeleteBatchLaunch::AsyncJobId {
            async_job_id: "job-42".into()
        }
    );
}

#[tokio::test]
async fn move_entry_unwraps_metadata() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/move_v2"))
        .and(body_json(json!({ "from_path": "/a.txt", "to_path": "/b.txt", "autorename": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": file_json("/b.txt", 1, "2024-01-01T00:00:00Z")
        })))
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let meta = client.move_entry("/a.txt", "/b.txt").await.unwrap();
    assert_eq!(meta.path(), "/b.txt");
}

#[tokio::test]
async fn api_error_keeps_status_and_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/get_metadata"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("Retry-After", "7")
                .set_body_string("too_many_requests"),
        )
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_metadata("/x.txt").await.unwrap_err();

    assert!(matches!(err, DbxError::Api { .. }));
    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert_eq!(err.retry_after_secs(), Some(7));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn conflict_error_is_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/2/files/delete_v2"))
        .respond_with(
            ResponseTemplate::new(409).set_body_string(r#"{"error_summary":"path_lookup/not_found/"}"#),
        )
        .mount(&server)
        .await;

    let client = DropboxClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.delete("/missing").await.unwrap_err();

    assert_eq!(err.classification(), Some(ApiErrorClass::Permanent));
    assert!(!err.is_retryable());
}

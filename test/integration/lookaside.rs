// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use crate::{LogCapture, HELLO_MD5};

use anyhow::Result;
use pretty_assertions::assert_eq;
use rpkg::{
    lookaside::{progress::Progress, LookasideCache, LookasideError, TemplateFields},
    sources::SourceEntry,
};
use reqwest::StatusCode;
use simple_test_case::test_case;
use std::{
    sync::{Arc, Mutex},
    time::{Duration, UNIX_EPOCH},
};
use wiremock::{
    matchers::{body_string_contains, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn cache(server: &MockServer) -> LookasideCache {
    LookasideCache::new(
        "md5",
        format!("{}/repo/pkgs", server.uri()),
        format!("{}/repo/pkgs/upload.cgi", server.uri()),
    )
}

fn hello_entry() -> SourceEntry {
    SourceEntry::new("md5", "a.tar.gz", HELLO_MD5)
}

fn hello_path() -> String {
    format!("/repo/pkgs/pkg/a.tar.gz/{HELLO_MD5}/a.tar.gz")
}

type Calls = Arc<Mutex<Vec<(u64, u64, u64, u64)>>>;

fn recorder() -> (Calls, Progress) {
    let calls = Calls::default();
    let sink = calls.clone();
    let progress: Progress = Arc::new(move |dl_total, dl_now, ul_total, ul_now| {
        sink.lock().unwrap().push((dl_total, dl_now, ul_total, ul_now));
    });
    (calls, progress)
}

async fn mount_check(server: &MockServer, answer: &str, calls: u64) {
    Mock::given(method("POST"))
        .and(path("/repo/pkgs/upload.cgi"))
        .and(body_string_contains("name=\"filename\""))
        .respond_with(ResponseTemplate::new(200).set_body_string(answer))
        .expect(calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn download_writes_verified_file_with_server_mtime() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(hello_path()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("hello")
                .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    let (calls, progress) = recorder();
    cache(&server)
        .download("pkg", &hello_entry(), &outfile, &TemplateFields::new(), Some(progress))
        .await?;

    assert_eq!(std::fs::read_to_string(&outfile)?, "hello");
    assert_eq!(
        std::fs::metadata(&outfile)?.modified()?,
        UNIX_EPOCH + Duration::from_secs(1_445_412_480)
    );
    let (_, downloaded, ul_total, ul_now) = calls.lock().unwrap().last().copied().unwrap_or_default();
    assert_eq!((downloaded, ul_total, ul_now), (5, 0, 0));
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn download_skips_network_when_local_copy_is_valid() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    std::fs::write(&outfile, "hello")?;
    cache(&server)
        .download("pkg", &hello_entry(), &outfile, &TemplateFields::new(), None)
        .await?;

    assert_eq!(std::fs::read_to_string(&outfile)?, "hello");
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn download_removes_file_that_fails_checksum() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(hello_path()))
        .respond_with(ResponseTemplate::new(200).set_body_string("corrupted"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    let result = cache(&server)
        .download("pkg", &hello_entry(), &outfile, &TemplateFields::new(), None)
        .await;

    assert!(matches!(
        result,
        Err(LookasideError::Download { ref message, .. }) if message == "failed checksum"
    ));
    assert!(!outfile.exists());

    Ok(())
}

#[tokio::test]
async fn download_reports_status_and_removes_stale_file() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(hello_path()))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    std::fs::write(&outfile, "stale")?;
    let result = cache(&server)
        .download("pkg", &hello_entry(), &outfile, &TemplateFields::new(), None)
        .await;

    assert!(matches!(
        result,
        Err(LookasideError::Download { status: Some(code), .. }) if code == StatusCode::NOT_FOUND
    ));
    assert!(!outfile.exists());

    Ok(())
}

#[tokio::test]
async fn download_rejects_unknown_hashtype_before_transfer() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    let entry = SourceEntry::new("WHIRLPOOL", "a.tar.gz", "ahash");
    let result = cache(&server)
        .download("pkg", &entry, &outfile, &TemplateFields::new(), None)
        .await;

    assert!(matches!(result, Err(LookasideError::Hash(_))));
    assert!(!outfile.exists());
    server.verify().await;

    Ok(())
}

#[test_case("../a.tar.gz"; "parent directory")]
#[test_case("/tmp/a.tar.gz"; "absolute path")]
#[test_case("sub/a.tar.gz"; "nested path")]
#[tokio::test]
async fn download_rejects_file_name_with_path_components(file: &str) -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("out").join("a.tar.gz");
    let entry = SourceEntry::new("md5", file, HELLO_MD5);
    let result = cache(&server)
        .download("pkg", &entry, &outfile, &TemplateFields::new(), None)
        .await;

    assert!(matches!(
        result,
        Err(LookasideError::Download { file: ref name, status: None, .. }) if name == file
    ));
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn download_removes_stale_file_when_server_is_unreachable() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    std::fs::write(&outfile, "stale")?;

    let cache = LookasideCache::new("md5", "http://127.0.0.1:1", "http://127.0.0.1:1/upload.cgi");
    let result = cache
        .download("pkg", &hello_entry(), &outfile, &TemplateFields::new(), None)
        .await;

    assert!(matches!(result, Err(LookasideError::Download { status: None, .. })));
    assert!(!outfile.exists());

    Ok(())
}

#[tokio::test]
async fn download_gives_up_on_stalled_server() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(hello_path()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("hello")
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let outfile = dir.path().join("a.tar.gz");
    std::fs::write(&outfile, "stale")?;
    let result = cache(&server)
        .with_low_speed_limit(1000, Duration::from_millis(50))
        .download("pkg", &hello_entry(), &outfile, &TemplateFields::new(), None)
        .await;

    assert!(matches!(
        result,
        Err(LookasideError::Download { ref message, .. }) if message.starts_with("transfer slower than")
    ));
    assert!(!outfile.exists());

    Ok(())
}

#[test_case("Available", Some(true); "available")]
#[test_case("Missing", Some(false); "missing")]
#[test_case("Huh?", None; "unexpected answer")]
#[tokio::test]
async fn remote_file_exists_reads_cgi_answer(answer: &str, expect: Option<bool>) -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/repo/pkgs/upload.cgi"))
        .and(body_string_contains("name=\"md5sum\""))
        .and(body_string_contains(HELLO_MD5))
        .and(body_string_contains("a.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_string(format!("{answer}\n")))
        .expect(1)
        .mount(&server)
        .await;

    let result = cache(&server)
        .remote_file_exists("pkg", "a.tar.gz", HELLO_MD5)
        .await;
    match expect {
        Some(expect) => pretty_assertions::assert_eq!(result?, expect),
        None => assert!(matches!(
            result,
            Err(LookasideError::Upload { ref message, .. }) if message.starts_with("error checking for a.tar.gz")
        )),
    }
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn remote_file_exists_maps_server_error() -> Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let result = cache(&server)
        .remote_file_exists("pkg", "a.tar.gz", HELLO_MD5)
        .await;
    let error = result.err().map(|err| err.to_string());
    assert_eq!(error.as_deref(), Some("Error occurs inside the server."));

    Ok(())
}

#[tokio::test]
async fn upload_skips_file_already_in_cache() -> Result<()> {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let server = MockServer::start().await;
    mount_check(&server, "Available", 1).await;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("a.tar.gz");
    std::fs::write(&file, "hello")?;
    cache(&server).upload("pkg", &file, HELLO_MD5, None).await?;

    let requests = server.received_requests().await.unwrap_or_default();
    assert_eq!(requests.len(), 1);
    assert!(capture.contents().contains("file already uploaded"));
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn upload_sends_missing_file() -> Result<()> {
    let server = MockServer::start().await;
    mount_check(&server, "Missing", 1).await;
    Mock::given(method("POST"))
        .and(path("/repo/pkgs/upload.cgi"))
        .and(body_string_contains("filename=\"a.tar.gz\""))
        .and(body_string_contains("name=\"md5sum\""))
        .and(body_string_contains("hello"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Stored a.tar.gz"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("a.tar.gz");
    std::fs::write(&file, "hello")?;
    let (calls, progress) = recorder();
    cache(&server)
        .upload("pkg", &file, HELLO_MD5, Some(progress))
        .await?;

    assert_eq!(calls.lock().unwrap().last().copied(), Some((0, 0, 5, 5)));
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn upload_reports_unauthorized() -> Result<()> {
    let server = MockServer::start().await;
    mount_check(&server, "Missing", 1).await;
    Mock::given(method("POST"))
        .and(path("/repo/pkgs/upload.cgi"))
        .and(body_string_contains("filename=\"a.tar.gz\""))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let file = dir.path().join("a.tar.gz");
    std::fs::write(&file, "hello")?;
    let result = cache(&server).upload("pkg", &file, HELLO_MD5, None).await;

    assert!(matches!(
        result,
        Err(LookasideError::Upload { status: Some(code), ref message })
            if code == StatusCode::UNAUTHORIZED && message == "Request is unauthorized."
    ));
    server.verify().await;

    Ok(())
}

#[tokio::test]
async fn missing_certificate_only_warns() -> Result<()> {
    let capture = LogCapture::default();
    let _guard = tracing::subscriber::set_default(capture.subscriber());

    let server = MockServer::start().await;
    mount_check(&server, "Available", 1).await;

    let dir = tempfile::tempdir()?;
    let exists = cache(&server)
        .with_client_cert(dir.path().join("missing.pem"))
        .remote_file_exists("pkg", "a.tar.gz", HELLO_MD5)
        .await?;

    assert!(exists);
    assert!(capture.contents().contains("missing certificate"));

    Ok(())
}

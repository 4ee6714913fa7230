//! S3 backend (OpenDAL) against a path-style object store stub.

mod common;

use anyhow::Result;
use common::{Request, Response, StubServer};
use savesync::sync::s3::PART_SIZE;
use savesync::sync::{S3Params, S3Provider, StorageProvider};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use tempfile::TempDir;
use std::sync::{Arc, Mutex};

const NO_SUCH_KEY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchKey</Code><Message>The specified key does not exist.</Message></Error>"#;

/// Objects plus in-flight multipart uploads, keyed by request path.
#[derive(Default)]
struct Store {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, BTreeMap<usize, Vec<u8>>>,
}

fn query<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    let (_, query) = req.path.split_once('?')?;
    query.split('&').find_map(|pair| match pair.split_once('=') {
        Some((k, v)) if k == name => Some(v),
        None if pair == name => Some(""),
        _ => None,
    })
}

/// `Range: bytes=a-b` as an inclusive byte range.
fn range(req: &Request) -> Option<(usize, usize)> {
    let bytes = req.header("Range")?.strip_prefix("bytes=")?;
    let (start, end) = bytes.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

fn object_store(store: Arc<Mutex<Store>>) -> impl Fn(&Request) -> Response + Send + Sync {
    move |req| {
        let mut store = store.lock().expect("store");
        let key = req.path_only().to_string();
        match req.method.as_str() {
            "POST" if query(req, "uploads").is_some() => {
                let upload_id = format!("upload-{}", store.uploads.len() + 1);
                store.uploads.insert(upload_id.clone(), BTreeMap::new());
                Response::xml(
                    200,
                    format!(
                        "<InitiateMultipartUploadResult><Bucket>saves</Bucket><Key>{}</Key>\
                         <UploadId>{}</UploadId></InitiateMultipartUploadResult>",
                        key, upload_id
                    ),
                )
            }
            "POST" => {
                let Some(parts) = query(req, "uploadId").and_then(|id| store.uploads.remove(id))
                else {
                    return Response::status(404);
                };
                let body: Vec<u8> = parts.into_values().flatten().collect();
                store.objects.insert(key.clone(), body);
                Response::xml(
                    200,
                    format!(
                        "<CompleteMultipartUploadResult><Bucket>saves</Bucket><Key>{}</Key>\
                         <ETag>\"done\"</ETag></CompleteMultipartUploadResult>",
                        key
                    ),
                )
            }
            "PUT" => {
                if let (Some(id), Some(number)) = (query(req, "uploadId"), query(req, "partNumber")) {
                    let number: usize = number.parse().unwrap_or(0);
                    return match store.uploads.get_mut(id) {
                        Some(parts) => {
                            parts.insert(number, req.body.clone());
                            Response::status(200).with_header("ETag", &format!("\"part-{}\"", number))
                        }
                        None => Response::status(404),
                    };
                }
                store.objects.insert(key, req.body.clone());
                Response::status(200).with_header("ETag", "\"stub\"")
            }
            "GET" if query(req, "list-type").is_some() => {
                let mut keys: Vec<(&String, usize)> = store
                    .objects
                    .iter()
                    .map(|(k, v)| (k, v.len()))
                    .collect();
                keys.sort();
                let contents: String = keys
                    .into_iter()
                    .filter_map(|(k, size)| {
                        let key = k.strip_prefix("/saves/")?;
                        Some(format!(
                            "<Contents><Key>{}</Key><Size>{}</Size>\
                             <LastModified>2024-05-01T10:00:00.000Z</LastModified>\
                             <ETag>\"stub\"</ETag></Contents>",
                            key, size
                        ))
                    })
                    .collect();
                Response::xml(
                    200,
                    format!(
                        "<ListBucketResult><Name>saves</Name><IsTruncated>false</IsTruncated>{}</ListBucketResult>",
                        contents
                    ),
                )
            }
            "GET" => match store.objects.get(&key) {
                Some(body) => match range(req) {
                    Some((start, end)) => {
                        let end = end.min(body.len().saturating_sub(1));
                        Response::status(206)
                            .with_header(
                                "Content-Range",
                                &format!("bytes {}-{}/{}", start, end, body.len()),
                            )
                            .with_body(body[start..=end].to_vec())
                    }
                    None => Response::status(200)
                        .with_header("Content-Type", "application/octet-stream")
                        .with_body(body.clone()),
                },
                None => Response::xml(404, NO_SUCH_KEY),
            },
            "HEAD" => match store.objects.get(&key) {
                Some(body) => Response::status(200)
                    .with_header("Content-Length", &body.len().to_string()),
                None => Response::status(404).with_header("Content-Length", "0"),
            },
            "DELETE" => {
                store.objects.remove(&key);
                Response::status(204)
            }
            _ => Response::status(405),
        }
    }
}

fn provider(server: &StubServer, prefix: &str) -> Result<S3Provider> {
    S3Provider::new(&S3Params {
        bucket: "saves".to_string(),
        region: "us-east-1".to_string(),
        endpoint: Some(server.url()),
        access_key_id: "AKIDEXAMPLE".to_string(),
        secret_access_key: "secret".to_string(),
        prefix: prefix.to_string(),
    })
}

#[test]
fn test_read_missing_key_returns_none() -> Result<()> {
    let store = Arc::new(Mutex::new(Store::default()));
    let server = StubServer::start(object_store(Arc::clone(&store)));
    let s3 = provider(&server, "")?;

    assert_eq!(s3.read_text("index.tsv")?, None);
    assert_eq!(server.count("GET", "/saves/index.tsv"), 1);
    Ok(())
}

#[test]
fn test_write_then_read_under_prefix() -> Result<()> {
    let store = Arc::new(Mutex::new(Store::default()));
    let server = StubServer::start(object_store(Arc::clone(&store)));
    let s3 = provider(&server, "/alice/")?;

    s3.write_text("index.meta.json", r#"{"mode":"full"}"#)?;
    assert!(store
        .lock()
        .expect("store")
        .objects
        .contains_key("/saves/alice/index.meta.json"));

    assert_eq!(
        s3.read_text("index.meta.json")?.as_deref(),
        Some(r#"{"mode":"full"}"#)
    );
    s3.delete_file("index.meta.json")?;
    assert_eq!(s3.read_text("index.meta.json")?, None);
    Ok(())
}

#[test]
fn test_large_file_goes_up_in_parts_and_down_in_ranges() -> Result<()> {
    let store = Arc::new(Mutex::new(Store::default()));
    let server = StubServer::start(object_store(Arc::clone(&store)));
    let s3 = provider(&server, "alice")?;

    let temp = TempDir::new()?;
    let source = temp.path().join("library.db");
    let content: Vec<u8> = (0..PART_SIZE + 5).map(|i| (i % 251) as u8).collect();
    fs::write(&source, &content)?;

    let mut progress = Vec::new();
    s3.upload_file(
        "data/library.db",
        &source,
        content.len() as u64,
        &mut |p| progress.push(p),
    )?;
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(server.count("POST", "/saves/alice/data/library.db?uploads"), 1);
    assert_eq!(
        store.lock().expect("store").objects.get("/saves/alice/data/library.db").map(Vec::len),
        Some(content.len())
    );

    let restored = temp.path().join("restored/library.db");
    s3.download_file("data/library.db", &restored)?;
    assert_eq!(fs::read(&restored)?, content);
    let ranged = server
        .requests()
        .iter()
        .filter(|r| r.method == "GET" && r.header("Range").is_some())
        .count();
    assert_eq!(ranged, 2);
    Ok(())
}

#[test]
fn test_small_file_upload_reports_progress() -> Result<()> {
    let store = Arc::new(Mutex::new(Store::default()));
    let server = StubServer::start(object_store(Arc::clone(&store)));
    let s3 = provider(&server, "")?;

    let temp = TempDir::new()?;
    let source = temp.path().join("Bounce_0");
    fs::write(&source, b"rms")?;

    let mut progress = Vec::new();
    s3.upload_file("external/kemu/rms/Bounce_0", &source, 3, &mut |p| progress.push(p))?;
    assert_eq!(progress.first(), Some(&0));
    assert_eq!(progress.last(), Some(&100));
    assert_eq!(server.count("POST", "/saves/"), 0);
    assert_eq!(s3.read_text("external/kemu/rms/Bounce_0")?.as_deref(), Some("rms"));
    Ok(())
}

#[test]
fn test_list_strips_prefix_and_skips_directories() -> Result<()> {
    let store = Arc::new(Mutex::new(Store::default()));
    {
        let mut store = store.lock().expect("store");
        for (key, body) in [
            ("/saves/alice/external/kemu/rms/A", b"12345".to_vec()),
            ("/saves/alice/external/kemu/rms/", Vec::new()),
            ("/saves/alice/external/kemu/config/system.cfg", b"ab".to_vec()),
        ] {
            store.objects.insert(key.to_string(), body);
        }
    }
    let server = StubServer::start(object_store(Arc::clone(&store)));
    let s3 = provider(&server, "/alice/")?;

    let entries = s3.list("external")?;
    let mut names: Vec<(&str, u64)> = entries
        .iter()
        .map(|e| (e.filename.as_str(), e.size))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![
            ("external/kemu/config/system.cfg", 2),
            ("external/kemu/rms/A", 5),
        ]
    );
    assert!(entries.iter().all(|e| !e.is_directory));
    Ok(())
}

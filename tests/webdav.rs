//! WebDAV backend against an in-memory DAV stub.

mod common;

use anyhow::Result;
use common::{Request, Response, StubServer};
use savesync::sync::{StorageProvider, WebDavParams, WebDavProvider};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Collections and files of the fake server, keyed by request path.
#[derive(Default)]
struct DavState {
    collections: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
}

fn parent_of(path: &str) -> String {
    path.rsplit_once('/')
        .map(|(parent, _)| parent.to_string())
        .unwrap_or_default()
}

fn dav_handler(state: Arc<Mutex<DavState>>) -> impl Fn(&Request) -> Response + Send + Sync {
    move |req| {
        let mut state = state.lock().expect("dav state");
        let path = req.path.trim_end_matches('/').to_string();
        match req.method.as_str() {
            "MKCOL" => {
                if state.collections.contains(&path) {
                    Response::status(405)
                } else if !state.collections.contains(&parent_of(&path)) {
                    Response::status(409)
                } else {
                    state.collections.insert(path);
                    Response::status(201)
                }
            }
            "PUT" => {
                if !state.collections.contains(&parent_of(&path)) {
                    return Response::status(409);
                }
                let existed = state.files.insert(path, req.body.clone()).is_some();
                Response::status(if existed { 204 } else { 201 })
            }
            "GET" => match state.files.get(&path) {
                Some(body) => Response::status(200).with_body(body.clone()),
                None => Response::status(404),
            },
            "DELETE" => match state.files.remove(&path) {
                Some(_) => Response::status(204),
                None => Response::status(404),
            },
            _ => Response::status(405),
        }
    }
}

fn provider(server: &StubServer) -> WebDavProvider {
    WebDavProvider::new(&WebDavParams {
        url: format!("{}/dav", server.url()),
        username: "alice".to_string(),
        password: "secret".to_string(),
        root: "SaveSync".to_string(),
    })
    .expect("webdav provider")
    .with_retry_step(Duration::from_millis(5))
}

fn dav_server() -> (StubServer, Arc<Mutex<DavState>>) {
    let state = Arc::new(Mutex::new(DavState::default()));
    state
        .lock()
        .expect("dav state")
        .collections
        .insert("/dav".to_string());
    (StubServer::start(dav_handler(Arc::clone(&state))), state)
}

#[test]
fn test_write_text_creates_missing_collections() -> Result<()> {
    let (server, state) = dav_server();
    let dav = provider(&server);

    dav.write_text("external/kemu/rms/Bounce_0", "save-1")?;

    {
        let state = state.lock().expect("dav state");
        for dir in [
            "/dav/SaveSync",
            "/dav/SaveSync/external",
            "/dav/SaveSync/external/kemu",
            "/dav/SaveSync/external/kemu/rms",
        ] {
            assert!(state.collections.contains(dir), "missing collection {}", dir);
        }
    }
    assert_eq!(
        dav.read_text("external/kemu/rms/Bounce_0")?.as_deref(),
        Some("save-1")
    );
    Ok(())
}

#[test]
fn test_write_text_is_idempotent() -> Result<()> {
    let (server, _state) = dav_server();
    let dav = provider(&server);

    dav.write_text("index.tsv", "path\tmd5\tsize\tmtime\n")?;
    dav.write_text("index.tsv", "path\tmd5\tsize\tmtime\n")?;

    assert_eq!(server.count("PUT", "/dav/SaveSync/index.tsv"), 2);
    assert_eq!(
        dav.read_text("index.tsv")?.as_deref(),
        Some("path\tmd5\tsize\tmtime\n")
    );
    Ok(())
}

#[test]
fn test_read_missing_returns_none() -> Result<()> {
    let (server, _state) = dav_server();
    let dav = provider(&server);

    assert_eq!(dav.read_text("index.meta.json")?, None);
    dav.delete_file("never/uploaded")?;
    Ok(())
}

#[test]
fn test_transient_status_is_retried() -> Result<()> {
    let (inner, _state) = {
        let state = Arc::new(Mutex::new(DavState::default()));
        state
            .lock()
            .expect("dav state")
            .collections
            .insert("/dav".to_string());
        (dav_handler(Arc::clone(&state)), state)
    };
    let puts = AtomicUsize::new(0);
    let server = StubServer::start(move |req| {
        if req.method == "PUT" && puts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Response::status(503);
        }
        inner(req)
    });
    let dav = provider(&server);

    dav.write_text("data/config.yml", "theme: dark\n")?;
    assert_eq!(server.count("PUT", "/dav/SaveSync/data/config.yml"), 2);
    assert_eq!(dav.read_text("data/config.yml")?.as_deref(), Some("theme: dark\n"));
    Ok(())
}

#[test]
fn test_list_parses_propfind() -> Result<()> {
    let server = StubServer::start(|req| {
        if req.method != "PROPFIND" {
            return Response::status(405);
        }
        assert_eq!(req.header("Depth"), Some("infinity"));
        Response::xml(
            207,
            r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/SaveSync/external/</d:href>
    <d:propstat><d:prop><d:resourcetype><d:collection/></d:resourcetype></d:prop></d:propstat>
  </d:response>
  <d:response>
    <d:href>/dav/SaveSync/external/kemu/rms/Bounce%200</d:href>
    <d:propstat><d:prop>
      <d:resourcetype/>
      <d:getcontentlength>3</d:getcontentlength>
    </d:prop></d:propstat>
  </d:response>
</d:multistatus>"#,
        )
    });
    let dav = provider(&server);

    let entries = dav.list("external")?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "external/kemu/rms/Bounce 0");
    assert_eq!(entries[0].basename, "Bounce 0");
    assert_eq!(entries[0].size, 3);
    Ok(())
}

/// DAV state with the server root collection already present.
fn base_state() -> Arc<Mutex<DavState>> {
    let state = Arc::new(Mutex::new(DavState::default()));
    state
        .lock()
        .expect("dav state")
        .collections
        .insert("/dav".to_string());
    state
}

#[test]
fn test_locked_mkcol_is_retried() -> Result<()> {
    let inner = dav_handler(base_state());
    let mkcols = AtomicUsize::new(0);
    let server = StubServer::start(move |req| {
        if req.method == "MKCOL" && mkcols.fetch_add(1, Ordering::SeqCst) == 0 {
            return Response::status(423);
        }
        inner(req)
    });
    let dav = provider(&server);

    dav.write_text("index.tsv", "path\tmd5\tsize\tmtime\n")?;
    assert_eq!(server.count("MKCOL", "/dav/SaveSync"), 2);
    assert_eq!(server.count("PUT", "/dav/SaveSync/index.tsv"), 1);
    Ok(())
}

#[test]
fn test_put_conflict_recreates_parent_collection() -> Result<()> {
    let state = base_state();
    let inner = dav_handler(Arc::clone(&state));
    let puts = AtomicUsize::new(0);
    let server = {
        let state = Arc::clone(&state);
        StubServer::start(move |req| {
            // Another client removes the folder right before the first PUT lands
            if req.method == "PUT" && puts.fetch_add(1, Ordering::SeqCst) == 0 {
                state
                    .lock()
                    .expect("dav state")
                    .collections
                    .remove("/dav/SaveSync/data");
            }
            inner(req)
        })
    };
    let dav = provider(&server);

    dav.write_text("data/config.yml", "theme: dark\n")?;
    assert_eq!(server.count("PUT", "/dav/SaveSync/data/config.yml"), 2);
    assert_eq!(server.count("MKCOL", "/dav/SaveSync/data"), 2);
    assert!(state
        .lock()
        .expect("dav state")
        .collections
        .contains("/dav/SaveSync/data"));
    assert_eq!(dav.read_text("data/config.yml")?.as_deref(), Some("theme: dark\n"));
    Ok(())
}

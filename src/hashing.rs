//! Local index builder - Hash resolved items into manifest rows.
//!
//! Every file is hashed with streamed MD5, except `data/config.yml` which is hashed
//! over a canonical form of its parsed YAML so that reformatting, comments and key
//! order do not count as changes.

use crate::groups::SEMANTIC_CONFIG_PATH;
use crate::manifest::IndexRow;
use crate::progress::{ProgressEvent, ProgressSink, Stage};
use crate::resolver::BackupItem;
use anyhow::{Context, Result};
use md5::{Digest, Md5};
use serde_yaml::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

const READ_BUFFER: usize = 64 * 1024;

/// Streamed MD5 of a file, hex encoded.
pub fn md5_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Cannot open {}", path.display()))?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("Cannot read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// MD5 of a string, hex encoded.
pub fn md5_str(text: &str) -> String {
    hex::encode(Md5::digest(text.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(&serde_json::Value::String(s.clone()).to_string()),
        Value::Sequence(seq) => {
            out.push('[');
            for (i, item) in seq.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Mapping(map) => {
            let sorted: BTreeMap<String, &Value> =
                map.iter().map(|(k, v)| (key_string(k), v)).collect();
            out.push('{');
            for (i, (key, value)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String(key).to_string());
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Tagged(tagged) => {
            out.push_str(&tagged.tag.to_string());
            out.push(' ');
            write_canonical(&tagged.value, out);
        }
    }
}

fn key_string(key: &Value) -> String {
    match key {
        Value::String(s) => s.clone(),
        other => {
            let mut s = String::new();
            write_canonical(other, &mut s);
            s
        }
    }
}

/// Canonical string of a YAML document: mappings recursively sorted by key.
pub fn canonicalize_yaml(text: &str) -> Result<String> {
    let value: Value = serde_yaml::from_str(text).context("Cannot parse YAML")?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Hash of an item as stored in the manifest.
pub fn hash_item(item: &BackupItem) -> Result<String> {
    if item.rel == SEMANTIC_CONFIG_PATH {
        let text = std::fs::read_to_string(&item.abs)
            .with_context(|| format!("Cannot read {}", item.abs.display()));
        match text.and_then(|t| canonicalize_yaml(&t)) {
            Ok(canonical) => return Ok(md5_str(&canonical)),
            Err(e) => warn!(
                "[Hash] Falling back to raw hash for {}: {:#}",
                item.rel, e
            ),
        }
    }
    md5_file(&item.abs)
}

/// Build index rows for `items`.
///
/// A cached row with the same path, size and mtime is reused without rehashing.
/// Unreadable files are reported to `sink` and left out of the index.
pub fn build_local_index(
    items: &[BackupItem],
    cache: Option<&HashMap<String, IndexRow>>,
    sink: &dyn ProgressSink,
) -> Vec<IndexRow> {
    let mut rows = Vec::with_capacity(items.len());
    let mut reused = 0usize;

    for item in items {
        let cached = cache
            .and_then(|c| c.get(&item.rel))
            .filter(|row| row.size == item.size && row.mtime == item.mtime);

        let md5 = match cached {
            Some(row) => {
                reused += 1;
                row.md5.clone()
            }
            None => match hash_item(item) {
                Ok(md5) => md5,
                Err(e) => {
                    warn!("[Hash] Cannot hash {}: {:#}", item.rel, e);
                    sink.emit(ProgressEvent::Error {
                        path: item.rel.clone(),
                        stage: Stage::Hash,
                        message: format!("{:#}", e),
                    });
                    continue;
                }
            },
        };

        rows.push(IndexRow {
            path: item.rel.clone(),
            md5,
            size: item.size,
            mtime: item.mtime,
        });
    }

    debug!(
        "[Hash] Indexed {} files ({} reused from cache)",
        rows.len(),
        reused
    );
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopSink;
    use tempfile::TempDir;

    fn item_for(temp: &TempDir, rel: &str, content: &str) -> BackupItem {
        let abs = temp.path().join(rel.replace('/', "_"));
        std::fs::write(&abs, content).unwrap();
        BackupItem::from_path(rel, abs).unwrap()
    }

    #[test]
    fn test_md5_of_known_content() {
        let temp = TempDir::new().unwrap();
        let item = item_for(&temp, "data/keybindings.json", "abc");
        assert_eq!(hash_item(&item).unwrap(), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_semantic_hash_ignores_order_and_comments() {
        let a = "# launcher settings\nui:\n  theme: dark\n  scale: 2\nlast_game: bounce\n";
        let b = "last_game: bounce   # most recent\nui: {scale: 2, theme: dark}\n";
        assert_eq!(canonicalize_yaml(a).unwrap(), canonicalize_yaml(b).unwrap());

        let temp = TempDir::new().unwrap();
        let first = hash_item(&item_for(&temp, SEMANTIC_CONFIG_PATH, a)).unwrap();
        let second = hash_item(&item_for(&temp, SEMANTIC_CONFIG_PATH, b)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_semantic_hash_sees_scalar_changes() {
        let a = canonicalize_yaml("ui:\n  scale: 2\n").unwrap();
        let b = canonicalize_yaml("ui:\n  scale: 3\n").unwrap();
        assert_ne!(md5_str(&a), md5_str(&b));
    }

    #[test]
    fn test_semantic_hash_only_for_config_yml() {
        let temp = TempDir::new().unwrap();
        let text = "b: 1\na: 2\n";
        let other = hash_item(&item_for(&temp, "data/other.yml", text)).unwrap();
        assert_eq!(other, md5_str(text));
    }

    #[test]
    fn test_invalid_yaml_falls_back_to_raw_bytes() {
        let temp = TempDir::new().unwrap();
        let text = "key: [unclosed\n";
        let item = item_for(&temp, SEMANTIC_CONFIG_PATH, text);
        assert_eq!(hash_item(&item).unwrap(), md5_str(text));
    }

    #[test]
    fn test_cache_is_reused_when_size_and_mtime_match() {
        let temp = TempDir::new().unwrap();
        let item = item_for(&temp, "data/keybindings.json", "abc");

        let mut cache = HashMap::new();
        cache.insert(
            item.rel.clone(),
            IndexRow {
                path: item.rel.clone(),
                md5: "cached".to_string(),
                size: item.size,
                mtime: item.mtime,
            },
        );
        let rows = build_local_index(std::slice::from_ref(&item), Some(&cache), &NoopSink);
        assert_eq!(rows[0].md5, "cached");

        cache.get_mut(&item.rel).unwrap().mtime += 1;
        let rows = build_local_index(std::slice::from_ref(&item), Some(&cache), &NoopSink);
        assert_eq!(rows[0].md5, "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_unreadable_item_is_reported_and_skipped() {
        let temp = TempDir::new().unwrap();
        let item = BackupItem {
            rel: "data/gone.json".to_string(),
            abs: temp.path().join("gone.json"),
            size: 1,
            mtime: 1,
        };
        let errors = std::cell::Cell::new(0);
        let sink = |e: ProgressEvent| {
            if matches!(e, ProgressEvent::Error { .. }) {
                errors.set(errors.get() + 1);
            }
        };
        let rows = build_local_index(&[item], None, &sink);
        assert!(rows.is_empty());
        assert_eq!(errors.get(), 1);
    }
}

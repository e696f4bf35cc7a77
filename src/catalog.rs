//! Enumerates granules in a remote object store.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::{Error, Result};
use crate::granule::{self, Location, PRODUCT_PREFIX};

/// One object returned by a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    pub is_truncated: bool,
    pub continuation_token: Option<String>,
}

/// Paginated `list(bucket, prefix)` over an object store.
pub trait ObjectLister {
    fn list_page(&self, bucket: &str, prefix: &str, token: Option<&str>) -> Result<ListPage>;
}

/// A granule to process and its size in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub name: String,
    pub size: u64,
}

/// Which object names count as granules of interest.
#[derive(Debug, Clone)]
pub struct MatchRule {
    pub prefix: String,
    pub suffix: String,
}

impl MatchRule {
    pub fn for_release(release: &str, version: &str) -> Self {
        MatchRule {
            prefix: PRODUCT_PREFIX.to_string(),
            suffix: granule::release_suffix(release, version),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.prefix) && name.ends_with(&self.suffix)
    }
}

/// Lists every object under `location` whose name matches `rule`.
///
/// Pages until the store stops returning a continuation token. Any transport
/// error aborts the whole listing.
pub fn list_catalog(
    lister: &dyn ObjectLister,
    location: &Location,
    rule: &MatchRule,
) -> Result<Vec<WorkItem>> {
    let mut items = Vec::new();
    let mut seen = HashSet::new();
    let mut token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let page = lister.list_page(&location.bucket, &location.prefix, token.as_deref())?;
        pages += 1;
        print!("#");
        std::io::stdout().flush().ok();

        // Keep granules of interest, named by the last path element
        for entry in page.entries {
            let name = entry.key.rsplit('/').next().unwrap_or(&entry.key);
            if rule.matches(name) && seen.insert(name.to_string()) {
                items.push(WorkItem {
                    name: name.to_string(),
                    size: entry.size,
                });
            }
        }

        // Follow the continuation token until the listing is complete
        match page.continuation_token {
            Some(next) if page.is_truncated => token = Some(next),
            _ => break,
        }
    }
    println!();

    info!(
        "Listed {} matching granules in {} pages under {}/{}",
        items.len(),
        pages,
        location.bucket,
        location.prefix
    );
    Ok(items)
}

/// Lists existing outputs and maps each back to the v1 granule it was made from.
pub fn list_converted(
    lister: &dyn ObjectLister,
    location: &Location,
    release: &str,
    version: &str,
) -> Result<HashSet<String>> {
    let rule = MatchRule::for_release(release, version);
    let outputs = list_catalog(lister, location, &rule)?;
    Ok(outputs
        .into_iter()
        .map(|item| granule::to_v1_name(&item.name, release, version))
        .collect())
}

/// Input list files: `single` unless `pattern` is given, in which case every
/// path the glob matches, sorted.
pub fn granule_list_paths(single: &Path, pattern: Option<&str>) -> Result<Vec<PathBuf>> {
    let Some(pattern) = pattern else {
        return Ok(vec![single.to_path_buf()]);
    };
    let mut paths = glob::glob(pattern)
        .map_err(|e| Error::Listing(format!("bad pattern '{}': {}", pattern, e)))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Listing(e.to_string()))?;
    paths.sort();
    Ok(paths)
}

/// Reads granule names, one per line, from each list file. Blank lines are
/// skipped and repeated names kept once. Sizes are unknown and left at 0.
pub fn read_granule_lists(paths: &[PathBuf]) -> Result<Vec<WorkItem>> {
    let mut seen = HashSet::new();
    let mut items = Vec::new();
    for path in paths {
        let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        for name in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if seen.insert(name.to_string()) {
                items.push(WorkItem {
                    name: name.to_string(),
                    size: 0,
                });
            }
        }
    }
    info!("Read {} granules from {} list files", items.len(), paths.len());
    Ok(items)
}

/// Object store backed by a local directory: `<root>/<bucket>/<key>`.
///
/// Keys are listed in sorted order; the continuation token is the last key of
/// the previous page.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalObjectStore {
    pub const DEFAULT_PAGE_SIZE: usize = 1000;

    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore {
            root: root.into(),
            page_size: Self::DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn collect_keys(&self, bucket_dir: &Path, dir: &Path, out: &mut Vec<ObjectEntry>) -> Result<()> {
        let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(dir, e))?;
            let path = entry.path();
            let meta = entry.metadata().map_err(|e| Error::io(&path, e))?;
            if meta.is_dir() {
                self.collect_keys(bucket_dir, &path, out)?;
            } else if let Ok(rel) = path.strip_prefix(bucket_dir) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(ObjectEntry {
                    key,
                    size: meta.len(),
                });
            }
        }
        Ok(())
    }
}

impl ObjectLister for LocalObjectStore {
    fn list_page(&self, bucket: &str, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let bucket_dir = self.root.join(bucket);
        if !bucket_dir.is_dir() {
            return Err(Error::Listing(format!("no such bucket: {}", bucket)));
        }

        let mut all = Vec::new();
        self.collect_keys(&bucket_dir, &bucket_dir, &mut all)?;
        all.retain(|e| e.key.starts_with(prefix));
        all.sort_by(|a, b| a.key.cmp(&b.key));

        let start = match token {
            Some(t) => all.partition_point(|e| e.key.as_str() <= t),
            None => 0,
        };
        let end = (start + self.page_size).min(all.len());
        let entries = all[start..end].to_vec();
        let is_truncated = end < all.len();
        let continuation_token = if is_truncated {
            entries.last().map(|e| e.key.clone())
        } else {
            None
        };
        debug!(
            "Listed page of {} objects in {} (truncated: {})",
            entries.len(),
            bucket,
            is_truncated
        );

        Ok(ListPage {
            entries,
            is_truncated,
            continuation_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct ScriptedLister {
        pages: Vec<ListPage>,
        calls: RefCell<Vec<Option<String>>>,
    }

    impl ObjectLister for ScriptedLister {
        fn list_page(&self, _bucket: &str, _prefix: &str, token: Option<&str>) -> Result<ListPage> {
            let mut calls = self.calls.borrow_mut();
            let idx = calls.len();
            calls.push(token.map(str::to_string));
            self.pages
                .get(idx)
                .cloned()
                .ok_or_else(|| Error::Listing("ran past the last page".into()))
        }
    }

    fn entry(key: &str, size: u64) -> ObjectEntry {
        ObjectEntry {
            key: key.to_string(),
            size,
        }
    }

    const A: &str = "ATL24_20181120020325_08010106_006_02_002_01.h5";
    const B: &str = "ATL24_20190115020325_08010111_006_02_002_01.h5";

    #[test]
    fn pages_until_no_token_and_tolerates_empty_pages() {
        let lister = ScriptedLister {
            pages: vec![
                ListPage {
                    entries: vec![entry(&format!("data/{}", A), 10), entry("data/readme.txt", 1)],
                    is_truncated: true,
                    continuation_token: Some("t1".into()),
                },
                ListPage {
                    entries: vec![],
                    is_truncated: true,
                    continuation_token: Some("t2".into()),
                },
                ListPage {
                    entries: vec![
                        entry(&format!("data/{}", B), 20),
                        entry(&format!("other/{}", A), 99),
                        entry("data/ATL24_20181120020325_08010106_006_02_001_01.h5", 5),
                    ],
                    is_truncated: false,
                    continuation_token: None,
                },
            ],
            calls: RefCell::new(Vec::new()),
        };
        let loc = Location::parse("s3://bucket/data");
        let items = list_catalog(&lister, &loc, &MatchRule::for_release("002", "01")).unwrap();

        assert_eq!(
            items,
            vec![
                WorkItem { name: A.into(), size: 10 },
                WorkItem { name: B.into(), size: 20 },
            ]
        );
        assert_eq!(
            *lister.calls.borrow(),
            vec![None, Some("t1".to_string()), Some("t2".to_string())]
        );
    }

    #[test]
    fn transport_error_is_fatal() {
        let lister = ScriptedLister {
            pages: vec![ListPage {
                entries: vec![entry(A, 1)],
                is_truncated: true,
                continuation_token: Some("t1".into()),
            }],
            calls: RefCell::new(Vec::new()),
        };
        let loc = Location::parse("s3://bucket");
        assert!(list_catalog(&lister, &loc, &MatchRule::for_release("002", "01")).is_err());
    }

    #[test]
    fn local_store_pages_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let prefix_dir = dir.path().join("bucket").join("data");
        fs::create_dir_all(&prefix_dir).unwrap();
        for name in [B, A, "notes.txt"] {
            fs::write(prefix_dir.join(name), b"xyz").unwrap();
        }

        let store = LocalObjectStore::new(dir.path()).with_page_size(1);
        let first = store.list_page("bucket", "data", None).unwrap();
        assert_eq!(first.entries.len(), 1);
        assert_eq!(first.entries[0].key, format!("data/{}", A));
        assert!(first.is_truncated);

        let loc = Location::parse("s3://bucket/data");
        let items = list_catalog(&store, &loc, &MatchRule::for_release("002", "01")).unwrap();
        let names: Vec<_> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec![A, B]);
        assert!(items.iter().all(|i| i.size == 3));
    }

    #[test]
    fn converted_outputs_map_to_v1_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out").join(A), b"").unwrap();

        let store = LocalObjectStore::new(dir.path());
        let done = list_converted(&store, &Location::parse("s3://out"), "002", "01").unwrap();
        assert!(done.contains("ATL24_20181120020325_08010106_006_02_001_01.h5"));
        assert_eq!(done.len(), 1);
    }

    #[test]
    fn granule_lists_from_glob() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("cycle_1.txt"), "G1.h5\n\n  G2.h5 \n").unwrap();
        fs::write(dir.path().join("cycle_2.txt"), "G2.h5\nG3.h5\n").unwrap();
        fs::write(dir.path().join("notes.md"), "G9.h5\n").unwrap();

        let pattern = dir.path().join("cycle_*.txt");
        let paths = granule_list_paths(Path::new("unused"), pattern.to_str()).unwrap();
        assert_eq!(paths.len(), 2);

        let items = read_granule_lists(&paths).unwrap();
        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, ["G1.h5", "G2.h5", "G3.h5"]);

        let single = granule_list_paths(Path::new("list.txt"), None).unwrap();
        assert_eq!(single, [PathBuf::from("list.txt")]);
        assert!(read_granule_lists(&single).is_err());
    }
}

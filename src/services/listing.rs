//! Assembles logical files from a flat listing of the wrapped backend.

use crate::{
    backend::parent_dir,
    errors::{ChunkerError, ChunkerResult},
    models::{
        metadata::MAX_METADATA_SIZE,
        object::{BaseObject, CompositeObject, DirEntry, Entry},
    },
    services::{chunker::Chunker, naming::ChunkKind},
};
use std::collections::{BTreeMap, BTreeSet, btree_map};
use tracing::{debug, warn};

impl Chunker {
    /// List one directory level.
    ///
    /// Temporary and control chunks are hidden, data chunks are folded into
    /// their composite file. Broken composites fail the listing in strict
    /// mode and are skipped otherwise.
    pub async fn list(&self, dir: &str) -> ChunkerResult<Vec<Entry>> {
        let entries = self.base.list(dir).await?;
        self.process_entries(entries)
    }

    pub(crate) fn process_entries(&self, mut entries: Vec<DirEntry>) -> ChunkerResult<Vec<Entry>> {
        // A base name sorts before every chunk derived from it.
        entries.sort_by(|a, b| a.remote().cmp(b.remote()));

        let mut objects: BTreeMap<String, CompositeObject> = BTreeMap::new();
        let mut dirs: BTreeSet<String> = BTreeSet::new();
        let mut bad: BTreeSet<String> = BTreeSet::new();

        for entry in entries {
            let obj = match entry {
                DirEntry::Dir(dir) => {
                    dirs.insert(dir);
                    continue;
                }
                DirEntry::Object(obj) => obj,
            };

            let Some(name) = self.codec.parse_chunk_name(&obj.remote) else {
                let remote = obj.remote.clone();
                objects.insert(remote, CompositeObject::from_main(obj, self.identity.clone()));
                continue;
            };
            if name.is_temporary() {
                debug!("skip temporary chunk `{}`", obj.remote);
                continue;
            }
            let ChunkKind::Data(chunk_no) = name.kind else {
                debug!("skip control chunk `{}`", obj.remote);
                continue;
            };

            let composite = match objects.entry(name.main_name) {
                btree_map::Entry::Occupied(slot) => slot.into_mut(),
                btree_map::Entry::Vacant(slot) => {
                    if self.use_meta {
                        debug!("skip orphan data chunk `{}`", obj.remote);
                        continue;
                    }
                    let remote = slot.key().clone();
                    slot.insert(CompositeObject::headless(remote, self.identity.clone()))
                }
            };
            if let Err(err) = composite.add_chunk(obj, chunk_no) {
                if self.config.fail_hard {
                    return Err(err);
                }
                bad.insert(composite.remote().to_string());
            }
        }

        let mut result = Vec::with_capacity(objects.len() + dirs.len());
        for (remote, mut obj) in objects {
            if bad.contains(&remote) {
                debug!("skip broken composite `{remote}`");
                continue;
            }
            if dirs.contains(&remote) {
                if self.config.fail_hard {
                    return Err(ChunkerError::invalid_composite(
                        remote,
                        "name is both a directory and a file",
                    ));
                }
                warn!("`{remote}` is both a directory and a file, skipping the file");
                continue;
            }
            if let Err(err) = obj.validate() {
                if self.config.fail_hard {
                    return Err(err);
                }
                debug!("skip invalid composite `{remote}`: {err}");
                continue;
            }
            result.push(Entry::Object(obj));
        }
        result.extend(dirs.into_iter().map(Entry::Dir));
        result.sort_by(|a, b| a.remote().cmp(b.remote()));
        Ok(result)
    }

    /// Find one logical file by name.
    ///
    /// Objects too large to be metadata are returned as plain files without
    /// a directory scan. Metadata itself is not read here. With metadata on,
    /// chunks without their main object are orphans and yield `ObjectNotFound`.
    pub async fn new_object(&self, remote: &str) -> ChunkerResult<CompositeObject> {
        if self.config.fail_hard {
            self.forbid_chunk(remote)?;
        }

        let mut obj = if self.use_meta {
            let main = self.base.stat(remote).await?;
            let large = main.size > MAX_METADATA_SIZE as u64;
            let mut obj = CompositeObject::from_main(main, self.identity.clone());
            if large {
                obj.validate()?;
                return Ok(obj);
            }
            obj
        } else {
            CompositeObject::headless(remote, self.identity.clone())
        };

        for (chunk, chunk_no) in self.scan_chunks(remote).await? {
            obj.add_chunk(chunk, chunk_no)?;
        }

        if !obj.is_composite() && obj.main().is_none() {
            // Plain file in no-metadata mode.
            let main = self.base.stat(remote).await?;
            obj = CompositeObject::from_main(main, self.identity.clone());
        }
        obj.validate()?;
        Ok(obj)
    }

    /// Active data chunks of `remote` found in its directory.
    async fn scan_chunks(&self, remote: &str) -> ChunkerResult<Vec<(BaseObject, usize)>> {
        let entries = match self.base.list(parent_dir(remote)).await {
            Ok(entries) => entries,
            Err(ChunkerError::DirNotFound(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut found = Vec::new();
        for entry in entries {
            let DirEntry::Object(chunk) = entry else {
                continue;
            };
            let Some(name) = self.codec.parse_chunk_name(&chunk.remote) else {
                continue;
            };
            if name.main_name != remote || name.is_temporary() {
                continue;
            }
            if let ChunkKind::Data(chunk_no) = name.kind {
                found.push((chunk, chunk_no));
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{Backend, MemoryBackend},
        config::{ChunkerConfig, HashPolicy, MetaFormat},
    };
    use chrono::Utc;
    use std::sync::Arc;

    fn chunker(meta_format: MetaFormat, fail_hard: bool) -> Chunker {
        let hash_type = match meta_format {
            MetaFormat::None => HashPolicy::None,
            MetaFormat::SimpleJson => HashPolicy::Md5,
        };
        let config = ChunkerConfig {
            chunk_size: 100,
            name_format: "*.chunk.###".into(),
            meta_format,
            hash_type,
            fail_hard,
            ..ChunkerConfig::default()
        };
        Chunker::new(Arc::new(MemoryBackend::new("t")), config).unwrap()
    }

    fn object(remote: &str, size: u64) -> DirEntry {
        DirEntry::Object(BaseObject::new(remote, size, Utc::now()))
    }

    fn names(entries: &[Entry]) -> Vec<&str> {
        entries.iter().map(Entry::remote).collect()
    }

    #[test]
    fn test_folds_chunks_into_composite() {
        let c = chunker(MetaFormat::SimpleJson, false);
        let entries = vec![
            object("fish.chunk.002", 50),
            object("fish", 40),
            object("fish.chunk.001", 100),
            object("fish.chunk.003..tmp_1234567890", 7),
            object("fish.chunk._lock", 1),
            object("orphan.chunk.001", 100),
            object("plain", 5),
            DirEntry::Dir("sea".into()),
        ];
        let result = c.process_entries(entries).unwrap();
        assert_eq!(names(&result), ["fish", "plain", "sea"]);
        let Entry::Object(fish) = &result[0] else {
            panic!("expected an object");
        };
        assert!(fish.is_composite());
        assert_eq!(fish.size(), Some(150));
        assert_eq!(fish.chunk_count(), 2);
    }

    #[test]
    fn test_no_metadata_mode_synthesizes_from_chunks() {
        let c = chunker(MetaFormat::None, false);
        let entries = vec![object("fish.chunk.001", 100), object("fish.chunk.002", 3)];
        let result = c.process_entries(entries).unwrap();
        assert_eq!(names(&result), ["fish"]);
        let Entry::Object(fish) = &result[0] else {
            panic!("expected an object");
        };
        assert_eq!(fish.size(), Some(103));
        assert!(fish.main().is_none());
    }

    #[test]
    fn test_holes_dropped_or_fatal() {
        let entries = || {
            vec![
                object("fish", 40),
                object("fish.chunk.001", 100),
                object("fish.chunk.003", 100),
                object("tuna", 1),
            ]
        };
        let lenient = chunker(MetaFormat::SimpleJson, false);
        assert_eq!(names(&lenient.process_entries(entries()).unwrap()), ["tuna"]);

        let strict = chunker(MetaFormat::SimpleJson, true);
        assert!(matches!(
            strict.process_entries(entries()),
            Err(ChunkerError::InvalidComposite { .. })
        ));
    }

    #[test]
    fn test_dir_and_file_conflict() {
        let entries = || vec![object("fish", 4), DirEntry::Dir("fish".into())];
        let lenient = chunker(MetaFormat::SimpleJson, false);
        assert_eq!(names(&lenient.process_entries(entries()).unwrap()), ["fish"]);
        assert!(matches!(
            lenient.process_entries(entries()).unwrap()[0],
            Entry::Dir(_)
        ));

        let strict = chunker(MetaFormat::SimpleJson, true);
        assert!(strict.process_entries(entries()).is_err());
    }

    #[tokio::test]
    async fn test_new_object_large_file_skips_scan() {
        let base = Arc::new(MemoryBackend::new("t"));
        let c = Chunker::new(
            base.clone(),
            ChunkerConfig {
                chunk_size: 100,
                name_format: "*.chunk.###".into(),
                ..ChunkerConfig::default()
            },
        )
        .unwrap();
        let data = vec![0u8; 300];
        let info = crate::models::info::ObjectInfo::new("big", Some(300), Utc::now());
        base.put(&mut &data[..], &info).await.unwrap();
        let info = crate::models::info::ObjectInfo::new("big.chunk.001", Some(1), Utc::now());
        base.put(&mut &b"x"[..], &info).await.unwrap();

        let obj = c.new_object("big").await.unwrap();
        assert!(!obj.is_composite());
        assert_eq!(obj.size(), Some(300));

        assert!(c.new_object("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_orphan_chunks_are_not_a_file() {
        let base = Arc::new(MemoryBackend::new("t"));
        let c = Chunker::new(
            base.clone(),
            ChunkerConfig {
                chunk_size: 100,
                name_format: "*.chunk.###".into(),
                ..ChunkerConfig::default()
            },
        )
        .unwrap();
        for (remote, len) in [("fish.chunk.001", 100), ("fish.chunk.002", 20)] {
            let data = vec![7u8; len];
            let info = crate::models::info::ObjectInfo::new(remote, Some(len as u64), Utc::now());
            base.put(&mut &data[..], &info).await.unwrap();
        }

        let err = c.new_object("fish").await.unwrap_err();
        assert!(matches!(err, ChunkerError::ObjectNotFound(_)), "{err}");
        assert!(c.list("").await.unwrap().is_empty());
    }
}

//! The namespace (C2): a directory tree plus a digest index, mutated only
//! by applying committed commands. Readers take the tree lock in shared
//! mode; commands apply under the writer lock (see `consensus` for the
//! apply pipeline that calls into here).
//!
//! Directories form a graph with a cycle at the root (`root.parent ==
//! root`), so they are addressed by stable arena index rather than by
//! owning pointer — `parent` is a `DirId`, never a reference.

use crate::types::{Digest, MetaError, NodeId, Result};
use std::collections::HashMap;

/// A stable index into the directory arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DirId(usize);

/// One binding of a logical path (directory + leaf name) to a `File`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathBinding {
    pub parent: DirId,
    pub name: String,
}

#[derive(Debug)]
struct Directory {
    name: String,
    parent: DirId,
    children_dirs: HashMap<String, DirId>,
    children_files: HashMap<String, Digest>,
    size_aggregate: u64,
}

/// A file as seen from the namespace: its content digest, every logical
/// path bound to it, and the set of nodes known to host that digest.
/// Shared by every path in `paths` — `replica_count` is `paths.len()` and
/// also the number of distinct hosts, and the two advance independently
/// (a path add/remove changes the former, a replica-manager report
/// changes the latter).
#[derive(Clone, Debug)]
pub struct File {
    pub digest: Digest,
    pub paths: Vec<PathBinding>,
    pub size_bytes: u64,
    pub host_set: Vec<NodeId>,
}

impl File {
    pub fn replica_count(&self) -> usize {
        self.paths.len()
    }
}

/// The full per-master namespace: directory arena rooted at `/`, plus the
/// digest index used for dedup. There is exactly one `Namespace` per
/// master process; it is threaded into request handlers rather than
/// accessed by name.
pub struct Namespace {
    dirs: Vec<Directory>,
    root: DirId,
    files: HashMap<Digest, File>,
}

impl Namespace {
    pub fn new() -> Self {
        let root_id = DirId(0);
        let root = Directory {
            name: String::new(),
            parent: root_id,
            children_dirs: HashMap::new(),
            children_files: HashMap::new(),
            size_aggregate: 0,
        };
        Self {
            dirs: vec![root],
            root: root_id,
            files: HashMap::new(),
        }
    }

    fn split(path: &str) -> Result<(Vec<&str>, &str)> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(MetaError::NotADirectory(path.to_string()));
        }
        let mut parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        let leaf = parts.pop().ok_or_else(|| MetaError::NotADirectory(path.to_string()))?;
        Ok((parts, leaf))
    }

    /// Walks `segments` from `dir`, creating missing directories, and
    /// returns the terminal directory's id.
    fn mkdirp(&mut self, mut dir: DirId, segments: &[&str]) -> DirId {
        for seg in segments {
            let existing = self.dirs[dir.0].children_dirs.get(*seg).copied();
            dir = match existing {
                Some(child) => child,
                None => {
                    let new_id = DirId(self.dirs.len());
                    self.dirs.push(Directory {
                        name: seg.to_string(),
                        parent: dir,
                        children_dirs: HashMap::new(),
                        children_files: HashMap::new(),
                        size_aggregate: 0,
                    });
                    self.dirs[dir.0].children_dirs.insert(seg.to_string(), new_id);
                    new_id
                }
            };
        }
        dir
    }

    fn resolve_dir(&self, segments: &[&str]) -> Result<DirId> {
        let mut dir = self.root;
        for seg in segments {
            dir = *self.dirs[dir.0]
                .children_dirs
                .get(*seg)
                .ok_or_else(|| MetaError::NotFound(seg.to_string()))?;
        }
        Ok(dir)
    }

    fn add_size_along_ancestors(&mut self, mut dir: DirId, delta: i64) {
        loop {
            let d = &mut self.dirs[dir.0];
            d.size_aggregate = (d.size_aggregate as i64 + delta).max(0) as u64;
            let parent = d.parent;
            if parent == dir {
                break; // root's parent is itself
            }
            dir = parent;
        }
    }

    /// Applies `AddFile`. See spec component design §4.2 for the four
    /// cases this implements: new directories created as needed, digest
    /// conflict at an existing path, dedup onto an existing digest from a
    /// new path, or a brand new file.
    pub fn add_file(&mut self, path: &str, digest: Digest, host_ids: Vec<NodeId>) -> Result<()> {
        let (segments, leaf) = Self::split(path)?;
        let dir = self.mkdirp(self.root, &segments);

        if let Some(existing_digest) = self.dirs[dir.0].children_files.get(leaf).cloned() {
            if existing_digest == digest {
                return Ok(()); // re-applying the same AddFile is a no-op
            }
            return Err(MetaError::Conflict { path: path.to_string() });
        }

        self.dirs[dir.0]
            .children_files
            .insert(leaf.to_string(), digest.clone());

        let size = match self.files.get_mut(&digest) {
            Some(file) => {
                file.paths.push(PathBinding {
                    parent: dir,
                    name: leaf.to_string(),
                });
                for h in host_ids {
                    if !file.host_set.contains(&h) {
                        file.host_set.push(h);
                    }
                }
                file.size_bytes
            }
            None => {
                // Size is not carried by `AddFile` in the wire command;
                // the content store is the source of truth for bytes, so
                // a freshly-bound digest starts at 0 until a size report
                // arrives (mirrors spec.md's documented command fields —
                // this is a deliberate minimal-field command).
                let file = File {
                    digest: digest.clone(),
                    paths: vec![PathBinding {
                        parent: dir,
                        name: leaf.to_string(),
                    }],
                    size_bytes: 0,
                    host_set: host_ids,
                };
                self.files.insert(digest, file);
                0
            }
        };

        self.add_size_along_ancestors(dir, size as i64);
        Ok(())
    }

    /// Records the true size for a digest once known (e.g. from the
    /// upload callback), correcting ancestor aggregates.
    pub fn set_file_size(&mut self, digest: &Digest, size_bytes: u64) {
        if let Some(file) = self.files.get_mut(digest) {
            let delta = size_bytes as i64 - file.size_bytes as i64;
            file.size_bytes = size_bytes;
            let paths = file.paths.clone();
            for p in paths {
                self.add_size_along_ancestors(p.parent, delta);
            }
        }
    }

    pub fn get_file(&self, path: &str) -> Result<&File> {
        let (segments, leaf) = Self::split(path)?;
        let dir = self.resolve_dir(&segments)?;
        let digest = self.dirs[dir.0]
            .children_files
            .get(leaf)
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;
        self.files.get(digest).ok_or_else(|| MetaError::NotFound(path.to_string()))
    }

    /// Removes the `(parent, leaf)` binding for `path`. When this was the
    /// last binding, the `File` is dropped from the digest index —
    /// whether the node still hosts the digest is tracked by `host_set`
    /// and left to the caller (content-store cleanup is a separate,
    /// out-of-band fan-out per spec §4.8 failure semantics).
    pub fn delete_file(&mut self, path: &str) -> Result<()> {
        let (segments, leaf) = Self::split(path)?;
        let dir = self.resolve_dir(&segments)?;
        let digest = self.dirs[dir.0]
            .children_files
            .remove(leaf)
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;

        let (size, now_empty) = {
            let file = self
                .files
                .get_mut(&digest)
                .expect("digest index and directory entry must agree");
            file.paths.retain(|b| !(b.parent == dir && b.name == leaf));
            (file.size_bytes, file.paths.is_empty())
        };
        if now_empty {
            self.files.remove(&digest);
        }
        self.add_size_along_ancestors(dir, -(size as i64));
        Ok(())
    }

    pub fn get_dir_size(&self, path: &str) -> Result<u64> {
        let (segments, leaf) = Self::split_full(path);
        let dir = self.resolve_dir_full(&segments, leaf)?;
        Ok(self.dirs[dir.0].size_aggregate)
    }

    fn split_full(path: &str) -> (Vec<&str>, &str) {
        let trimmed = path.trim_start_matches('/').trim_end_matches('/');
        if trimmed.is_empty() {
            return (Vec::new(), "");
        }
        let parts: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
        (parts, "")
    }

    fn resolve_dir_full(&self, segments: &[&str], _leaf: &str) -> Result<DirId> {
        self.resolve_dir(segments)
    }

    /// Produces an indented human listing of a directory, matching
    /// spec.md's `PrintDir`. This is the one formatting-facing operation
    /// in the namespace and is intentionally not wired to any CLI.
    pub fn print_dir(&self, path: &str) -> Result<String> {
        let (segments, _) = Self::split_full(path);
        let dir = self.resolve_dir(&segments)?;
        let mut out = String::new();
        self.print_dir_rec(dir, 0, &mut out);
        Ok(out)
    }

    fn print_dir_rec(&self, dir: DirId, depth: usize, out: &mut String) {
        let d = &self.dirs[dir.0];
        let indent = "  ".repeat(depth);
        let mut names: Vec<&String> = d.children_dirs.keys().collect();
        names.sort();
        for name in names {
            out.push_str(&format!("{indent}{name}/\n"));
            self.print_dir_rec(d.children_dirs[name], depth + 1, out);
        }
        let mut files: Vec<&String> = d.children_files.keys().collect();
        files.sort();
        for name in files {
            let digest = &d.children_files[name];
            let size = self.files.get(digest).map(|f| f.size_bytes).unwrap_or(0);
            out.push_str(&format!("{indent}{name} ({size} bytes)\n"));
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-container record of every installed rule, enabling O(N)
//! teardown without scanning the kernel maps.

use std::{fs, io, os::unix::fs::MetadataExt, path::Path, time::Duration};

use plain::Plain;
use thiserror::Error;

use cordon_common::{InodeKey, NetCreateKey, NetTupleKey, NetUnixKey, MAX_KEYS_PER_KIND};

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("could not resolve the cgroup directory {path}: {source}")]
    CgroupResolve {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("cgroup directory {0} has inode 0; rules cannot be scoped")]
    CgroupZero(String),

    #[error("key array for {0} is full ({1} entries)")]
    KeyArrayFull(&'static str, usize),
}

/// Reads the cgroup identity of a container: the inode number of the
/// cgroup directory the cgroup collaborator created for it, named after
/// the container's hostname.
pub fn resolve_cgroup_id(cgroup_root: &Path, container_id: &str) -> Result<u64, ContextError> {
    let dir = cgroup_root.join(container_id);
    let meta = fs::metadata(&dir).map_err(|source| ContextError::CgroupResolve {
        path: dir.display().to_string(),
        source,
    })?;
    let cgroup_id = meta.ino();
    if cgroup_id == 0 {
        return Err(ContextError::CgroupZero(dir.display().to_string()));
    }
    Ok(cgroup_id)
}

/// Append-only array of installed map keys for one rule kind. Grows
/// exponentially from a small initial capacity, deduplicates on record
/// and is capped at the map capacity.
pub struct KeyArray<K> {
    name: &'static str,
    keys: Vec<K>,
    cap: usize,
}

impl<K: Plain + Copy + PartialEq> KeyArray<K> {
    fn new(name: &'static str, initial: usize) -> Self {
        KeyArray {
            name,
            keys: Vec::with_capacity(initial),
            cap: MAX_KEYS_PER_KIND,
        }
    }

    #[cfg(test)]
    fn with_cap(name: &'static str, initial: usize, cap: usize) -> Self {
        KeyArray {
            name,
            keys: Vec::with_capacity(initial),
            cap,
        }
    }

    /// Records a key, returning false when it was already recorded.
    pub fn record(&mut self, key: K) -> Result<bool, ContextError> {
        if self.keys.contains(&key) {
            return Ok(false);
        }
        if self.keys.len() >= self.cap {
            return Err(ContextError::KeyArrayFull(self.name, self.cap));
        }
        if self.keys.len() == self.keys.capacity() {
            self.keys.reserve(self.keys.capacity());
        }
        self.keys.push(key);
        Ok(true)
    }

    pub fn as_slice(&self) -> &[K] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Everything installed for one container.
pub struct ContainerContext {
    pub container_id: String,
    pub cgroup_id: u64,
    pub file_keys: KeyArray<InodeKey>,
    pub dir_keys: KeyArray<InodeKey>,
    pub basename_keys: KeyArray<InodeKey>,
    pub net_create_keys: KeyArray<NetCreateKey>,
    pub net_tuple_keys: KeyArray<NetTupleKey>,
    pub net_unix_keys: KeyArray<NetUnixKey>,
    pub last_populate: Option<Duration>,
}

impl ContainerContext {
    /// Initial capacities reflect expected rule density: file rules
    /// dominate (subtree fallbacks expand into many inodes), basename
    /// and unix rules stay rare.
    pub fn new(container_id: &str, cgroup_id: u64) -> Self {
        ContainerContext {
            container_id: container_id.to_string(),
            cgroup_id,
            file_keys: KeyArray::new("policy_map", 256),
            dir_keys: KeyArray::new("dir_policy_map", 64),
            basename_keys: KeyArray::new("basename_policy_map", 16),
            net_create_keys: KeyArray::new("net_create_map", 16),
            net_tuple_keys: KeyArray::new("net_tuple_map", 32),
            net_unix_keys: KeyArray::new("net_unix_map", 16),
            last_populate: None,
        }
    }

    /// Total number of recorded keys across all kinds.
    pub fn installed(&self) -> usize {
        self.file_keys.len()
            + self.dir_keys.len()
            + self.basename_keys.len()
            + self.net_create_keys.len()
            + self.net_tuple_keys.len()
            + self.net_unix_keys.len()
    }
}

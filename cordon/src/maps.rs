//! Ownership of the six kernel-resident policy maps and their pinned
//! identities under the bpf filesystem.
//!
//! On startup each map is adopted from its pin when the pinned object
//! still carries the expected ABI signature; anything else is unpinned
//! and recreated so the map set is never a mix of old and new layouts.

use std::{
    ffi::CString,
    fs, io, mem,
    os::fd::{AsRawFd, OwnedFd},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use plain::Plain;
use thiserror::Error;

use crate::sys;
use cordon_common::{
    BasenameValue, DirValue, InodeKey, NetCreateKey, NetTupleKey, NetUnixKey, MAX_KEYS_PER_KIND,
};

/// Magic number of the bpf filesystem, from the kernel UAPI.
const BPF_FS_MAGIC: i64 = 0xcafe4a11;

#[derive(Error, Debug)]
pub enum MapError {
    #[error("could not stat the bpf filesystem: {0}")]
    BpfFsStat(#[source] io::Error),

    #[error("{0} is not a bpf filesystem mount")]
    NotBpfFs(String),

    #[error("could not create the pin directory: {0}")]
    PinDir(#[source] io::Error),

    #[error("could not inspect pinned map {name}: {source}")]
    Inspect {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not unpin stale map {name}: {source}")]
    Unpin {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("could not create map {name}: {source}")]
    Create {
        name: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Expected ABI signature of one map.
#[derive(Debug, Copy, Clone)]
pub struct MapSpec {
    pub name: &'static str,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
}

impl MapSpec {
    fn matches(&self, info: &sys::MapInfo) -> bool {
        info.map_type == sys::BPF_MAP_TYPE_HASH
            && info.key_size == self.key_size
            && info.value_size == self.value_size
    }
}

/// One kernel map plus its pinned identity.
pub struct MapHandle {
    fd: OwnedFd,
    spec: MapSpec,
    pin_path: PathBuf,
    reused: bool,
}

impl MapHandle {
    /// Adopts the pinned map when its signature matches the spec,
    /// otherwise unpins it and creates a fresh map. Freshly created
    /// maps are pinned immediately so that the program loader adopts
    /// the same fd identity; a failed pin is downgraded to a warning
    /// because the fd itself stays usable.
    fn open_or_create(root: &Path, spec: MapSpec) -> Result<Self, MapError> {
        let pin_path = root.join(spec.name);

        match sys::obj_get(&pin_path) {
            Ok(fd) => {
                let info = sys::map_info(fd.as_raw_fd()).map_err(|source| MapError::Inspect {
                    name: spec.name,
                    source,
                })?;
                if spec.matches(&info) {
                    debug!("reusing pinned map {}", pin_path.display());
                    return Ok(MapHandle {
                        fd,
                        spec,
                        pin_path,
                        reused: true,
                    });
                }
                warn!(
                    "pinned map {} has a mismatched ABI (key {}/{} value {}/{}), replacing it",
                    pin_path.display(),
                    info.key_size,
                    spec.key_size,
                    info.value_size,
                    spec.value_size
                );
                fs::remove_file(&pin_path).map_err(|source| MapError::Unpin {
                    name: spec.name,
                    source,
                })?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(MapError::Inspect {
                    name: spec.name,
                    source,
                })
            }
        }

        let fd = sys::map_create(
            spec.name,
            sys::BPF_MAP_TYPE_HASH,
            spec.key_size,
            spec.value_size,
            spec.max_entries,
        )
        .map_err(|source| MapError::Create {
            name: spec.name,
            source,
        })?;

        if let Err(e) = sys::obj_pin(fd.as_raw_fd(), &pin_path) {
            warn!("could not pin map {}: {}", pin_path.display(), e);
        }

        Ok(MapHandle {
            fd,
            spec,
            pin_path,
            reused: false,
        })
    }

    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn reused(&self) -> bool {
        self.reused
    }

    pub fn update<K: Plain, V: Plain>(&self, key: &K, value: &V) -> io::Result<()> {
        sys::map_update_elem(
            self.fd.as_raw_fd(),
            sys::bytes_of(key),
            sys::bytes_of(value),
        )
    }

    pub fn lookup<K: Plain, V: Plain>(&self, key: &K, value: &mut V) -> io::Result<bool> {
        sys::map_lookup_elem(
            self.fd.as_raw_fd(),
            sys::bytes_of(key),
            sys::bytes_of_mut(value),
        )
    }

    /// Deletes the given keys, returning the number actually removed.
    pub fn delete_batch<K: Plain>(&self, keys: &[K]) -> io::Result<usize> {
        sys::map_delete_batch(
            self.fd.as_raw_fd(),
            sys::bytes_of_slice(keys),
            mem::size_of::<K>(),
        )
    }

    fn unpin(&self) {
        if let Err(e) = fs::remove_file(&self.pin_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("could not unpin {}: {}", self.pin_path.display(), e);
            }
        }
    }
}

/// The full map set consulted by the LSM programs.
pub struct MapSet {
    pub inode: MapHandle,
    pub dir: MapHandle,
    pub basename: MapHandle,
    pub net_create: MapHandle,
    pub net_tuple: MapHandle,
    pub net_unix: MapHandle,
}

pub fn inode_map_spec() -> MapSpec {
    MapSpec {
        name: "policy_map",
        key_size: mem::size_of::<InodeKey>() as u32,
        value_size: mem::size_of::<u32>() as u32,
        max_entries: MAX_KEYS_PER_KIND as u32,
    }
}

pub fn dir_map_spec() -> MapSpec {
    MapSpec {
        name: "dir_policy_map",
        key_size: mem::size_of::<InodeKey>() as u32,
        value_size: mem::size_of::<DirValue>() as u32,
        max_entries: MAX_KEYS_PER_KIND as u32,
    }
}

pub fn basename_map_spec() -> MapSpec {
    MapSpec {
        name: "basename_policy_map",
        key_size: mem::size_of::<InodeKey>() as u32,
        value_size: mem::size_of::<BasenameValue>() as u32,
        max_entries: MAX_KEYS_PER_KIND as u32,
    }
}

pub fn net_create_map_spec() -> MapSpec {
    MapSpec {
        name: "net_create_map",
        key_size: mem::size_of::<NetCreateKey>() as u32,
        value_size: mem::size_of::<u32>() as u32,
        max_entries: MAX_KEYS_PER_KIND as u32,
    }
}

pub fn net_tuple_map_spec() -> MapSpec {
    MapSpec {
        name: "net_tuple_map",
        key_size: mem::size_of::<NetTupleKey>() as u32,
        value_size: mem::size_of::<u32>() as u32,
        max_entries: MAX_KEYS_PER_KIND as u32,
    }
}

pub fn net_unix_map_spec() -> MapSpec {
    MapSpec {
        name: "net_unix_map",
        key_size: mem::size_of::<NetUnixKey>() as u32,
        value_size: mem::size_of::<u32>() as u32,
        max_entries: MAX_KEYS_PER_KIND as u32,
    }
}

/// Verifies that `mount` is a bpf filesystem. A missing mount means the
/// whole enforcement backend is unavailable, which the manager treats as
/// a downgrade rather than an error.
fn ensure_bpffs(mount: &Path) -> Result<(), MapError> {
    use std::os::unix::ffi::OsStrExt;

    let c = CString::new(mount.as_os_str().as_bytes())
        .map_err(|_| MapError::NotBpfFs(mount.display().to_string()))?;
    let mut st: libc::statfs = unsafe { mem::zeroed() };
    let ret = unsafe { libc::statfs(c.as_ptr(), &mut st) };
    if ret != 0 {
        return Err(MapError::BpfFsStat(io::Error::last_os_error()));
    }
    if st.f_type as i64 != BPF_FS_MAGIC {
        return Err(MapError::NotBpfFs(mount.display().to_string()));
    }
    Ok(())
}

impl MapSet {
    /// Opens or creates all six maps under `root` (the application's
    /// directory inside the bpf filesystem, e.g. `/sys/fs/bpf/cordon`).
    pub fn init(root: &Path) -> Result<Self, MapError> {
        let mount = root.parent().unwrap_or(root);
        ensure_bpffs(mount)?;
        fs::create_dir_all(root).map_err(MapError::PinDir)?;

        Ok(MapSet {
            inode: MapHandle::open_or_create(root, inode_map_spec())?,
            dir: MapHandle::open_or_create(root, dir_map_spec())?,
            basename: MapHandle::open_or_create(root, basename_map_spec())?,
            net_create: MapHandle::open_or_create(root, net_create_map_spec())?,
            net_tuple: MapHandle::open_or_create(root, net_tuple_map_spec())?,
            net_unix: MapHandle::open_or_create(root, net_unix_map_spec())?,
        })
    }

    /// Confirms every map still has its pin; absence is logged, not
    /// fatal, because the open fd keeps the map alive.
    pub fn verify_pins(&self) {
        for handle in self.handles() {
            if !handle.pin_path.exists() {
                warn!(
                    "map {} is not pinned at {}; restarts will not be able to adopt it",
                    handle.name(),
                    handle.pin_path.display()
                );
            }
        }
    }

    pub fn unpin_all(&self) {
        for handle in self.handles() {
            handle.unpin();
        }
    }

    fn handles(&self) -> [&MapHandle; 6] {
        [
            &self.inode,
            &self.dir,
            &self.basename,
            &self.net_create,
            &self.net_tuple,
            &self.net_unix,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_match_declared_wire_sizes() {
        assert_eq!(inode_map_spec().key_size, 24);
        assert_eq!(inode_map_spec().value_size, 4);
        assert_eq!(dir_map_spec().value_size, 8);
        assert_eq!(basename_map_spec().value_size, 3232);
        assert_eq!(net_create_map_spec().key_size, 24);
        assert_eq!(net_tuple_map_spec().key_size, 40);
        assert_eq!(net_unix_map_spec().key_size, 128);
    }

    #[test]
    fn tmpdir_is_not_bpffs() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ensure_bpffs(dir.path()),
            Err(MapError::NotBpfFs(_))
        ));
    }

    #[test]
    #[cfg_attr(not(feature = "tests_bpf"), ignore)]
    fn abi_mismatch_replaces_pinned_map() {
        let root = Path::new("/sys/fs/bpf/cordon-test");
        fs::create_dir_all(root).unwrap();

        // Pin a map whose value size disagrees with the inode map spec.
        let bogus = sys::map_create("policy_map", sys::BPF_MAP_TYPE_HASH, 24, 8, 16).unwrap();
        let pin = root.join("policy_map");
        let _ = fs::remove_file(&pin);
        sys::obj_pin(bogus.as_raw_fd(), &pin).unwrap();

        let handle = MapHandle::open_or_create(root, inode_map_spec()).unwrap();
        assert!(!handle.reused());
        let info = sys::map_info(handle.fd.as_raw_fd()).unwrap();
        assert_eq!(info.value_size, 4);

        handle.unpin();
        let _ = fs::remove_dir(root);
    }

    #[test]
    #[cfg_attr(not(feature = "tests_bpf"), ignore)]
    fn matching_pin_is_reused() {
        let root = Path::new("/sys/fs/bpf/cordon-test-reuse");
        fs::create_dir_all(root).unwrap();
        let _ = fs::remove_file(root.join("policy_map"));

        let first = MapHandle::open_or_create(root, inode_map_spec()).unwrap();
        assert!(!first.reused());
        let second = MapHandle::open_or_create(root, inode_map_spec()).unwrap();
        assert!(second.reused());

        second.unpin();
        let _ = fs::remove_dir(root);
    }
}

//! Thin wrapper around the bpf(2) command multiplex.
//!
//! Everything here is policy-free plumbing: typed command codes, the
//! per-command attribute structs and the handful of map operations the
//! rest of the crate needs. Batch deletion degrades to per-key deletion
//! on kernels without `BPF_MAP_DELETE_BATCH`.

use std::{
    ffi::CString,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
    slice,
};

use log::debug;
use plain::Plain;

/// Subset of bpf(2) commands used by cordon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum BpfCmd {
    MapCreate = 0,
    MapLookupElem = 1,
    MapUpdateElem = 2,
    MapDeleteElem = 3,
    ObjPin = 6,
    ObjGet = 7,
    ObjGetInfoByFd = 15,
    MapDeleteBatch = 27,
}

pub const BPF_MAP_TYPE_HASH: u32 = 1;

/// BPF_ANY: create a new element or update an existing one.
const BPF_ANY: u64 = 0;

const BPF_OBJ_NAME_LEN: usize = 16;

#[repr(C)]
struct MapCreateAttr {
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
    map_flags: u32,
    inner_map_fd: u32,
    numa_node: u32,
    map_name: [u8; BPF_OBJ_NAME_LEN],
}

#[repr(C)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    value: u64,
    flags: u64,
}

#[repr(C)]
struct MapBatchAttr {
    in_batch: u64,
    out_batch: u64,
    keys: u64,
    values: u64,
    count: u32,
    map_fd: u32,
    elem_flags: u64,
    flags: u64,
}

#[repr(C)]
struct ObjAttr {
    pathname: u64,
    bpf_fd: u32,
    file_flags: u32,
}

#[repr(C)]
struct ObjGetInfoAttr {
    bpf_fd: u32,
    info_len: u32,
    info: u64,
}

/// Leading fields of the kernel's `bpf_map_info`. The kernel truncates
/// its copy-out to `info_len`, so a prefix is enough for the ABI check.
#[derive(Debug, Copy, Clone, Default)]
#[repr(C)]
pub struct MapInfo {
    pub map_type: u32,
    pub id: u32,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub map_flags: u32,
    pub name: [u8; BPF_OBJ_NAME_LEN],
}

/// The single entry point: issues one bpf(2) command.
fn bpf<T>(cmd: BpfCmd, attr: &mut T) -> io::Result<i64> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd as libc::c_long,
            attr as *mut T as *mut libc::c_void,
            mem::size_of::<T>(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret)
}

pub(crate) fn bytes_of<T: Plain>(t: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(t as *const T as *const u8, mem::size_of::<T>()) }
}

pub(crate) fn bytes_of_mut<T: Plain>(t: &mut T) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(t as *mut T as *mut u8, mem::size_of::<T>()) }
}

pub(crate) fn bytes_of_slice<T: Plain>(ts: &[T]) -> &[u8] {
    unsafe { slice::from_raw_parts(ts.as_ptr() as *const u8, mem::size_of_val(ts)) }
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Creates an unpinned map.
pub fn map_create(
    name: &str,
    map_type: u32,
    key_size: u32,
    value_size: u32,
    max_entries: u32,
) -> io::Result<OwnedFd> {
    let mut map_name = [0u8; BPF_OBJ_NAME_LEN];
    let n = name.len().min(BPF_OBJ_NAME_LEN - 1);
    map_name[..n].copy_from_slice(&name.as_bytes()[..n]);

    let mut attr = MapCreateAttr {
        map_type,
        key_size,
        value_size,
        max_entries,
        map_flags: 0,
        inner_map_fd: 0,
        numa_node: 0,
        map_name,
    };
    let fd = bpf(BpfCmd::MapCreate, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Pins a BPF object (map or link fd) at a path inside the bpf
/// filesystem.
pub fn obj_pin(fd: RawFd, path: &Path) -> io::Result<()> {
    let pathname = path_cstring(path)?;
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        bpf_fd: fd as u32,
        file_flags: 0,
    };
    bpf(BpfCmd::ObjPin, &mut attr)?;
    Ok(())
}

/// Opens an already-pinned object.
pub fn obj_get(path: &Path) -> io::Result<OwnedFd> {
    let pathname = path_cstring(path)?;
    let mut attr = ObjAttr {
        pathname: pathname.as_ptr() as u64,
        bpf_fd: 0,
        file_flags: 0,
    };
    let fd = bpf(BpfCmd::ObjGet, &mut attr)?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
}

/// Reads the kernel-reported metadata of a map fd.
pub fn map_info(fd: RawFd) -> io::Result<MapInfo> {
    let mut info = MapInfo::default();
    let mut attr = ObjGetInfoAttr {
        bpf_fd: fd as u32,
        info_len: mem::size_of::<MapInfo>() as u32,
        info: &mut info as *mut MapInfo as u64,
    };
    bpf(BpfCmd::ObjGetInfoByFd, &mut attr)?;
    Ok(info)
}

/// Inserts or overwrites one element.
pub fn map_update_elem(fd: RawFd, key: &[u8], value: &[u8]) -> io::Result<()> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: value.as_ptr() as u64,
        flags: BPF_ANY,
    };
    bpf(BpfCmd::MapUpdateElem, &mut attr)?;
    Ok(())
}

/// Reads one element into `value`. Returns false when the key does not
/// exist.
pub fn map_lookup_elem(fd: RawFd, key: &[u8], value: &mut [u8]) -> io::Result<bool> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: value.as_mut_ptr() as u64,
        flags: 0,
    };
    match bpf(BpfCmd::MapLookupElem, &mut attr) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Deletes one element. Returns false when the key did not exist.
pub fn map_delete_elem(fd: RawFd, key: &[u8]) -> io::Result<bool> {
    let mut attr = MapElemAttr {
        map_fd: fd as u32,
        _pad: 0,
        key: key.as_ptr() as u64,
        value: 0,
        flags: 0,
    };
    match bpf(BpfCmd::MapDeleteElem, &mut attr) {
        Ok(_) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

fn delete_each(fd: RawFd, keys: &[u8], key_size: usize) -> io::Result<usize> {
    let mut deleted = 0;
    for key in keys.chunks_exact(key_size) {
        if map_delete_elem(fd, key)? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

/// Deletes a batch of fixed-size keys and returns how many existed and
/// were removed. Uses `BPF_MAP_DELETE_BATCH` where the kernel offers it;
/// kernels answering EINVAL/EOPNOTSUPP/ENOSYS get per-key deletion
/// instead. Keys absent from the map are skipped, not errors: the batch
/// resumes past them so that partial success is preserved.
pub fn map_delete_batch(fd: RawFd, keys: &[u8], key_size: usize) -> io::Result<usize> {
    assert!(key_size > 0 && keys.len() % key_size == 0);
    let total = keys.len() / key_size;
    if total == 0 {
        return Ok(0);
    }

    let mut deleted = 0usize;
    let mut idx = 0usize;
    while idx < total {
        let remaining = &keys[idx * key_size..];
        let mut attr = MapBatchAttr {
            in_batch: 0,
            out_batch: 0,
            keys: remaining.as_ptr() as u64,
            values: 0,
            count: (total - idx) as u32,
            map_fd: fd as u32,
            elem_flags: 0,
            flags: 0,
        };
        match bpf(BpfCmd::MapDeleteBatch, &mut attr) {
            Ok(_) => {
                deleted += attr.count as usize;
                break;
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                // attr.count elements were removed before the kernel hit
                // a key that is not in the map; step over it.
                deleted += attr.count as usize;
                idx += attr.count as usize + 1;
            }
            Err(e)
                if deleted == 0
                    && idx == 0
                    && matches!(
                        e.raw_os_error(),
                        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS)
                    ) =>
            {
                debug!("batch delete unavailable ({}), deleting per key", e);
                return delete_each(fd, keys, key_size);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_info_prefix_layout() {
        // Field offsets must match the head of the kernel's bpf_map_info.
        assert_eq!(mem::size_of::<MapInfo>(), 40);
    }

    #[test]
    #[cfg_attr(not(feature = "tests_bpf"), ignore)]
    fn create_update_delete_roundtrip() {
        let fd = map_create("cordon_test", BPF_MAP_TYPE_HASH, 8, 4, 16).expect("map_create");
        let key = 7u64;
        let value = 42u32;
        map_update_elem(fd.as_raw_fd(), bytes_of(&key), bytes_of(&value)).expect("update");

        let mut out = 0u32;
        assert!(map_lookup_elem(fd.as_raw_fd(), bytes_of(&key), bytes_of_mut(&mut out)).unwrap());
        assert_eq!(out, 42);

        assert!(map_delete_elem(fd.as_raw_fd(), bytes_of(&key)).unwrap());
        assert!(!map_delete_elem(fd.as_raw_fd(), bytes_of(&key)).unwrap());
    }

    #[test]
    #[cfg_attr(not(feature = "tests_bpf"), ignore)]
    fn batch_delete_absorbs_missing_keys() {
        let fd = map_create("cordon_test", BPF_MAP_TYPE_HASH, 8, 4, 16).expect("map_create");
        let present = [1u64, 3u64];
        for k in &present {
            map_update_elem(fd.as_raw_fd(), bytes_of(k), bytes_of(&0u32)).unwrap();
        }
        let keys = [1u64, 2u64, 3u64];
        let deleted =
            map_delete_batch(fd.as_raw_fd(), bytes_of_slice(&keys), mem::size_of::<u64>())
                .expect("batch delete");
        assert_eq!(deleted, present.len());
    }
}

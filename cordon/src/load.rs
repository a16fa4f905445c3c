//! Loading and attaching of the LSM enforcement programs.
//!
//! The programs themselves are built out-of-tree and shipped as an
//! object file; here they are loaded with the map pin directory so the
//! loader adopts the maps the handle set already owns, attached to
//! their hooks, and the enforcement links are pinned. A pinned link is
//! the liveness signal other processes must check for: a pinned map
//! with no pinned link is leftover state from a dead instance.

use std::{fs, io, path::Path};

use aya::{
    programs::{
        links::{FdLink, LinkError},
        Lsm, ProgramError,
    },
    Btf, BtfError, Ebpf, EbpfError, EbpfLoader,
};
use log::{debug, warn};
use thiserror::Error;

/// Pin name of the file enforcement link.
pub const FS_LSM_LINK: &str = "fs_lsm_link";

/// Pin name of the optional exec enforcement link.
pub const FS_LSM_EXEC_LINK: &str = "fs_lsm_exec_link";

/// Socket hooks attached when the object provides them. Their links are
/// not pinned; only the file links signal liveness.
static SOCKET_HOOKS: &[&str] = &[
    "socket_create",
    "socket_bind",
    "socket_connect",
    "socket_listen",
    "socket_accept",
    "socket_sendmsg",
    "unix_stream_connect",
];

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("could not read the program object: {0}")]
    IO(#[from] io::Error),

    #[error(transparent)]
    Ebpf(#[from] EbpfError),
}

/// Loads the enforcement object, pointing the loader at the pin
/// directory so that maps pinned there are adopted instead of
/// recreated.
pub fn load_object<P: AsRef<Path>, Q: AsRef<Path>>(object: P, pin_root: Q) -> Result<Ebpf, LoadError> {
    let data = fs::read(object)?;
    let bpf = EbpfLoader::new().map_pin_path(pin_root).load(&data)?;
    Ok(bpf)
}

#[derive(Error, Debug)]
pub enum AttachError {
    #[error(transparent)]
    Btf(#[from] BtfError),

    #[error(transparent)]
    Program(#[from] ProgramError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Pin(#[from] aya::pin::PinError),

    #[error("program {0} not found in the object")]
    ProgMissing(&'static str),
}

fn attach_pinned(
    bpf: &mut Ebpf,
    program: &'static str,
    hook: &'static str,
    btf: &Btf,
    pin: &Path,
) -> Result<(), AttachError> {
    let lsm: &mut Lsm = bpf
        .program_mut(program)
        .ok_or(AttachError::ProgMissing(program))?
        .try_into()?;
    lsm.load(hook, btf)?;
    let link_id = lsm.attach()?;
    let link = lsm.take_link(link_id)?;
    let fd_link: FdLink = link.try_into().unwrap();

    // A stale pin from a crashed instance would make the new pin fail.
    if let Err(e) = fs::remove_file(pin) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("could not remove stale link pin {}: {}", pin.display(), e);
        }
    }
    fd_link.pin(pin)?;
    Ok(())
}

/// Attaches the enforcement programs and pins the enforcement links.
/// Returns the pinned link paths so shutdown can unlink them.
pub fn attach_programs(
    bpf: &mut Ebpf,
    pin_root: &Path,
) -> Result<Vec<std::path::PathBuf>, AttachError> {
    let btf = Btf::from_sys_fs()?;
    let mut pinned = Vec::new();

    let fs_link = pin_root.join(FS_LSM_LINK);
    attach_pinned(bpf, "file_open", "file_open", &btf, &fs_link)?;
    pinned.push(fs_link);

    // The exec hook is optional; older objects ship without it.
    if bpf.program_mut("bprm_check_security").is_some() {
        let exec_link = pin_root.join(FS_LSM_EXEC_LINK);
        attach_pinned(
            bpf,
            "bprm_check_security",
            "bprm_check_security",
            &btf,
            &exec_link,
        )?;
        pinned.push(exec_link);
    } else {
        debug!("object has no exec enforcement program");
    }

    for hook in SOCKET_HOOKS.iter().copied() {
        match bpf.program_mut(hook) {
            Some(program) => {
                let lsm: &mut Lsm = program.try_into()?;
                lsm.load(hook, &btf)?;
                lsm.attach()?;
            }
            None => debug!("object has no {} program", hook),
        }
    }

    Ok(pinned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(not(feature = "tests_bpf"), ignore)]
    fn load_and_attach_bpf() {
        let root = Path::new("/sys/fs/bpf/cordon-test-load");
        fs::create_dir_all(root).expect("creating the pin dir failed");
        let mut bpf = load_object(Path::new("/usr/lib/cordon/cordon-lsm.bpf.o"), root)
            .expect("loading BPF failed");
        let pinned = attach_programs(&mut bpf, root).expect("attaching BPF programs failed");
        assert!(!pinned.is_empty());
        for pin in pinned {
            let _ = fs::remove_file(pin);
        }
        let _ = fs::remove_dir(root);
    }
}

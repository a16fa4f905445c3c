use std::{fs, io, path::Path};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CheckBpfLsmError {
    #[error("could not read the LSM list: {0}")]
    Io(#[from] io::Error),

    #[error("BPF LSM is not enabled (active LSMs: {0})")]
    BpfLsmDisabled(String),
}

/// Checks whether the BPF LSM is active by reading the comma-separated
/// LSM list the kernel exposes (usually
/// `/sys/kernel/security/lsm`). Inside containers that file can hide
/// the host state, so callers may skip this probe.
pub fn check_bpf_lsm_enabled<P: AsRef<Path>>(path: P) -> Result<(), CheckBpfLsmError> {
    let content = fs::read_to_string(path)?;
    if content.split(',').any(|lsm| lsm.trim() == "bpf") {
        return Ok(());
    }
    Err(CheckBpfLsmError::BpfLsmDisabled(
        content.trim_end().to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn detects_bpf_in_lsm_list() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "lockdown,capability,selinux,bpf").unwrap();
        assert!(check_bpf_lsm_enabled(f.path()).is_ok());
    }

    #[test]
    fn rejects_lsm_list_without_bpf() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "lockdown,capability,apparmor").unwrap();
        assert!(matches!(
            check_bpf_lsm_enabled(f.path()),
            Err(CheckBpfLsmError::BpfLsmDisabled(_))
        ));
    }

    #[test]
    fn missing_probe_file_is_an_io_error() {
        assert!(matches!(
            check_bpf_lsm_enabled("/nonexistent/lsm"),
            Err(CheckBpfLsmError::Io(_))
        ));
    }
}

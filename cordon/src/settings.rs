use std::path::PathBuf;

use config::{Config, ConfigError, File};
use serde::Deserialize;

static DEFAULT_BPFFS_ROOT: &str = "/sys/fs/bpf/cordon";
static DEFAULT_BPF_OBJECT: &str = "/usr/lib/cordon/cordon-lsm.bpf.o";
static DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/cordon";
static DEFAULT_LSM_PROBE: &str = "/sys/kernel/security/lsm";

/// Daemon settings, all overridable from `/etc/cordon/cordon.toml`.
/// Tests inject their own values instead of going through the file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    /// Directory inside the bpf filesystem holding our pinned objects.
    pub bpffs_root: PathBuf,
    /// Pre-built LSM program object. Its absence means enforcement is
    /// simply unavailable on this host.
    pub bpf_object: PathBuf,
    /// Directory whose per-container subdirectories are created by the
    /// cgroup collaborator; their inode numbers are the cgroup ids.
    pub cgroup_root: PathBuf,
    /// Kernel file listing the active LSMs.
    pub lsm_probe: PathBuf,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let mut s = Config::default();
        s.set_default("bpffs_root", DEFAULT_BPFFS_ROOT)?;
        s.set_default("bpf_object", DEFAULT_BPF_OBJECT)?;
        s.set_default("cgroup_root", DEFAULT_CGROUP_ROOT)?;
        s.set_default("lsm_probe", DEFAULT_LSM_PROBE)?;
        s.merge(File::with_name("/etc/cordon/cordon").required(false))?;
        s.try_into()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bpffs_root: PathBuf::from(DEFAULT_BPFFS_ROOT),
            bpf_object: PathBuf::from(DEFAULT_BPF_OBJECT),
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            lsm_probe: PathBuf::from(DEFAULT_LSM_PROBE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_matches_defaults() {
        let s = Settings::new().expect("failed to get settings");
        assert_eq!(s, Settings::default());
    }
}

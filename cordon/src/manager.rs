//! Process-wide enforcement state: the loaded programs, the map-handle
//! set, the per-container contexts and the metrics counters.
//!
//! One mutex serializes populate and cleanup across containers; the
//! deny-event consumer runs beside it and only touches the ring buffer
//! and its counter. When the BPF LSM is unavailable on the host, every
//! operation degrades to a silent no-op so that container lifecycles
//! proceed unconfined rather than fail.

use std::{
    collections::HashMap,
    fs, io,
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use aya::maps::RingBuf;
use aya::Ebpf;
use log::{debug, error, info, warn};
use plain::Plain;
use thiserror::Error;

use crate::{
    compiler::{self, CompiledRule},
    container::{self, ContainerContext, ContextError},
    events::DenyEventConsumer,
    load,
    maps::{MapError, MapHandle, MapSet},
    policy::{NetRule, Policy, SecurityLevel},
    settings::Settings,
    sysutils,
};
use cordon_common::{
    AccessFlags, BasenameValue, DirValue, InodeKey, NetCreateKey, NetFlags, NetTupleKey,
    NetUnixKey, DIR_FLAG_RECURSIVE, MAX_NET_RULES, MAX_PATHS, UNIX_PATH_LEN,
};

/// Name of the ring buffer map inside the enforcement object.
const DENY_RINGBUF: &str = "deny_events";

#[derive(Error, Debug)]
pub enum InitError {
    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    Load(#[from] load::LoadError),

    #[error(transparent)]
    Attach(#[from] load::AttachError),
}

#[derive(Error, Debug)]
pub enum PopulateError {
    #[error("invalid policy: {0}")]
    Precondition(String),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("manager state inconsistent: {0}")]
    Internal(&'static str),
}

#[derive(Error, Debug)]
pub enum CleanupError {
    #[error("batch delete on {map} failed: {source}")]
    BatchDelete {
        map: &'static str,
        #[source]
        source: io::Error,
    },
}

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("no context for container {0}")]
    UnknownContainer(String),
}

#[derive(Error, Debug)]
enum InstallError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Slots(#[from] compiler::SlotsFull),
}

impl InstallError {
    /// Map exhaustion; stops subtree walks.
    fn is_no_space(&self) -> bool {
        match self {
            InstallError::Io(e) => {
                matches!(e.raw_os_error(), Some(libc::E2BIG) | Some(libc::ENOSPC))
            }
            InstallError::Context(ContextError::KeyArrayFull(_, _)) => true,
            InstallError::Context(ContextError::CgroupResolve { .. }) => false,
            InstallError::Context(ContextError::CgroupZero(_)) => false,
            InstallError::Slots(_) => true,
        }
    }
}

/// Global counters, readable at any time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub containers: usize,
    pub populated_total: u64,
    pub populate_failures: u64,
    pub cleaned_total: u64,
    pub cleanup_failures: u64,
    pub deny_events_total: u64,
}

/// Per-container counters and timing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerMetrics {
    pub cgroup_id: u64,
    pub file_rules: usize,
    pub dir_rules: usize,
    pub basename_rules: usize,
    pub net_create_rules: usize,
    pub net_tuple_rules: usize,
    pub net_unix_rules: usize,
    pub last_populate: Option<Duration>,
}

struct ManagerState {
    available: bool,
    bpf: Option<Ebpf>,
    maps: Option<MapSet>,
    pinned_links: Vec<std::path::PathBuf>,
    consumer: Option<DenyEventConsumer>,
    containers: HashMap<String, ContainerContext>,
    populated_total: u64,
    populate_failures: u64,
    cleaned_total: u64,
    cleanup_failures: u64,
}

pub struct EnforcementManager {
    settings: Settings,
    deny_events: Arc<AtomicU64>,
    state: Mutex<ManagerState>,
}

impl EnforcementManager {
    pub fn new(settings: Settings) -> Self {
        EnforcementManager {
            settings,
            deny_events: Arc::new(AtomicU64::new(0)),
            state: Mutex::new(ManagerState {
                available: false,
                bpf: None,
                maps: None,
                pinned_links: Vec::new(),
                consumer: None,
                containers: HashMap::new(),
                populated_total: 0,
                populate_failures: 0,
                cleaned_total: 0,
                cleanup_failures: 0,
            }),
        }
    }

    /// Brings enforcement up: map adoption, program load, hook attach,
    /// link pinning, deny-event consumer. A host without the BPF LSM
    /// (or without the program object, or without a bpf filesystem)
    /// leaves the manager unavailable and returns success; real
    /// failures past those probes are surfaced.
    pub fn initialize(&self) -> Result<(), InitError> {
        let mut state = self.state.lock().unwrap();
        if state.available {
            return Ok(());
        }

        if !cfg!(target_os = "linux") {
            info!("not a Linux host; LSM enforcement stays off");
            return Ok(());
        }
        if !self.settings.bpf_object.exists() {
            info!(
                "enforcement object {} not present; containers will run unconfined",
                self.settings.bpf_object.display()
            );
            return Ok(());
        }
        if let Err(e) = sysutils::check_bpf_lsm_enabled(&self.settings.lsm_probe) {
            info!("BPF LSM unavailable: {}; containers will run unconfined", e);
            return Ok(());
        }

        let maps = match MapSet::init(&self.settings.bpffs_root) {
            Ok(maps) => maps,
            Err(e @ (MapError::BpfFsStat(_) | MapError::NotBpfFs(_))) => {
                info!("{}; containers will run unconfined", e);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        // From here on a failure must not leave half-initialized pins
        // behind.
        let maps = scopeguard::guard(maps, |maps| maps.unpin_all());

        let mut bpf = load::load_object(&self.settings.bpf_object, &self.settings.bpffs_root)?;
        let pinned_links = match load::attach_programs(&mut bpf, &self.settings.bpffs_root) {
            Ok(pinned) => pinned,
            Err(e) => {
                for name in [load::FS_LSM_LINK, load::FS_LSM_EXEC_LINK] {
                    let _ = fs::remove_file(self.settings.bpffs_root.join(name));
                }
                return Err(e.into());
            }
        };
        maps.verify_pins();

        let consumer = match bpf.take_map(DENY_RINGBUF) {
            Some(map) => match RingBuf::try_from(map) {
                Ok(ring) => Some(DenyEventConsumer::spawn(ring, self.deny_events.clone())),
                Err(e) => {
                    warn!("deny event ring buffer unusable: {}", e);
                    None
                }
            },
            None => {
                debug!("object has no {} ring buffer", DENY_RINGBUF);
                None
            }
        };

        state.maps = Some(scopeguard::ScopeGuard::into_inner(maps));
        state.bpf = Some(bpf);
        state.pinned_links = pinned_links;
        state.consumer = consumer;
        state.available = true;
        info!(
            "LSM enforcement live under {}",
            self.settings.bpffs_root.display()
        );
        Ok(())
    }

    /// Unlinks every pinned object, stops the deny-event consumer and
    /// drops the loaded program set.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(mut consumer) = state.consumer.take() {
            consumer.stop();
        }
        for pin in state.pinned_links.drain(..) {
            if let Err(e) = fs::remove_file(&pin) {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("could not unlink {}: {}", pin.display(), e);
                }
            }
        }
        if let Some(maps) = state.maps.take() {
            maps.unpin_all();
        }
        state.bpf = None;
        state.containers.clear();
        state.available = false;
        debug!("LSM enforcement shut down");
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().unwrap().available
    }

    /// Compiles and installs a policy for one container. Per-rule
    /// trouble (a path that does not exist in this rootfs, an exhausted
    /// basename slot) is logged and skipped: the LSM default-denies, so
    /// a missing allow rule shows up as a runtime denial, not a breach.
    pub fn populate_policy(
        &self,
        container_id: &str,
        rootfs: &Path,
        policy: &Policy,
    ) -> Result<(), PopulateError> {
        let mut state = self.state.lock().unwrap();
        if !state.available {
            debug!(
                "LSM enforcement unavailable; container {} runs unconfined",
                container_id
            );
            return Ok(());
        }

        if let Err(e) = check_preconditions(rootfs, policy) {
            state.populate_failures += 1;
            return Err(e);
        }
        if policy.level == SecurityLevel::Privileged {
            info!("container {} is privileged, not confining it", container_id);
            return Ok(());
        }

        let started = Instant::now();
        match populate_into(&self.settings, &mut state, container_id, rootfs, policy) {
            Ok(installed) => {
                state.populated_total += 1;
                let elapsed = started.elapsed();
                if let Some(cx) = state.containers.get_mut(container_id) {
                    cx.last_populate = Some(elapsed);
                }
                info!(
                    "installed {} rules for container {} in {:?}",
                    installed, container_id, elapsed
                );
                Ok(())
            }
            Err(e) => {
                state.populate_failures += 1;
                Err(e)
            }
        }
    }

    /// Removes every rule recorded for the container. Success when no
    /// context exists; the context is dropped even when a batch delete
    /// fails, so repeated cleanup cannot leak memory.
    pub fn cleanup_policy(&self, container_id: &str) -> Result<(), CleanupError> {
        let mut state = self.state.lock().unwrap();
        if !state.available {
            return Ok(());
        }

        let started = Instant::now();
        let cx = match state.containers.remove(container_id) {
            Some(cx) => cx,
            None => {
                debug!("no context for container {}, nothing to clean", container_id);
                return Ok(());
            }
        };
        let maps = match state.maps.as_ref() {
            Some(maps) => maps,
            None => return Ok(()),
        };

        let mut failure: Option<(&'static str, io::Error)> = None;
        delete_kind(&maps.inode, cx.file_keys.as_slice(), &mut failure);
        delete_kind(&maps.dir, cx.dir_keys.as_slice(), &mut failure);
        delete_kind(&maps.basename, cx.basename_keys.as_slice(), &mut failure);
        delete_kind(&maps.net_create, cx.net_create_keys.as_slice(), &mut failure);
        delete_kind(&maps.net_tuple, cx.net_tuple_keys.as_slice(), &mut failure);
        delete_kind(&maps.net_unix, cx.net_unix_keys.as_slice(), &mut failure);

        match failure {
            Some((map, source)) => {
                state.cleanup_failures += 1;
                Err(CleanupError::BatchDelete { map, source })
            }
            None => {
                state.cleaned_total += 1;
                debug!(
                    "cleaned up container {} in {:?}",
                    container_id,
                    started.elapsed()
                );
                Ok(())
            }
        }
    }

    pub fn metrics(&self) -> Metrics {
        let state = self.state.lock().unwrap();
        Metrics {
            containers: state.containers.len(),
            populated_total: state.populated_total,
            populate_failures: state.populate_failures,
            cleaned_total: state.cleaned_total,
            cleanup_failures: state.cleanup_failures,
            deny_events_total: self.deny_events.load(Ordering::Relaxed),
        }
    }

    pub fn container_metrics(&self, container_id: &str) -> Result<ContainerMetrics, MetricsError> {
        let state = self.state.lock().unwrap();
        let cx = state
            .containers
            .get(container_id)
            .ok_or_else(|| MetricsError::UnknownContainer(container_id.to_string()))?;
        Ok(ContainerMetrics {
            cgroup_id: cx.cgroup_id,
            file_rules: cx.file_keys.len(),
            dir_rules: cx.dir_keys.len(),
            basename_rules: cx.basename_keys.len(),
            net_create_rules: cx.net_create_keys.len(),
            net_tuple_rules: cx.net_tuple_keys.len(),
            net_unix_rules: cx.net_unix_keys.len(),
            last_populate: cx.last_populate,
        })
    }
}

impl Drop for EnforcementManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn check_preconditions(rootfs: &Path, policy: &Policy) -> Result<(), PopulateError> {
    if !rootfs.is_absolute() {
        return Err(PopulateError::Precondition(format!(
            "rootfs {} is not absolute",
            rootfs.display()
        )));
    }
    if policy.paths.len() > MAX_PATHS {
        return Err(PopulateError::Precondition(format!(
            "{} path rules exceed the {} limit",
            policy.paths.len(),
            MAX_PATHS
        )));
    }
    if policy.net_rules.len() > MAX_NET_RULES {
        return Err(PopulateError::Precondition(format!(
            "{} net rules exceed the {} limit",
            policy.net_rules.len(),
            MAX_NET_RULES
        )));
    }
    Ok(())
}

fn populate_into(
    settings: &Settings,
    state: &mut ManagerState,
    container_id: &str,
    rootfs: &Path,
    policy: &Policy,
) -> Result<usize, PopulateError> {
    let cgroup_id = container::resolve_cgroup_id(&settings.cgroup_root, container_id)?;

    let ManagerState {
        maps, containers, ..
    } = state;
    let maps = maps
        .as_ref()
        .ok_or(PopulateError::Internal("map set missing while available"))?;
    let cx = containers
        .entry(container_id.to_string())
        .or_insert_with(|| ContainerContext::new(container_id, cgroup_id));
    let before = cx.installed();

    for path_rule in &policy.paths {
        let compiled = match compiler::compile_pattern(rootfs, &path_rule.pattern, path_rule.access)
        {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!("skipping pattern {}: {}", path_rule.pattern, e);
                continue;
            }
        };
        for rule in &compiled {
            if let Err(e) = install_rule(maps, cx, cgroup_id, rule) {
                warn!(
                    "could not install a rule for pattern {}: {}",
                    path_rule.pattern, e
                );
            }
        }
    }

    for net_rule in &policy.net_rules {
        if let Err(e) = install_net_rule(maps, cx, cgroup_id, net_rule) {
            warn!("could not install a net rule: {}", e);
        }
    }

    Ok(cx.installed() - before)
}

/// Read-modify-write of an allow mask so that repeated installs union
/// their permissions instead of overwriting them.
fn or_update<K: Plain + Copy>(map: &MapHandle, key: &K, allow: u32) -> io::Result<()> {
    let mut current: u32 = 0;
    let mask = if map.lookup(key, &mut current)? {
        current | allow
    } else {
        allow
    };
    map.update(key, &mask)
}

fn install_rule(
    maps: &MapSet,
    cx: &mut ContainerContext,
    cgroup: u64,
    rule: &CompiledRule,
) -> Result<(), InstallError> {
    match rule {
        CompiledRule::Inode { dev, ino, access } => {
            let key = InodeKey {
                cgroup,
                dev: *dev,
                ino: *ino,
            };
            or_update(&maps.inode, &key, *access)?;
            cx.file_keys.record(key)?;
        }
        CompiledRule::Dir {
            path,
            dev,
            ino,
            access,
            flags,
        } => {
            let key = InodeKey {
                cgroup,
                dev: *dev,
                ino: *ino,
            };
            let mut current = DirValue {
                access: 0,
                flags: 0,
            };
            let value = if maps.dir.lookup(&key, &mut current)? {
                DirValue {
                    access: current.access | access,
                    flags: current.flags | flags,
                }
            } else {
                DirValue {
                    access: *access,
                    flags: *flags,
                }
            };
            match maps.dir.update(&key, &value) {
                Ok(()) => {
                    cx.dir_keys.record(key)?;
                }
                Err(e) if flags & DIR_FLAG_RECURSIVE != 0 => {
                    warn!(
                        "could not install a recursive rule for {}: {}; walking the subtree",
                        path.display(),
                        e
                    );
                    install_subtree(maps, cx, cgroup, path, *access);
                }
                Err(e) => return Err(e.into()),
            }
        }
        CompiledRule::Basename {
            dir_dev,
            dir_ino,
            rule,
        } => {
            let key = InodeKey {
                cgroup,
                dev: *dir_dev,
                ino: *dir_ino,
            };
            let mut slots = BasenameValue::EMPTY;
            maps.basename.lookup(&key, &mut slots)?;
            compiler::merge_basename(&mut slots, rule)?;
            maps.basename.update(&key, &slots)?;
            cx.basename_keys.record(key)?;
        }
    }
    Ok(())
}

/// Per-inode fallback when a recursive directory rule cannot be
/// installed. Exhausted map or context space stops the walk; any other
/// per-file failure only loses that file.
fn install_subtree(
    maps: &MapSet,
    cx: &mut ContainerContext,
    cgroup: u64,
    dir: &Path,
    access: u32,
) {
    let expanded = compiler::expand_subtree(dir, AccessFlags::from_bits_truncate(access));
    for rule in &expanded {
        match install_rule(maps, cx, cgroup, rule) {
            Ok(()) => {}
            Err(e) if e.is_no_space() => {
                warn!(
                    "stopping the walk under {}: no space left ({})",
                    dir.display(),
                    e
                );
                break;
            }
            Err(e) => warn!("skipping an entry under {}: {}", dir.display(), e),
        }
    }
}

fn install_net_rule(
    maps: &MapSet,
    cx: &mut ContainerContext,
    cgroup: u64,
    rule: &NetRule,
) -> Result<(), InstallError> {
    let allow = rule.allow.bits();

    if rule.allow.contains(NetFlags::CREATE) {
        let key = NetCreateKey {
            cgroup,
            family: rule.family,
            sock_type: rule.sock_type,
            protocol: rule.protocol,
            _pad: 0,
        };
        or_update(&maps.net_create, &key, allow)?;
        cx.net_create_keys.record(key)?;
    }

    let endpoint_bits = rule.allow & !NetFlags::CREATE;
    if endpoint_bits.is_empty() {
        return Ok(());
    }

    if rule.family == libc::AF_UNIX as u32 {
        let path = match &rule.unix_path {
            Some(path) => path,
            None => {
                warn!("unix net rule without a path, skipping its endpoint bits");
                return Ok(());
            }
        };
        let key = match unix_key(cgroup, rule, path) {
            Some(key) => key,
            None => {
                warn!("unix socket path {} is too long, skipping", path);
                return Ok(());
            }
        };
        or_update(&maps.net_unix, &key, allow)?;
        cx.net_unix_keys.record(key)?;
    } else {
        let key = NetTupleKey {
            cgroup,
            family: rule.family,
            sock_type: rule.sock_type,
            protocol: rule.protocol,
            port: rule.port,
            _pad: 0,
            addr: rule.addr,
        };
        or_update(&maps.net_tuple, &key, allow)?;
        cx.net_tuple_keys.record(key)?;
    }
    Ok(())
}

fn unix_key(cgroup: u64, rule: &NetRule, path: &str) -> Option<NetUnixKey> {
    let (is_abstract, bytes) = match path.strip_prefix('@') {
        Some(rest) => (1u8, rest.as_bytes()),
        None => (0u8, path.as_bytes()),
    };
    if bytes.len() > UNIX_PATH_LEN {
        return None;
    }
    let mut key = NetUnixKey {
        cgroup,
        sock_type: rule.sock_type,
        protocol: rule.protocol,
        is_abstract,
        path_len: bytes.len() as u8,
        path: [0; UNIX_PATH_LEN],
        _pad: [0; 2],
    };
    key.path[..bytes.len()].copy_from_slice(bytes);
    Some(key)
}

fn delete_kind<K: Plain + Copy>(
    map: &MapHandle,
    keys: &[K],
    failure: &mut Option<(&'static str, io::Error)>,
) {
    if keys.is_empty() {
        return;
    }
    match map.delete_batch(keys) {
        Ok(deleted) => debug!(
            "removed {} of {} keys from {}",
            deleted,
            keys.len(),
            map.name()
        ),
        Err(e) => {
            error!("batch delete on {} failed: {}", map.name(), e);
            if failure.is_none() {
                *failure = Some((map.name(), e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Backend;
    use std::path::PathBuf;

    fn unavailable_manager() -> EnforcementManager {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            bpffs_root: dir.path().join("bpf"),
            bpf_object: dir.path().join("missing.bpf.o"),
            cgroup_root: dir.path().join("cgroup"),
            lsm_probe: dir.path().join("lsm"),
        };
        EnforcementManager::new(settings)
    }

    #[test]
    fn initialize_without_object_downgrades() {
        let manager = unavailable_manager();
        manager.initialize().expect("initialize should succeed");
        assert!(!manager.is_available());
    }

    #[test]
    fn unavailable_populate_and_cleanup_are_silent_noops() {
        let manager = unavailable_manager();
        manager.initialize().unwrap();

        let policy = Backend::Lsm.build(&["minimal"]).unwrap();
        manager
            .populate_policy("c1", Path::new("/tmp"), &policy)
            .expect("populate must succeed when unavailable");
        manager
            .cleanup_policy("c1")
            .expect("cleanup must succeed when unavailable");

        let metrics = manager.metrics();
        assert_eq!(metrics.containers, 0);
        assert_eq!(metrics.populated_total, 0);
        assert_eq!(metrics.cleaned_total, 0);
        assert!(matches!(
            manager.container_metrics("c1"),
            Err(MetricsError::UnknownContainer(_))
        ));
    }

    #[test]
    fn populate_before_initialize_is_a_silent_noop() {
        let manager = unavailable_manager();
        let policy = Backend::Lsm.build(&["minimal"]).unwrap();
        manager
            .populate_policy("c1", Path::new("/tmp"), &policy)
            .unwrap();
        assert_eq!(manager.metrics(), Metrics::default());
    }

    #[test]
    fn shutdown_on_unavailable_manager_is_harmless() {
        let manager = unavailable_manager();
        manager.initialize().unwrap();
        manager.shutdown();
        assert!(!manager.is_available());
    }

    #[test]
    fn unix_key_handles_the_abstract_namespace() {
        let rule = NetRule::unix(
            libc::SOCK_STREAM as u32,
            "@cordon-test",
            NetFlags::CONNECT | NetFlags::CREATE,
        );
        let key = unix_key(9, &rule, "@cordon-test").unwrap();
        assert_eq!(key.is_abstract, 1);
        assert_eq!(key.path_len as usize, "cordon-test".len());
        assert_eq!(&key.path[..11], b"cordon-test");

        let rule = NetRule::unix(libc::SOCK_STREAM as u32, "/run/x.sock", NetFlags::CONNECT);
        let key = unix_key(9, &rule, "/run/x.sock").unwrap();
        assert_eq!(key.is_abstract, 0);
    }

    #[test]
    fn unix_key_rejects_overlong_paths() {
        let long = format!("/{}", "x".repeat(UNIX_PATH_LEN + 1));
        let rule = NetRule::unix(libc::SOCK_STREAM as u32, &long, NetFlags::CONNECT);
        assert!(unix_key(9, &rule, &long).is_none());
    }

    #[test]
    fn preconditions_reject_oversized_policies() {
        let mut policy = Backend::Lsm.build(&["minimal"]).unwrap();
        policy.paths = (0..MAX_PATHS + 1)
            .map(|i| crate::policy::PathRule {
                pattern: format!("/p{}", i),
                access: AccessFlags::READ,
            })
            .collect();
        assert!(matches!(
            check_preconditions(Path::new("/tmp"), &policy),
            Err(PopulateError::Precondition(_))
        ));

        let policy = Backend::Lsm.build(&["minimal"]).unwrap();
        assert!(check_preconditions(Path::new("/tmp"), &policy).is_ok());
        assert!(matches!(
            check_preconditions(PathBuf::from("relative").as_path(), &policy),
            Err(PopulateError::Precondition(_))
        ));
    }
}

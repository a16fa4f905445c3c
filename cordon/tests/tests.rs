//! End-to-end scenarios against a real kernel. These need a bpffs
//! mount, the BPF LSM enabled and the pre-built enforcement object, so
//! they are gated behind the `tests_bpf` feature like the rest of the
//! kernel-facing tests.

use std::{fs, path::PathBuf};

use cordon::{Backend, EnforcementManager, Settings};

fn test_settings(tag: &str) -> (tempfile::TempDir, Settings) {
    let scratch = tempfile::tempdir().expect("tempdir");
    let settings = Settings {
        bpffs_root: PathBuf::from("/sys/fs/bpf").join(format!("cordon-{}", tag)),
        bpf_object: PathBuf::from("/usr/lib/cordon/cordon-lsm.bpf.o"),
        cgroup_root: scratch.path().join("cgroup"),
        lsm_probe: PathBuf::from("/sys/kernel/security/lsm"),
    };
    fs::create_dir_all(&settings.cgroup_root).unwrap();
    (scratch, settings)
}

fn fixture_rootfs(scratch: &tempfile::TempDir) -> PathBuf {
    let rootfs = scratch.path().join("rootfs");
    for dir in ["bin", "lib", "etc", "dev", "tmp", "opt/app"] {
        fs::create_dir_all(rootfs.join(dir)).unwrap();
    }
    for file in ["dev/null", "dev/zero", "etc/hosts", "lib/lib0.so"] {
        fs::File::create(rootfs.join(file)).unwrap();
    }
    rootfs
}

#[test]
fn fallback_populate_cleanup_succeed_without_lsm() {
    // No kernel requirements: the object path points nowhere, so the
    // manager must stay unavailable and both operations must be silent
    // successes.
    let scratch = tempfile::tempdir().unwrap();
    let settings = Settings {
        bpffs_root: scratch.path().join("bpf"),
        bpf_object: scratch.path().join("absent.bpf.o"),
        cgroup_root: scratch.path().join("cgroup"),
        lsm_probe: scratch.path().join("lsm"),
    };
    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");
    assert!(!manager.is_available());

    let rootfs = fixture_rootfs(&scratch);
    let policy = Backend::Lsm.build(&["minimal", "build"]).unwrap();
    manager
        .populate_policy("c0", &rootfs, &policy)
        .expect("populate");
    manager.cleanup_policy("c0").expect("cleanup");
    assert_eq!(manager.metrics().containers, 0);
    manager.shutdown();
}

#[test]
#[cfg_attr(not(feature = "tests_bpf"), ignore)]
fn populate_then_cleanup_restores_empty_state() {
    let (scratch, settings) = test_settings("e2e");
    fs::create_dir_all(settings.cgroup_root.join("c1")).unwrap();
    let rootfs = fixture_rootfs(&scratch);

    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");
    assert!(manager.is_available());

    let policy = Backend::Lsm.build(&["minimal", "build"]).unwrap();
    manager
        .populate_policy("c1", &rootfs, &policy)
        .expect("populate");
    let metrics = manager.container_metrics("c1").expect("container metrics");
    assert!(metrics.file_rules + metrics.dir_rules > 0);

    manager.cleanup_policy("c1").expect("cleanup");
    assert!(manager.container_metrics("c1").is_err());
    assert_eq!(manager.metrics().cleaned_total, 1);
    manager.shutdown();
}

#[test]
#[cfg_attr(not(feature = "tests_bpf"), ignore)]
fn recursive_pattern_installs_one_dir_rule() {
    let (scratch, settings) = test_settings("recursive");
    fs::create_dir_all(settings.cgroup_root.join("c2")).unwrap();
    let rootfs = fixture_rootfs(&scratch);

    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");

    let mut policy = Backend::Lsm.build(&[]).unwrap();
    policy.paths.push(cordon::policy::PathRule {
        pattern: "/opt/app/**".to_string(),
        access: cordon_common::AccessFlags::READ,
    });
    manager.populate_policy("c2", &rootfs, &policy).unwrap();

    let metrics = manager.container_metrics("c2").unwrap();
    assert_eq!(metrics.dir_rules, 1);
    assert_eq!(metrics.file_rules, 0);

    manager.cleanup_policy("c2").unwrap();
    manager.shutdown();
}

#[test]
#[cfg_attr(not(feature = "tests_bpf"), ignore)]
fn digit_pattern_installs_one_basename_rule() {
    let (scratch, settings) = test_settings("basename");
    fs::create_dir_all(settings.cgroup_root.join("c3")).unwrap();
    let rootfs = fixture_rootfs(&scratch);

    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");

    let mut policy = Backend::Lsm.build(&[]).unwrap();
    policy.paths.push(cordon::policy::PathRule {
        pattern: "/etc/lib[0-9].so".to_string(),
        access: cordon_common::AccessFlags::READ,
    });
    manager.populate_policy("c3", &rootfs, &policy).unwrap();

    let metrics = manager.container_metrics("c3").unwrap();
    assert_eq!(metrics.basename_rules, 1);

    manager.cleanup_policy("c3").unwrap();
    manager.shutdown();
}

#[test]
#[cfg_attr(not(feature = "tests_bpf"), ignore)]
fn connect_rule_lands_in_create_and_tuple_maps() {
    use cordon_common::NetFlags;

    let (scratch, settings) = test_settings("net");
    fs::create_dir_all(settings.cgroup_root.join("c4")).unwrap();
    let rootfs = fixture_rootfs(&scratch);

    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");

    let mut policy = Backend::Lsm.build(&[]).unwrap();
    policy.net_rules.push(cordon::policy::NetRule::inet(
        libc::AF_INET as u32,
        libc::SOCK_STREAM as u32,
        libc::IPPROTO_TCP as u32,
        443,
        NetFlags::CREATE | NetFlags::CONNECT,
    ));
    manager.populate_policy("c4", &rootfs, &policy).unwrap();

    let metrics = manager.container_metrics("c4").unwrap();
    assert_eq!(metrics.net_create_rules, 1);
    assert_eq!(metrics.net_tuple_rules, 1);

    manager.cleanup_policy("c4").unwrap();
    assert!(manager.container_metrics("c4").is_err());
    manager.shutdown();
}

#[test]
#[cfg_attr(not(feature = "tests_bpf"), ignore)]
fn containers_are_isolated() {
    let (scratch, settings) = test_settings("isolation");
    for c in ["a1", "b1"] {
        fs::create_dir_all(settings.cgroup_root.join(c)).unwrap();
    }
    let rootfs = fixture_rootfs(&scratch);

    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");

    let policy = Backend::Lsm.build(&["minimal"]).unwrap();
    manager.populate_policy("a1", &rootfs, &policy).unwrap();
    manager.populate_policy("b1", &rootfs, &policy).unwrap();
    let b_before = manager.container_metrics("b1").unwrap();

    manager.cleanup_policy("a1").unwrap();
    let b_after = manager.container_metrics("b1").unwrap();
    assert_eq!(b_before, b_after);

    manager.cleanup_policy("b1").unwrap();
    manager.shutdown();
}

#[test]
#[cfg_attr(not(feature = "tests_bpf"), ignore)]
fn repopulating_without_cleanup_is_bounded() {
    let (scratch, settings) = test_settings("repopulate");
    fs::create_dir_all(settings.cgroup_root.join("c5")).unwrap();
    let rootfs = fixture_rootfs(&scratch);

    let manager = EnforcementManager::new(settings);
    manager.initialize().expect("initialize");

    let policy = Backend::Lsm.build(&["minimal", "network"]).unwrap();
    manager.populate_policy("c5", &rootfs, &policy).unwrap();
    let first = manager.container_metrics("c5").unwrap();
    manager.populate_policy("c5", &rootfs, &policy).unwrap();
    let second = manager.container_metrics("c5").unwrap();

    assert_eq!(first.file_rules, second.file_rules);
    assert_eq!(first.dir_rules, second.dir_rules);
    assert_eq!(first.net_tuple_rules, second.net_tuple_rules);

    manager.cleanup_policy("c5").unwrap();
    manager.shutdown();
}

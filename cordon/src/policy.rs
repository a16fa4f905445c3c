//! Policy objects and the profile-based builders.
//!
//! A policy is assembled from named profiles whose contents are baked
//! into the binary. Profiles are additive and unordered. The same
//! policy shape serves both enforcement backends: the LSM backend
//! consumes the path and network rules, the syscall-filter backend
//! consumes the syscall list.

use std::collections::HashMap;

use lazy_static::lazy_static;
use thiserror::Error;

use cordon_common::{AccessFlags, NetFlags, MAX_NET_RULES, MAX_PATHS};

/// Enforcement strictness, carried alongside the rule lists.
/// Privileged containers are exempt from LSM confinement.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecurityLevel {
    Baseline,
    Restricted,
    Privileged,
}

/// One allow pattern with its access mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub pattern: String,
    pub access: AccessFlags,
}

impl PathRule {
    fn new(pattern: &str, access: AccessFlags) -> Self {
        PathRule {
            pattern: pattern.to_string(),
            access,
        }
    }
}

/// One network rule. `addr`/`addr_len` describe the permitted endpoint
/// for INET families; `unix_path` (leading `@` marks the abstract
/// namespace) describes AF_UNIX endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetRule {
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
    pub port: u16,
    pub addr: [u8; 16],
    pub addr_len: u8,
    pub unix_path: Option<String>,
    pub allow: NetFlags,
}

impl NetRule {
    /// An INET/INET6 rule. A zero port or an all-zero address means
    /// "any" to the kernel-side matcher.
    pub fn inet(family: u32, sock_type: u32, protocol: u32, port: u16, allow: NetFlags) -> Self {
        NetRule {
            family,
            sock_type,
            protocol,
            port,
            addr: [0; 16],
            addr_len: 0,
            unix_path: None,
            allow,
        }
    }

    pub fn unix(sock_type: u32, path: &str, allow: NetFlags) -> Self {
        NetRule {
            family: libc::AF_UNIX as u32,
            sock_type,
            protocol: 0,
            port: 0,
            addr: [0; 16],
            addr_len: 0,
            unix_path: Some(path.to_string()),
            allow,
        }
    }
}

/// Which enforcement backend a built policy is destined for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Backend {
    Seccomp,
    Lsm,
}

/// Compiled user intent for one container.
#[derive(Debug, Clone)]
pub struct Policy {
    pub backend: Backend,
    pub level: SecurityLevel,
    pub paths: Vec<PathRule>,
    pub net_rules: Vec<NetRule>,
    pub syscalls: Vec<&'static str>,
}

impl Policy {
    pub fn with_level(mut self, level: SecurityLevel) -> Self {
        self.level = level;
        self
    }
}

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("unknown profile {0}")]
    UnknownProfile(String),

    #[error("profiles expand to {0} path rules, more than the {MAX_PATHS} limit")]
    TooManyPaths(usize),

    #[error("profiles expand to {0} net rules, more than the {MAX_NET_RULES} limit")]
    TooManyNetRules(usize),
}

struct Profile {
    paths: Vec<PathRule>,
    net_rules: Vec<NetRule>,
    syscalls: Vec<&'static str>,
}

fn minimal_profile() -> Profile {
    let rx = AccessFlags::READ | AccessFlags::EXEC;
    let rw = AccessFlags::READ | AccessFlags::WRITE;
    Profile {
        paths: vec![
            PathRule::new("/bin", rx),
            PathRule::new("/sbin", rx),
            PathRule::new("/lib", rx),
            PathRule::new("/lib64", rx),
            PathRule::new("/usr/bin", rx),
            PathRule::new("/usr/sbin", rx),
            PathRule::new("/usr/lib", rx),
            PathRule::new("/etc", AccessFlags::READ),
            PathRule::new("/dev/null", rw),
            PathRule::new("/dev/zero", AccessFlags::READ),
            PathRule::new("/dev/full", AccessFlags::WRITE),
            PathRule::new("/dev/urandom", AccessFlags::READ),
            PathRule::new("/dev/random", AccessFlags::READ),
            PathRule::new("/dev/tty", rw),
            PathRule::new("/tmp/**", rw | AccessFlags::EXEC),
            PathRule::new("/proc/self", AccessFlags::READ),
        ],
        net_rules: Vec::new(),
        syscalls: vec![
            "read",
            "write",
            "openat",
            "close",
            "fstat",
            "newfstatat",
            "lseek",
            "mmap",
            "mprotect",
            "munmap",
            "brk",
            "rt_sigaction",
            "rt_sigprocmask",
            "rt_sigreturn",
            "ioctl",
            "getdents64",
            "getcwd",
            "futex",
            "getpid",
            "gettid",
            "exit",
            "exit_group",
            "clock_gettime",
            "nanosleep",
        ],
    }
}

fn build_profile() -> Profile {
    let rx = AccessFlags::READ | AccessFlags::EXEC;
    let rw = AccessFlags::READ | AccessFlags::WRITE;
    Profile {
        paths: vec![
            PathRule::new("/usr/include/**", AccessFlags::READ),
            PathRule::new("/usr/share", AccessFlags::READ),
            PathRule::new("/usr/libexec", rx),
            PathRule::new("/opt", rx),
            PathRule::new("/var/tmp", rw),
        ],
        net_rules: Vec::new(),
        syscalls: vec![
            "clone",
            "clone3",
            "execve",
            "execveat",
            "fork",
            "vfork",
            "wait4",
            "waitid",
            "pipe2",
            "dup",
            "dup3",
            "fcntl",
            "chdir",
            "fchdir",
            "mkdirat",
            "unlinkat",
            "renameat2",
            "linkat",
            "symlinkat",
            "readlinkat",
            "fchmod",
            "fchmodat",
            "fchownat",
            "utimensat",
            "ftruncate",
            "fallocate",
            "fsync",
            "fdatasync",
            "flock",
        ],
    }
}

fn network_profile() -> Profile {
    let inet = libc::AF_INET as u32;
    let inet6 = libc::AF_INET6 as u32;
    let stream = libc::SOCK_STREAM as u32;
    let dgram = libc::SOCK_DGRAM as u32;
    let tcp = libc::IPPROTO_TCP as u32;
    let udp = libc::IPPROTO_UDP as u32;
    let client = NetFlags::CREATE | NetFlags::CONNECT | NetFlags::SEND;
    Profile {
        paths: vec![
            PathRule::new("/etc/resolv.conf", AccessFlags::READ),
            PathRule::new("/etc/hosts", AccessFlags::READ),
            PathRule::new("/etc/nsswitch.conf", AccessFlags::READ),
            PathRule::new("/etc/ssl/**", AccessFlags::READ),
            PathRule::new("/etc/ca-certificates/**", AccessFlags::READ),
        ],
        net_rules: vec![
            NetRule::inet(inet, stream, tcp, 0, client),
            NetRule::inet(inet6, stream, tcp, 0, client),
            NetRule::inet(inet, dgram, udp, 53, client),
            NetRule::inet(inet6, dgram, udp, 53, client),
            NetRule::unix(
                stream,
                "/var/run/nscd/socket",
                NetFlags::CREATE | NetFlags::CONNECT,
            ),
        ],
        syscalls: vec![
            "socket",
            "connect",
            "bind",
            "listen",
            "accept4",
            "getsockname",
            "getpeername",
            "sendto",
            "recvfrom",
            "sendmsg",
            "recvmsg",
            "setsockopt",
            "getsockopt",
            "shutdown",
        ],
    }
}

lazy_static! {
    static ref PROFILES: HashMap<&'static str, Profile> = {
        let mut profiles = HashMap::new();
        profiles.insert("minimal", minimal_profile());
        profiles.insert("build", build_profile());
        profiles.insert("network", network_profile());
        profiles
    };
}

impl Backend {
    /// Builds a policy as the union of the named profiles. Unknown
    /// names are rejected; duplicates of the same profile collapse.
    pub fn build(&self, profiles: &[&str]) -> Result<Policy, PolicyError> {
        let mut paths = Vec::new();
        let mut net_rules = Vec::new();
        let mut syscalls = Vec::new();

        let mut seen: Vec<&str> = Vec::new();
        for name in profiles {
            if seen.contains(name) {
                continue;
            }
            let profile = PROFILES
                .get(name)
                .ok_or_else(|| PolicyError::UnknownProfile(name.to_string()))?;
            seen.push(*name);

            for rule in &profile.paths {
                if !paths.contains(rule) {
                    paths.push(rule.clone());
                }
            }
            for rule in &profile.net_rules {
                if !net_rules.contains(rule) {
                    net_rules.push(rule.clone());
                }
            }
            for syscall in &profile.syscalls {
                if !syscalls.contains(syscall) {
                    syscalls.push(*syscall);
                }
            }
        }

        if paths.len() > MAX_PATHS {
            return Err(PolicyError::TooManyPaths(paths.len()));
        }
        if net_rules.len() > MAX_NET_RULES {
            return Err(PolicyError::TooManyNetRules(net_rules.len()));
        }

        Ok(Policy {
            backend: *self,
            level: SecurityLevel::Baseline,
            paths,
            net_rules,
            syscalls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_profile_is_rejected() {
        assert!(matches!(
            Backend::Lsm.build(&["minimal", "bogus"]),
            Err(PolicyError::UnknownProfile(_))
        ));
    }

    #[test]
    fn profiles_are_additive() {
        let minimal = Backend::Lsm.build(&["minimal"]).unwrap();
        let both = Backend::Lsm.build(&["minimal", "build"]).unwrap();
        assert!(both.paths.len() > minimal.paths.len());
        for rule in &minimal.paths {
            assert!(both.paths.contains(rule));
        }
    }

    #[test]
    fn profiles_are_unordered() {
        let a = Backend::Lsm.build(&["minimal", "network"]).unwrap();
        let b = Backend::Lsm.build(&["network", "minimal"]).unwrap();
        assert_eq!(a.paths.len(), b.paths.len());
        assert_eq!(a.net_rules.len(), b.net_rules.len());
        for rule in &a.paths {
            assert!(b.paths.contains(rule));
        }
    }

    #[test]
    fn duplicate_profile_names_collapse() {
        let once = Backend::Lsm.build(&["minimal"]).unwrap();
        let twice = Backend::Lsm.build(&["minimal", "minimal"]).unwrap();
        assert_eq!(once.paths.len(), twice.paths.len());
    }

    #[test]
    fn network_profile_carries_net_rules() {
        let policy = Backend::Lsm.build(&["network"]).unwrap();
        assert!(!policy.net_rules.is_empty());
        assert!(policy
            .net_rules
            .iter()
            .any(|r| r.unix_path.is_some() && r.family == libc::AF_UNIX as u32));
        assert!(policy
            .net_rules
            .iter()
            .any(|r| r.port == 53 && r.protocol == libc::IPPROTO_UDP as u32));
    }

    #[test]
    fn both_backends_share_the_policy_shape() {
        let lsm = Backend::Lsm.build(&["minimal", "network"]).unwrap();
        let seccomp = Backend::Seccomp.build(&["minimal", "network"]).unwrap();
        assert_eq!(lsm.backend, Backend::Lsm);
        assert_eq!(seccomp.backend, Backend::Seccomp);
        assert_eq!(lsm.paths, seccomp.paths);
        assert_eq!(lsm.syscalls, seccomp.syscalls);
        assert!(!seccomp.syscalls.is_empty());
    }

    #[test]
    fn default_level_is_baseline() {
        let policy = Backend::Lsm.build(&["minimal"]).unwrap();
        assert_eq!(policy.level, SecurityLevel::Baseline);
        let privileged = policy.with_level(SecurityLevel::Privileged);
        assert_eq!(privileged.level, SecurityLevel::Privileged);
    }
}

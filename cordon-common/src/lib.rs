//! Types shared between the cordon userspace daemon and the BPF LSM
//! programs. Every struct here is `#[repr(C)]` and has to stay layout
//! compatible with the kernel side, which consumes these maps directly.
#![cfg_attr(not(test), no_std)]

use bitflags::bitflags;
use plain::Plain;

/// Upper bound on path rules in a single policy.
pub const MAX_PATHS: usize = 256;

/// Upper bound on network rules in a single policy.
pub const MAX_NET_RULES: usize = 64;

/// Basename rules attachable to one directory inode.
pub const BASENAME_SLOTS: usize = 8;

/// Tokens a basename pattern may decompose into.
pub const BASENAME_TOKENS: usize = 6;

/// Longest literal token, in bytes.
pub const BASENAME_TOKEN_LEN: usize = 64;

/// Longest AF_UNIX socket path the kernel side matches against.
pub const UNIX_PATH_LEN: usize = 108;

/// Cap on recorded keys per rule kind per container. Matches the
/// max_entries of the underlying maps.
pub const MAX_KEYS_PER_KIND: usize = 10_240;

bitflags! {
    /// Permitted file operations.
    pub struct AccessFlags: u32 {
        const READ = 0x1;
        const WRITE = 0x2;
        const EXEC = 0x4;
    }
}

bitflags! {
    /// Permitted socket operations.
    pub struct NetFlags: u32 {
        const CREATE = 0x01;
        const BIND = 0x02;
        const CONNECT = 0x04;
        const LISTEN = 0x08;
        const ACCEPT = 0x10;
        const SEND = 0x20;
    }
}

/// Directory rule applies to direct children only.
pub const DIR_FLAG_CHILDREN: u32 = 0x1;
/// Directory rule applies to the whole subtree.
pub const DIR_FLAG_RECURSIVE: u32 = 0x2;

/// Unused basename token slot.
pub const TOKEN_NONE: u8 = 0;
/// Literal bytes; `?` inside the literal matches any single character.
pub const TOKEN_LITERAL: u8 = 1;
/// Exactly one ASCII digit.
pub const TOKEN_DIGIT: u8 = 2;
/// One or more ASCII digits.
pub const TOKEN_DIGITS: u8 = 3;

/// LSM hook identifiers carried in deny events.
pub const HOOK_FILE_OPEN: u32 = 1;
pub const HOOK_BPRM_CHECK: u32 = 2;
pub const HOOK_SOCKET_CREATE: u32 = 3;
pub const HOOK_SOCKET_BIND: u32 = 4;
pub const HOOK_SOCKET_CONNECT: u32 = 5;
pub const HOOK_SOCKET_LISTEN: u32 = 6;
pub const HOOK_SOCKET_ACCEPT: u32 = 7;
pub const HOOK_SOCKET_SEND: u32 = 8;
pub const HOOK_UNIX_CONNECT: u32 = 9;

/// Key of the per-inode and per-directory policy maps. For basename
/// rules the inode fields identify the parent directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct InodeKey {
    pub cgroup: u64,
    pub dev: u64,
    pub ino: u64,
}

unsafe impl Plain for InodeKey {}

/// Value of the directory policy map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct DirValue {
    pub access: u32,
    pub flags: u32,
}

unsafe impl Plain for DirValue {}

/// One token of a compiled basename pattern.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct BasenameToken {
    pub kind: u8,
    pub len: u8,
    pub bytes: [u8; BASENAME_TOKEN_LEN],
}

impl BasenameToken {
    pub const NONE: BasenameToken = BasenameToken {
        kind: TOKEN_NONE,
        len: 0,
        bytes: [0; BASENAME_TOKEN_LEN],
    };
}

/// One basename rule: a token sequence matched against the last path
/// component of a lookup inside the owning directory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct BasenameRule {
    pub access: u32,
    pub token_count: u8,
    pub tail_wildcard: u8,
    pub _pad: [u8; 2],
    pub tokens: [BasenameToken; BASENAME_TOKENS],
}

unsafe impl Plain for BasenameRule {}

impl BasenameRule {
    pub const EMPTY: BasenameRule = BasenameRule {
        access: 0,
        token_count: 0,
        tail_wildcard: 0,
        _pad: [0; 2],
        tokens: [BasenameToken::NONE; BASENAME_TOKENS],
    };

    /// Whether this slot holds no rule.
    pub fn is_empty(&self) -> bool {
        self.token_count == 0
    }

    /// Token-shape equality, ignoring the allow mask. Two rules with the
    /// same shape merge into one slot.
    pub fn same_shape(&self, other: &BasenameRule) -> bool {
        self.token_count == other.token_count
            && self.tail_wildcard == other.tail_wildcard
            && self.tokens[..self.token_count as usize]
                == other.tokens[..other.token_count as usize]
    }
}

/// Value of the basename policy map: a fixed array of rule slots.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct BasenameValue {
    pub slots: [BasenameRule; BASENAME_SLOTS],
}

unsafe impl Plain for BasenameValue {}

impl BasenameValue {
    pub const EMPTY: BasenameValue = BasenameValue {
        slots: [BasenameRule::EMPTY; BASENAME_SLOTS],
    };
}

/// Key of the socket-creation policy map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct NetCreateKey {
    pub cgroup: u64,
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
    pub _pad: u32,
}

unsafe impl Plain for NetCreateKey {}

/// Key of the endpoint policy map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct NetTupleKey {
    pub cgroup: u64,
    pub family: u32,
    pub sock_type: u32,
    pub protocol: u32,
    pub port: u16,
    pub _pad: u16,
    pub addr: [u8; 16],
}

unsafe impl Plain for NetTupleKey {}

/// Key of the AF_UNIX policy map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct NetUnixKey {
    pub cgroup: u64,
    pub sock_type: u32,
    pub protocol: u32,
    pub is_abstract: u8,
    pub path_len: u8,
    pub path: [u8; UNIX_PATH_LEN],
    pub _pad: [u8; 2],
}

unsafe impl Plain for NetUnixKey {}

/// Denial record emitted by the LSM programs through the ring buffer.
#[derive(Debug, Copy, Clone)]
#[repr(C)]
pub struct DenyEvent {
    pub cgroup: u64,
    pub dev: u64,
    pub ino: u64,
    pub required: u32,
    pub hook: u32,
    pub pid: u32,
    pub comm: [u8; 16],
    pub name: [u8; BASENAME_TOKEN_LEN],
    pub _pad: [u8; 4],
}

unsafe impl Plain for DenyEvent {}

// Layout guards. The kernel programs hardcode these sizes.
const _: () = assert!(core::mem::size_of::<InodeKey>() == 24);
const _: () = assert!(core::mem::size_of::<DirValue>() == 8);
const _: () = assert!(core::mem::size_of::<BasenameToken>() == 66);
const _: () = assert!(core::mem::size_of::<BasenameRule>() == 404);
const _: () = assert!(core::mem::size_of::<BasenameValue>() == 3232);
const _: () = assert!(core::mem::size_of::<NetCreateKey>() == 24);
const _: () = assert!(core::mem::size_of::<NetTupleKey>() == 40);
const _: () = assert!(core::mem::size_of::<NetUnixKey>() == 128);
const _: () = assert!(core::mem::size_of::<DenyEvent>() == 120);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_shape_ignores_access() {
        let mut a = BasenameRule::EMPTY;
        a.token_count = 1;
        a.tokens[0].kind = TOKEN_DIGIT;
        let mut b = a;
        b.access = AccessFlags::WRITE.bits();
        assert!(a.same_shape(&b));
    }

    #[test]
    fn same_shape_differs_on_tail_wildcard() {
        let mut a = BasenameRule::EMPTY;
        a.token_count = 1;
        a.tokens[0].kind = TOKEN_DIGITS;
        let mut b = a;
        b.tail_wildcard = 1;
        assert!(!a.same_shape(&b));
    }

    #[test]
    fn empty_slot_detection() {
        assert!(BasenameRule::EMPTY.is_empty());
        let mut r = BasenameRule::EMPTY;
        r.token_count = 2;
        assert!(!r.is_empty());
    }
}

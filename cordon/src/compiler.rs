//! Compilation of allow patterns into installable rules.
//!
//! The grammar is evaluated in a fixed order: a `/**` suffix becomes a
//! recursive directory rule, `/*` a children-only rule, a wildcarded
//! last segment with a literal parent becomes a basename rule on the
//! parent directory inode, any other wildcarded pattern is expanded
//! against the filesystem, and literals are stat'ed directly. All
//! resolution happens underneath the container rootfs.
//!
//! Compilation is separate from installation: this module only stats
//! the filesystem and emits [`CompiledRule`] values; the manager writes
//! them into the kernel maps and records them in the container context.

use std::{
    fs, io,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use thiserror::Error;
use walkdir::WalkDir;

use cordon_common::{
    AccessFlags, BasenameRule, BasenameToken, BasenameValue, BASENAME_SLOTS, BASENAME_TOKENS,
    BASENAME_TOKEN_LEN, DIR_FLAG_CHILDREN, DIR_FLAG_RECURSIVE, TOKEN_DIGIT, TOKEN_DIGITS,
    TOKEN_LITERAL,
};

/// Open-descriptor cap for subtree walks.
const WALK_MAX_OPEN: usize = 16;

/// One rule ready for installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompiledRule {
    /// Allow `access` on a single inode.
    Inode { dev: u64, ino: u64, access: u32 },
    /// Allow `access` on a directory inode, children-only or recursive
    /// depending on `flags`. The host path is kept for the subtree-walk
    /// fallback and for logging.
    Dir {
        path: PathBuf,
        dev: u64,
        ino: u64,
        access: u32,
        flags: u32,
    },
    /// Attach a basename rule to the parent directory inode.
    Basename {
        dir_dev: u64,
        dir_ino: u64,
        rule: BasenameRule,
    },
}

#[derive(Error, Debug)]
pub enum CompileError {
    #[error("pattern {0} is not absolute")]
    NotAbsolute(String),

    #[error("pattern {0} not supported: {1}")]
    NotSupported(String, &'static str),

    #[error("could not resolve {path}: {source}")]
    Resolve {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),
}

/// Basename-slot merge failure: all 8 slots of the directory are taken.
#[derive(Error, Debug)]
#[error("no space left in the basename rule slots")]
pub struct SlotsFull;

enum TokenizeError {
    /// `+` outside a digit class; the glob fallback handles it.
    BarePlus,
    Unsupported(&'static str),
}

fn wildcarded(s: &str) -> bool {
    s.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'+'))
}

fn resolve(rootfs: &Path, pattern: &str) -> PathBuf {
    rootfs.join(pattern.trim_start_matches('/'))
}

fn stat(rootfs: &Path, pattern: &str) -> Result<(PathBuf, fs::Metadata), CompileError> {
    let full = resolve(rootfs, pattern);
    match fs::metadata(&full) {
        Ok(meta) => Ok((full, meta)),
        Err(source) => Err(CompileError::Resolve {
            path: full.display().to_string(),
            source,
        }),
    }
}

fn dir_rule(
    rootfs: &Path,
    prefix: &str,
    access: AccessFlags,
    flags: u32,
) -> Result<CompiledRule, CompileError> {
    let (path, meta) = stat(rootfs, prefix)?;
    Ok(CompiledRule::Dir {
        path,
        dev: meta.dev(),
        ino: meta.ino(),
        access: access.bits(),
        flags,
    })
}

/// Compiles one allow pattern against the container rootfs.
///
/// Per-pattern trouble that only loses this one entry (an over-long
/// path, a glob that matches nothing) is logged and yields an empty
/// rule list; genuine misuse surfaces as an error.
pub fn compile_pattern(
    rootfs: &Path,
    pattern: &str,
    access: AccessFlags,
) -> Result<Vec<CompiledRule>, CompileError> {
    if !pattern.starts_with('/') {
        return Err(CompileError::NotAbsolute(pattern.to_string()));
    }
    if rootfs.as_os_str().len() + pattern.len() >= libc::PATH_MAX as usize {
        warn!(
            "skipping {}: composed with {} it exceeds PATH_MAX",
            pattern,
            rootfs.display()
        );
        return Ok(Vec::new());
    }

    if let Some(prefix) = pattern.strip_suffix("/**") {
        let prefix = if prefix.is_empty() { "/" } else { prefix };
        return Ok(vec![dir_rule(rootfs, prefix, access, DIR_FLAG_RECURSIVE)?]);
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix = if prefix.is_empty() { "/" } else { prefix };
        return Ok(vec![dir_rule(rootfs, prefix, access, DIR_FLAG_CHILDREN)?]);
    }

    let (parent, base) = match pattern.rsplit_once('/') {
        Some((p, b)) => (if p.is_empty() { "/" } else { p }, b),
        None => ("/", pattern),
    };

    if wildcarded(base) && !wildcarded(parent) {
        match tokenize_basename(base) {
            Ok(rule) => {
                let (_, meta) = stat(rootfs, parent)?;
                let mut rule = rule;
                rule.access = access.bits();
                return Ok(vec![CompiledRule::Basename {
                    dir_dev: meta.dev(),
                    dir_ino: meta.ino(),
                    rule,
                }]);
            }
            // `lib+.so` style shorthand: handled by the glob expansion
            // below, where `+` translates to `*`.
            Err(TokenizeError::BarePlus) => {}
            Err(TokenizeError::Unsupported(what)) => {
                return Err(CompileError::NotSupported(pattern.to_string(), what))
            }
        }
    }

    if wildcarded(pattern) {
        return compile_glob(rootfs, pattern, access);
    }

    compile_literal(rootfs, pattern, access)
}

/// Parses a basename pattern into the token form the kernel matcher
/// consumes. Literal runs keep `?` as an in-band single-character
/// wildcard; `[0-9]` and `[0-9]+` become digit tokens; a trailing `*`
/// sets the tail-wildcard flag.
fn tokenize_basename(base: &str) -> Result<BasenameRule, TokenizeError> {
    let bytes = base.as_bytes();
    let mut tokens: Vec<BasenameToken> = Vec::new();
    let mut literal: Vec<u8> = Vec::new();
    let mut tail_wildcard = false;
    let mut i = 0;

    fn flush(tokens: &mut Vec<BasenameToken>, literal: &mut Vec<u8>) -> Result<(), TokenizeError> {
        if literal.is_empty() {
            return Ok(());
        }
        if literal.len() > BASENAME_TOKEN_LEN {
            return Err(TokenizeError::Unsupported("literal token too long"));
        }
        let mut token = BasenameToken::NONE;
        token.kind = TOKEN_LITERAL;
        token.len = literal.len() as u8;
        token.bytes[..literal.len()].copy_from_slice(literal);
        tokens.push(token);
        literal.clear();
        Ok(())
    }

    while i < bytes.len() {
        match bytes[i] {
            b'*' => {
                if i != bytes.len() - 1 {
                    return Err(TokenizeError::Unsupported("interior wildcard"));
                }
                tail_wildcard = true;
                i += 1;
            }
            b'[' => {
                flush(&mut tokens, &mut literal)?;
                if !bytes[i..].starts_with(b"[0-9]") {
                    return Err(TokenizeError::Unsupported("bracket expression"));
                }
                i += 5;
                let mut token = BasenameToken::NONE;
                if bytes.get(i) == Some(&b'+') {
                    token.kind = TOKEN_DIGITS;
                    i += 1;
                } else {
                    token.kind = TOKEN_DIGIT;
                }
                tokens.push(token);
            }
            b'+' => return Err(TokenizeError::BarePlus),
            b']' => return Err(TokenizeError::Unsupported("bracket expression")),
            c => {
                literal.push(c);
                i += 1;
            }
        }
    }
    flush(&mut tokens, &mut literal)?;

    if tokens.is_empty() {
        // A bare `*` belongs to the children-only directory case.
        return Err(TokenizeError::Unsupported("empty basename pattern"));
    }
    if tokens.len() > BASENAME_TOKENS {
        return Err(TokenizeError::Unsupported("too many tokens"));
    }

    let mut rule = BasenameRule::EMPTY;
    rule.token_count = tokens.len() as u8;
    rule.tail_wildcard = tail_wildcard as u8;
    rule.tokens[..tokens.len()].copy_from_slice(&tokens);
    Ok(rule)
}

/// Expands a wildcarded pattern against the filesystem. `+` is
/// translated to `*` first, so `lib+.so` behaves as `lib*.so`.
fn compile_glob(
    rootfs: &Path,
    pattern: &str,
    access: AccessFlags,
) -> Result<Vec<CompiledRule>, CompileError> {
    let translated = pattern.replace('+', "*");
    let full = resolve(rootfs, &translated);
    let full = full.to_string_lossy();

    let mut rules = Vec::new();
    for entry in glob::glob(&full)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                warn!("skipping unreadable glob match under {}: {}", pattern, e);
                continue;
            }
        };
        match fs::metadata(&path) {
            Ok(meta) if meta.is_dir() => rules.push(CompiledRule::Dir {
                dev: meta.dev(),
                ino: meta.ino(),
                access: access.bits(),
                flags: DIR_FLAG_RECURSIVE,
                path,
            }),
            Ok(meta) => rules.push(CompiledRule::Inode {
                dev: meta.dev(),
                ino: meta.ino(),
                access: access.bits(),
            }),
            Err(e) => warn!("skipping {}: {}", path.display(), e),
        }
    }
    if rules.is_empty() {
        warn!(
            "pattern {} matched nothing under {}",
            pattern,
            rootfs.display()
        );
    }
    Ok(rules)
}

fn compile_literal(
    rootfs: &Path,
    pattern: &str,
    access: AccessFlags,
) -> Result<Vec<CompiledRule>, CompileError> {
    let (path, meta) = stat(rootfs, pattern)?;
    if meta.is_dir() {
        return Ok(vec![CompiledRule::Dir {
            dev: meta.dev(),
            ino: meta.ino(),
            access: access.bits(),
            flags: DIR_FLAG_RECURSIVE,
            path,
        }]);
    }
    Ok(vec![CompiledRule::Inode {
        dev: meta.dev(),
        ino: meta.ino(),
        access: access.bits(),
    }])
}

/// Fallback for a directory whose recursive rule could not be
/// installed: per-inode rules for every entry of the subtree. The walk
/// keeps at most 16 descriptors open and does not cross mount
/// boundaries. Unreadable entries are logged and skipped.
pub fn expand_subtree(dir: &Path, access: AccessFlags) -> Vec<CompiledRule> {
    let mut rules = Vec::new();
    for entry in WalkDir::new(dir)
        .max_open(WALK_MAX_OPEN)
        .same_file_system(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("subtree walk under {}: {}", dir.display(), e);
                continue;
            }
        };
        match entry.metadata() {
            Ok(meta) => rules.push(CompiledRule::Inode {
                dev: meta.dev(),
                ino: meta.ino(),
                access: access.bits(),
            }),
            Err(e) => warn!("could not stat {}: {}", entry.path().display(), e),
        }
    }
    debug!(
        "expanded {} into {} per-inode rules",
        dir.display(),
        rules.len()
    );
    rules
}

/// Merges a compiled basename rule into the slot array of its
/// directory: an equal-shaped slot absorbs the allow mask, otherwise
/// the first empty slot is taken.
pub fn merge_basename(slots: &mut BasenameValue, rule: &BasenameRule) -> Result<(), SlotsFull> {
    for slot in slots.slots.iter_mut() {
        if !slot.is_empty() && slot.same_shape(rule) {
            slot.access |= rule.access;
            return Ok(());
        }
    }
    for slot in slots.slots.iter_mut() {
        if slot.is_empty() {
            *slot = *rule;
            return Ok(());
        }
    }
    debug_assert_eq!(slots.slots.len(), BASENAME_SLOTS);
    Err(SlotsFull)
}

//! Consumer of the kernel-to-userspace ring buffer of denial records.
//!
//! A single worker thread drains the ring buffer, logs each event and
//! counts it. The stream is best-effort audit: events are never
//! acknowledged and drops are acceptable. The thread terminates on a
//! cooperative stop flag and is joined on shutdown.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use aya::maps::{MapData, RingBuf};
use log::{info, warn};

use cordon_common::{
    DenyEvent, HOOK_BPRM_CHECK, HOOK_FILE_OPEN, HOOK_SOCKET_ACCEPT, HOOK_SOCKET_BIND,
    HOOK_SOCKET_CONNECT, HOOK_SOCKET_CREATE, HOOK_SOCKET_LISTEN, HOOK_SOCKET_SEND,
    HOOK_UNIX_CONNECT,
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct DenyEventConsumer {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl DenyEventConsumer {
    pub fn spawn(ring: RingBuf<MapData>, counter: Arc<AtomicU64>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let handle = thread::spawn(move || consume(ring, thread_stop, counter));
        DenyEventConsumer {
            stop,
            handle: Some(handle),
        }
    }

    /// Signals the worker and joins it. The worker notices the flag
    /// within one poll interval.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("deny event consumer panicked");
            }
        }
    }
}

impl Drop for DenyEventConsumer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn consume(mut ring: RingBuf<MapData>, stop: Arc<AtomicBool>, counter: Arc<AtomicU64>) {
    while !stop.load(Ordering::SeqCst) {
        let mut drained = false;
        while let Some(item) = ring.next() {
            drained = true;
            counter.fetch_add(1, Ordering::Relaxed);
            match plain::from_bytes::<DenyEvent>(&item) {
                Ok(event) => log_event(event),
                Err(_) => warn!("malformed deny event of {} bytes", item.len()),
            }
        }
        if !drained {
            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn hook_name(hook: u32) -> &'static str {
    match hook {
        HOOK_FILE_OPEN => "file_open",
        HOOK_BPRM_CHECK => "bprm_check_security",
        HOOK_SOCKET_CREATE => "socket_create",
        HOOK_SOCKET_BIND => "socket_bind",
        HOOK_SOCKET_CONNECT => "socket_connect",
        HOOK_SOCKET_LISTEN => "socket_listen",
        HOOK_SOCKET_ACCEPT => "socket_accept",
        HOOK_SOCKET_SEND => "socket_sendmsg",
        HOOK_UNIX_CONNECT => "unix_stream_connect",
        _ => "unknown",
    }
}

fn trimmed(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    std::str::from_utf8(&bytes[..end]).unwrap_or("<non-utf8>")
}

fn log_event(event: &DenyEvent) {
    match event.hook {
        HOOK_FILE_OPEN | HOOK_BPRM_CHECK => info!(
            "denied {} of {} (dev {} ino {}, mask {:#x}) for {} (pid {}) in cgroup {}",
            hook_name(event.hook),
            trimmed(&event.name),
            event.dev,
            event.ino,
            event.required,
            trimmed(&event.comm),
            event.pid,
            event.cgroup,
        ),
        _ => info!(
            "denied {} (mask {:#x}) for {} (pid {}) in cgroup {}",
            hook_name(event.hook),
            event.required,
            trimmed(&event.comm),
            event.pid,
            event.cgroup,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_names_cover_all_ids() {
        for hook in 1..=9 {
            assert_ne!(hook_name(hook), "unknown");
        }
        assert_eq!(hook_name(0), "unknown");
        assert_eq!(hook_name(99), "unknown");
    }

    #[test]
    fn trimmed_stops_at_nul() {
        let mut comm = [0u8; 16];
        comm[..4].copy_from_slice(b"bash");
        assert_eq!(trimmed(&comm), "bash");
        assert_eq!(trimmed(&[0u8; 16]), "");
        let full = [b'a'; 16];
        assert_eq!(trimmed(&full), "aaaaaaaaaaaaaaaa");
    }
}

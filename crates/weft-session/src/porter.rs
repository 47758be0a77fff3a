//! The porter: a per-client registry mapping local ports to their owners.
//!
//! Every listener and every live stream holds exactly one reservation.
//! Reservations are released through [`PortGuard`], a clonable handle whose
//! release fires exactly once no matter how many clones call it or drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;

use weft_core::{EPHEMERAL_PORT_MAX, EPHEMERAL_PORT_MIN};
use weft_proto::Addr;

use crate::listener::ListenerHandle;
use crate::SessionError;

/// What a reserved port is bound to.
#[derive(Clone)]
pub enum PortEntry {
    /// A listener; owns its port until closed.
    Listener(ListenerHandle),
    /// An in-flight or established stream holding an ephemeral port.
    Stream(StreamEntry),
}

/// Porter-side record of a stream reservation.
#[derive(Clone, Debug)]
pub struct StreamEntry {
    /// The remote end of the stream.
    pub remote: Addr,
}

type PortMap = Arc<RwLock<HashMap<u16, PortEntry>>>;

/// Shared port registry. Clones refer to the same registry.
#[derive(Clone, Default)]
pub struct Porter {
    ports: PortMap,
}

impl Porter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a specific port. Fails with `PortTaken` if already mapped.
    pub fn reserve(&self, port: u16, entry: PortEntry) -> Result<PortGuard, SessionError> {
        let mut ports = self.ports.write().unwrap_or_else(|e| e.into_inner());
        if ports.contains_key(&port) {
            return Err(SessionError::PortTaken);
        }
        ports.insert(port, entry);
        Ok(PortGuard::new(port, &self.ports))
    }

    /// Reserves an unused port in the ephemeral range, probing sequentially
    /// from a random starting offset. `make_entry` receives the chosen port.
    ///
    /// Fails with `NoFreePort` once the whole range has been swept.
    pub fn reserve_ephemeral(
        &self,
        make_entry: impl FnOnce(u16) -> PortEntry,
    ) -> Result<(u16, PortGuard), SessionError> {
        let span = u32::from(EPHEMERAL_PORT_MAX - EPHEMERAL_PORT_MIN) + 1;
        let start: u32 = rand::thread_rng().gen_range(0..span);

        let mut ports = self.ports.write().unwrap_or_else(|e| e.into_inner());
        for i in 0..span {
            let port = EPHEMERAL_PORT_MIN + ((start + i) % span) as u16;
            if !ports.contains_key(&port) {
                ports.insert(port, make_entry(port));
                return Ok((port, PortGuard::new(port, &self.ports)));
            }
        }
        Err(SessionError::NoFreePort)
    }

    /// Returns the entry mapped at `port`, if any.
    pub fn lookup(&self, port: u16) -> Option<PortEntry> {
        self.ports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&port)
            .cloned()
    }

    /// Visits a consistent snapshot of all entries. The callback may call
    /// [`Porter::lookup`] freely; it must not reserve or release.
    pub fn for_each(&self, mut f: impl FnMut(u16, &PortEntry)) {
        let snapshot: Vec<(u16, PortEntry)> = {
            let ports = self.ports.read().unwrap_or_else(|e| e.into_inner());
            ports.iter().map(|(p, e)| (*p, e.clone())).collect()
        };
        for (port, entry) in &snapshot {
            f(*port, entry);
        }
    }

    /// Number of live reservations.
    pub fn len(&self) -> usize {
        self.ports.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases a port reservation exactly once, on the first of: an explicit
/// [`release`](PortGuard::release) call on any clone, or the drop of the
/// last clone.
#[derive(Clone)]
pub struct PortGuard {
    inner: Arc<GuardInner>,
}

struct GuardInner {
    port: u16,
    ports: PortMap,
    released: AtomicBool,
}

impl PortGuard {
    fn new(port: u16, ports: &PortMap) -> Self {
        Self {
            inner: Arc::new(GuardInner {
                port,
                ports: Arc::clone(ports),
                released: AtomicBool::new(false),
            }),
        }
    }

    /// The reserved port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Removes the mapping. Safe to call any number of times.
    pub fn release(&self) {
        self.inner.do_release();
    }

    /// Whether the reservation has already been released.
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl GuardInner {
    fn do_release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.port);
    }
}

impl Drop for GuardInner {
    fn drop(&mut self) {
        self.do_release();
    }
}

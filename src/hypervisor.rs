//! Hypervisor session management
//!
//! Owns the single libvirt connection. All domain operations borrow the
//! connection through [`HypervisorSession::with_conn`]; only the session
//! itself ever opens or closes the handle.

use parking_lot::Mutex;
use virt::connect::Connect;

use crate::{Error, Result};

pub const DEFAULT_URI: &str = "qemu:///system";

/// Long-lived libvirt connection with reconnect-on-demand.
pub struct HypervisorSession {
    uri: String,
    conn: Mutex<Option<Connect>>,
}

impl HypervisorSession {
    /// Create a session for `uri` without connecting yet.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Open the connection. Idempotent: succeeds immediately when already open.
    pub fn connect(&self) -> bool {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return true;
        }
        match Connect::open(Some(&self.uri)) {
            Ok(c) => {
                tracing::info!(uri = %self.uri, "Hypervisor connection established");
                *guard = Some(c);
                true
            }
            Err(e) => {
                tracing::error!(uri = %self.uri, error = %e, "Hypervisor connection failed");
                false
            }
        }
    }

    /// Like [`connect`](Self::connect) but surfaces the driver error.
    pub fn connect_or_fail(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        if guard.is_some() {
            return Ok(());
        }
        let c = Connect::open(Some(&self.uri))
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        tracing::info!(uri = %self.uri, "Hypervisor connection established");
        *guard = Some(c);
        Ok(())
    }

    /// Re-open the connection when it is missing or the liveness probe
    /// reports dead.
    pub fn ensure_connected(&self) -> Result<()> {
        let mut guard = self.conn.lock();
        let alive = guard
            .as_ref()
            .map(|c| c.is_alive().unwrap_or(false))
            .unwrap_or(false);
        if alive {
            return Ok(());
        }
        if guard.is_some() {
            tracing::warn!(uri = %self.uri, "Stale hypervisor connection, reopening");
            *guard = None;
        }
        let c = Connect::open(Some(&self.uri))
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        *guard = Some(c);
        Ok(())
    }

    /// Run `f` with the live connection, connecting first if needed.
    /// Callers must not close the handle.
    pub fn with_conn<R>(&self, f: impl FnOnce(&Connect) -> Result<R>) -> Result<R> {
        self.ensure_connected()?;
        let guard = self.conn.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::ConnectionFailed("connection lost".into()))?;
        f(conn)
    }

    /// Whether the connection is open and alive.
    pub fn is_alive(&self) -> bool {
        self.conn
            .lock()
            .as_ref()
            .map(|c| c.is_alive().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn hypervisor_version(&self) -> Result<String> {
        self.with_conn(|c| {
            let v = c.get_hyp_version()?;
            Ok(format!("{}.{}.{}", v / 1_000_000, (v % 1_000_000) / 1000, v % 1000))
        })
    }

    pub fn hostname(&self) -> Result<String> {
        self.with_conn(|c| Ok(c.get_hostname()?))
    }

    /// Close the connection. Idempotent; safe to call from drop paths.
    pub fn close(&self) {
        let mut guard = self.conn.lock();
        if guard.take().is_some() {
            tracing::info!(uri = %self.uri, "Hypervisor connection closed");
        }
    }
}

impl Drop for HypervisorSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for HypervisorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorSession")
            .field("uri", &self.uri)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_disconnected() {
        let session = HypervisorSession::new("test:///default");
        assert!(!session.is_alive());
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = HypervisorSession::new("test:///default");
        session.close();
        session.close();
        assert!(!session.is_alive());
    }

    // The libvirt "test" driver is compiled into the client library, so this
    // exercises the real connect path without a hypervisor.
    #[test]
    fn test_connect_test_driver() {
        let session = HypervisorSession::new("test:///default");
        if session.connect() {
            assert!(session.is_alive());
            session.connect_or_fail().unwrap();
            session.close();
            assert!(!session.is_alive());
        }
    }
}

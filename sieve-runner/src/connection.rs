//! Process-wide shared connection with a bounded-wait once-initializer.
//!
//! The first caller of [`SharedConnection::get_or_init`] runs the initializer
//! under mutual exclusion; concurrent callers park on a condition variable
//! until initialization completes or their timeout elapses. A failed or
//! panicking initialization returns the slot to uninitialized and wakes the
//! waiters, so a later caller may retry explicitly.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use sieve_core::config::{require_positive, ConfigError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Longest a caller waits for a concurrent initializer.
    pub wait_timeout_secs: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            wait_timeout_secs: 30,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("connection.wait_timeout_secs", self.wait_timeout_secs as f64)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("timed out after {waited_ms}ms waiting for connection initialization")]
    InitTimeout { waited_ms: u64 },

    #[error("connection initialization failed: {0}")]
    InitFailed(String),
}

enum InitState<T: ?Sized> {
    Uninit,
    Initializing,
    Ready(Arc<T>),
}

/// Returns the slot to `Uninit` and wakes waiters if the initializer unwinds
/// before reporting.
struct ResetOnUnwind<'a, T: ?Sized> {
    conn: &'a SharedConnection<T>,
    armed: bool,
}

impl<T: ?Sized> Drop for ResetOnUnwind<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.conn.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = InitState::Uninit;
        warn!("shared connection initializer panicked");
        self.conn.ready.notify_all();
    }
}

/// One shared handle, created at most once at a time.
pub struct SharedConnection<T: ?Sized> {
    state: Mutex<InitState<T>>,
    ready: Condvar,
}

impl<T: ?Sized> Default for SharedConnection<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> SharedConnection<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Uninit),
            ready: Condvar::new(),
        }
    }

    /// Current handle, if initialized.
    pub fn get(&self) -> Option<Arc<T>> {
        match &*self.state.lock().unwrap() {
            InitState::Ready(handle) => Some(Arc::clone(handle)),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.get().is_some()
    }

    /// Return the handle, initializing it if nobody has yet.
    ///
    /// `init` runs outside the lock, on the calling thread, at most once per
    /// successful initialization. Callers arriving while another thread is
    /// initializing wait up to `timeout`.
    pub fn get_or_init<F>(&self, init: F, timeout: Duration) -> Result<Arc<T>, ConnectionError>
    where
        F: FnOnce() -> Result<Arc<T>, String>,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            match &*state {
                InitState::Ready(handle) => return Ok(Arc::clone(handle)),
                InitState::Uninit => {
                    *state = InitState::Initializing;
                    break;
                }
                InitState::Initializing => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(timeout_ms = timeout.as_millis() as u64, "connection init wait timed out");
                        return Err(ConnectionError::InitTimeout {
                            waited_ms: timeout.as_millis() as u64,
                        });
                    }
                    let (guard, _) = self.ready.wait_timeout(state, deadline - now).unwrap();
                    state = guard;
                }
            }
        }
        drop(state);

        debug!("initializing shared connection");
        let mut reset = ResetOnUnwind {
            conn: self,
            armed: true,
        };
        let outcome = init();
        reset.armed = false;
        let mut state = self.state.lock().unwrap();
        let result = match outcome {
            Ok(handle) => {
                *state = InitState::Ready(Arc::clone(&handle));
                info!("shared connection ready");
                Ok(handle)
            }
            Err(reason) => {
                *state = InitState::Uninit;
                warn!(%reason, "shared connection initialization failed");
                Err(ConnectionError::InitFailed(reason))
            }
        };
        self.ready.notify_all();
        result
    }

    /// Take the handle out, leaving the slot uninitialized.
    pub fn release(&self) -> Option<Arc<T>> {
        let mut state = self.state.lock().unwrap();
        match std::mem::replace(&mut *state, InitState::Uninit) {
            InitState::Ready(handle) => Some(handle),
            InitState::Initializing => {
                *state = InitState::Initializing;
                None
            }
            InitState::Uninit => None,
        }
    }
}

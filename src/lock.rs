//! Named cross-process locks.
//!
//! A lock is held by whoever owns the [`Token`] it was granted with. Waiters
//! queue in arrival order and the lock is handed straight to the oldest live
//! waiter on release, so there is no thundering herd and no barging. Holders
//! must renew within the lease or the lock is reaped.

use crate::error::{Error, Result};
use crate::protocol::{LockRequest, Token};
use crate::rate_limit::current_time_ms;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct LockManager {
    locks: Mutex<HashMap<String, LockState>>,
    lease_ms: u64,
}

#[derive(Default)]
struct LockState {
    holder: Option<Holder>,
    waiters: VecDeque<oneshot::Sender<Token>>,
}

struct Holder {
    token: Token,
    expires_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStats {
    pub held: usize,
    pub waiting: usize,
}

impl LockState {
    fn grant(&mut self, now: u64, lease_ms: u64) -> Token {
        let token = Token::generate();
        self.holder = Some(Holder {
            token: token.clone(),
            expires_at: now + lease_ms,
        });
        token
    }

    /// Pass the lock to the oldest waiter still listening, or free it.
    fn hand_off(&mut self, now: u64, lease_ms: u64) {
        self.holder = None;
        while let Some(waiter) = self.waiters.pop_front() {
            let token = self.grant(now, lease_ms);
            if waiter.send(token).is_ok() {
                return;
            }
            self.holder = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

impl LockManager {
    pub fn new(lease_ms: u64) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            lease_ms,
        }
    }

    /// Acquire `name`, waiting up to `request.timeout_ms` behind the current
    /// holder. With a token, renews the lease if that token holds the lock
    /// and fails with [`Error::LockReleased`] otherwise.
    pub async fn acquire(&self, name: &str, request: LockRequest) -> Result<Token> {
        let mut rx = {
            let now = current_time_ms();
            let mut locks = self.lock_map()?;
            let state = locks.entry(name.to_string()).or_default();

            if state.holder.as_ref().is_some_and(|h| h.expires_at <= now) {
                warn!(lock = %name, "Lock lease expired, handing off");
                state.hand_off(now, self.lease_ms);
            }

            if let Some(presented) = &request.token {
                return match state.holder.as_mut() {
                    Some(holder) if holder.token.value == *presented => {
                        holder.expires_at = now + self.lease_ms;
                        debug!(lock = %name, "Lock renewed");
                        Ok(holder.token.clone())
                    }
                    _ => Err(Error::LockReleased(format!(
                        "token does not hold lock '{}'",
                        name
                    ))),
                };
            }

            if state.holder.is_none() {
                let token = state.grant(now, self.lease_ms);
                info!(lock = %name, "Lock granted");
                return Ok(token);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            debug!(lock = %name, waiters = state.waiters.len(), "Waiting for lock");
            rx
        };

        match tokio::time::timeout(Duration::from_millis(request.timeout_ms), &mut rx).await {
            Ok(Ok(token)) => {
                info!(lock = %name, "Lock granted after wait");
                Ok(token)
            }
            Ok(Err(_)) => Err(Error::Internal(format!("waiter for lock '{}' was dropped", name))),
            Err(_) => {
                // a hand-off may have raced the deadline; keep it if so
                rx.close();
                match rx.try_recv() {
                    Ok(token) => Ok(token),
                    Err(_) => {
                        warn!(lock = %name, timeout_ms = request.timeout_ms, "Lock wait timed out");
                        Err(Error::LockTimeout {
                            key: name.to_string(),
                            timeout_ms: request.timeout_ms,
                        })
                    }
                }
            }
        }
    }

    pub fn release(&self, name: &str, token: &Token) -> Result<()> {
        let now = current_time_ms();
        let mut locks = self.lock_map()?;

        let Some(state) = locks.get_mut(name) else {
            return Err(Error::LockReleased(format!("lock '{}' is not held", name)));
        };
        match &state.holder {
            Some(holder) if holder.token == *token => {}
            _ => {
                return Err(Error::LockReleased(format!(
                    "token does not hold lock '{}'",
                    name
                )))
            }
        }

        state.hand_off(now, self.lease_ms);
        info!(lock = %name, handed_off = state.holder.is_some(), "Lock released");
        if state.is_idle() {
            locks.remove(name);
        }
        Ok(())
    }

    pub fn reap_expired(&self) -> Result<usize> {
        self.reap_expired_at(current_time_ms())
    }

    /// Take locks away from holders whose lease lapsed and forget waiters
    /// that gave up.
    pub fn reap_expired_at(&self, now: u64) -> Result<usize> {
        let mut locks = self.lock_map()?;
        let mut reaped = 0;

        for (name, state) in locks.iter_mut() {
            state.waiters.retain(|w| !w.is_closed());
            if state.holder.as_ref().is_some_and(|h| h.expires_at <= now) {
                warn!(lock = %name, "Reaping expired lock");
                state.hand_off(now, self.lease_ms);
                reaped += 1;
            }
        }
        locks.retain(|_, state| !state.is_idle());

        Ok(reaped)
    }

    pub fn stats(&self) -> Result<LockStats> {
        let locks = self.lock_map()?;
        Ok(LockStats {
            held: locks.values().filter(|s| s.holder.is_some()).count(),
            waiting: locks.values().map(|s| s.waiters.len()).sum(),
        })
    }

    fn lock_map(&self) -> Result<MutexGuard<'_, HashMap<String, LockState>>> {
        self.locks
            .lock()
            .map_err(|_| Error::Internal("Failed to acquire lock table".to_string()))
    }
}

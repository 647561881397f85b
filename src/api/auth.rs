//! API principals and login sessions.
//!
//! Passwords are stored as `HMAC-SHA256(salt, password)` with a random
//! per-user salt. A successful login issues a random session id; the
//! transport resolves it back to a [`Principal`] for each call. Login
//! attempts are rate limited per client with a token bucket.

use burster::Limiter;
use core::time::Duration;
use log::{info, warn};

use crate::error::{Error, Result};

// ── Constants ────────────────────────────────────────────────

/// Concurrent sessions; the oldest is evicted when a new login arrives.
pub const MAX_SESSIONS: usize = 8;

/// Transports that may attempt logins (console, web, serial, ...).
pub const MAX_CLIENTS: usize = 4;

pub const MAX_USERS: usize = 8;

/// Client identifier (transport slot).
pub type ClientId = u8;

pub mod perm {
    pub const DEVICE_CONTROL: &str = "device.control";
    pub const FAN_CONTROL: &str = "fan.control";
    pub const TEMP_CONTROL: &str = "temp.control";
    pub const POWER_CONTROL: &str = "power.control";
}

const ADMIN_PERMISSIONS: &[&str] = &[
    perm::DEVICE_CONTROL,
    perm::FAN_CONTROL,
    perm::TEMP_CONTROL,
    perm::POWER_CONTROL,
];

// ── Principal ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Authenticated, read-only.
    User,
    Admin,
    /// Holds every permission.
    Root,
}

impl Level {
    pub fn name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Root => "root",
        }
    }
}

/// Authenticated caller as seen by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub level: Level,
    permissions: Vec<&'static str>,
}

impl Principal {
    /// Principal with the permission set of `level`.
    pub fn new(name: &str, level: Level) -> Self {
        let permissions = match level {
            Level::User => Vec::new(),
            Level::Admin | Level::Root => ADMIN_PERMISSIONS.to_vec(),
        };
        Self {
            name: name.to_owned(),
            level,
            permissions,
        }
    }

    /// Principal holding exactly `permissions` (service accounts, tests).
    pub fn with_permissions(name: &str, permissions: &[&'static str]) -> Self {
        Self {
            name: name.to_owned(),
            level: Level::User,
            permissions: permissions.to_vec(),
        }
    }

    pub fn has(&self, permission: &str) -> bool {
        self.level == Level::Root || self.permissions.contains(&permission)
    }

    pub fn permissions(&self) -> &[&'static str] {
        &self.permissions
    }
}

// ── User records ─────────────────────────────────────────────

struct UserRecord {
    name: String,
    salt: [u8; 16],
    hash: [u8; 32],
    level: Level,
}

fn hash_password(salt: &[u8; 16], password: &str) -> [u8; 32] {
    hmac_sha256::HMAC::mac(password.as_bytes(), salt)
}

struct Session {
    id: u32,
    user: usize,
    created_at: u64,
}

// ── Session table ────────────────────────────────────────────

pub struct SessionTable {
    users: Vec<UserRecord>,
    sessions: heapless::Vec<Session, MAX_SESSIONS>,
    limiters: [burster::TokenBucket<fn() -> Duration>; MAX_CLIENTS],
    logins: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            users: Vec::new(),
            sessions: heapless::Vec::new(),
            limiters: core::array::from_fn(|_| {
                burster::TokenBucket::new_with_time_provider(
                    5,
                    5, // 5 attempts per second, burst of 5
                    platform_now as fn() -> Duration,
                )
            }),
            logins: 0,
        }
    }

    /// Add or replace a user.
    pub fn add_user(&mut self, name: &str, password: &str, level: Level) -> Result<()> {
        if name.is_empty() || name.len() > 32 {
            return Err(Error::InvalidArg("user name must be 1-32 characters"));
        }
        let mut salt = [0u8; 16];
        salt.copy_from_slice(&random_bytes()[..16]);
        let record = UserRecord {
            name: name.to_owned(),
            hash: hash_password(&salt, password),
            salt,
            level,
        };
        if let Some(i) = self.users.iter().position(|u| u.name == name) {
            self.users[i] = record;
            // existing sessions keep the old level until re-login
            self.sessions.retain(|s| s.user != i);
        } else {
            if self.users.len() >= MAX_USERS {
                return Err(Error::Internal("user table full"));
            }
            self.users.push(record);
        }
        Ok(())
    }

    /// Check credentials and open a session. `Busy` when the client has
    /// exhausted its attempts.
    pub fn login(&mut self, client: ClientId, name: &str, password: &str) -> Result<u32> {
        let limiter = self
            .limiters
            .get_mut(client as usize)
            .ok_or(Error::InvalidArg("unknown client"))?;
        if limiter.try_consume(1).is_err() {
            warn!("api: login rate limit hit for client {}", client);
            return Err(Error::Busy);
        }

        let Some(user) = self.users.iter().position(|u| u.name == name) else {
            warn!("api: login failed for unknown user");
            return Err(Error::Unauthorized);
        };
        let record = &self.users[user];
        if !hmac_sha256::HMAC::verify(password.as_bytes(), record.salt, &record.hash) {
            warn!("api: login failed for {}", name);
            return Err(Error::Unauthorized);
        }

        if self.sessions.is_full() {
            let oldest = self
                .sessions
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.created_at)
                .map(|(i, _)| i);
            if let Some(i) = oldest {
                self.sessions.swap_remove(i);
            }
        }
        let id = self.alloc_session_id();
        self.logins += 1;
        let _ = self.sessions.push(Session {
            id,
            user,
            created_at: self.logins,
        });
        info!("api: {} logged in ({})", name, record.level.name());
        Ok(id)
    }

    pub fn logout(&mut self, session: u32) -> bool {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.id != session);
        self.sessions.len() != before
    }

    pub fn principal(&self, session: u32) -> Option<Principal> {
        let s = self.sessions.iter().find(|s| s.id == session)?;
        let user = self.users.get(s.user)?;
        Some(Principal::new(&user.name, user.level))
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn alloc_session_id(&self) -> u32 {
        loop {
            let b = random_bytes();
            let id = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            if id != 0 && !self.sessions.iter().any(|s| s.id == id) {
                return id;
            }
        }
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

// ── Platform-specific randomness ─────────────────────────────

#[cfg(target_os = "espidf")]
fn random_bytes() -> [u8; 32] {
    let mut buf = [0u8; 32];
    // SAFETY: esp_fill_random writes exactly `len` bytes into the buffer.
    unsafe {
        esp_idf_sys::esp_fill_random(buf.as_mut_ptr().cast(), buf.len());
    }
    buf
}

/// Host stand-in built from `RandomState`; not cryptographic.
#[cfg(not(target_os = "espidf"))]
fn random_bytes() -> [u8; 32] {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut buf = [0u8; 32];
    for chunk in buf.chunks_mut(8) {
        let val = RandomState::new().build_hasher().finish().to_le_bytes();
        chunk.copy_from_slice(&val[..chunk.len()]);
    }
    buf
}

// ── Platform time for rate limiter ───────────────────────────

#[cfg(target_os = "espidf")]
fn platform_now() -> Duration {
    // SAFETY: reads the monotonic system timer.
    let us = unsafe { esp_idf_sys::esp_timer_get_time() };
    Duration::from_micros(us as u64)
}

#[cfg(not(target_os = "espidf"))]
fn platform_now() -> Duration {
    use std::time::Instant;
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

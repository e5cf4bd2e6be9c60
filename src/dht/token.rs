//! announce_peer tokens
//!
//! A token is an HMAC-SHA1 of the requester's IPv4 address under a
//! rotating secret, truncated to 8 bytes. Tokens minted under the
//! current or the previous secret are accepted.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Length of issued tokens in bytes
pub const TOKEN_LEN: usize = 8;

/// Default interval between secret rotations
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(300);

struct TokenSecrets {
    current: [u8; 16],
    previous: [u8; 16],
}

impl TokenSecrets {
    fn new() -> Self {
        Self {
            current: rand::random(),
            previous: rand::random(),
        }
    }

    fn rotate(&mut self) {
        self.previous = self.current;
        self.current = rand::random();
    }
}

/// Issues and validates tokens
pub struct TokenManager {
    secrets: TokenSecrets,
    rotation_interval: Duration,
    rotated_at: Instant,
}

impl TokenManager {
    pub fn new(rotation_interval: Duration, now: Instant) -> Self {
        Self {
            secrets: TokenSecrets::new(),
            rotation_interval,
            rotated_at: now,
        }
    }

    /// Rotate the secret if the interval has elapsed
    fn maybe_rotate(&mut self, now: Instant) {
        if now.saturating_duration_since(self.rotated_at) >= self.rotation_interval {
            self.secrets.rotate();
            self.rotated_at = now;
            debug!("Token secret rotated");
        }
    }

    fn token_with_secret(secret: &[u8; 16], ip: Ipv4Addr) -> [u8; TOKEN_LEN] {
        let mut token = [0u8; TOKEN_LEN];
        // HMAC accepts keys of any length
        if let Ok(mut mac) = HmacSha1::new_from_slice(secret) {
            mac.update(&ip.octets());
            let digest = mac.finalize().into_bytes();
            token.copy_from_slice(&digest[..TOKEN_LEN]);
        }
        token
    }

    /// Token for `ip` under the current secret
    pub fn token(&mut self, ip: Ipv4Addr, now: Instant) -> [u8; TOKEN_LEN] {
        self.maybe_rotate(now);
        Self::token_with_secret(&self.secrets.current, ip)
    }

    /// Whether `token` was issued to `ip` under the current or previous secret
    pub fn validate(&mut self, ip: Ipv4Addr, token: &[u8], now: Instant) -> bool {
        self.maybe_rotate(now);
        token == Self::token_with_secret(&self.secrets.current, ip).as_slice()
            || token == Self::token_with_secret(&self.secrets.previous, ip).as_slice()
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("rotation_interval", &self.rotation_interval)
            .field("rotated_at", &self.rotated_at)
            .finish_non_exhaustive()
    }
}

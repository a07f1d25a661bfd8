//! Secure-channel and token collaborators.
//!
//! The registry needs two things from the security layer:
//!
//! - [`SecureChannel::wrap`] turns an accepted TCP socket into the stream the
//!   framed channel runs over.  [`PlainChannel`] passes the socket through
//!   unchanged; an encrypting implementation wraps it in TLS.
//! - [`TokenValidator::validate`] decides whether a handshake's bearer token
//!   is acceptable.  [`TokenStore`] is the in-memory implementation.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};
use uuid::Uuid;

use super::channel::BoxedStream;
use crate::sync::lock;

/// Wraps accepted sockets before the handshake is read.
#[async_trait]
pub trait SecureChannel: Send + Sync {
    async fn wrap(&self, stream: TcpStream) -> io::Result<BoxedStream>;

    fn is_encrypted(&self) -> bool;
}

/// Pass-through channel used when encryption is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainChannel;

#[async_trait]
impl SecureChannel for PlainChannel {
    async fn wrap(&self, stream: TcpStream) -> io::Result<BoxedStream> {
        Ok(Box::new(stream))
    }

    fn is_encrypted(&self) -> bool {
        false
    }
}

/// Decides whether a handshake token is acceptable.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

#[derive(Debug, Clone)]
struct TokenRecord {
    device_id: Option<String>,
    expires_at: Instant,
}

/// Issued bearer tokens with expiry.
///
/// Tokens are 64 lowercase hex characters (two random v4 UUIDs in simple
/// form).
#[derive(Debug)]
pub struct TokenStore {
    ttl: Duration,
    tokens: Mutex<HashMap<String, TokenRecord>>,
}

impl TokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issues a new token, optionally bound to a device ID for later revocation.
    pub fn issue(&self, device_id: Option<&str>) -> String {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        lock(&self.tokens).insert(
            token.clone(),
            TokenRecord {
                device_id: device_id.map(str::to_string),
                expires_at: Instant::now() + self.ttl,
            },
        );
        debug!("issued token for {}", device_id.unwrap_or("<unbound>"));
        token
    }

    /// Returns `true` if the token existed.
    pub fn revoke(&self, token: &str) -> bool {
        lock(&self.tokens).remove(token).is_some()
    }

    /// Revokes every token bound to `device_id`; returns how many.
    pub fn revoke_device(&self, device_id: &str) -> usize {
        let mut tokens = lock(&self.tokens);
        let before = tokens.len();
        tokens.retain(|_, record| record.device_id.as_deref() != Some(device_id));
        before - tokens.len()
    }

    /// Drops expired tokens; returns how many.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut tokens = lock(&self.tokens);
        let before = tokens.len();
        tokens.retain(|_, record| record.expires_at > now);
        let purged = before - tokens.len();
        if purged > 0 {
            info!("purged {purged} expired tokens");
        }
        purged
    }

    pub fn len(&self) -> usize {
        lock(&self.tokens).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TokenValidator for TokenStore {
    fn validate(&self, token: &str) -> bool {
        lock(&self.tokens)
            .get(token)
            .is_some_and(|record| record.expires_at > Instant::now())
    }
}

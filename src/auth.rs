//! Client Authentication
//!
//! Verifies mysql_native_password challenge responses against the configured
//! users and decides which schema a session starts in.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;
use sha1::{Digest, Sha1};

use crate::config::ProxyConfig;
use crate::error::{Error, Result};

/// Length of the per-connection salt
pub const SALT_LEN: usize = 20;

/// Salted password hash used by the mysql_native_password handshake:
/// `SHA1(password) XOR SHA1(salt ++ SHA1(SHA1(password)))`.
///
/// An empty password hashes to an empty response, as clients send nothing
/// when no password is set.
pub fn auth_hash(salt: &[u8], password: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }

    let mut hasher = Sha1::new();
    hasher.update(password);
    let stage1 = hasher.finalize_reset();

    hasher.update(&stage1);
    let stage2 = hasher.finalize_reset();

    hasher.update(salt);
    hasher.update(&stage2);
    let stage3 = hasher.finalize();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Fresh random salt; bytes stay in 1..=127 so no client mistakes one for a terminator
pub fn generate_salt() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..SALT_LEN).map(|_| rng.gen_range(1..=127u8)).collect()
}

/// Who is on the other end of a session, and what they have been granted
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Login name from the handshake response
    pub user: String,
    /// Peer address
    pub host: IpAddr,
    /// Salt sent in this connection's greeting
    pub salt: Vec<u8>,
    /// Active schema, once bound
    pub schema: Option<String>,
}

impl ClientIdentity {
    pub fn new(host: IpAddr, salt: Vec<u8>) -> Self {
        Self {
            user: String::new(),
            host,
            salt,
            schema: None,
        }
    }

    fn access_denied(&self) -> Error {
        Error::AccessDenied {
            user: self.user.clone(),
            host: self.host.to_string(),
            using_password: true,
        }
    }
}

/// Authorization tables derived from one configuration snapshot
pub struct SessionAuthenticator {
    config: Arc<ProxyConfig>,
    /// user -> {password -> schema}
    user_auths: HashMap<String, HashMap<String, String>>,
    /// schema -> {user -> password}
    schemas: HashMap<String, HashMap<String, String>>,
}

impl SessionAuthenticator {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        let mut user_auths: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut schemas: HashMap<String, HashMap<String, String>> = HashMap::new();

        for user in config.users.values() {
            user_auths
                .entry(user.username.clone())
                .or_default()
                .insert(user.password.clone(), user.db_name.clone());
            schemas
                .entry(user.db_name.clone())
                .or_default()
                .insert(user.username.clone(), user.password.clone());
        }

        Self {
            config,
            user_auths,
            schemas,
        }
    }

    /// Snapshot the tables were built from
    pub fn config(&self) -> &Arc<ProxyConfig> {
        &self.config
    }

    /// Whether a schema is known
    pub fn has_schema(&self, schema: &str) -> bool {
        self.schemas.contains_key(schema)
    }

    /// Enforce the user's IP deny and allow lists. Deny wins.
    pub fn check_host(&self, identity: &ClientIdentity) -> Result<()> {
        let user = match self.config.user(&identity.user) {
            Some(u) => u,
            // Unknown users fail in the password check with the same error
            None => return Ok(()),
        };
        let host = identity.host.to_string();

        if user.black_list_ips.iter().any(|ip| ip == &host) {
            tracing::warn!(user = %identity.user, host = %host, "Login from blacklisted host");
            return Err(identity.access_denied());
        }
        if !user.auth_ips.is_empty() && !user.auth_ips.iter().any(|ip| ip == &host) {
            tracing::warn!(user = %identity.user, host = %host, "Login from host not in allow list");
            return Err(identity.access_denied());
        }
        Ok(())
    }

    /// Verify credentials when the client did not request a schema.
    /// On success the schema authorized by the matching password is bound.
    pub fn check_auth(&self, identity: &mut ClientIdentity, candidate: &[u8]) -> Result<()> {
        tracing::debug!(user = %identity.user, "checkAuth");
        let auths = match self.user_auths.get(&identity.user) {
            Some(a) => a,
            None => {
                tracing::warn!(user = %identity.user, "Connect without db, no authorization record");
                return Err(identity.access_denied());
            }
        };

        for (password, schema) in auths {
            if candidate == auth_hash(&identity.salt, password.as_bytes()).as_slice() {
                identity.schema = Some(schema.clone());
                return Ok(());
            }
        }
        Err(identity.access_denied())
    }

    /// Verify credentials for an explicitly requested schema and switch to it
    pub fn check_auth_with_db(
        &self,
        identity: &mut ClientIdentity,
        candidate: &[u8],
        schema: &str,
    ) -> Result<()> {
        let auths = self
            .schemas
            .get(schema)
            .ok_or_else(|| Error::BadDatabase(schema.to_string()))?;

        match auths.get(&identity.user) {
            Some(password) if candidate == auth_hash(&identity.salt, password.as_bytes()).as_slice() => {}
            _ => return Err(identity.access_denied()),
        }

        self.use_schema(identity, schema)
    }

    /// Switch an authenticated session to another schema it is authorized for
    pub fn use_schema(&self, identity: &mut ClientIdentity, schema: &str) -> Result<()> {
        let auths = self
            .schemas
            .get(schema)
            .ok_or_else(|| Error::BadDatabase(schema.to_string()))?;
        if !auths.contains_key(&identity.user) {
            return Err(identity.access_denied());
        }
        identity.schema = Some(schema.to_string());
        Ok(())
    }
}

//! Key-based authentication database, an external-collaborator interface.
//!
//! The database is a JSON document `{"keys": {"<key>": {...}}}`. When the
//! file is absent, operations proceed unauthenticated.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::Path;

use ipnetwork::IpNetwork;
use log::warn;
use serde::Deserialize;

use crate::errors::EngineError;

#[derive(Debug, Clone, Deserialize)]
pub struct KeySpec {
    pub userid: String,
    #[serde(default)]
    pub email: Option<String>,
    /// CIDRs or bare IPs; when non-empty, the key only works from these.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub userid: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthDb {
    pub keys: HashMap<String, KeySpec>,
}

impl AuthDb {
    /// Load the database; an absent file means unauthenticated mode.
    ///
    /// # Errors
    /// Returns read errors other than not-found, and JSON parse errors.
    pub fn load(path: &Path) -> Result<Option<Self>, EngineError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a key presented from `address` to an account, or deny.
    #[must_use]
    pub fn authenticate(&self, key: &str, address: IpAddr) -> Option<Account> {
        let spec = self.keys.get(key)?;
        if !spec.allow.is_empty() && !spec.allow.iter().any(|c| allows(c, address)) {
            warn!("auth: key for {} denied from {address}", spec.userid);
            return None;
        }
        Some(Account { userid: spec.userid.clone(), email: spec.email.clone() })
    }
}

/// A bare IP is treated as an exact-host network.
fn allows(spec: &str, address: IpAddr) -> bool {
    if let Ok(net) = spec.parse::<IpNetwork>() {
        return net.contains(address);
    }
    if let Ok(ip) = spec.parse::<IpAddr>() {
        return ip == address;
    }
    warn!("auth: unparseable allow entry {spec:?}");
    false
}

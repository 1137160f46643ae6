//! Signing identity resolution.
//!
//! The distribution service only answers over a TLS channel authenticated
//! with the taxpayer's digital certificate. Key management is external:
//! this module only resolves a taxpayer id to client-auth material.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::Config;
use crate::error::{SyncError, SyncResult};

/// Resolves a taxpayer id to TLS client credentials.
pub trait SigningIdentityProvider: Send + Sync {
    fn identity(&self, taxpayer_id: &str) -> SyncResult<reqwest::Identity>;
}

/// Reads a PEM bundle (certificate chain followed by the private key) per
/// taxpayer from the path given in configuration.
pub struct PemFileIdentity {
    paths: HashMap<String, PathBuf>,
}

impl PemFileIdentity {
    pub fn new(paths: HashMap<String, PathBuf>) -> Self {
        Self { paths }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config
                .taxpayers
                .iter()
                .map(|t| (t.tax_id.clone(), t.identity_pem.clone()))
                .collect(),
        )
    }

    fn pem_bytes(&self, taxpayer_id: &str) -> SyncResult<Vec<u8>> {
        let path = self.paths.get(taxpayer_id).ok_or_else(|| {
            SyncError::Identity(format!("no identity configured for {}", taxpayer_id))
        })?;
        std::fs::read(path).map_err(|e| {
            SyncError::Identity(format!("cannot read {}: {}", path.display(), e))
        })
    }
}

impl SigningIdentityProvider for PemFileIdentity {
    fn identity(&self, taxpayer_id: &str) -> SyncResult<reqwest::Identity> {
        let pem = self.pem_bytes(taxpayer_id)?;
        reqwest::Identity::from_pem(&pem)
            .map_err(|e| SyncError::Identity(format!("invalid PEM for {}: {}", taxpayer_id, e)))
    }
}

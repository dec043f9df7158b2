// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-invocation configuration

use serde::{Deserialize, Serialize};

use crate::constants::{tpm_rh, TpmAlgId, MAX_DIGEST_BUFFER};
use crate::error::{Error, Result};

/// Device selection, as understood by `TpmDevice::open`
const TCTI_ENV: &str = "TPM2TOOLS_TCTI";
/// Override for the largest chunk sent in one Hash/HMAC/SequenceUpdate
const MAX_BUFFER_ENV: &str = "TPM2_SESSION_MAX_BUFFER";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// TPM device path; auto-detected when unset
    pub tcti: Option<String>,
    /// Largest chunk the device accepts in a single digest command
    pub max_buffer: usize,
    /// Hash algorithm for sessions started by the auth resolver
    #[serde(with = "alg_name")]
    pub session_hash: TpmAlgId,
    /// Hierarchy that issues hash tickets
    pub hierarchy: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcti: None,
            max_buffer: MAX_DIGEST_BUFFER,
            session_hash: TpmAlgId::Sha256,
            hierarchy: tpm_rh::OWNER,
        }
    }
}

impl Config {
    /// Defaults overlaid with `TPM2TOOLS_TCTI` and `TPM2_SESSION_MAX_BUFFER`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(tcti) = lookup(TCTI_ENV).filter(|v| !v.is_empty()) {
            config.tcti = Some(tcti);
        }
        if let Some(raw) = lookup(MAX_BUFFER_ENV) {
            let max_buffer = raw.trim().parse::<usize>().map_err(|e| {
                Error::Config(format!("invalid {MAX_BUFFER_ENV} value {raw:?}: {e}"))
            })?;
            config = config.with_max_buffer(max_buffer)?;
        }
        Ok(config)
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Result<Self> {
        if max_buffer == 0 || max_buffer > MAX_DIGEST_BUFFER {
            return Err(Error::Config(format!(
                "max buffer must be within 1..={MAX_DIGEST_BUFFER}, got {max_buffer}"
            )));
        }
        self.max_buffer = max_buffer;
        Ok(self)
    }

    pub fn with_tcti(mut self, tcti: impl Into<String>) -> Self {
        self.tcti = Some(tcti.into());
        self
    }
}

mod alg_name {
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::constants::TpmAlgId;

    pub fn serialize<S: Serializer>(alg: &TpmAlgId, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{alg:?}").to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TpmAlgId, D::Error> {
        let name = String::deserialize(d)?;
        TpmAlgId::from_hash_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown hash algorithm: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.max_buffer, 1024);
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TPM2TOOLS_TCTI", "device:/dev/tpm0"),
            ("TPM2_SESSION_MAX_BUFFER", "512"),
        ]))
        .unwrap();
        assert_eq!(config.tcti.as_deref(), Some("device:/dev/tpm0"));
        assert_eq!(config.max_buffer, 512);
    }

    #[test]
    fn test_max_buffer_bounds() {
        assert!(Config::from_lookup(lookup(&[("TPM2_SESSION_MAX_BUFFER", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("TPM2_SESSION_MAX_BUFFER", "4096")])).is_err());
        assert!(Config::from_lookup(lookup(&[("TPM2_SESSION_MAX_BUFFER", "abc")])).is_err());
    }

    #[test]
    fn test_serde_hash_name() {
        let json = serde_json::to_string(&Config::default()).unwrap();
        assert!(json.contains("\"session_hash\":\"sha256\""));
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Config::default());
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization descriptors
//!
//! A descriptor is the string a user supplies to authorize an object:
//!
//! - `""`: the empty password
//! - `str:<text>` or plain text: a password
//! - `hex:<hex>`: a password given as hex bytes
//! - `file:<path>`: a password read from a file (`file:-` reads stdin)
//! - `session:<path>`: a session saved with [`TpmContext::save_session`]
//! - `pcr:<bank>:<list>[+<raw-pcr-file>]`: a new policy session satisfying
//!   PolicyPCR over the listed PCRs
//! - `hmac:<password>`: a new unbound HMAC session carrying the password

use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{debug, warn};

use crate::constants::*;
use crate::context::TpmContext;
use crate::crypto;
use crate::device::Transport;
use crate::error::{Error, Result};
use crate::session::{Session, SessionParams};
use crate::types::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDescriptor {
    Password(AuthValue),
    PasswordFile(PathBuf),
    Session(PathBuf),
    Pcr {
        bank: TpmAlgId,
        pcrs: Vec<u32>,
        raw_values: Option<PathBuf>,
    },
    Hmac(AuthValue),
}

/// What a descriptor resolved to
#[derive(Debug, Clone)]
pub enum Credential {
    Password(AuthValue),
    /// A session the caller now owns and must close
    Session { session: Session, auth: AuthValue },
}

impl Credential {
    pub fn session(&self) -> Option<Session> {
        match self {
            Credential::Password(_) => None,
            Credential::Session { session, .. } => Some(*session),
        }
    }

    pub fn auth(&self) -> &AuthValue {
        match self {
            Credential::Password(auth) | Credential::Session { auth, .. } => auth,
        }
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidAuthDescriptor(msg.into())
}

fn parse_pcr_list(list: &str) -> Result<Vec<u32>> {
    let parse_index = |s: &str| -> Result<u32> {
        let index: u32 = s
            .trim()
            .parse()
            .map_err(|_| invalid(format!("bad PCR index {s:?}")))?;
        if index > MAX_PCR_INDEX {
            return Err(invalid(format!("PCR index {index} out of range")));
        }
        Ok(index)
    };

    let mut pcrs = Vec::new();
    for item in list.split(',') {
        match item.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_index(start)?, parse_index(end)?);
                if start > end {
                    return Err(invalid(format!("bad PCR range {item:?}")));
                }
                pcrs.extend(start..=end);
            }
            None => pcrs.push(parse_index(item)?),
        }
    }
    pcrs.sort_unstable();
    pcrs.dedup();
    Ok(pcrs)
}

impl FromStr for AuthDescriptor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(text) = s.strip_prefix("str:") {
            return Ok(Self::Password(AuthValue::new(text.as_bytes())?));
        }
        if let Some(hex_str) = s.strip_prefix("hex:") {
            let bytes =
                hex::decode(hex_str).map_err(|e| invalid(format!("bad hex password: {e}")))?;
            return Ok(Self::Password(AuthValue::new(bytes)?));
        }
        if let Some(path) = s.strip_prefix("file:") {
            if path.is_empty() {
                return Err(invalid("empty password file path"));
            }
            return Ok(Self::PasswordFile(path.into()));
        }
        if let Some(path) = s.strip_prefix("session:") {
            if path.is_empty() {
                return Err(invalid("empty session file path"));
            }
            return Ok(Self::Session(path.into()));
        }
        if let Some(password) = s.strip_prefix("hmac:") {
            return Ok(Self::Hmac(AuthValue::new(password.as_bytes())?));
        }
        if let Some(selection) = s.strip_prefix("pcr:") {
            let (selection, raw_values) = match selection.split_once('+') {
                Some((_, "")) => return Err(invalid("empty raw PCR file path")),
                Some((selection, path)) => (selection, Some(PathBuf::from(path))),
                None => (selection, None),
            };
            let (bank, list) = selection
                .split_once(':')
                .ok_or_else(|| invalid(format!("expected pcr:<bank>:<list>, got {s:?}")))?;
            let bank = TpmAlgId::from_hash_name(bank)
                .ok_or_else(|| invalid(format!("unknown PCR bank {bank:?}")))?;
            return Ok(Self::Pcr {
                bank,
                pcrs: parse_pcr_list(list)?,
                raw_values,
            });
        }
        Ok(Self::Password(AuthValue::new(s.as_bytes())?))
    }
}

fn read_password_file(path: &Path) -> Result<AuthValue> {
    let bytes = if path == Path::new("-") {
        let mut bytes = Vec::new();
        std::io::stdin().read_to_end(&mut bytes)?;
        bytes
    } else {
        fs_err::read(path)?
    };
    AuthValue::new(bytes)
}

impl<T: Transport> TpmContext<T> {
    /// Parse and resolve a descriptor string
    pub fn resolve_auth(&mut self, descriptor: &str) -> Result<Credential> {
        let parsed = descriptor.parse::<AuthDescriptor>()?;
        self.resolve_auth_descriptor(&parsed)
    }

    /// Resolve a parsed descriptor, starting a session when it asks for one
    pub fn resolve_auth_descriptor(&mut self, descriptor: &AuthDescriptor) -> Result<Credential> {
        match descriptor {
            AuthDescriptor::Password(auth) => Ok(Credential::Password(auth.clone())),
            AuthDescriptor::PasswordFile(path) => {
                Ok(Credential::Password(read_password_file(path)?))
            }
            AuthDescriptor::Session(path) => {
                let session = self.load_session(path)?;
                Ok(Credential::Session {
                    session,
                    auth: AuthValue::empty(),
                })
            }
            AuthDescriptor::Hmac(auth) => {
                let params = SessionParams::hmac(self.config().session_hash);
                let session = self.start_auth_session(&params)?;
                Ok(Credential::Session {
                    session,
                    auth: auth.clone(),
                })
            }
            AuthDescriptor::Pcr {
                bank,
                pcrs,
                raw_values,
            } => {
                let hash_alg = self.config().session_hash;
                let session = self.start_auth_session(&SessionParams::policy(hash_alg))?;
                match self.assert_pcr_policy(session, *bank, pcrs, raw_values.as_deref(), hash_alg)
                {
                    Ok(()) => Ok(Credential::Session {
                        session,
                        auth: AuthValue::empty(),
                    }),
                    Err(err) => {
                        if let Err(close_err) = self.close_session(session) {
                            warn!("failed to close {session}: {close_err}");
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    fn assert_pcr_policy(
        &mut self,
        session: Session,
        bank: TpmAlgId,
        pcrs: &[u32],
        raw_values: Option<&Path>,
        hash_alg: TpmAlgId,
    ) -> Result<()> {
        let pcr_digest = match raw_values {
            Some(path) => {
                let raw = fs_err::read(path)?;
                let expected = pcrs.len() * bank.digest_size();
                if raw.len() != expected {
                    return Err(invalid(format!(
                        "{} holds {} bytes, expected {expected} for {} PCRs",
                        path.display(),
                        raw.len(),
                        pcrs.len()
                    )));
                }
                crypto::digest(hash_alg, &[&raw])?
            }
            None => self.pcr_policy_digest(bank, pcrs, hash_alg)?,
        };
        debug!("PCR policy digest {}", hex::encode(&pcr_digest));
        self.policy_pcr(
            session,
            &pcr_digest,
            &TpmlPcrSelection::single(bank, pcrs),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password(bytes: &[u8]) -> AuthDescriptor {
        AuthDescriptor::Password(AuthValue::new(bytes.to_vec()).unwrap())
    }

    #[test]
    fn test_password_forms() {
        assert_eq!("".parse::<AuthDescriptor>().unwrap(), password(b""));
        assert_eq!("secret".parse::<AuthDescriptor>().unwrap(), password(b"secret"));
        assert_eq!("str:hex:x".parse::<AuthDescriptor>().unwrap(), password(b"hex:x"));
        assert_eq!("hex:0aff".parse::<AuthDescriptor>().unwrap(), password(&[0x0a, 0xff]));
    }

    #[test]
    fn test_password_too_long() {
        let long = "a".repeat(MAX_AUTH_SIZE + 1);
        assert!(matches!(
            long.parse::<AuthDescriptor>(),
            Err(Error::InvalidAuthDescriptor(_))
        ));
    }

    #[test]
    fn test_session_and_file_forms() {
        assert_eq!(
            "session:/tmp/s.ctx".parse::<AuthDescriptor>().unwrap(),
            AuthDescriptor::Session("/tmp/s.ctx".into())
        );
        assert_eq!(
            "file:-".parse::<AuthDescriptor>().unwrap(),
            AuthDescriptor::PasswordFile("-".into())
        );
        assert!("session:".parse::<AuthDescriptor>().is_err());
        assert!("hex:zz".parse::<AuthDescriptor>().is_err());
    }

    #[test]
    fn test_pcr_forms() {
        assert_eq!(
            "pcr:sha256:0,2-4,2".parse::<AuthDescriptor>().unwrap(),
            AuthDescriptor::Pcr {
                bank: TpmAlgId::Sha256,
                pcrs: vec![0, 2, 3, 4],
                raw_values: None,
            }
        );
        assert_eq!(
            "pcr:sha1:7+pcrs.bin".parse::<AuthDescriptor>().unwrap(),
            AuthDescriptor::Pcr {
                bank: TpmAlgId::Sha1,
                pcrs: vec![7],
                raw_values: Some("pcrs.bin".into()),
            }
        );
        for bad in ["pcr:sha256", "pcr:md5:1", "pcr:sha256:24", "pcr:sha256:5-1", "pcr:sha256:"] {
            assert!(bad.parse::<AuthDescriptor>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_credential_accessors() {
        let cred = Credential::Password(AuthValue::new(b"pw".to_vec()).unwrap());
        assert_eq!(cred.session(), None);
        assert_eq!(cred.auth().as_bytes(), b"pw");
    }
}

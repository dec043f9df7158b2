// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Objects as commands see them: a handle plus what authorizes it

use std::path::Path;

use tracing::{debug, warn};

use crate::auth::Credential;
use crate::constants::*;
use crate::context::TpmContext;
use crate::device::Transport;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::shandle::Authorization;
use crate::types::AuthValue;

/// A TPM entity ready to be used by a command
#[derive(Debug, Clone)]
pub struct LoadedObject {
    pub handle: u32,
    pub auth: AuthValue,
    /// Session that authorizes the object instead of a plain password
    pub session: Option<Session>,
    /// Loaded from a context file; flushed by `close_object`
    pub transient: bool,
}

impl LoadedObject {
    /// An object already present on the TPM, authorized with an empty password
    pub fn from_handle(handle: u32) -> Self {
        Self {
            handle,
            auth: AuthValue::empty(),
            session: None,
            transient: false,
        }
    }

    pub fn with_auth(mut self, auth: AuthValue) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Attach a resolved credential
    pub fn with_credential(mut self, credential: Credential) -> Self {
        match credential {
            Credential::Password(auth) => {
                self.auth = auth;
                self.session = None;
            }
            Credential::Session { session, auth } => {
                self.auth = auth;
                self.session = Some(session);
            }
        }
        self
    }

    pub fn authorization(&self) -> Authorization<'_> {
        Authorization {
            handle: self.handle,
            auth: &self.auth,
            session: self.session,
        }
    }
}

/// Parse a hierarchy shorthand or a numeric handle
pub fn parse_handle(target: &str) -> Option<u32> {
    let handle = match target {
        "o" | "owner" => tpm_rh::OWNER,
        "p" | "platform" => tpm_rh::PLATFORM,
        "e" | "endorsement" => tpm_rh::ENDORSEMENT,
        "n" | "null" => tpm_rh::NULL,
        "l" | "lockout" => tpm_rh::LOCKOUT,
        _ => {
            return match target.strip_prefix("0x").or_else(|| target.strip_prefix("0X")) {
                Some(hex) => u32::from_str_radix(hex, 16).ok(),
                None => target.parse().ok(),
            };
        }
    };
    Some(handle)
}

impl<T: Transport> TpmContext<T> {
    /// Load an object from a hierarchy shorthand, a numeric handle, or a
    /// context file
    pub fn load_object(&mut self, target: &str) -> Result<LoadedObject> {
        if target.is_empty() {
            return Err(Error::InvalidAuthDescriptor("empty object reference".into()));
        }
        if let Some(handle) = parse_handle(target) {
            debug!("object {target} is handle 0x{handle:08x}");
            return Ok(LoadedObject::from_handle(handle));
        }
        self.load_object_context(target)
    }

    fn load_object_context(&mut self, path: impl AsRef<Path>) -> Result<LoadedObject> {
        let blob = fs_err::read(path.as_ref())?;
        let handle = self.context_load(&blob)?;
        debug!(
            "loaded object context {} as 0x{handle:08x}",
            path.as_ref().display()
        );
        Ok(LoadedObject {
            transient: true,
            ..LoadedObject::from_handle(handle)
        })
    }

    /// Load an object and resolve its auth descriptor
    pub fn load_object_with_auth(&mut self, target: &str, auth: &str) -> Result<LoadedObject> {
        let object = self.load_object(target)?;
        match self.resolve_auth(auth) {
            Ok(credential) => Ok(object.with_credential(credential)),
            Err(err) => {
                if object.transient {
                    if let Err(flush_err) = self.flush_context(object.handle) {
                        warn!("failed to flush 0x{:08x}: {flush_err}", object.handle);
                    }
                }
                Err(err)
            }
        }
    }

    /// Close the object's session and flush it if this context loaded it.
    ///
    /// Both steps are attempted; the first failure is returned.
    pub fn close_object(&mut self, object: LoadedObject) -> Result<()> {
        let closed = match object.session {
            Some(session) => self.close_session(session),
            None => Ok(()),
        };
        let flushed = if object.transient {
            self.flush_context(object.handle)
        } else {
            Ok(())
        };
        closed.and(flushed)
    }

    /// Save a transient object's context to `path`
    pub fn save_object(&mut self, object: &LoadedObject, path: impl AsRef<Path>) -> Result<()> {
        let blob = self.context_save(object.handle)?;
        fs_err::write(path.as_ref(), blob)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("o"), Some(tpm_rh::OWNER));
        assert_eq!(parse_handle("endorsement"), Some(tpm_rh::ENDORSEMENT));
        assert_eq!(parse_handle("0x81000001"), Some(0x8100_0001));
        assert_eq!(parse_handle("16"), Some(16));
        assert_eq!(parse_handle("key.ctx"), None);
    }

    #[test]
    fn test_with_credential() {
        let auth = AuthValue::new(b"pw".to_vec()).unwrap();
        let object =
            LoadedObject::from_handle(tpm_rh::OWNER).with_credential(Credential::Password(auth));
        assert_eq!(object.auth.as_bytes(), b"pw");
        assert!(object.session.is_none());
    }
}

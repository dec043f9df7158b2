// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization slots of a command
//!
//! A command that touches an authorized handle carries one slot per such
//! handle. A slot is either the password pseudo-session (`TPM_RS_PW`) or an
//! open session. [`ShandleSlots`] assembles up to three of them for a single
//! command and refuses to reuse one session in two slots.

use tracing::trace;

use crate::constants::*;
use crate::context::TpmContext;
use crate::device::*;
use crate::error::{Error, Result};
use crate::session::Session;
use crate::types::AuthValue;

/// The handle that fills one authorization slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shandle {
    /// Password pseudo-session
    Password,
    Session { session: Session, handle: u32 },
}

impl Shandle {
    /// The value placed in the slot's sessionHandle field
    pub fn handle(&self) -> u32 {
        match self {
            Shandle::Password => tpm_rh::PW,
            Shandle::Session { handle, .. } => *handle,
        }
    }

    pub fn session(&self) -> Option<Session> {
        match self {
            Shandle::Password => None,
            Shandle::Session { session, .. } => Some(*session),
        }
    }
}

/// What authorizes access to one handle of a command
#[derive(Debug, Clone, Copy)]
pub struct Authorization<'a> {
    pub handle: u32,
    pub auth: &'a AuthValue,
    pub session: Option<Session>,
}

impl<'a> Authorization<'a> {
    pub fn password(handle: u32, auth: &'a AuthValue) -> Self {
        Self {
            handle,
            auth,
            session: None,
        }
    }

    pub fn with_session(handle: u32, auth: &'a AuthValue, session: Session) -> Self {
        Self {
            handle,
            auth,
            session: Some(session),
        }
    }
}

/// Up to three slots for one command
#[derive(Debug, Default)]
pub struct ShandleSlots {
    slots: Vec<Shandle>,
}

impl ShandleSlots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, shandle: Shandle) -> Result<()> {
        if self.slots.len() == MAX_SESSION_SLOTS {
            return Err(Error::ShandleConflict(format!(
                "a command carries at most {MAX_SESSION_SLOTS} authorization slots"
            )));
        }
        if let Some(session) = shandle.session() {
            if self.slots.iter().any(|s| s.session() == Some(session)) {
                return Err(Error::ShandleConflict(format!(
                    "{session} occupies more than one slot"
                )));
            }
        }
        self.slots.push(shandle);
        Ok(())
    }

    pub fn get(&self, index: usize) -> Option<Shandle> {
        self.slots.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Shandle> {
        self.slots.iter()
    }
}

impl<T: Transport> TpmContext<T> {
    /// Pick the slot handle for `object_handle`: the password pseudo-session
    /// without a session, the session's current device handle otherwise
    pub fn resolve_shandle(&self, object_handle: u32, session: Option<Session>) -> Result<Shandle> {
        let shandle = match session {
            None => Shandle::Password,
            Some(session) => Shandle::Session {
                session,
                handle: self.sessions.entry(session)?.handle,
            },
        };
        trace!("0x{object_handle:08x} authorized by {shandle:?}");
        Ok(shandle)
    }

    /// Build the wire slot for `shandle` authorizing an entity whose
    /// auth value is `auth`
    pub(crate) fn auth_slot(&self, shandle: Shandle, auth: &AuthValue) -> Result<AuthSlot> {
        let Shandle::Session { session, handle } = shandle else {
            return Ok(AuthSlot::password(auth.as_bytes()));
        };
        let entry = self.sessions.entry(session)?;
        let hmac = match entry.session_type {
            // Policy sessions prove the auth value only after PolicyPassword or PolicyAuthValue.
            TpmSe::Policy | TpmSe::Trial if !entry.auth_value_required => Vec::new(),
            _ => auth.as_bytes().to_vec(),
        };
        Ok(AuthSlot {
            handle,
            session_type: Some(entry.session_type),
            nonce: Vec::new(),
            attributes: entry.attributes,
            hmac,
        })
    }

    /// Resolve and build the slots for one command, in handle order
    pub fn authorization_slots(&self, auths: &[Authorization<'_>]) -> Result<Vec<AuthSlot>> {
        let mut slots = ShandleSlots::new();
        for auth in auths {
            slots.push(self.resolve_shandle(auth.handle, auth.session)?)?;
        }
        slots
            .iter()
            .zip(auths)
            .map(|(shandle, auth)| self.auth_slot(*shandle, auth.auth))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_shandle() {
        assert_eq!(Shandle::Password.handle(), tpm_rh::PW);
        assert_eq!(Shandle::Password.session(), None);
    }

    #[test]
    fn test_slots_limit() {
        let mut slots = ShandleSlots::new();
        for _ in 0..MAX_SESSION_SLOTS {
            slots.push(Shandle::Password).unwrap();
        }
        assert!(matches!(
            slots.push(Shandle::Password),
            Err(Error::ShandleConflict(_))
        ));
        assert_eq!(slots.len(), 3);
    }
}

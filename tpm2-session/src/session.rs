// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 session management
//!
//! Sessions are handed out as opaque [`Session`] tokens. The TPM recycles
//! session handles, so a token carries a locally allocated id that is never
//! reused; a token whose session was closed, flushed by the TPM or saved to a
//! file resolves to [`Error::StaleSession`] instead of someone else's session.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;

use scale::{Decode, Encode};
use tracing::{debug, warn};

use crate::constants::*;
use crate::context::TpmContext;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::policy::PolicyState;
use crate::types::*;

/// Size of the caller nonce sent with StartAuthSession
const NONCE_CALLER_SIZE: usize = 16;

/// Version tag of the saved-session file
const SESSION_FILE_VERSION: u32 = 2;

/// A handle to an open authorization session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Session(u64);

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// StartAuthSession parameters
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    /// Salt decryption key; `TPM_RH_NULL` for an unsalted session
    pub tpm_key: u32,
    /// Bind entity; `TPM_RH_NULL` for an unbound session
    pub bind: u32,
    /// Random when unset
    pub nonce_caller: Option<Vec<u8>>,
    pub symmetric: TpmtSymDef,
}

impl SessionParams {
    pub fn new(session_type: TpmSe, hash_alg: TpmAlgId) -> Self {
        Self {
            session_type,
            hash_alg,
            tpm_key: tpm_rh::NULL,
            bind: tpm_rh::NULL,
            nonce_caller: None,
            symmetric: TpmtSymDef::default(),
        }
    }

    pub fn hmac(hash_alg: TpmAlgId) -> Self {
        Self::new(TpmSe::Hmac, hash_alg)
    }

    pub fn policy(hash_alg: TpmAlgId) -> Self {
        Self::new(TpmSe::Policy, hash_alg)
    }

    pub fn trial(hash_alg: TpmAlgId) -> Self {
        Self::new(TpmSe::Trial, hash_alg)
    }

    pub fn with_tpm_key(mut self, tpm_key: u32) -> Self {
        self.tpm_key = tpm_key;
        self
    }

    pub fn with_bind(mut self, bind: u32) -> Self {
        self.bind = bind;
        self
    }

    pub fn with_nonce_caller(mut self, nonce: Vec<u8>) -> Self {
        self.nonce_caller = Some(nonce);
        self
    }

    pub fn with_symmetric(mut self, symmetric: TpmtSymDef) -> Self {
        self.symmetric = symmetric;
        self
    }
}

/// What the registry knows about one open session
#[derive(Debug, Clone)]
pub(crate) struct SessionEntry {
    pub handle: u32,
    pub session_type: TpmSe,
    pub hash_alg: TpmAlgId,
    pub attributes: TpmaSession,
    pub nonce_tpm: Vec<u8>,
    pub bind: Option<u32>,
    pub policy: PolicyState,
    /// PolicyPassword or PolicyAuthValue was asserted since the last reset
    pub auth_value_required: bool,
}

impl SessionEntry {
    fn new(handle: u32, session_type: TpmSe, hash_alg: TpmAlgId, nonce_tpm: Vec<u8>) -> Self {
        Self {
            handle,
            session_type,
            hash_alg,
            attributes: TpmaSession::new().with_continue_session(),
            nonce_tpm,
            bind: None,
            policy: PolicyState::Fresh,
            auth_value_required: false,
        }
    }

    pub fn reset_policy(&mut self) {
        self.policy = PolicyState::Fresh;
        self.auth_value_required = false;
    }
}

/// Open sessions of one context, keyed by token
#[derive(Debug, Default)]
pub(crate) struct SessionRegistry {
    next_id: u64,
    open: BTreeMap<Session, SessionEntry>,
}

impl SessionRegistry {
    fn register(&mut self, entry: SessionEntry) -> Session {
        self.next_id += 1;
        let session = Session(self.next_id);
        self.open.insert(session, entry);
        session
    }

    pub fn is_open(&self, session: Session) -> bool {
        self.open.contains_key(&session)
    }

    pub fn entry(&self, session: Session) -> Result<&SessionEntry> {
        self.open.get(&session).ok_or(Error::StaleSession(session))
    }

    pub fn entry_mut(&mut self, session: Session) -> Result<&mut SessionEntry> {
        self.open
            .get_mut(&session)
            .ok_or(Error::StaleSession(session))
    }

    pub fn take(&mut self, session: Session) -> Option<SessionEntry> {
        self.open.remove(&session)
    }

    fn find_handle(&self, handle: u32) -> Option<Session> {
        self.open
            .iter()
            .find(|(_, entry)| entry.handle == handle)
            .map(|(session, _)| *session)
    }

    /// Forget the session the TPM flushed on its own
    pub fn retire_handle(&mut self, handle: u32) -> Option<Session> {
        let session = self.find_handle(handle)?;
        self.open.remove(&session);
        Some(session)
    }

    /// A policy session that authorized a command starts over
    pub fn reset_policy_after_use(&mut self, handle: u32) {
        if let Some(session) = self.find_handle(handle) {
            if let Some(entry) = self.open.get_mut(&session) {
                if entry.session_type.is_policy() {
                    entry.reset_policy();
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn drain(&mut self) -> Vec<(Session, SessionEntry)> {
        std::mem::take(&mut self.open).into_iter().collect()
    }
}

/// On-disk form of a saved session
#[derive(Debug, Encode, Decode)]
struct SessionFile {
    version: u32,
    session_type: u8,
    hash_alg: u16,
    attributes: u8,
    auth_value_required: bool,
    nonce_tpm: Vec<u8>,
    context: Vec<u8>,
}

impl<T: Transport> TpmContext<T> {
    /// TPM2_StartAuthSession
    pub fn start_auth_session(&mut self, params: &SessionParams) -> Result<Session> {
        let nonce_caller = match &params.nonce_caller {
            Some(nonce) => nonce.clone(),
            None => {
                let mut nonce = vec![0u8; NONCE_CALLER_SIZE];
                getrandom::fill(&mut nonce).map_err(|e| {
                    Error::Io(std::io::Error::other(format!("failed to generate nonce: {e}")))
                })?;
                nonce
            }
        };

        let mut cmd = CommandBuffer::new();
        // nonceCaller
        cmd.put_tpm2b_bounded(&nonce_caller, Tpm2bNonce::MAX_SIZE, "nonceCaller")?;
        // encryptedSalt (empty - no salt)
        cmd.put_tpm2b(&[]);
        cmd.put_u8(params.session_type as u8);
        cmd.put(&params.symmetric);
        // authHash
        cmd.put_u16(params.hash_alg.to_u16());

        let request = TpmRequest::new(TpmCc::StartAuthSession)
            .handle(params.tpm_key)
            .handle(params.bind)
            .params(cmd);
        let response = self.execute(request)?;
        let handle = response.out_handle()?;
        let nonce_tpm = response
            .param_buffer()
            .get_tpm2b_bounded(Tpm2bNonce::MAX_SIZE, "nonceTPM")?;

        let mut entry = SessionEntry::new(handle, params.session_type, params.hash_alg, nonce_tpm);
        if params.bind != tpm_rh::NULL {
            entry.bind = Some(params.bind);
        }
        let session = self.sessions.register(entry);
        debug!(
            "started {:?} {session} as handle 0x{handle:08x}",
            params.session_type
        );
        Ok(session)
    }

    /// Start an unbound, unsalted session with default parameters
    pub fn start_session(&mut self, session_type: TpmSe, hash_alg: TpmAlgId) -> Result<Session> {
        self.start_auth_session(&SessionParams::new(session_type, hash_alg))
    }

    /// Start a session that is closed when the returned guard is dropped
    pub fn scoped_session(&mut self, params: &SessionParams) -> Result<SessionGuard<'_, T>> {
        let session = self.start_auth_session(params)?;
        Ok(SessionGuard {
            ctx: self,
            session,
            armed: true,
        })
    }

    /// Flush a session and invalidate its token.
    ///
    /// Closing a session that is already closed is a no-op.
    pub fn close_session(&mut self, session: Session) -> Result<()> {
        let Some(entry) = self.sessions.take(session) else {
            debug!("{session} already closed");
            return Ok(());
        };
        self.flush_context(entry.handle)
    }

    pub fn is_session_open(&self, session: Session) -> bool {
        self.sessions.is_open(session)
    }

    /// Number of sessions this context currently holds open
    pub fn open_session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_handle(&self, session: Session) -> Result<u32> {
        Ok(self.sessions.entry(session)?.handle)
    }

    pub fn session_type(&self, session: Session) -> Result<TpmSe> {
        Ok(self.sessions.entry(session)?.session_type)
    }

    pub fn session_hash_alg(&self, session: Session) -> Result<TpmAlgId> {
        Ok(self.sessions.entry(session)?.hash_alg)
    }

    /// The nonce the TPM returned at session start
    pub fn nonce_tpm(&self, session: Session) -> Result<&[u8]> {
        Ok(&self.sessions.entry(session)?.nonce_tpm)
    }

    pub fn get_session_attributes(&self, session: Session) -> Result<TpmaSession> {
        Ok(self.sessions.entry(session)?.attributes)
    }

    /// Update only the attribute bits selected by `mask`
    pub fn set_session_attributes(
        &mut self,
        session: Session,
        flags: TpmaSession,
        mask: TpmaSession,
    ) -> Result<()> {
        let entry = self.sessions.entry_mut(session)?;
        entry.attributes = entry.attributes.masked_update(flags, mask);
        debug!("{session} attributes now {:?}", entry.attributes);
        Ok(())
    }

    /// ContextSave a session into `path`; the token becomes stale.
    ///
    /// The saved session stays alive on the TPM until it is loaded again
    /// with [`TpmContext::load_session`] and closed.
    pub fn save_session(&mut self, session: Session, path: impl AsRef<Path>) -> Result<()> {
        let entry = self.sessions.entry(session)?.clone();
        let context = self.context_save(entry.handle)?;
        let file = SessionFile {
            version: SESSION_FILE_VERSION,
            session_type: entry.session_type as u8,
            hash_alg: entry.hash_alg.to_u16(),
            attributes: entry.attributes.0,
            auth_value_required: entry.auth_value_required,
            nonce_tpm: entry.nonce_tpm,
            context,
        };
        fs_err::write(path.as_ref(), file.encode())?;
        self.sessions.take(session);
        debug!("saved {session} to {}", path.as_ref().display());
        Ok(())
    }

    /// ContextLoad a session saved by [`TpmContext::save_session`]
    pub fn load_session(&mut self, path: impl AsRef<Path>) -> Result<Session> {
        let bytes = fs_err::read(path.as_ref())?;
        let file = SessionFile::decode(&mut &bytes[..]).map_err(|e| {
            Error::InvalidAuthDescriptor(format!(
                "{} is not a session file: {e}",
                path.as_ref().display()
            ))
        })?;
        if file.version != SESSION_FILE_VERSION {
            return Err(Error::InvalidAuthDescriptor(format!(
                "unsupported session file version {}",
                file.version
            )));
        }
        let session_type = TpmSe::from_u8(file.session_type).ok_or_else(|| {
            Error::InvalidAuthDescriptor(format!("unknown session type {}", file.session_type))
        })?;
        let hash_alg = TpmAlgId::from_u16(file.hash_alg).ok_or_else(|| {
            Error::InvalidAuthDescriptor(format!("unknown session hash 0x{:04x}", file.hash_alg))
        })?;

        let handle = self.context_load(&file.context)?;
        let mut entry = SessionEntry::new(handle, session_type, hash_alg, file.nonce_tpm);
        entry.attributes = TpmaSession(file.attributes);
        entry.auth_value_required = file.auth_value_required;
        // A loaded policy session may carry assertions we cannot see.
        entry.policy = PolicyState::Building;
        let session = self.sessions.register(entry);
        debug!(
            "loaded {session} from {} as handle 0x{handle:08x}",
            path.as_ref().display()
        );
        Ok(session)
    }
}

/// An open session that is closed when dropped
pub struct SessionGuard<'a, T: Transport> {
    ctx: &'a mut TpmContext<T>,
    session: Session,
    armed: bool,
}

impl<T: Transport> SessionGuard<'_, T> {
    pub fn session(&self) -> Session {
        self.session
    }

    /// Keep the session open past the guard
    pub fn release(mut self) -> Session {
        self.armed = false;
        self.session
    }

    /// Close now and report the flush result
    pub fn close(mut self) -> Result<()> {
        self.armed = false;
        let session = self.session;
        self.ctx.close_session(session)
    }
}

impl<T: Transport> Deref for SessionGuard<'_, T> {
    type Target = TpmContext<T>;

    fn deref(&self) -> &Self::Target {
        self.ctx
    }
}

impl<T: Transport> DerefMut for SessionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.ctx
    }
}

impl<T: Transport> Drop for SessionGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(err) = self.ctx.close_session(self.session) {
            warn!("failed to close {}: {err}", self.session);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(handle: u32, session_type: TpmSe) -> SessionEntry {
        SessionEntry::new(handle, session_type, TpmAlgId::Sha256, vec![1; 16])
    }

    #[test]
    fn test_tokens_are_not_reused() {
        let mut registry = SessionRegistry::default();
        let first = registry.register(entry(0x0300_0000, TpmSe::Policy));
        assert!(registry.take(first).is_some());
        let second = registry.register(entry(0x0300_0000, TpmSe::Policy));
        assert_ne!(first, second);
        assert!(matches!(
            registry.entry(first),
            Err(Error::StaleSession(s)) if s == first
        ));
        assert_eq!(registry.entry(second).unwrap().handle, 0x0300_0000);
    }

    #[test]
    fn test_default_attributes_continue_session() {
        let mut registry = SessionRegistry::default();
        let session = registry.register(entry(0x0200_0000, TpmSe::Hmac));
        let attrs = registry.entry(session).unwrap().attributes;
        assert!(attrs.continue_session());
        assert_eq!(attrs, TpmaSession::new().with_continue_session());
    }

    #[test]
    fn test_retire_handle() {
        let mut registry = SessionRegistry::default();
        let a = registry.register(entry(0x0200_0000, TpmSe::Hmac));
        let b = registry.register(entry(0x0300_0001, TpmSe::Policy));
        assert_eq!(registry.retire_handle(0x0300_0001), Some(b));
        assert_eq!(registry.retire_handle(0x0300_0001), None);
        assert!(registry.is_open(a));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_policy_reset_after_use() {
        let mut registry = SessionRegistry::default();
        let s = registry.register(entry(0x0300_0000, TpmSe::Policy));
        {
            let e = registry.entry_mut(s).unwrap();
            e.policy = PolicyState::Building;
            e.auth_value_required = true;
        }
        registry.reset_policy_after_use(0x0300_0000);
        let e = registry.entry(s).unwrap();
        assert_eq!(e.policy, PolicyState::Fresh);
        assert!(!e.auth_value_required);
    }

    #[test]
    fn test_session_file_encoding() {
        let file = SessionFile {
            version: SESSION_FILE_VERSION,
            session_type: TpmSe::Policy as u8,
            hash_alg: TpmAlgId::Sha256.to_u16(),
            attributes: TpmaSession::CONTINUE_SESSION,
            auth_value_required: true,
            nonce_tpm: vec![7; 16],
            context: vec![1, 2, 3],
        };
        let decoded = SessionFile::decode(&mut &file.encode()[..]).unwrap();
        assert_eq!(decoded.context, vec![1, 2, 3]);
        assert_eq!(decoded.session_type, 1);
        assert!(decoded.auth_value_required);
    }
}

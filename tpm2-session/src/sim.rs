// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process software TPM
//!
//! [`SoftTpm`] implements [`Transport`] for the commands this crate issues.
//! It keeps real policy digests (so trial digests match what a hardware TPM
//! computes), a SHA-256 PCR bank, hash and HMAC sequences, hierarchy and
//! object authorization, NV definitions and persistent handles. It enforces a
//! small session limit, checks every authorization slot, flushes sessions
//! submitted without `continueSession`, and records each command code so
//! tests can assert exact call sequences.
//!
//! Simplifications: HMAC sessions carry the plaintext auth value, and
//! ActivateCredential treats the credential blob as plaintext.

use std::collections::{BTreeMap, BTreeSet};

use tracing::trace;

use crate::constants::*;
use crate::crypto;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::*;

type SimResult<T> = std::result::Result<T, ResponseCode>;

const DEFAULT_SESSION_LIMIT: usize = 3;
const TRANSIENT_FIRST: u32 = 0x8000_0000;
const PCR_COUNT: usize = (MAX_PCR_INDEX + 1) as usize;
const CONTEXT_MAGIC: &[u8; 4] = b"SIMC";
const CONTEXT_SESSION: u8 = 1;
const CONTEXT_OBJECT: u8 = 2;
/// TPM_GENERATED_VALUE
const TPM_GENERATED: u32 = 0xFF54_4347;
/// TPM_ST_ATTEST_CERTIFY
const ST_ATTEST_CERTIFY: u16 = 0x8017;

fn malformed(_: Error) -> ResponseCode {
    TpmRc::Size.into()
}

fn param_error(base: TpmRc, n: u8) -> ResponseCode {
    ResponseCode::format1(base, RcSubject::Parameter(n))
}

fn handle_error(base: TpmRc, n: u8) -> ResponseCode {
    ResponseCode::format1(base, RcSubject::Handle(n))
}

fn session_error(base: TpmRc, n: u8) -> ResponseCode {
    ResponseCode::format1(base, RcSubject::Session(n))
}

fn sim_digest(hash_alg: TpmAlgId, parts: &[&[u8]]) -> SimResult<Vec<u8>> {
    crypto::digest(hash_alg, parts).map_err(|_| TpmRc::Hash.into())
}

#[derive(Debug, Clone)]
struct SimSession {
    session_type: TpmSe,
    hash_alg: TpmAlgId,
    digest: Vec<u8>,
    nonce_tpm: Vec<u8>,
    /// PolicyPassword/PolicyAuthValue asserted
    needs_auth_value: bool,
    command_code: Option<u32>,
    saved: bool,
}

impl SimSession {
    fn reset(&mut self) {
        self.digest = vec![0u8; self.hash_alg.digest_size()];
        self.needs_auth_value = false;
        self.command_code = None;
    }
}

#[derive(Debug, Clone)]
enum ObjectKind {
    KeyedHash { key: Vec<u8>, hash_alg: TpmAlgId },
    Signing { key_type: TpmAlgId },
}

#[derive(Debug, Clone)]
struct SimObject {
    kind: ObjectKind,
    auth: Vec<u8>,
    auth_policy: Vec<u8>,
    seed: u32,
}

impl SimObject {
    fn key_type(&self) -> TpmAlgId {
        match self.kind {
            ObjectKind::KeyedHash { .. } => TpmAlgId::KeyedHash,
            ObjectKind::Signing { key_type } => key_type,
        }
    }

    /// A minimal TPMT_PUBLIC: type, nameAlg, attributes, authPolicy, unique
    fn public_area(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.put_u16(self.key_type().to_u16());
        buf.put_u16(TpmAlgId::Sha256.to_u16());
        buf.put_u32(0);
        buf.put_tpm2b(&self.auth_policy);
        buf.put_tpm2b(&self.seed.to_be_bytes());
        buf.into_vec()
    }

    fn name(&self) -> SimResult<Vec<u8>> {
        let mut name = TpmAlgId::Sha256.to_u16().to_be_bytes().to_vec();
        name.extend(sim_digest(TpmAlgId::Sha256, &[&self.public_area()])?);
        Ok(name)
    }
}

#[derive(Debug, Clone)]
enum SequenceKind {
    Hash,
    Hmac { key: Vec<u8> },
}

#[derive(Debug, Clone)]
struct SimSequence {
    kind: SequenceKind,
    hash_alg: TpmAlgId,
    data: Vec<u8>,
    auth: Vec<u8>,
}

#[derive(Debug, Clone)]
struct SimNv {
    public: TpmsNvPublic,
    auth: Vec<u8>,
}

/// Session slots to update once a command succeeds
enum AfterUse {
    Keep,
    ResetPolicy(u32),
    Flush(u32),
}

pub struct SoftTpm {
    session_limit: usize,
    sessions: BTreeMap<u32, SimSession>,
    objects: BTreeMap<u32, SimObject>,
    sequences: BTreeMap<u32, SimSequence>,
    nv: BTreeMap<u32, SimNv>,
    hierarchy_auth: BTreeMap<u32, Vec<u8>>,
    pcrs: Vec<Vec<u8>>,
    next_transient: u32,
    counter: u64,
    commands: Vec<TpmCc>,
    failures: Vec<(TpmCc, ResponseCode)>,
}

impl Default for SoftTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftTpm {
    pub fn new() -> Self {
        let hierarchy_auth = [
            tpm_rh::OWNER,
            tpm_rh::ENDORSEMENT,
            tpm_rh::PLATFORM,
            tpm_rh::LOCKOUT,
            tpm_rh::NULL,
        ]
        .into_iter()
        .map(|h| (h, Vec::new()))
        .collect();
        Self {
            session_limit: DEFAULT_SESSION_LIMIT,
            sessions: BTreeMap::new(),
            objects: BTreeMap::new(),
            sequences: BTreeMap::new(),
            nv: BTreeMap::new(),
            hierarchy_auth,
            pcrs: vec![vec![0u8; TpmAlgId::Sha256.digest_size()]; PCR_COUNT],
            next_transient: TRANSIENT_FIRST,
            counter: 0,
            commands: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn with_session_limit(mut self, limit: usize) -> Self {
        self.session_limit = limit;
        self
    }

    pub fn set_hierarchy_auth(&mut self, hierarchy: u32, auth: &[u8]) {
        self.hierarchy_auth.insert(hierarchy, auth.to_vec());
    }

    fn alloc_transient(&mut self) -> u32 {
        let handle = self.next_transient;
        self.next_transient += 1;
        handle
    }

    fn add_object(&mut self, kind: ObjectKind, auth: &[u8]) -> u32 {
        let handle = self.alloc_transient();
        self.objects.insert(
            handle,
            SimObject {
                kind,
                auth: auth.to_vec(),
                auth_policy: Vec::new(),
                seed: handle,
            },
        );
        handle
    }

    /// Load a SHA-256 keyed-hash key; returns its transient handle
    pub fn add_hmac_key(&mut self, key: &[u8], auth: &[u8]) -> u32 {
        self.add_object(
            ObjectKind::KeyedHash {
                key: key.to_vec(),
                hash_alg: TpmAlgId::Sha256,
            },
            auth,
        )
    }

    /// Load a signing key of `key_type` (RSA or ECC)
    pub fn add_signing_key(&mut self, key_type: TpmAlgId, auth: &[u8]) -> u32 {
        self.add_object(ObjectKind::Signing { key_type }, auth)
    }

    /// Require a policy session with `policy` to authorize `handle`
    pub fn set_auth_policy(&mut self, handle: u32, policy: &[u8]) -> bool {
        match self.objects.get_mut(&handle) {
            Some(object) => {
                object.auth_policy = policy.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn object_name(&self, handle: u32) -> Option<Vec<u8>> {
        self.objects.get(&handle).and_then(|o| o.name().ok())
    }

    pub fn has_object(&self, handle: u32) -> bool {
        self.objects.contains_key(&handle)
    }

    /// Extend a SHA-256 PCR
    pub fn extend_pcr(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let pcr = self
            .pcrs
            .get_mut(index as usize)
            .ok_or_else(|| Error::Config(format!("no PCR {index}")))?;
        let measurement = crypto::digest(TpmAlgId::Sha256, &[data])?;
        *pcr = crypto::digest(TpmAlgId::Sha256, &[pcr, &measurement])?;
        Ok(())
    }

    pub fn pcr_value(&self, index: u32) -> Option<&[u8]> {
        self.pcrs.get(index as usize).map(Vec::as_slice)
    }

    /// Every command code submitted so far
    pub fn commands(&self) -> &[TpmCc] {
        &self.commands
    }

    pub fn command_count(&self, code: TpmCc) -> usize {
        self.commands.iter().filter(|c| **c == code).count()
    }

    /// Answer the next `code` command with `rc`
    pub fn fail_next(&mut self, code: TpmCc, rc: ResponseCode) {
        self.failures.push((code, rc));
    }

    /// Sessions present on the device, loaded or saved
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sequence_count(&self) -> usize {
        self.sequences.len()
    }

    pub fn nv_public(&self, index: u32) -> Option<&TpmsNvPublic> {
        self.nv.get(&index).map(|nv| &nv.public)
    }

    /// A verification ticket as VerifySignature would issue it for an
    /// approval of `approved` by the key named `key_sign`
    pub fn approve_policy(
        &self,
        approved: &PolicyDigest,
        policy_ref: &[u8],
        key_sign: &[u8],
    ) -> Result<TpmtTkVerified> {
        let a_hash = crypto::digest(TpmAlgId::Sha256, &[approved.as_bytes(), policy_ref])?;
        Ok(Ticket {
            tag: TpmSt::Verified,
            hierarchy: tpm_rh::OWNER,
            digest: crypto::digest(TpmAlgId::Sha256, &[b"verified", &a_hash, key_sign])?,
        })
    }

    fn next_nonce(&mut self, hash_alg: TpmAlgId) -> SimResult<Vec<u8>> {
        self.counter += 1;
        sim_digest(hash_alg, &[b"nonce", &self.counter.to_be_bytes()])
    }

    fn entity_name(&self, handle: u32) -> SimResult<Vec<u8>> {
        match self.objects.get(&handle) {
            Some(object) => object.name(),
            None => Ok(handle.to_be_bytes().to_vec()),
        }
    }

    /// Auth value and policy of an authorizable entity
    fn entity_auth(&self, handle: u32, n: u8) -> SimResult<(Vec<u8>, Vec<u8>)> {
        if let Some(auth) = self.hierarchy_auth.get(&handle) {
            return Ok((auth.clone(), Vec::new()));
        }
        if let Some(object) = self.objects.get(&handle) {
            return Ok((object.auth.clone(), object.auth_policy.clone()));
        }
        if let Some(sequence) = self.sequences.get(&handle) {
            return Ok((sequence.auth.clone(), Vec::new()));
        }
        if let Some(nv) = self.nv.get(&handle) {
            return Ok((nv.auth.clone(), nv.public.auth_policy.clone()));
        }
        Err(handle_error(TpmRc::Handle, n))
    }

    fn auth_count(code: TpmCc) -> usize {
        match code {
            TpmCc::Certify | TpmCc::ActivateCredential => 2,
            TpmCc::PolicySecret
            | TpmCc::HmacStart
            | TpmCc::Hmac
            | TpmCc::SequenceUpdate
            | TpmCc::SequenceComplete
            | TpmCc::NvDefineSpace
            | TpmCc::EvictControl => 1,
            _ => 0,
        }
    }

    /// Check every authorization slot against the handle it covers
    fn authorize(&self, request: &TpmRequest) -> SimResult<Vec<AfterUse>> {
        let expected = Self::auth_count(request.code);
        if request.auths.len() < expected {
            return Err(TpmRc::AuthMissing.into());
        }
        if request.auths.len() > expected {
            return Err(TpmRc::AuthContext.into());
        }
        let mut after = Vec::with_capacity(expected);
        for (i, slot) in request.auths.iter().enumerate() {
            let n = (i + 1) as u8;
            let entity = *request
                .handles
                .get(i)
                .ok_or_else(|| handle_error(TpmRc::Handle, n))?;
            let (auth, policy) = self.entity_auth(entity, n)?;
            if slot.is_password() {
                if slot.hmac != auth {
                    return Err(session_error(TpmRc::AuthFail, n));
                }
                after.push(AfterUse::Keep);
                continue;
            }
            let session = self
                .sessions
                .get(&slot.handle)
                .filter(|s| !s.saved)
                .ok_or_else(|| session_error(TpmRc::Value, n))?;
            match session.session_type {
                TpmSe::Hmac => {
                    if slot.hmac != auth {
                        return Err(session_error(TpmRc::AuthFail, n));
                    }
                }
                TpmSe::Trial => return Err(session_error(TpmRc::PolicyFail, n)),
                TpmSe::Policy => {
                    if policy.is_empty() || session.digest != policy {
                        return Err(session_error(TpmRc::PolicyFail, n));
                    }
                    if session.command_code.is_some_and(|cc| cc != request.code.to_u32()) {
                        return Err(session_error(TpmRc::PolicyCc, n));
                    }
                    if session.needs_auth_value && slot.hmac != auth {
                        return Err(session_error(TpmRc::AuthFail, n));
                    }
                }
            }
            after.push(if !slot.attributes.continue_session() {
                AfterUse::Flush(slot.handle)
            } else if session.session_type.is_policy() {
                AfterUse::ResetPolicy(slot.handle)
            } else {
                AfterUse::Keep
            });
        }
        Ok(after)
    }

    fn policy_session(&mut self, handle: u32, n: u8) -> SimResult<&mut SimSession> {
        self.sessions
            .get_mut(&handle)
            .filter(|s| !s.saved && s.session_type.is_policy())
            .ok_or_else(|| handle_error(TpmRc::Handle, n))
    }

    fn extend_policy(&mut self, handle: u32, n: u8, parts: &[&[u8]]) -> SimResult<()> {
        let session = self.policy_session(handle, n)?;
        let mut all: Vec<&[u8]> = vec![session.digest.as_slice()];
        all.extend_from_slice(parts);
        session.digest = sim_digest(session.hash_alg, &all)?;
        Ok(())
    }

    fn handle_at(request: &TpmRequest, i: usize) -> SimResult<u32> {
        request
            .handles
            .get(i)
            .copied()
            .ok_or_else(|| handle_error(TpmRc::Handle, (i + 1) as u8))
    }

    fn dispatch(&mut self, request: &TpmRequest) -> SimResult<TpmResponse> {
        let after = self.authorize(request)?;
        let mut params = ResponseBuffer::new(&request.params);
        let response = match request.code {
            TpmCc::StartAuthSession => self.start_auth_session(request, &mut params)?,
            TpmCc::FlushContext => self.flush_context(&mut params)?,
            TpmCc::ContextSave => self.context_save(request)?,
            TpmCc::ContextLoad => self.context_load(&mut params)?,
            TpmCc::PolicyRestart => {
                let handle = Self::handle_at(request, 0)?;
                self.policy_session(handle, 1)?.reset();
                TpmResponse::success(vec![], vec![])
            }
            TpmCc::PolicyGetDigest => {
                let handle = Self::handle_at(request, 0)?;
                let digest = self.policy_session(handle, 1)?.digest.clone();
                TpmResponse::success(vec![], Tpm2bDigest::new(digest).to_bytes())
            }
            TpmCc::PolicyPassword | TpmCc::PolicyAuthValue => {
                let handle = Self::handle_at(request, 0)?;
                // Both leave the same digest: the auth value is checked at use.
                self.extend_policy(handle, 1, &[&TpmCc::PolicyAuthValue.to_u32().to_be_bytes()])?;
                self.policy_session(handle, 1)?.needs_auth_value = true;
                TpmResponse::success(vec![], vec![])
            }
            TpmCc::PolicyPcr => self.policy_pcr(request, &mut params)?,
            TpmCc::PolicySecret => self.policy_secret(request, &mut params)?,
            TpmCc::PolicyOr => self.policy_or(request, &mut params)?,
            TpmCc::PolicyAuthorize => self.policy_authorize(request, &mut params)?,
            TpmCc::PolicyCommandCode => {
                let handle = Self::handle_at(request, 0)?;
                let code = params.get_u32().map_err(malformed)?;
                let cc = TpmCc::PolicyCommandCode.to_u32().to_be_bytes();
                self.extend_policy(handle, 1, &[&cc, &code.to_be_bytes()])?;
                self.policy_session(handle, 1)?.command_code = Some(code);
                TpmResponse::success(vec![], vec![])
            }
            TpmCc::PolicyLocality => {
                let handle = Self::handle_at(request, 0)?;
                let locality = params.get_u8().map_err(malformed)?;
                let cc = TpmCc::PolicyLocality.to_u32().to_be_bytes();
                self.extend_policy(handle, 1, &[&cc, &[locality]])?;
                TpmResponse::success(vec![], vec![])
            }
            TpmCc::PolicyDuplicationSelect => {
                let handle = Self::handle_at(request, 0)?;
                let object_name = params.get_tpm2b().map_err(malformed)?;
                let new_parent_name = params.get_tpm2b().map_err(malformed)?;
                let include = params.get_u8().map_err(malformed)?;
                let cc = TpmCc::PolicyDuplicationSelect.to_u32().to_be_bytes();
                let object_part: &[u8] = if include != 0 { &object_name } else { &[] };
                self.extend_policy(
                    handle,
                    1,
                    &[&cc, object_part, &new_parent_name, &[include]],
                )?;
                TpmResponse::success(vec![], vec![])
            }
            TpmCc::PcrRead => self.pcr_read(&mut params)?,
            TpmCc::Hash => self.hash(&mut params)?,
            TpmCc::Hmac => self.hmac(request, &mut params)?,
            TpmCc::HashSequenceStart => self.hash_sequence_start(&mut params)?,
            TpmCc::HmacStart => self.hmac_start(request, &mut params)?,
            TpmCc::SequenceUpdate => {
                let handle = Self::handle_at(request, 0)?;
                let chunk = params
                    .get_tpm2b_bounded(MAX_DIGEST_BUFFER, "buffer")
                    .map_err(|_| param_error(TpmRc::Size, 1))?;
                let sequence = self
                    .sequences
                    .get_mut(&handle)
                    .ok_or_else(|| handle_error(TpmRc::Handle, 1))?;
                sequence.data.extend(chunk);
                TpmResponse::success(vec![], vec![])
            }
            TpmCc::SequenceComplete => self.sequence_complete(request, &mut params)?,
            TpmCc::ReadPublic => {
                let handle = Self::handle_at(request, 0)?;
                let object = self
                    .objects
                    .get(&handle)
                    .ok_or_else(|| handle_error(TpmRc::Handle, 1))?;
                let name = object.name()?;
                let mut out = CommandBuffer::new();
                out.put_tpm2b(&object.public_area());
                out.put_tpm2b(&name);
                out.put_tpm2b(&name);
                TpmResponse::success(vec![], out.into_vec())
            }
            TpmCc::Certify => self.certify(request, &mut params)?,
            TpmCc::ActivateCredential => self.activate_credential(request, &mut params)?,
            TpmCc::NvDefineSpace => self.nv_define_space(request, &mut params)?,
            TpmCc::EvictControl => self.evict_control(request, &mut params)?,
            _ => return Err(TpmRc::CommandCode.into()),
        };

        for action in after {
            match action {
                AfterUse::Keep => {}
                AfterUse::ResetPolicy(handle) => {
                    if let Some(session) = self.sessions.get_mut(&handle) {
                        session.reset();
                    }
                }
                AfterUse::Flush(handle) => {
                    self.sessions.remove(&handle);
                }
            }
        }
        Ok(response)
    }

    fn start_auth_session(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let nonce_caller = params.get_tpm2b().map_err(malformed)?;
        let _salt = params.get_tpm2b().map_err(malformed)?;
        let session_type = TpmSe::from_u8(params.get_u8().map_err(malformed)?)
            .ok_or_else(|| param_error(TpmRc::Value, 3))?;
        let _symmetric = params.get::<TpmtSymDef>().map_err(malformed)?;
        let hash_alg = TpmAlgId::from_u16(params.get_u16().map_err(malformed)?)
            .filter(|alg| crypto::digest(*alg, &[]).is_ok())
            .ok_or_else(|| param_error(TpmRc::Hash, 5))?;
        if !(16..=Tpm2bNonce::MAX_SIZE).contains(&nonce_caller.len()) {
            return Err(param_error(TpmRc::Size, 1));
        }
        if request.handles.len() != 2 {
            return Err(handle_error(TpmRc::Handle, 1));
        }
        if self.sessions.len() >= self.session_limit {
            return Err(TpmRc::SessionHandles.into());
        }

        let index = (0u32..)
            .find(|i| !self.sessions.keys().any(|h| h & 0x00FF_FFFF == *i))
            .unwrap_or_default();
        let ht = if session_type == TpmSe::Hmac {
            tpm_ht::HMAC_SESSION
        } else {
            tpm_ht::POLICY_SESSION
        };
        let handle = (u32::from(ht) << 24) | index;
        let nonce_tpm = self.next_nonce(hash_alg)?;
        let mut session = SimSession {
            session_type,
            hash_alg,
            digest: Vec::new(),
            nonce_tpm: nonce_tpm.clone(),
            needs_auth_value: false,
            command_code: None,
            saved: false,
        };
        session.reset();
        self.sessions.insert(handle, session);
        Ok(TpmResponse::success(
            vec![handle],
            Tpm2bNonce::new(nonce_tpm).to_bytes(),
        ))
    }

    fn flush_context(&mut self, params: &mut ResponseBuffer) -> SimResult<TpmResponse> {
        let handle = params.get_u32().map_err(malformed)?;
        let flushed = self.sessions.remove(&handle).is_some()
            || self.sequences.remove(&handle).is_some()
            || (tpm_ht::of(handle) == tpm_ht::TRANSIENT && self.objects.remove(&handle).is_some());
        if !flushed {
            return Err(param_error(TpmRc::Handle, 1));
        }
        Ok(TpmResponse::success(vec![], vec![]))
    }

    fn context_save(&mut self, request: &TpmRequest) -> SimResult<TpmResponse> {
        let handle = Self::handle_at(request, 0)?;
        let kind = if let Some(session) = self.sessions.get_mut(&handle) {
            if session.saved {
                return Err(handle_error(TpmRc::Handle, 1));
            }
            session.saved = true;
            CONTEXT_SESSION
        } else if tpm_ht::of(handle) == tpm_ht::TRANSIENT && self.objects.contains_key(&handle) {
            CONTEXT_OBJECT
        } else {
            return Err(handle_error(TpmRc::Handle, 1));
        };
        let mut blob = CONTEXT_MAGIC.to_vec();
        blob.push(kind);
        blob.extend(handle.to_be_bytes());
        Ok(TpmResponse::success(vec![], blob))
    }

    fn context_load(&mut self, params: &mut ResponseBuffer) -> SimResult<TpmResponse> {
        let magic = params.get_bytes(CONTEXT_MAGIC.len()).map_err(malformed)?;
        if magic != CONTEXT_MAGIC {
            return Err(param_error(TpmRc::Value, 1));
        }
        let kind = params.get_u8().map_err(malformed)?;
        let handle = params.get_u32().map_err(malformed)?;
        let loaded = match kind {
            CONTEXT_SESSION => {
                let session = self
                    .sessions
                    .get_mut(&handle)
                    .filter(|s| s.saved)
                    .ok_or_else(|| param_error(TpmRc::Handle, 1))?;
                session.saved = false;
                handle
            }
            CONTEXT_OBJECT => {
                let object = self
                    .objects
                    .get(&handle)
                    .cloned()
                    .ok_or_else(|| param_error(TpmRc::Handle, 1))?;
                let copy = self.alloc_transient();
                self.objects.insert(copy, object);
                copy
            }
            _ => return Err(param_error(TpmRc::Value, 1)),
        };
        Ok(TpmResponse::success(vec![loaded], vec![]))
    }

    fn selected_pcr_digest(
        &self,
        selection: &TpmlPcrSelection,
        hash_alg: TpmAlgId,
    ) -> SimResult<Vec<u8>> {
        let mut values: Vec<&[u8]> = Vec::new();
        for sel in &selection.pcr_selections {
            if sel.hash != TpmAlgId::Sha256 {
                return Err(param_error(TpmRc::Value, 2));
            }
            for index in sel.indices() {
                let value = self
                    .pcrs
                    .get(index as usize)
                    .ok_or_else(|| param_error(TpmRc::Value, 2))?;
                values.push(value);
            }
        }
        sim_digest(hash_alg, &values)
    }

    fn policy_pcr(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let handle = Self::handle_at(request, 0)?;
        let pcr_digest = params.get_tpm2b().map_err(malformed)?;
        let selection = params.get::<TpmlPcrSelection>().map_err(malformed)?;
        let (hash_alg, trial) = {
            let session = self.policy_session(handle, 1)?;
            (session.hash_alg, session.session_type == TpmSe::Trial)
        };
        let current = self.selected_pcr_digest(&selection, hash_alg)?;
        if !pcr_digest.is_empty() && !trial && pcr_digest != current {
            return Err(param_error(TpmRc::Value, 1));
        }
        let digest = if pcr_digest.is_empty() {
            current
        } else {
            pcr_digest
        };
        let cc = TpmCc::PolicyPcr.to_u32().to_be_bytes();
        self.extend_policy(handle, 1, &[&cc, &selection.to_bytes(), &digest])?;
        Ok(TpmResponse::success(vec![], vec![]))
    }

    fn policy_secret(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let auth_handle = Self::handle_at(request, 0)?;
        let handle = Self::handle_at(request, 1)?;
        let nonce_tpm = params.get_tpm2b().map_err(malformed)?;
        let _cp_hash = params.get_tpm2b().map_err(malformed)?;
        let policy_ref = params.get_tpm2b().map_err(malformed)?;
        let expiration = params.get_i32().map_err(malformed)?;

        let session_nonce = self.policy_session(handle, 2)?.nonce_tpm.clone();
        if !nonce_tpm.is_empty() && nonce_tpm != session_nonce {
            return Err(param_error(TpmRc::Value, 1));
        }
        let name = self.entity_name(auth_handle)?;
        let cc = TpmCc::PolicySecret.to_u32().to_be_bytes();
        self.extend_policy(handle, 2, &[&cc, &name])?;
        self.extend_policy(handle, 2, &[&policy_ref])?;

        let ticket = if expiration < 0 {
            let digest = self.policy_session(handle, 2)?.digest.clone();
            Ticket {
                tag: TpmSt::Auth,
                hierarchy: tpm_rh::OWNER,
                digest: sim_digest(TpmAlgId::Sha256, &[b"auth", &digest])?,
            }
        } else {
            Ticket::null(TpmSt::Auth)
        };
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&[]);
        out.put(&ticket);
        Ok(TpmResponse::success(vec![], out.into_vec()))
    }

    fn policy_or(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let handle = Self::handle_at(request, 0)?;
        let list = params.get::<TpmlDigest>().map_err(|_| param_error(TpmRc::Size, 1))?;
        if list.digests.len() < 2 {
            return Err(param_error(TpmRc::Size, 1));
        }
        let session = self.policy_session(handle, 1)?;
        let trial = session.session_type == TpmSe::Trial;
        if !trial && !list.digests.iter().any(|d| d.buffer == session.digest) {
            return Err(param_error(TpmRc::Value, 1));
        }
        let zeros = vec![0u8; session.hash_alg.digest_size()];
        let cc = TpmCc::PolicyOr.to_u32().to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![zeros.as_slice(), cc.as_slice()];
        parts.extend(list.digests.iter().map(|d| d.buffer.as_slice()));
        session.digest = sim_digest(session.hash_alg, &parts)?;
        Ok(TpmResponse::success(vec![], vec![]))
    }

    fn policy_authorize(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let handle = Self::handle_at(request, 0)?;
        let approved = params.get_tpm2b().map_err(malformed)?;
        let policy_ref = params.get_tpm2b().map_err(malformed)?;
        let key_sign = params.get_tpm2b().map_err(malformed)?;
        let ticket = params.get::<TpmtTkVerified>().map_err(malformed)?;

        let (current, trial) = {
            let session = self.policy_session(handle, 1)?;
            (session.digest.clone(), session.session_type == TpmSe::Trial)
        };
        if !trial {
            if approved != current {
                return Err(param_error(TpmRc::Value, 1));
            }
            let expected = self
                .approve_policy(&PolicyDigest(approved), &policy_ref, &key_sign)
                .map_err(|_| ResponseCode::from(TpmRc::Hash))?;
            if ticket != expected {
                return Err(param_error(TpmRc::Ticket, 4));
            }
        }
        let session = self.policy_session(handle, 1)?;
        session.digest = vec![0u8; session.hash_alg.digest_size()];
        let cc = TpmCc::PolicyAuthorize.to_u32().to_be_bytes();
        self.extend_policy(handle, 1, &[&cc, &key_sign])?;
        self.extend_policy(handle, 1, &[&policy_ref])?;
        Ok(TpmResponse::success(vec![], vec![]))
    }

    fn pcr_read(&mut self, params: &mut ResponseBuffer) -> SimResult<TpmResponse> {
        let selection = params.get::<TpmlPcrSelection>().map_err(malformed)?;
        let mut returned = Vec::new();
        let mut digests = Vec::new();
        for sel in selection
            .pcr_selections
            .iter()
            .filter(|s| s.hash == TpmAlgId::Sha256)
        {
            for index in sel.indices() {
                if digests.len() == TpmlDigest::MAX_COUNT {
                    break;
                }
                if let Some(value) = self.pcrs.get(index as usize) {
                    returned.push(index);
                    digests.push(Tpm2bDigest::new(value.clone()));
                }
            }
        }
        let out_selection = if returned.is_empty() {
            TpmlPcrSelection::default()
        } else {
            TpmlPcrSelection::single(TpmAlgId::Sha256, &returned)
        };
        let mut out = CommandBuffer::new();
        out.put_u32(self.counter as u32);
        out.put(&out_selection);
        out.put(&TpmlDigest::new(digests));
        Ok(TpmResponse::success(vec![], out.into_vec()))
    }

    fn hashcheck(&self, hierarchy: u32, digest: &[u8]) -> SimResult<Ticket> {
        if hierarchy == tpm_rh::NULL {
            return Ok(Ticket::null(TpmSt::Hashcheck));
        }
        Ok(Ticket {
            tag: TpmSt::Hashcheck,
            hierarchy,
            digest: sim_digest(TpmAlgId::Sha256, &[b"hashcheck", digest])?,
        })
    }

    fn hash(&mut self, params: &mut ResponseBuffer) -> SimResult<TpmResponse> {
        let data = params
            .get_tpm2b_bounded(MAX_DIGEST_BUFFER, "data")
            .map_err(|_| param_error(TpmRc::Size, 1))?;
        let hash_alg = TpmAlgId::from_u16(params.get_u16().map_err(malformed)?)
            .ok_or_else(|| param_error(TpmRc::Hash, 2))?;
        let hierarchy = params.get_u32().map_err(malformed)?;
        let digest = crypto::digest(hash_alg, &[&data]).map_err(|_| param_error(TpmRc::Hash, 2))?;
        let ticket = self.hashcheck(hierarchy, &digest)?;
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&digest);
        out.put(&ticket);
        Ok(TpmResponse::success(vec![], out.into_vec()))
    }

    /// HMAC key and algorithm of a keyed-hash object
    fn hmac_key(&self, handle: u32, requested: TpmAlgId) -> SimResult<(Vec<u8>, TpmAlgId)> {
        let object = self
            .objects
            .get(&handle)
            .ok_or_else(|| handle_error(TpmRc::Handle, 1))?;
        let ObjectKind::KeyedHash { key, hash_alg } = &object.kind else {
            return Err(handle_error(TpmRc::Value, 1));
        };
        let alg = if requested == TpmAlgId::Null {
            *hash_alg
        } else {
            requested
        };
        Ok((key.clone(), alg))
    }

    fn hmac(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let handle = Self::handle_at(request, 0)?;
        let data = params
            .get_tpm2b_bounded(MAX_DIGEST_BUFFER, "buffer")
            .map_err(|_| param_error(TpmRc::Size, 1))?;
        let requested = TpmAlgId::from_u16(params.get_u16().map_err(malformed)?)
            .ok_or_else(|| param_error(TpmRc::Hash, 2))?;
        let (key, alg) = self.hmac_key(handle, requested)?;
        let mac = crypto::hmac(alg, &key, &data).map_err(|_| param_error(TpmRc::Hash, 2))?;
        Ok(TpmResponse::success(vec![], Tpm2bDigest::new(mac).to_bytes()))
    }

    fn hash_sequence_start(&mut self, params: &mut ResponseBuffer) -> SimResult<TpmResponse> {
        let auth = params.get::<AuthValue>().map_err(malformed)?;
        let hash_alg = TpmAlgId::from_u16(params.get_u16().map_err(malformed)?)
            .filter(|alg| alg.is_hash())
            .ok_or_else(|| param_error(TpmRc::Hash, 2))?;
        let handle = self.alloc_transient();
        self.sequences.insert(
            handle,
            SimSequence {
                kind: SequenceKind::Hash,
                hash_alg,
                data: Vec::new(),
                auth: auth.as_bytes().to_vec(),
            },
        );
        Ok(TpmResponse::success(vec![handle], vec![]))
    }

    fn hmac_start(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let key_handle = Self::handle_at(request, 0)?;
        let auth = params.get::<AuthValue>().map_err(malformed)?;
        let requested = TpmAlgId::from_u16(params.get_u16().map_err(malformed)?)
            .ok_or_else(|| param_error(TpmRc::Hash, 2))?;
        let (key, hash_alg) = self.hmac_key(key_handle, requested)?;
        let handle = self.alloc_transient();
        self.sequences.insert(
            handle,
            SimSequence {
                kind: SequenceKind::Hmac { key },
                hash_alg,
                data: Vec::new(),
                auth: auth.as_bytes().to_vec(),
            },
        );
        Ok(TpmResponse::success(vec![handle], vec![]))
    }

    fn sequence_complete(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let handle = Self::handle_at(request, 0)?;
        let chunk = params
            .get_tpm2b_bounded(MAX_DIGEST_BUFFER, "buffer")
            .map_err(|_| param_error(TpmRc::Size, 1))?;
        let hierarchy = params.get_u32().map_err(malformed)?;
        let mut sequence = self
            .sequences
            .remove(&handle)
            .ok_or_else(|| handle_error(TpmRc::Handle, 1))?;
        sequence.data.extend(chunk);

        let (digest, ticket) = match &sequence.kind {
            SequenceKind::Hash => {
                let digest = sim_digest(sequence.hash_alg, &[&sequence.data])?;
                let ticket = self.hashcheck(hierarchy, &digest)?;
                (digest, ticket)
            }
            SequenceKind::Hmac { key } => {
                let mac = crypto::hmac(sequence.hash_alg, key, &sequence.data)
                    .map_err(|_| ResponseCode::from(TpmRc::Hash))?;
                (mac, Ticket::null(TpmSt::Hashcheck))
            }
        };
        let mut out = CommandBuffer::new();
        out.put_tpm2b(&digest);
        out.put(&ticket);
        Ok(TpmResponse::success(vec![], out.into_vec()))
    }

    fn certify(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let object = Self::handle_at(request, 0)?;
        let sign_key = Self::handle_at(request, 1)?;
        let qualifying = params
            .get_tpm2b_bounded(Tpm2bData::MAX_SIZE, "qualifyingData")
            .map_err(|_| param_error(TpmRc::Size, 1))?;
        let scheme = params.get::<TpmtSigScheme>().map_err(malformed)?;

        let key = self
            .objects
            .get(&sign_key)
            .ok_or_else(|| handle_error(TpmRc::Handle, 2))?;
        if TpmtSigScheme::for_key_type(key.key_type(), scheme.hash_alg) != Some(scheme) {
            return Err(param_error(TpmRc::Value, 2));
        }
        let name = self.entity_name(object)?;

        let mut attest = CommandBuffer::new();
        attest.put_u32(TPM_GENERATED);
        attest.put_u16(ST_ATTEST_CERTIFY);
        attest.put_tpm2b(&qualifying);
        attest.put_tpm2b(&name);
        let attest = attest.into_vec();

        let mut signature = CommandBuffer::new();
        signature.put_u16(scheme.scheme.to_u16());
        signature.put_u16(scheme.hash_alg.to_u16());
        signature.put_tpm2b(&sim_digest(scheme.hash_alg, &[&attest])?);

        let mut out = CommandBuffer::new();
        out.put_tpm2b(&attest);
        out.put_bytes(signature.as_bytes());
        Ok(TpmResponse::success(vec![], out.into_vec()))
    }

    fn activate_credential(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let activate = Self::handle_at(request, 0)?;
        let key = Self::handle_at(request, 1)?;
        if !self.objects.contains_key(&activate) {
            return Err(handle_error(TpmRc::Handle, 1));
        }
        if !self.objects.contains_key(&key) {
            return Err(handle_error(TpmRc::Handle, 2));
        }
        let credential = params
            .get::<Tpm2bIdObject>()
            .map_err(|_| param_error(TpmRc::Size, 1))?;
        let secret = params
            .get::<Tpm2bEncryptedSecret>()
            .map_err(|_| param_error(TpmRc::Size, 2))?;
        if secret.buffer.is_empty() {
            return Err(param_error(TpmRc::Value, 2));
        }
        if credential.buffer.len() > Tpm2bDigest::MAX_SIZE {
            return Err(param_error(TpmRc::Size, 1));
        }
        Ok(TpmResponse::success(
            vec![],
            Tpm2bDigest::new(credential.buffer).to_bytes(),
        ))
    }

    fn nv_define_space(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let hierarchy = Self::handle_at(request, 0)?;
        if hierarchy != tpm_rh::OWNER && hierarchy != tpm_rh::PLATFORM {
            return Err(handle_error(TpmRc::Hierarchy, 1));
        }
        let auth = params.get::<AuthValue>().map_err(malformed)?;
        let public = params.get::<TpmsNvPublic>().map_err(malformed)?;
        if tpm_ht::of(public.nv_index) != tpm_ht::NV_INDEX {
            return Err(param_error(TpmRc::Value, 2));
        }
        if self.nv.contains_key(&public.nv_index) {
            return Err(TpmRc::NvDefined.into());
        }
        trace!("NV index 0x{:08x} defined", public.nv_index);
        self.nv.insert(
            public.nv_index,
            SimNv {
                public,
                auth: auth.as_bytes().to_vec(),
            },
        );
        Ok(TpmResponse::success(vec![], vec![]))
    }

    fn evict_control(
        &mut self,
        request: &TpmRequest,
        params: &mut ResponseBuffer,
    ) -> SimResult<TpmResponse> {
        let auth = Self::handle_at(request, 0)?;
        let object = Self::handle_at(request, 1)?;
        if auth != tpm_rh::OWNER && auth != tpm_rh::PLATFORM {
            return Err(handle_error(TpmRc::Hierarchy, 1));
        }
        let persistent = params.get_u32().map_err(malformed)?;
        if tpm_ht::of(persistent) != tpm_ht::PERSISTENT {
            return Err(param_error(TpmRc::Value, 1));
        }
        match tpm_ht::of(object) {
            tpm_ht::TRANSIENT => {
                let copy = self
                    .objects
                    .get(&object)
                    .cloned()
                    .ok_or_else(|| handle_error(TpmRc::Handle, 2))?;
                if self.objects.contains_key(&persistent) {
                    return Err(TpmRc::NvDefined.into());
                }
                self.objects.insert(persistent, copy);
            }
            tpm_ht::PERSISTENT if object == persistent => {
                self.objects
                    .remove(&object)
                    .ok_or_else(|| handle_error(TpmRc::Handle, 2))?;
            }
            _ => return Err(handle_error(TpmRc::Handle, 2)),
        }
        Ok(TpmResponse::success(vec![], vec![]))
    }

    /// Handles of every persistent object
    pub fn persistent_handles(&self) -> BTreeSet<u32> {
        self.objects
            .keys()
            .copied()
            .filter(|h| tpm_ht::of(*h) == tpm_ht::PERSISTENT)
            .collect()
    }
}

impl Transport for SoftTpm {
    fn submit(&mut self, request: &TpmRequest) -> Result<TpmResponse> {
        self.commands.push(request.code);
        if request.auths.len() > MAX_SESSION_SLOTS {
            return Ok(TpmResponse::error(TpmRc::AuthContext.into()));
        }
        if let Some(pos) = self.failures.iter().position(|(cc, _)| *cc == request.code) {
            let (_, rc) = self.failures.remove(pos);
            return Ok(TpmResponse::error(rc));
        }
        let response = self
            .dispatch(request)
            .unwrap_or_else(TpmResponse::error);
        trace!("sim {:?} -> {}", request.code, response.rc);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(tpm: &mut SoftTpm, session_type: TpmSe) -> TpmResponse {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(&[0u8; 16]);
        params.put_tpm2b(&[]);
        params.put_u8(session_type as u8);
        params.put(&TpmtSymDef::null());
        params.put_u16(TpmAlgId::Sha256.to_u16());
        let request = TpmRequest::new(TpmCc::StartAuthSession)
            .handle(tpm_rh::NULL)
            .handle(tpm_rh::NULL)
            .params(params);
        tpm.submit(&request).unwrap()
    }

    #[test]
    fn test_session_limit() {
        let mut tpm = SoftTpm::new();
        for _ in 0..3 {
            assert!(start(&mut tpm, TpmSe::Hmac).is_success());
        }
        let response = start(&mut tpm, TpmSe::Policy);
        assert!(response.rc.is_resource_exhaustion());
        assert_eq!(tpm.session_count(), 3);

        let mut single = SoftTpm::new().with_session_limit(1);
        assert!(start(&mut single, TpmSe::Trial).is_success());
        assert!(!start(&mut single, TpmSe::Trial).is_success());
    }

    #[test]
    fn test_session_handles_are_recycled() {
        let mut tpm = SoftTpm::new();
        let first = start(&mut tpm, TpmSe::Policy).out_handle().unwrap();
        let mut params = CommandBuffer::new();
        params.put_u32(first);
        let flush = TpmRequest::new(TpmCc::FlushContext).params(params);
        assert!(tpm.submit(&flush).unwrap().is_success());
        assert!(!tpm.submit(&flush).unwrap().is_success());
        let second = start(&mut tpm, TpmSe::Policy).out_handle().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_missing_authorization() {
        let mut tpm = SoftTpm::new();
        let key = tpm.add_hmac_key(b"key", b"");
        let mut params = CommandBuffer::new();
        params.put_tpm2b(b"data");
        params.put_u16(TpmAlgId::Null.to_u16());
        let request = TpmRequest::new(TpmCc::Hmac).handle(key).params(params);
        let response = tpm.submit(&request).unwrap();
        assert_eq!(response.rc.kind(), TpmRc::AuthMissing);
    }

    #[test]
    fn test_injected_failure_is_consumed() {
        let mut tpm = SoftTpm::new();
        tpm.fail_next(TpmCc::StartAuthSession, TpmRc::Memory.into());
        assert!(!start(&mut tpm, TpmSe::Hmac).is_success());
        assert!(start(&mut tpm, TpmSe::Hmac).is_success());
        assert_eq!(tpm.command_count(TpmCc::StartAuthSession), 2);
    }

    #[test]
    fn test_extend_pcr() {
        let mut tpm = SoftTpm::new();
        assert_eq!(tpm.pcr_value(7), Some(&[0u8; 32][..]));
        tpm.extend_pcr(7, b"boot").unwrap();
        assert_ne!(tpm.pcr_value(7), Some(&[0u8; 32][..]));
        assert!(tpm.extend_pcr(24, b"x").is_err());
    }
}

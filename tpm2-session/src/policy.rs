// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy assertions
//!
//! Each assertion extends the policy digest of an open policy (or trial)
//! session. The engine only sequences the calls: it refuses stale sessions,
//! tracks whether a session has accumulated assertions, and reports a device
//! rejection of an assertion as [`Error::PolicyStepRejected`]. Whether a
//! policy is satisfied is decided by the TPM when the session authorizes a
//! command.

use tracing::debug;

use crate::constants::*;
use crate::context::TpmContext;
use crate::crypto;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::object::LoadedObject;
use crate::session::{Session, SessionParams};
use crate::types::*;

/// Whether a policy session has accumulated assertions since start or restart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PolicyState {
    #[default]
    Fresh,
    Building,
}

/// Optional inputs of PolicySecret
#[derive(Debug, Clone, Default)]
pub struct PolicySecretParams {
    pub nonce_tpm: Vec<u8>,
    pub cp_hash: Vec<u8>,
    pub policy_ref: Vec<u8>,
    /// Negative values request a ticket
    pub expiration: i32,
}

/// Outputs of PolicySecret
#[derive(Debug, Clone)]
pub struct PolicySecretOutput {
    pub timeout: Vec<u8>,
    pub ticket: TpmtTkAuth,
}

/// One assertion of a policy recipe
#[derive(Debug, Clone)]
pub enum PolicyStep<'a> {
    Password,
    AuthValue,
    Pcr {
        /// Empty to let the TPM use the current PCR values
        pcr_digest: Vec<u8>,
        selection: TpmlPcrSelection,
    },
    Secret {
        auth_object: &'a LoadedObject,
        params: PolicySecretParams,
    },
    Or(Vec<PolicyDigest>),
    Authorize {
        approved_policy: PolicyDigest,
        policy_ref: Vec<u8>,
        key_sign: Vec<u8>,
        ticket: TpmtTkVerified,
    },
    CommandCode(u32),
    Locality(TpmaLocality),
    DuplicationSelect {
        object_name: Vec<u8>,
        new_parent_name: Vec<u8>,
        include_object: bool,
    },
}

impl<T: Transport> TpmContext<T> {
    /// Send one assertion against `session`
    fn assert_policy(
        &mut self,
        session: Session,
        code: TpmCc,
        auth: Option<AuthSlot>,
        leading_handle: Option<u32>,
        params: CommandBuffer,
    ) -> Result<TpmResponse> {
        let handle = self.sessions.entry(session)?.handle;
        let mut request = TpmRequest::new(code);
        if let Some(leading) = leading_handle {
            request = request.handle(leading);
        }
        request = request.handle(handle).params(params);
        if let Some(slot) = auth {
            request = request.auth(slot);
        }
        let response = self
            .execute(request)
            .map_err(Error::into_policy_rejection)?;
        self.sessions.entry_mut(session)?.policy = PolicyState::Building;
        debug!("{code:?} asserted on {session}");
        Ok(response)
    }

    pub fn policy_state(&self, session: Session) -> Result<PolicyState> {
        Ok(self.sessions.entry(session)?.policy)
    }

    /// TPM2_PolicyRestart: reset the digest to zeros and the state to fresh
    pub fn policy_restart(&mut self, session: Session) -> Result<()> {
        let handle = self.sessions.entry(session)?.handle;
        self.execute(TpmRequest::new(TpmCc::PolicyRestart).handle(handle))?;
        self.sessions.entry_mut(session)?.reset_policy();
        debug!("{session} restarted");
        Ok(())
    }

    /// TPM2_PolicyGetDigest
    pub fn policy_get_digest(&mut self, session: Session) -> Result<PolicyDigest> {
        let handle = self.sessions.entry(session)?.handle;
        let response = self.execute(TpmRequest::new(TpmCc::PolicyGetDigest).handle(handle))?;
        let digest = response
            .param_buffer()
            .get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "policyDigest")?;
        Ok(PolicyDigest(digest))
    }

    /// TPM2_PolicyPassword: the object's auth value travels in the clear
    /// in the session slot
    pub fn policy_password(&mut self, session: Session) -> Result<()> {
        self.assert_policy(
            session,
            TpmCc::PolicyPassword,
            None,
            None,
            CommandBuffer::new(),
        )?;
        self.sessions.entry_mut(session)?.auth_value_required = true;
        Ok(())
    }

    /// TPM2_PolicyAuthValue: later slots of this session carry the
    /// object's auth value
    pub fn policy_auth_value(&mut self, session: Session) -> Result<()> {
        self.assert_policy(
            session,
            TpmCc::PolicyAuthValue,
            None,
            None,
            CommandBuffer::new(),
        )?;
        self.sessions.entry_mut(session)?.auth_value_required = true;
        Ok(())
    }

    /// TPM2_PolicyPCR
    pub fn policy_pcr(
        &mut self,
        session: Session,
        pcr_digest: &[u8],
        selection: &TpmlPcrSelection,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b_bounded(pcr_digest, Tpm2bDigest::MAX_SIZE, "pcrDigest")?;
        params.put(selection);
        self.assert_policy(session, TpmCc::PolicyPcr, None, None, params)?;
        Ok(())
    }

    /// TPM2_PolicySecret, authorized by `auth_object`
    pub fn policy_secret(
        &mut self,
        auth_object: &LoadedObject,
        session: Session,
        secret: &PolicySecretParams,
    ) -> Result<PolicySecretOutput> {
        if auth_object.session == Some(session) {
            return Err(Error::ShandleConflict(format!(
                "{session} cannot authorize its own PolicySecret"
            )));
        }
        let slot = self.authorization_slots(&[auth_object.authorization()])?;
        let mut params = CommandBuffer::new();
        params.put_tpm2b_bounded(&secret.nonce_tpm, Tpm2bNonce::MAX_SIZE, "nonceTPM")?;
        params.put_tpm2b_bounded(&secret.cp_hash, Tpm2bDigest::MAX_SIZE, "cpHashA")?;
        params.put_tpm2b_bounded(&secret.policy_ref, Tpm2bNonce::MAX_SIZE, "policyRef")?;
        params.put_i32(secret.expiration);
        let response = self.assert_policy(
            session,
            TpmCc::PolicySecret,
            slot.into_iter().next(),
            Some(auth_object.handle),
            params,
        )?;

        let mut buf = response.param_buffer();
        let timeout = buf.get_tpm2b_bounded(Tpm2bTimeout::MAX_SIZE, "timeout")?;
        let ticket = buf.get::<TpmtTkAuth>()?;
        Ok(PolicySecretOutput { timeout, ticket })
    }

    /// TPM2_PolicyOR
    pub fn policy_or(&mut self, session: Session, digests: &[PolicyDigest]) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put(&TpmlDigest::from_policy_digests(digests));
        self.assert_policy(session, TpmCc::PolicyOr, None, None, params)?;
        Ok(())
    }

    /// TPM2_PolicyAuthorize
    pub fn policy_authorize(
        &mut self,
        session: Session,
        approved_policy: &PolicyDigest,
        policy_ref: &[u8],
        key_sign: &[u8],
        ticket: &TpmtTkVerified,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b(approved_policy.as_bytes());
        params.put_tpm2b_bounded(policy_ref, Tpm2bNonce::MAX_SIZE, "policyRef")?;
        params.put_tpm2b_bounded(key_sign, Tpm2bName::MAX_SIZE, "keySign")?;
        params.put(ticket);
        self.assert_policy(session, TpmCc::PolicyAuthorize, None, None, params)?;
        Ok(())
    }

    /// TPM2_PolicyCommandCode
    pub fn policy_command_code(&mut self, session: Session, code: u32) -> Result<()> {
        let mut params = CommandBuffer::with_capacity(4);
        params.put_u32(code);
        self.assert_policy(session, TpmCc::PolicyCommandCode, None, None, params)?;
        Ok(())
    }

    /// TPM2_PolicyLocality
    pub fn policy_locality(&mut self, session: Session, locality: TpmaLocality) -> Result<()> {
        let mut params = CommandBuffer::with_capacity(1);
        params.put_u8(locality.0);
        self.assert_policy(session, TpmCc::PolicyLocality, None, None, params)?;
        Ok(())
    }

    /// TPM2_PolicyDuplicationSelect
    pub fn policy_duplication_select(
        &mut self,
        session: Session,
        object_name: &[u8],
        new_parent_name: &[u8],
        include_object: bool,
    ) -> Result<()> {
        let mut params = CommandBuffer::new();
        params.put_tpm2b_bounded(object_name, Tpm2bName::MAX_SIZE, "objectName")?;
        params.put_tpm2b_bounded(new_parent_name, Tpm2bName::MAX_SIZE, "newParentName")?;
        params.put_u8(include_object as u8);
        self.assert_policy(session, TpmCc::PolicyDuplicationSelect, None, None, params)?;
        Ok(())
    }

    /// Apply `steps` in order, stopping at the first failure.
    ///
    /// Returns the outputs of the PolicySecret steps in the order they ran.
    pub fn run_policy(
        &mut self,
        session: Session,
        steps: &[PolicyStep<'_>],
    ) -> Result<Vec<PolicySecretOutput>> {
        let mut secrets = Vec::new();
        for step in steps {
            match step {
                PolicyStep::Password => self.policy_password(session)?,
                PolicyStep::AuthValue => self.policy_auth_value(session)?,
                PolicyStep::Pcr {
                    pcr_digest,
                    selection,
                } => self.policy_pcr(session, pcr_digest, selection)?,
                PolicyStep::Secret {
                    auth_object,
                    params,
                } => secrets.push(self.policy_secret(auth_object, session, params)?),
                PolicyStep::Or(digests) => self.policy_or(session, digests)?,
                PolicyStep::Authorize {
                    approved_policy,
                    policy_ref,
                    key_sign,
                    ticket,
                } => self.policy_authorize(session, approved_policy, policy_ref, key_sign, ticket)?,
                PolicyStep::CommandCode(code) => self.policy_command_code(session, *code)?,
                PolicyStep::Locality(locality) => self.policy_locality(session, *locality)?,
                PolicyStep::DuplicationSelect {
                    object_name,
                    new_parent_name,
                    include_object,
                } => self.policy_duplication_select(
                    session,
                    object_name,
                    new_parent_name,
                    *include_object,
                )?,
            }
        }
        Ok(secrets)
    }

    /// Compute the digest of `steps` in a trial session, which is always closed
    pub fn trial_policy_digest(
        &mut self,
        hash_alg: TpmAlgId,
        steps: &[PolicyStep<'_>],
    ) -> Result<PolicyDigest> {
        let mut trial = self.scoped_session(&SessionParams::trial(hash_alg))?;
        let session = trial.session();
        trial.run_policy(session, steps)?;
        let digest = trial.policy_get_digest(session)?;
        trial.close()?;
        Ok(digest)
    }

    /// TPM2_PCR_Read of `pcrs` in `bank`, in index order
    pub fn pcr_read(&mut self, bank: TpmAlgId, pcrs: &[u32]) -> Result<Vec<Vec<u8>>> {
        let mut pending: Vec<u32> = pcrs.to_vec();
        pending.sort_unstable();
        pending.dedup();
        let mut values = Vec::with_capacity(pending.len());

        // The TPM returns at most eight digests per call.
        while !pending.is_empty() {
            let mut params = CommandBuffer::new();
            params.put(&TpmlPcrSelection::single(bank, &pending));
            let response = self.execute(TpmRequest::new(TpmCc::PcrRead).params(params))?;

            let mut buf = response.param_buffer();
            let _update_counter = buf.get_u32()?;
            let selection_out = buf.get::<TpmlPcrSelection>()?;
            let digests = buf.get::<TpmlDigest>()?;

            let returned: Vec<u32> = selection_out
                .pcr_selections
                .iter()
                .filter(|s| s.hash == bank)
                .flat_map(|s| s.indices())
                .collect();
            if returned.is_empty() || returned.len() != digests.digests.len() {
                return Err(Error::Marshal(format!(
                    "PCR_Read returned {} digests for {} PCRs",
                    digests.digests.len(),
                    returned.len()
                )));
            }
            // Every round trip must retire at least one pending PCR.
            if let Some(pcr) = returned.iter().find(|pcr| !pending.contains(pcr)) {
                return Err(Error::Marshal(format!(
                    "PCR_Read returned PCR {pcr}, which is not pending"
                )));
            }
            values.extend(digests.digests.into_iter().map(|d| d.buffer));
            pending.retain(|pcr| !returned.contains(pcr));
        }
        Ok(values)
    }

    /// Digest of the current values of `pcrs`, as PolicyPCR expects it
    pub fn pcr_policy_digest(
        &mut self,
        bank: TpmAlgId,
        pcrs: &[u32],
        hash_alg: TpmAlgId,
    ) -> Result<Vec<u8>> {
        let values = self.pcr_read(bank, pcrs)?;
        let parts: Vec<&[u8]> = values.iter().map(Vec::as_slice).collect();
        crypto::digest(hash_alg, &parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_is_fresh() {
        assert_eq!(PolicyState::default(), PolicyState::Fresh);
    }

    /// Answers every PCR_Read with PCR 0 of the requested bank
    struct StuckPcrRead;

    impl Transport for StuckPcrRead {
        fn submit(&mut self, request: &TpmRequest) -> Result<TpmResponse> {
            let mut params = ResponseBuffer::new(&request.params);
            let bank = params.get::<TpmlPcrSelection>()?.pcr_selections[0].hash;
            let mut out = CommandBuffer::new();
            out.put_u32(1);
            out.put(&TpmlPcrSelection::single(bank, &[0]));
            out.put(&TpmlDigest::from_policy_digests(&[PolicyDigest(vec![0; 32])]));
            Ok(TpmResponse::success(vec![], out.into_vec()))
        }
    }

    #[test]
    fn test_pcr_read_without_progress_fails() {
        let mut ctx = TpmContext::new(StuckPcrRead, crate::Config::default());
        assert_eq!(ctx.pcr_read(TpmAlgId::Sha256, &[0]).unwrap().len(), 1);
        let err = ctx.pcr_read(TpmAlgId::Sha256, &[3, 4]).unwrap_err();
        assert!(matches!(err, Error::Marshal(_)));
    }

    #[test]
    fn test_secret_params_default() {
        let params = PolicySecretParams::default();
        assert!(params.policy_ref.is_empty());
        assert_eq!(params.expiration, 0);
    }
}

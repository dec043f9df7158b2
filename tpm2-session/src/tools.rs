// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Tool-level operations built on sessions, policies and sequences

use std::io::Read;

use tracing::{debug, info, warn};

use crate::constants::*;
use crate::context::TpmContext;
use crate::credential::CredentialBlob;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::object::LoadedObject;
use crate::policy::PolicySecretParams;
use crate::sequence::{DigestOutput, DigestSource};
use crate::session::{Session, SessionParams};
use crate::shandle::Authorization;
use crate::types::*;

/// Public area summary from TPM2_ReadPublic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicInfo {
    pub key_type: TpmAlgId,
    pub name_alg: TpmAlgId,
    /// Marshaled TPMT_PUBLIC
    pub public_area: Vec<u8>,
    pub name: Vec<u8>,
}

/// TPM2_Certify output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifyOutput {
    /// Marshaled TPMS_ATTEST
    pub attest: Vec<u8>,
    /// Marshaled TPMT_SIGNATURE
    pub signature: Vec<u8>,
}

/// NV index to define
#[derive(Debug, Clone)]
pub struct NvDefineParams {
    pub index: u32,
    pub size: u16,
    pub attributes: TpmaNv,
    pub auth: AuthValue,
    pub policy: Vec<u8>,
}

impl NvDefineParams {
    pub fn new(index: u32, size: u16, attributes: TpmaNv) -> Self {
        Self {
            index,
            size,
            attributes,
            auth: AuthValue::empty(),
            policy: Vec::new(),
        }
    }
}

impl<T: Transport> TpmContext<T> {
    /// HMAC everything `input` yields with `key`, using the key's scheme
    pub fn hmac_input<R: Read>(
        &mut self,
        key: &LoadedObject,
        input: &mut R,
        size: Option<u64>,
    ) -> Result<Vec<u8>> {
        let source = DigestSource::Hmac {
            key,
            hash_alg: TpmAlgId::Null,
        };
        let DigestOutput { digest, .. } = self.digest_reader(source, input, size)?;
        debug!("HMAC with key 0x{:08x}: {}", key.handle, hex::encode(&digest));
        Ok(digest)
    }

    /// TPM2_ReadPublic
    pub fn read_public(&mut self, handle: u32) -> Result<PublicInfo> {
        let response = self.execute(TpmRequest::new(TpmCc::ReadPublic).handle(handle))?;
        let mut buf = response.param_buffer();
        let public_area = buf.get_tpm2b()?;
        let name = buf.get_tpm2b_bounded(Tpm2bName::MAX_SIZE, "name")?;

        let mut area = ResponseBuffer::new(&public_area);
        let key_type = unmarshal_alg(&mut area)?;
        let name_alg = unmarshal_alg(&mut area)?;
        Ok(PublicInfo {
            key_type,
            name_alg,
            public_area,
            name,
        })
    }

    /// TPM2_Certify: `object` is attested by `signing_key`; both are
    /// authorized, in that order
    pub fn certify(
        &mut self,
        object: &LoadedObject,
        signing_key: &LoadedObject,
        qualifying_data: &[u8],
        hash_alg: TpmAlgId,
    ) -> Result<CertifyOutput> {
        let key_type = self.read_public(signing_key.handle)?.key_type;
        let scheme = TpmtSigScheme::for_key_type(key_type, hash_alg).ok_or_else(|| {
            Error::Config(format!("no suitable signing scheme for {key_type:?} keys"))
        })?;
        if qualifying_data.len() > Tpm2bData::MAX_SIZE {
            return Err(Error::Config(format!(
                "qualifying data is {} bytes, maximum is {}",
                qualifying_data.len(),
                Tpm2bData::MAX_SIZE
            )));
        }

        let slots =
            self.authorization_slots(&[object.authorization(), signing_key.authorization()])?;
        let mut params = CommandBuffer::new();
        params.put_tpm2b_bounded(qualifying_data, Tpm2bData::MAX_SIZE, "qualifyingData")?;
        params.put(&scheme);
        let mut request = TpmRequest::new(TpmCc::Certify)
            .handle(object.handle)
            .handle(signing_key.handle)
            .params(params);
        request.auths = slots;
        let response = self.execute(request)?;

        let mut buf = response.param_buffer();
        let attest = buf.get_tpm2b()?;
        let signature = buf.get_remaining();
        Ok(CertifyOutput { attest, signature })
    }

    /// TPM2_ActivateCredential.
    ///
    /// The credential key is authorized by a policy session satisfying
    /// PolicySecret(endorsement); the endorsement hierarchy is authorized with
    /// the credential key's own credential. The policy session is closed on
    /// every path.
    pub fn activate_credential(
        &mut self,
        credentialed_key: &LoadedObject,
        credential_key: &LoadedObject,
        blob: &CredentialBlob,
    ) -> Result<Vec<u8>> {
        let hash_alg = self.config().session_hash;
        let session = self.start_auth_session(&SessionParams::policy(hash_alg))?;
        let activated = self.activate_with_policy(session, credentialed_key, credential_key, blob);
        let closed = self.close_session(session);
        match (activated, closed) {
            (Ok(cert_info), Ok(())) => Ok(cert_info),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), closed) => {
                if let Err(close_err) = closed {
                    warn!("failed to close {session}: {close_err}");
                }
                Err(err)
            }
        }
    }

    fn activate_with_policy(
        &mut self,
        session: Session,
        credentialed_key: &LoadedObject,
        credential_key: &LoadedObject,
        blob: &CredentialBlob,
    ) -> Result<Vec<u8>> {
        let endorsement = LoadedObject {
            handle: tpm_rh::ENDORSEMENT,
            auth: credential_key.auth.clone(),
            session: credential_key.session,
            transient: false,
        };
        self.policy_secret(&endorsement, session, &PolicySecretParams::default())?;

        let policy_auth = AuthValue::empty();
        let slots = self.authorization_slots(&[
            credentialed_key.authorization(),
            Authorization::with_session(credential_key.handle, &policy_auth, session),
        ])?;
        let mut params = CommandBuffer::new();
        params.put_tpm2b(&blob.credential);
        params.put_tpm2b(&blob.secret);
        let mut request = TpmRequest::new(TpmCc::ActivateCredential)
            .handle(credentialed_key.handle)
            .handle(credential_key.handle)
            .params(params);
        request.auths = slots;
        let response = self.execute(request)?;
        let cert_info = response
            .param_buffer()
            .get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "certInfo")?;
        debug!("activated credential of {} bytes", cert_info.len());
        Ok(cert_info)
    }

    /// TPM2_NV_DefineSpace under `hierarchy`
    pub fn nv_define(&mut self, hierarchy: &LoadedObject, params: &NvDefineParams) -> Result<()> {
        if params.index == 0 {
            return Err(Error::Config("NV index cannot be 0".into()));
        }
        if params.size == 0 {
            warn!("defining NV index 0x{:08x} with size 0", params.index);
        }
        if params.policy.len() > Tpm2bDigest::MAX_SIZE {
            return Err(Error::Config(format!(
                "NV policy is {} bytes, maximum is {}",
                params.policy.len(),
                Tpm2bDigest::MAX_SIZE
            )));
        }
        let mut public = TpmsNvPublic::new(params.index, params.size, params.attributes);
        public.auth_policy = params.policy.clone();

        let slots = self.authorization_slots(&[hierarchy.authorization()])?;
        let mut cmd = CommandBuffer::new();
        cmd.put(&params.auth);
        cmd.put(&public);
        let mut request = TpmRequest::new(TpmCc::NvDefineSpace)
            .handle(hierarchy.handle)
            .params(cmd);
        request.auths = slots;
        self.execute(request)?;
        info!("defined NV index 0x{:08x}", params.index);
        Ok(())
    }

    /// TPM2_EvictControl: persist a transient object at `persistent`, or
    /// evict a persistent one
    pub fn evict_control(
        &mut self,
        auth: &LoadedObject,
        object_handle: u32,
        persistent: u32,
    ) -> Result<()> {
        let slots = self.authorization_slots(&[auth.authorization()])?;
        let mut params = CommandBuffer::with_capacity(4);
        params.put_u32(persistent);
        let mut request = TpmRequest::new(TpmCc::EvictControl)
            .handle(auth.handle)
            .handle(object_handle)
            .params(params);
        request.auths = slots;
        self.execute(request)?;
        debug!("EvictControl 0x{object_handle:08x} -> 0x{persistent:08x}");
        Ok(())
    }
}

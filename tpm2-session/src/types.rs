// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data types used by the session and policy layer

use std::fmt;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

macro_rules! tpm2b {
    ($(#[$meta:meta])* $name:ident, $max:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub buffer: Vec<u8>,
        }

        impl $name {
            pub const MAX_SIZE: usize = $max;

            pub fn new(data: Vec<u8>) -> Self {
                Self { buffer: data }
            }

            pub fn empty() -> Self {
                Self::default()
            }

            pub fn size(&self) -> usize {
                self.buffer.len()
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut CommandBuffer) {
                buf.put_tpm2b(&self.buffer);
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                Ok(Self {
                    buffer: buf.get_tpm2b_bounded(Self::MAX_SIZE, stringify!($name))?,
                })
            }
        }
    };
}

tpm2b!(
    /// TPM2B_DIGEST - Variable length digest
    Tpm2bDigest,
    64
);
tpm2b!(
    /// TPM2B_DATA - Variable length data
    Tpm2bData,
    64
);
tpm2b!(
    /// TPM2B_NAME - Object name (nameAlg || digest, or a handle)
    Tpm2bName,
    66
);
tpm2b!(
    /// TPM2B_MAX_BUFFER - One Hash/HMAC/SequenceUpdate chunk
    Tpm2bMaxBuffer,
    MAX_DIGEST_BUFFER
);
tpm2b!(
    /// TPM2B_TIMEOUT
    Tpm2bTimeout,
    8
);
tpm2b!(
    /// TPM2B_ID_OBJECT - Credential protected by MakeCredential
    Tpm2bIdObject,
    132
);
tpm2b!(
    /// TPM2B_ENCRYPTED_SECRET - Seed protecting a credential
    Tpm2bEncryptedSecret,
    512
);

/// TPM2B_NONCE - Nonce value
pub type Tpm2bNonce = Tpm2bDigest;

/// An authorization value (TPM2B_AUTH). Never printed.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthValue(Vec<u8>);

impl AuthValue {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() > MAX_AUTH_SIZE {
            return Err(Error::InvalidAuthDescriptor(format!(
                "auth value is {} bytes, maximum is {}",
                bytes.len(),
                MAX_AUTH_SIZE
            )));
        }
        Ok(Self(bytes))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthValue(<{} bytes>)", self.0.len())
    }
}

impl Marshal for AuthValue {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.0);
    }
}

impl Unmarshal for AuthValue {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self(buf.get_tpm2b_bounded(MAX_AUTH_SIZE, "TPM2B_AUTH")?))
    }
}

/// The running digest of a policy session
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PolicyDigest(pub Vec<u8>);

impl PolicyDigest {
    /// The digest of a freshly started (or restarted) session: all zeros
    pub fn fresh(hash_alg: TpmAlgId) -> Self {
        Self(vec![0u8; hash_alg.digest_size()])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for PolicyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyDigest({})", hex::encode(&self.0))
    }
}

impl fmt::Display for PolicyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

/// TPMS_PCR_SELECTION - PCR selection for a single hash algorithm
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>, // Bitmap of selected PCRs
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        // At least 3 bytes for PCR 0-23
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];

        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }

        Self { hash, pcr_select }
    }

    pub fn sha256(pcrs: &[u32]) -> Self {
        Self::new(TpmAlgId::Sha256, pcrs)
    }

    /// Selected PCR indices in ascending order
    pub fn indices(&self) -> Vec<u32> {
        let mut out = Vec::new();
        for (byte_idx, &byte) in self.pcr_select.iter().enumerate() {
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    out.push((byte_idx * 8 + bit) as u32);
                }
            }
        }
        out
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = unmarshal_alg(buf)?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION - List of PCR selections
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub pcr_selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn new(selections: Vec<TpmsPcrSelection>) -> Self {
        Self {
            pcr_selections: selections,
        }
    }

    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self::new(vec![TpmsPcrSelection::new(hash, pcrs)])
    }

    pub fn is_empty(&self) -> bool {
        self.pcr_selections.is_empty()
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.pcr_selections.len() as u32);
        for sel in &self.pcr_selections {
            sel.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        // TPM_NUM_PCR_BANKS
        if count > 16 {
            return Err(Error::Marshal(format!("PCR selection count {count} too large")));
        }
        let pcr_selections = (0..count)
            .map(|_| TpmsPcrSelection::unmarshal(buf))
            .collect::<Result<_>>()?;
        Ok(Self { pcr_selections })
    }
}

/// TPML_DIGEST - List of digests (PolicyOR branches, PCR_Read values)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl TpmlDigest {
    /// Upper bound on list length (TPML_DIGEST holds at most 8 entries)
    pub const MAX_COUNT: usize = 8;

    pub fn new(digests: Vec<Tpm2bDigest>) -> Self {
        Self { digests }
    }

    pub fn from_policy_digests(digests: &[PolicyDigest]) -> Self {
        Self::new(
            digests
                .iter()
                .map(|d| Tpm2bDigest::new(d.0.clone()))
                .collect(),
        )
    }
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.digests.len() as u32);
        for digest in &self.digests {
            digest.marshal(buf);
        }
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let count = buf.get_u32()? as usize;
        if count > Self::MAX_COUNT {
            return Err(Error::Marshal(format!("digest list count {count} too large")));
        }
        let digests = (0..count)
            .map(|_| Tpm2bDigest::unmarshal(buf))
            .collect::<Result<_>>()?;
        Ok(Self { digests })
    }
}

/// TPMT_SYM_DEF - Symmetric algorithm for parameter encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSymDef {
    pub algorithm: TpmAlgId,
    pub key_bits: u16,
    pub mode: TpmAlgId,
}

impl TpmtSymDef {
    pub fn null() -> Self {
        Self {
            algorithm: TpmAlgId::Null,
            key_bits: 0,
            mode: TpmAlgId::Null,
        }
    }

    pub fn aes_128_cfb() -> Self {
        Self {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }
}

impl Default for TpmtSymDef {
    fn default() -> Self {
        Self::aes_128_cfb()
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.algorithm.to_u16());
        if self.algorithm != TpmAlgId::Null {
            buf.put_u16(self.key_bits);
            buf.put_u16(self.mode.to_u16());
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = unmarshal_alg(buf)?;
        if algorithm == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let key_bits = buf.get_u16()?;
        let mode = unmarshal_alg(buf)?;
        Ok(Self {
            algorithm,
            key_bits,
            mode,
        })
    }
}

/// TPMT_TK_* - A ticket proving the TPM checked something
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub tag: TpmSt,
    pub hierarchy: u32,
    pub digest: Vec<u8>,
}

/// TPMT_TK_AUTH - Produced by PolicySecret/PolicySigned
pub type TpmtTkAuth = Ticket;
/// TPMT_TK_VERIFIED - Produced by VerifySignature, consumed by PolicyAuthorize
pub type TpmtTkVerified = Ticket;
/// TPMT_TK_HASHCHECK - Produced by Hash/SequenceComplete
pub type TpmtTkHashcheck = Ticket;

impl Ticket {
    /// The NULL ticket: tag with TPM_RH_NULL and an empty digest
    pub fn null(tag: TpmSt) -> Self {
        Self {
            tag,
            hierarchy: tpm_rh::NULL,
            digest: Vec::new(),
        }
    }

    pub fn is_null(&self) -> bool {
        self.hierarchy == tpm_rh::NULL && self.digest.is_empty()
    }
}

impl Marshal for Ticket {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag.to_u16());
        buf.put_u32(self.hierarchy);
        buf.put_tpm2b(&self.digest);
    }
}

impl Unmarshal for Ticket {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(raw)
            .ok_or_else(|| Error::Marshal(format!("invalid ticket tag: 0x{raw:04x}")))?;
        let hierarchy = buf.get_u32()?;
        let digest = buf.get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "ticket digest")?;
        Ok(Self {
            tag,
            hierarchy,
            digest,
        })
    }
}

/// TPMT_SIG_SCHEME - Signing scheme (NULL selects the key's default)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmtSigScheme {
    pub scheme: TpmAlgId,
    pub hash_alg: TpmAlgId,
}

impl TpmtSigScheme {
    pub fn null() -> Self {
        Self {
            scheme: TpmAlgId::Null,
            hash_alg: TpmAlgId::Null,
        }
    }

    /// The scheme a key of `key_type` signs with under `hash_alg`
    pub fn for_key_type(key_type: TpmAlgId, hash_alg: TpmAlgId) -> Option<Self> {
        let scheme = match key_type {
            TpmAlgId::Rsa => TpmAlgId::RsaSsa,
            TpmAlgId::Ecc => TpmAlgId::EcDsa,
            TpmAlgId::KeyedHash => TpmAlgId::Hmac,
            _ => return None,
        };
        Some(Self { scheme, hash_alg })
    }
}

impl Marshal for TpmtSigScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.scheme.to_u16());
        if self.scheme != TpmAlgId::Null {
            buf.put_u16(self.hash_alg.to_u16());
        }
    }
}

impl Unmarshal for TpmtSigScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = unmarshal_alg(buf)?;
        if scheme == TpmAlgId::Null {
            return Ok(Self::null());
        }
        let hash_alg = unmarshal_alg(buf)?;
        Ok(Self { scheme, hash_alg })
    }
}

/// TPMS_NV_PUBLIC - NV index definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: u32,
    pub name_alg: TpmAlgId,
    pub attributes: TpmaNv,
    pub auth_policy: Vec<u8>,
    pub data_size: u16,
}

impl TpmsNvPublic {
    pub fn new(nv_index: u32, data_size: u16, attributes: TpmaNv) -> Self {
        Self {
            nv_index,
            name_alg: TpmAlgId::Sha256,
            attributes,
            auth_policy: Vec::new(),
            data_size,
        }
    }
}

/// TPM2B_NV_PUBLIC
impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let mut inner = CommandBuffer::with_capacity(32);
        inner.put_u32(self.nv_index);
        inner.put_u16(self.name_alg.to_u16());
        inner.put_u32(self.attributes.0);
        inner.put_tpm2b(&self.auth_policy);
        inner.put_u16(self.data_size);
        buf.put_tpm2b(inner.as_bytes());
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let bytes = buf.get_tpm2b()?;
        let mut inner = ResponseBuffer::new(&bytes);
        Ok(Self {
            nv_index: inner.get_u32()?,
            name_alg: unmarshal_alg(&mut inner)?,
            attributes: TpmaNv(inner.get_u32()?),
            auth_policy: inner.get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "authPolicy")?,
            data_size: inner.get_u16()?,
        })
    }
}

pub(crate) fn unmarshal_alg(buf: &mut ResponseBuffer) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| Error::Marshal(format!("unknown algorithm: 0x{raw:04x}")))
}

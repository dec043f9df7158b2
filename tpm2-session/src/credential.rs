// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Credential files produced by MakeCredential
//!
//! Layout (big endian): magic `0xBADCC0DE`, version `1`, then the credential
//! and the encrypted secret, each as a 16-bit size followed by the bytes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::{Tpm2bEncryptedSecret, Tpm2bIdObject};

pub const CREDENTIAL_MAGIC: u32 = 0xBADC_C0DE;
pub const CREDENTIAL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBlob {
    #[serde(with = "serde_human_bytes")]
    pub credential: Vec<u8>,
    #[serde(with = "serde_human_bytes")]
    pub secret: Vec<u8>,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidCredentialFile(msg.into())
}

impl CredentialBlob {
    pub fn new(credential: Vec<u8>, secret: Vec<u8>) -> Result<Self> {
        let blob = Self { credential, secret };
        blob.check_sizes()?;
        Ok(blob)
    }

    fn check_sizes(&self) -> Result<()> {
        if self.credential.len() > Tpm2bIdObject::MAX_SIZE {
            return Err(invalid(format!(
                "credential is {} bytes, maximum is {}",
                self.credential.len(),
                Tpm2bIdObject::MAX_SIZE
            )));
        }
        if self.secret.len() > Tpm2bEncryptedSecret::MAX_SIZE {
            return Err(invalid(format!(
                "secret is {} bytes, maximum is {}",
                self.secret.len(),
                Tpm2bEncryptedSecret::MAX_SIZE
            )));
        }
        Ok(())
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(bytes);
        let magic = buf.get_u32().map_err(|_| invalid("truncated header"))?;
        if magic != CREDENTIAL_MAGIC {
            return Err(invalid(format!("bad magic 0x{magic:08x}")));
        }
        let version = buf.get_u32().map_err(|_| invalid("truncated header"))?;
        if version != CREDENTIAL_VERSION {
            return Err(invalid(format!("unsupported version {version}")));
        }
        let credential = buf
            .get::<Tpm2bIdObject>()
            .map_err(|e| invalid(format!("credential: {e}")))?;
        let secret = buf
            .get::<Tpm2bEncryptedSecret>()
            .map_err(|e| invalid(format!("secret: {e}")))?;
        Ok(Self {
            credential: credential.buffer,
            secret: secret.buffer,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.check_sizes()?;
        let mut buf = CommandBuffer::with_capacity(12 + self.credential.len() + self.secret.len());
        buf.put_u32(CREDENTIAL_MAGIC);
        buf.put_u32(CREDENTIAL_VERSION);
        buf.put_tpm2b(&self.credential);
        buf.put_tpm2b(&self.secret);
        Ok(buf.into_vec())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::parse(&fs_err::read(path.as_ref())?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs_err::write(path.as_ref(), self.to_bytes()?)?;
        Ok(())
    }
}

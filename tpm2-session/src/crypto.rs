// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Software digests for PCR policy values and the simulated TPM

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::constants::TpmAlgId;
use crate::error::{Error, Result};

/// Hash the concatenation of `parts` with `hash_alg`
pub fn digest(hash_alg: TpmAlgId, parts: &[&[u8]]) -> Result<Vec<u8>> {
    fn run<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
        let mut hasher = D::new();
        for part in parts {
            hasher.update(part);
        }
        hasher.finalize().to_vec()
    }

    match hash_alg {
        TpmAlgId::Sha256 => Ok(run::<Sha256>(parts)),
        TpmAlgId::Sha384 => Ok(run::<Sha384>(parts)),
        TpmAlgId::Sha512 => Ok(run::<Sha512>(parts)),
        other => Err(Error::Config(format!(
            "unsupported hash algorithm for software digest: {other:?}"
        ))),
    }
}

/// HMAC of `data` under `key` with `hash_alg`
pub fn hmac(hash_alg: TpmAlgId, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    fn run<M: Mac + KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = <M as Mac>::new_from_slice(key)
            .map_err(|e| Error::Config(format!("invalid HMAC key: {e}")))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    match hash_alg {
        TpmAlgId::Sha256 => run::<Hmac<Sha256>>(key, data),
        TpmAlgId::Sha384 => run::<Hmac<Sha384>>(key, data),
        TpmAlgId::Sha512 => run::<Hmac<Sha512>>(key, data),
        other => Err(Error::Config(format!(
            "unsupported hash algorithm for HMAC: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_concatenates_parts() {
        let split = digest(TpmAlgId::Sha256, &[b"ab", b"c"]).unwrap();
        let whole = digest(TpmAlgId::Sha256, &[b"abc"]).unwrap();
        assert_eq!(split, whole);
        assert_eq!(
            hex::encode(whole),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hmac_sha256_rfc4231_case2() {
        let mac = hmac(TpmAlgId::Sha256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_unsupported_alg() {
        assert!(digest(TpmAlgId::Sha1, &[b"x"]).is_err());
    }
}

// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Hash and HMAC sequences
//!
//! Inputs larger than one command buffer are digested with a start / update /
//! complete sequence. The driver splits the input so every update carries at
//! most `max_buffer` bytes and the final bytes always go to SequenceComplete.
//! Inputs that fit in one buffer take the one-shot Hash or HMAC command.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use tracing::{debug, warn};

use crate::constants::*;
use crate::context::TpmContext;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::object::LoadedObject;
use crate::shandle::Authorization;
use crate::types::*;

/// A handle to a started hash or HMAC sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sequence(u64);

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sequence#{}", self.0)
    }
}

/// What is being digested
#[derive(Debug, Clone, Copy)]
pub enum DigestSource<'a> {
    Hash(TpmAlgId),
    /// HMAC with a loaded keyed-hash key; `TPM_ALG_NULL` uses the key's scheme
    Hmac {
        key: &'a LoadedObject,
        hash_alg: TpmAlgId,
    },
}

/// Result of a digest operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestOutput {
    pub digest: Vec<u8>,
    /// Hashcheck ticket; absent for HMAC or when the hierarchy is NULL
    pub validation: Option<TpmtTkHashcheck>,
}

#[derive(Debug)]
struct SequenceEntry {
    handle: u32,
    auth: AuthValue,
    bytes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct SequenceRegistry {
    next_id: u64,
    active: BTreeMap<Sequence, SequenceEntry>,
}

impl SequenceRegistry {
    fn register(&mut self, entry: SequenceEntry) -> Sequence {
        self.next_id += 1;
        let sequence = Sequence(self.next_id);
        self.active.insert(sequence, entry);
        sequence
    }

    fn entry(&self, sequence: Sequence) -> Result<&SequenceEntry> {
        self.active
            .get(&sequence)
            .ok_or_else(|| Error::SequenceState(format!("{sequence} is not active")))
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn drain(&mut self) -> Vec<(Sequence, u32)> {
        std::mem::take(&mut self.active)
            .into_iter()
            .map(|(sequence, entry)| (sequence, entry.handle))
            .collect()
    }
}

fn validation(ticket: Ticket) -> Option<TpmtTkHashcheck> {
    (!ticket.is_null()).then_some(ticket)
}

/// Read up to `max` bytes; short only at end of input
fn read_chunk<R: Read>(reader: &mut R, max: usize) -> std::io::Result<Vec<u8>> {
    let mut chunk = Vec::with_capacity(max);
    reader.by_ref().take(max as u64).read_to_end(&mut chunk)?;
    Ok(chunk)
}

impl<T: Transport> TpmContext<T> {
    /// TPM2_HashSequenceStart
    pub fn hash_sequence_start(
        &mut self,
        auth: &AuthValue,
        hash_alg: TpmAlgId,
    ) -> Result<Sequence> {
        let mut params = CommandBuffer::new();
        params.put(auth);
        params.put_u16(hash_alg.to_u16());
        let response = self.execute(TpmRequest::new(TpmCc::HashSequenceStart).params(params))?;
        let handle = response.out_handle()?;
        let sequence = self.sequences.register(SequenceEntry {
            handle,
            auth: auth.clone(),
            bytes: 0,
        });
        debug!("started {hash_alg:?} {sequence} as handle 0x{handle:08x}");
        Ok(sequence)
    }

    /// TPM2_HMAC_Start with `key`, authorized through its shandle
    pub fn hmac_start(
        &mut self,
        key: &LoadedObject,
        auth: &AuthValue,
        hash_alg: TpmAlgId,
    ) -> Result<Sequence> {
        let slots = self.authorization_slots(&[key.authorization()])?;
        let mut params = CommandBuffer::new();
        params.put(auth);
        params.put_u16(hash_alg.to_u16());
        let mut request = TpmRequest::new(TpmCc::HmacStart)
            .handle(key.handle)
            .params(params);
        request.auths = slots;
        let response = self.execute(request)?;
        let handle = response.out_handle()?;
        let sequence = self.sequences.register(SequenceEntry {
            handle,
            auth: auth.clone(),
            bytes: 0,
        });
        debug!(
            "started HMAC {sequence} with key 0x{:08x} as handle 0x{handle:08x}",
            key.handle
        );
        Ok(sequence)
    }

    fn sequence_request(&self, code: TpmCc, sequence: Sequence) -> Result<TpmRequest> {
        let entry = self.sequences.entry(sequence)?;
        let slots =
            self.authorization_slots(&[Authorization::password(entry.handle, &entry.auth)])?;
        let mut request = TpmRequest::new(code).handle(entry.handle);
        request.auths = slots;
        Ok(request)
    }

    /// Drop a sequence after a failed step; the TPM copy is flushed if possible
    fn retire_sequence(&mut self, sequence: Sequence) {
        if let Some(entry) = self.sequences.active.remove(&sequence) {
            if let Err(err) = self.flush_context(entry.handle) {
                warn!("failed to flush {sequence}: {err}");
            }
        }
    }

    /// TPM2_SequenceUpdate with one chunk of at most `max_buffer` bytes
    pub fn sequence_update(&mut self, sequence: Sequence, chunk: &[u8]) -> Result<()> {
        let max = self.config().max_buffer;
        if chunk.len() > max {
            return Err(Error::SequenceState(format!(
                "update of {} bytes exceeds the {max}-byte buffer",
                chunk.len()
            )));
        }
        let mut params = CommandBuffer::with_capacity(chunk.len() + 2);
        params.put_tpm2b(chunk);
        let request = self
            .sequence_request(TpmCc::SequenceUpdate, sequence)?
            .params(params);
        if let Err(err) = self.execute(request) {
            self.retire_sequence(sequence);
            return Err(err);
        }
        if let Some(entry) = self.sequences.active.get_mut(&sequence) {
            entry.bytes += chunk.len() as u64;
        }
        Ok(())
    }

    /// TPM2_SequenceComplete; the sequence is consumed
    pub fn sequence_complete(
        &mut self,
        sequence: Sequence,
        chunk: &[u8],
    ) -> Result<DigestOutput> {
        let max = self.config().max_buffer;
        if chunk.len() > max {
            return Err(Error::SequenceState(format!(
                "final chunk of {} bytes exceeds the {max}-byte buffer",
                chunk.len()
            )));
        }
        let mut params = CommandBuffer::with_capacity(chunk.len() + 6);
        params.put_tpm2b(chunk);
        params.put_u32(self.config().hierarchy);
        let request = self
            .sequence_request(TpmCc::SequenceComplete, sequence)?
            .params(params);
        let response = match self.execute(request) {
            Ok(response) => response,
            Err(err) => {
                self.retire_sequence(sequence);
                return Err(err);
            }
        };
        // The TPM flushes a completed sequence itself.
        let total = self
            .sequences
            .active
            .remove(&sequence)
            .map(|entry| entry.bytes + chunk.len() as u64)
            .unwrap_or_default();

        let mut buf = response.param_buffer();
        let digest = buf.get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "result")?;
        let ticket = buf.get::<TpmtTkHashcheck>()?;
        debug!("completed {sequence} over {total} bytes");
        Ok(DigestOutput {
            digest,
            validation: validation(ticket),
        })
    }

    /// Abandon a sequence. Aborting an inactive sequence is a no-op.
    pub fn sequence_abort(&mut self, sequence: Sequence) -> Result<()> {
        match self.sequences.active.remove(&sequence) {
            Some(entry) => self.flush_context(entry.handle),
            None => Ok(()),
        }
    }

    pub fn active_sequence_count(&self) -> usize {
        self.sequences.len()
    }

    /// TPM2_Hash of at most one buffer
    pub fn hash(&mut self, data: &[u8], hash_alg: TpmAlgId) -> Result<DigestOutput> {
        let mut params = CommandBuffer::with_capacity(data.len() + 8);
        params.put_tpm2b_bounded(data, Tpm2bMaxBuffer::MAX_SIZE, "hash data")?;
        params.put_u16(hash_alg.to_u16());
        params.put_u32(self.config().hierarchy);
        let response = self.execute(TpmRequest::new(TpmCc::Hash).params(params))?;

        let mut buf = response.param_buffer();
        let digest = buf.get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "outHash")?;
        let ticket = buf.get::<TpmtTkHashcheck>()?;
        Ok(DigestOutput {
            digest,
            validation: validation(ticket),
        })
    }

    /// TPM2_HMAC of at most one buffer
    pub fn hmac(
        &mut self,
        key: &LoadedObject,
        data: &[u8],
        hash_alg: TpmAlgId,
    ) -> Result<DigestOutput> {
        let slots = self.authorization_slots(&[key.authorization()])?;
        let mut params = CommandBuffer::with_capacity(data.len() + 4);
        params.put_tpm2b_bounded(data, Tpm2bMaxBuffer::MAX_SIZE, "HMAC data")?;
        params.put_u16(hash_alg.to_u16());
        let mut request = TpmRequest::new(TpmCc::Hmac)
            .handle(key.handle)
            .params(params);
        request.auths = slots;
        let response = self.execute(request)?;
        let digest = response
            .param_buffer()
            .get_tpm2b_bounded(Tpm2bDigest::MAX_SIZE, "outHMAC")?;
        Ok(DigestOutput {
            digest,
            validation: None,
        })
    }

    fn one_shot(&mut self, source: DigestSource<'_>, data: &[u8]) -> Result<DigestOutput> {
        match source {
            DigestSource::Hash(hash_alg) => self.hash(data, hash_alg),
            DigestSource::Hmac { key, hash_alg } => self.hmac(key, data, hash_alg),
        }
    }

    fn start_for(&mut self, source: DigestSource<'_>) -> Result<Sequence> {
        let auth = AuthValue::empty();
        match source {
            DigestSource::Hash(hash_alg) => self.hash_sequence_start(&auth, hash_alg),
            DigestSource::Hmac { key, hash_alg } => self.hmac_start(key, &auth, hash_alg),
        }
    }

    /// Digest `data`, splitting it over a sequence when it exceeds one buffer
    pub fn digest_slice(&mut self, source: DigestSource<'_>, data: &[u8]) -> Result<DigestOutput> {
        let max = self.config().max_buffer;
        if data.len() <= max {
            return self.one_shot(source, data);
        }
        let sequence = self.start_for(source)?;
        let mut rest = data;
        while rest.len() > max {
            let (chunk, tail) = rest.split_at(max);
            self.sequence_update(sequence, chunk)?;
            rest = tail;
        }
        self.sequence_complete(sequence, rest)
    }

    /// Digest everything `reader` yields.
    ///
    /// With a known `size` the input is split as in [`Self::digest_slice`].
    /// Without one, a chunk of look-ahead is kept so the final bytes go to
    /// SequenceComplete.
    pub fn digest_reader<R: Read>(
        &mut self,
        source: DigestSource<'_>,
        reader: &mut R,
        size: Option<u64>,
    ) -> Result<DigestOutput> {
        let max = self.config().max_buffer;
        if let Some(size) = size {
            if size <= max as u64 {
                let mut data = Vec::with_capacity(size as usize);
                reader.by_ref().take(size).read_to_end(&mut data)?;
                if data.len() as u64 != size {
                    return Err(Error::Io(std::io::ErrorKind::UnexpectedEof.into()));
                }
                return self.one_shot(source, &data);
            }
        }

        let sequence = self.start_for(source)?;
        match self.feed_sequence(sequence, reader, size, max) {
            Ok(last) => self.sequence_complete(sequence, &last),
            Err(err) => {
                // Device failures already retired the sequence.
                if let Err(abort_err) = self.sequence_abort(sequence) {
                    warn!("failed to abort {sequence}: {abort_err}");
                }
                Err(err)
            }
        }
    }

    /// Push all but the final chunk of `reader`; returns the final chunk
    fn feed_sequence<R: Read>(
        &mut self,
        sequence: Sequence,
        reader: &mut R,
        size: Option<u64>,
        max: usize,
    ) -> Result<Vec<u8>> {
        match size {
            Some(size) => {
                let mut left = size;
                let mut chunk = vec![0u8; max];
                while left > max as u64 {
                    reader.read_exact(&mut chunk)?;
                    self.sequence_update(sequence, &chunk)?;
                    left -= max as u64;
                }
                let mut last = vec![0u8; left as usize];
                reader.read_exact(&mut last)?;
                Ok(last)
            }
            None => {
                let mut pending = read_chunk(reader, max)?;
                loop {
                    let next = read_chunk(reader, max)?;
                    if next.is_empty() {
                        return Ok(pending);
                    }
                    self.sequence_update(sequence, &pending)?;
                    pending = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_chunk_stops_at_max() {
        let data = vec![7u8; 10];
        let mut reader = &data[..];
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 2);
        assert!(read_chunk(&mut reader, 4).unwrap().is_empty());
    }

    #[test]
    fn test_null_ticket_is_dropped() {
        assert_eq!(validation(Ticket::null(TpmSt::Hashcheck)), None);
        let ticket = Ticket {
            tag: TpmSt::Hashcheck,
            hierarchy: tpm_rh::OWNER,
            digest: vec![1; 32],
        };
        assert_eq!(validation(ticket.clone()), Some(ticket));
    }

    #[test]
    fn test_registry_ids_are_unique() {
        let mut registry = SequenceRegistry::default();
        let entry = |handle| SequenceEntry {
            handle,
            auth: AuthValue::empty(),
            bytes: 0,
        };
        let a = registry.register(entry(0x8000_0000));
        let b = registry.register(entry(0x8000_0000));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.entry(a).is_err());
    }
}

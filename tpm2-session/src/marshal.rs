// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Big-endian marshalling for TPM parameter areas

use crate::error::{Error, Result};

/// Growable big-endian writer for command parameters
#[derive(Debug, Default, Clone)]
pub struct CommandBuffer {
    data: Vec<u8>,
}

impl CommandBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.data.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Put a TPM2B structure (2-byte size prefix + data).
    ///
    /// `data` must already be within the structure's bound; caller-supplied
    /// bytes go through [`CommandBuffer::put_tpm2b_bounded`].
    pub fn put_tpm2b(&mut self, data: &[u8]) {
        self.put_u16(data.len() as u16);
        self.put_bytes(data);
    }

    /// Put a TPM2B structure, rejecting data longer than `max` or than the
    /// 16-bit size prefix can describe
    pub fn put_tpm2b_bounded(&mut self, data: &[u8], max: usize, what: &str) -> Result<()> {
        let max = max.min(u16::MAX as usize);
        if data.len() > max {
            return Err(Error::Marshal(format!(
                "{what} is {} bytes, maximum is {max}",
                data.len()
            )));
        }
        self.put_tpm2b(data);
        Ok(())
    }

    pub fn put<T: Marshal + ?Sized>(&mut self, value: &T) {
        value.marshal(self);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Overwrite a u32 at `pos` (size fields patched after the body is known)
    pub fn patch_u32(&mut self, pos: usize, v: u32) {
        self.data[pos..pos + 4].copy_from_slice(&v.to_be_bytes());
    }
}

/// Cursor over a response parameter area
#[derive(Debug, Clone)]
pub struct ResponseBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ResponseBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Marshal(format!(
                "buffer underflow reading {what}: need {len} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>("u8")?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        self.take_array("u16").map(u16::from_be_bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        self.take_array("u32").map(u32::from_be_bytes)
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        self.take_array("i32").map(i32::from_be_bytes)
    }

    pub fn get_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        self.take(len, "byte string").map(<[u8]>::to_vec)
    }

    /// Get a TPM2B structure (2-byte size prefix + data)
    pub fn get_tpm2b(&mut self) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        self.get_bytes(size)
    }

    /// Get a TPM2B structure, rejecting sizes above the structure's bound
    pub fn get_tpm2b_bounded(&mut self, max: usize, what: &str) -> Result<Vec<u8>> {
        let size = self.get_u16()? as usize;
        if size > max {
            return Err(Error::Marshal(format!(
                "{what} size {size} exceeds maximum {max}"
            )));
        }
        self.get_bytes(size)
    }

    /// Get remaining bytes
    pub fn get_remaining(&mut self) -> Vec<u8> {
        let v = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        v
    }

    pub fn get<T: Unmarshal>(&mut self) -> Result<T> {
        T::unmarshal(self)
    }
}

/// Trait for types that can be marshalled to TPM format
pub trait Marshal {
    fn marshal(&self, buf: &mut CommandBuffer);

    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        self.marshal(&mut buf);
        buf.into_vec()
    }
}

/// Trait for types that can be unmarshalled from TPM format
pub trait Unmarshal: Sized {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self>;

    fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        Self::unmarshal(&mut buf)
    }
}

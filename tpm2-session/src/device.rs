// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Transport boundary between the session engine and a TPM
//!
//! A [`Transport`] accepts a command (code, handle area, up to three
//! authorization slots, parameter area) and returns the response handle and
//! parameter areas together with the TPM response code. [`TpmDevice`] speaks
//! the TPM 2.0 wire format over `/dev/tpmrm0` or `/dev/tpm0`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// Maximum TPM command/response size
const TPM_MAX_COMMAND_SIZE: usize = 4096;

/// Command header: tag (2) + size (4) + command code (4)
const TPM_HEADER_SIZE: usize = 10;

/// One TPMS_AUTH_COMMAND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSlot {
    /// `tpm_rh::PW` for a password slot, otherwise a session handle
    pub handle: u32,
    pub session_type: Option<TpmSe>,
    pub nonce: Vec<u8>,
    pub attributes: TpmaSession,
    /// Plaintext password (password slots, PolicyPassword) or empty
    pub hmac: Vec<u8>,
}

impl AuthSlot {
    pub fn password(auth: &[u8]) -> Self {
        Self {
            handle: tpm_rh::PW,
            session_type: None,
            nonce: Vec::new(),
            attributes: TpmaSession::new().with_continue_session(),
            hmac: auth.to_vec(),
        }
    }

    pub fn is_password(&self) -> bool {
        self.handle == tpm_rh::PW
    }
}

impl Marshal for AuthSlot {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.handle);
        buf.put_tpm2b(&self.nonce);
        buf.put_u8(self.attributes.0);
        buf.put_tpm2b(&self.hmac);
    }
}

/// A command ready for submission
#[derive(Debug, Clone)]
pub struct TpmRequest {
    pub code: TpmCc,
    pub handles: Vec<u32>,
    pub auths: Vec<AuthSlot>,
    pub params: Vec<u8>,
}

impl TpmRequest {
    pub fn new(code: TpmCc) -> Self {
        Self {
            code,
            handles: Vec::new(),
            auths: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn handle(mut self, handle: u32) -> Self {
        self.handles.push(handle);
        self
    }

    pub fn auth(mut self, slot: AuthSlot) -> Self {
        self.auths.push(slot);
        self
    }

    pub fn params(mut self, params: CommandBuffer) -> Self {
        self.params = params.into_vec();
        self
    }

    /// Serialize to the TPM 2.0 command wire format
    pub fn to_wire(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::with_capacity(TPM_HEADER_SIZE + self.params.len() + 64);
        let tag = if self.auths.is_empty() {
            TpmSt::NoSessions
        } else {
            TpmSt::Sessions
        };
        buf.put_u16(tag.to_u16());
        buf.put_u32(0); // Size placeholder
        buf.put_u32(self.code.to_u32());
        for handle in &self.handles {
            buf.put_u32(*handle);
        }
        if !self.auths.is_empty() {
            let mut area = CommandBuffer::new();
            for slot in &self.auths {
                slot.marshal(&mut area);
            }
            buf.put_u32(area.len() as u32);
            buf.put_bytes(area.as_bytes());
        }
        buf.put_bytes(&self.params);
        let size = buf.len() as u32;
        buf.patch_u32(2, size);
        buf.into_vec()
    }
}

/// A response as returned by the device; `rc` may be a TPM error
#[derive(Debug, Clone)]
pub struct TpmResponse {
    pub rc: ResponseCode,
    pub handles: Vec<u32>,
    pub params: Vec<u8>,
}

impl TpmResponse {
    pub fn success(handles: Vec<u32>, params: Vec<u8>) -> Self {
        Self {
            rc: ResponseCode::SUCCESS,
            handles,
            params,
        }
    }

    pub fn error(rc: ResponseCode) -> Self {
        Self {
            rc,
            handles: Vec::new(),
            params: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.rc.is_success()
    }

    /// Get a response buffer for parsing the parameters
    pub fn param_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.params)
    }

    pub fn out_handle(&self) -> Result<u32> {
        self.handles
            .first()
            .copied()
            .ok_or_else(|| Error::Marshal("response carries no handle".into()))
    }

    /// Parse a response in TPM 2.0 wire format
    pub fn parse(command: TpmCc, response: &[u8]) -> Result<Self> {
        if response.len() < TPM_HEADER_SIZE {
            return Err(Error::Marshal(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);
        let tag_raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(tag_raw)
            .ok_or_else(|| Error::Marshal(format!("invalid response tag: 0x{tag_raw:04x}")))?;
        let size = buf.get_u32()? as usize;
        if size < TPM_HEADER_SIZE || response.len() < size {
            return Err(Error::Marshal(format!(
                "TPM response size mismatch: header says {}, got {}",
                size,
                response.len()
            )));
        }
        let rc = ResponseCode(buf.get_u32()?);
        if !rc.is_success() {
            return Ok(Self::error(rc));
        }

        let mut body = ResponseBuffer::new(&response[TPM_HEADER_SIZE..size]);
        let handles = (0..command.response_handles())
            .map(|_| body.get_u32())
            .collect::<Result<Vec<_>>>()?;
        let params = if tag == TpmSt::Sessions {
            // The response auth area follows the parameters; it is not checked.
            let param_size = body.get_u32()? as usize;
            body.get_bytes(param_size)?
        } else {
            body.get_remaining()
        };

        Ok(Self::success(handles, params))
    }
}

/// Something that can execute TPM commands
pub trait Transport {
    /// Submit one command and block until the device answers
    fn submit(&mut self, request: &TpmRequest) -> Result<TpmResponse>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn submit(&mut self, request: &TpmRequest) -> Result<TpmResponse> {
        (**self).submit(request)
    }
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn submit(&mut self, request: &TpmRequest) -> Result<TpmResponse> {
        (**self).submit(request)
    }
}

/// TPM character device
pub struct TpmDevice {
    file: File,
    path: String,
}

impl TpmDevice {
    /// Open a TPM device
    pub fn open(path: &str) -> Result<Self> {
        // Strip "device:" prefix if present
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)
            .map_err(|e| {
                Error::Transport(format!("failed to open TPM device {device_path}: {e}"))
            })?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default TPM device
    pub fn detect() -> Result<Self> {
        ["/dev/tpmrm0", "/dev/tpm0"]
            .into_iter()
            .find(|p| Path::new(p).exists())
            .ok_or_else(|| Error::Transport("TPM device not found".into()))
            .and_then(Self::open)
    }

    /// Get the device path
    pub fn path(&self) -> &str {
        &self.path
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file
            .write_all(command)
            .map_err(|e| Error::Transport(format!("failed to write TPM command: {e}")))?;

        let mut response = vec![0u8; TPM_MAX_COMMAND_SIZE];
        let n = self
            .file
            .read(&mut response)
            .map_err(|e| Error::Transport(format!("failed to read TPM response: {e}")))?;

        response.truncate(n);
        Ok(response)
    }
}

impl Transport for TpmDevice {
    fn submit(&mut self, request: &TpmRequest) -> Result<TpmResponse> {
        if request
            .auths
            .iter()
            .any(|slot| slot.session_type == Some(TpmSe::Hmac))
        {
            // Computing session HMACs needs entity names and session keys.
            return Err(Error::Transport(
                "HMAC session authorization is not supported by the device transport".into(),
            ));
        }
        let wire = request.to_wire();
        debug!("{:?} command: {} bytes", request.code, wire.len());
        let response = self.transmit(&wire)?;
        TpmResponse::parse(request.code, &response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_without_sessions() {
        let mut params = CommandBuffer::new();
        params.put_u16(TpmAlgId::Sha256.to_u16());
        let bytes = TpmRequest::new(TpmCc::PcrRead).params(params).to_wire();

        assert_eq!(&bytes[0..2], &[0x80, 0x01]); // TPM_ST_NO_SESSIONS
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x01, 0x7E]); // TPM_CC_PCR_Read
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_command_with_password_slot() {
        let bytes = TpmRequest::new(TpmCc::FlushContext)
            .handle(0x8000_0000)
            .auth(AuthSlot::password(b"pw"))
            .to_wire();

        assert_eq!(&bytes[0..2], &[0x80, 0x02]); // TPM_ST_SESSIONS
        // authorizationSize = handle(4) + nonce(2) + attrs(1) + hmac(2 + 2)
        assert_eq!(&bytes[14..18], &[0, 0, 0, 11]);
        assert_eq!(&bytes[18..22], &tpm_rh::PW.to_be_bytes());
        assert_eq!(&bytes[bytes.len() - 2..], b"pw");
    }

    #[test]
    fn test_response_with_handle_and_sessions() {
        let response = vec![
            0x80, 0x02, // TPM_ST_SESSIONS
            0x00, 0x00, 0x00, 0x17, // Size = 23
            0x00, 0x00, 0x00, 0x00, // TPM_RC_SUCCESS
            0x80, 0x00, 0x00, 0x01, // sequence handle
            0x00, 0x00, 0x00, 0x02, // parameterSize
            0xAB, 0xCD, // parameters
            0x00, 0x00, 0x01, // response auth area (ignored)
        ];
        let parsed = TpmResponse::parse(TpmCc::HashSequenceStart, &response).unwrap();
        assert!(parsed.is_success());
        assert_eq!(parsed.handles, vec![0x8000_0001]);
        assert_eq!(parsed.params, vec![0xAB, 0xCD]);
    }

    #[test]
    fn test_error_response() {
        let response = vec![0x80, 0x01, 0x00, 0x00, 0x00, 0x0A, 0x00, 0x00, 0x09, 0x05];
        let parsed = TpmResponse::parse(TpmCc::StartAuthSession, &response).unwrap();
        assert!(!parsed.is_success());
        assert!(parsed.rc.is_resource_exhaustion());
    }
}

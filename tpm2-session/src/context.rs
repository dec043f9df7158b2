// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Per-invocation TPM context
//!
//! [`TpmContext`] owns the transport, the configuration and the registries of
//! every session and sequence it created. Operations are spread over the
//! `session`, `shandle`, `policy`, `sequence`, `object` and `tools` modules as
//! separate `impl` blocks. Dropping the context flushes whatever is still open.

use tracing::{debug, warn};

use crate::config::Config;
use crate::constants::*;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::sequence::SequenceRegistry;
use crate::session::SessionRegistry;

pub struct TpmContext<T: Transport> {
    transport: T,
    config: Config,
    pub(crate) sessions: SessionRegistry,
    pub(crate) sequences: SequenceRegistry,
}

impl TpmContext<TpmDevice> {
    /// Open the configured TPM device, or auto-detect one
    pub fn open(config: Config) -> Result<Self> {
        let device = match config.tcti.as_deref() {
            Some(path) => TpmDevice::open(path)?,
            None => TpmDevice::detect()?,
        };
        debug!("opened TPM device {}", device.path());
        Ok(Self::new(device, config))
    }

    /// Get the device path
    pub fn device_path(&self) -> &str {
        self.transport.path()
    }
}

impl<T: Transport> TpmContext<T> {
    pub fn new(transport: T, config: Config) -> Self {
        Self {
            transport,
            config,
            sessions: SessionRegistry::default(),
            sequences: SequenceRegistry::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Submit a command and turn a TPM error code into [`Error::Device`].
    ///
    /// Session slots submitted without `continueSession` are flushed by the
    /// TPM on success, and policy sessions are reset after authorizing a
    /// command; the registry is brought in line with both.
    pub(crate) fn execute(&mut self, request: TpmRequest) -> Result<TpmResponse> {
        let response = self.transport.submit(&request)?;
        debug!(
            "{:?}: handles={:x?} slots={} rc={}",
            request.code,
            request.handles,
            request.auths.len(),
            response.rc
        );
        if !response.is_success() {
            return Err(Error::Device {
                command: request.code,
                rc: response.rc,
            });
        }
        for slot in request.auths.iter().filter(|s| !s.is_password()) {
            if slot.attributes.continue_session() {
                self.sessions.reset_policy_after_use(slot.handle);
            } else if let Some(session) = self.sessions.retire_handle(slot.handle) {
                debug!("{session} flushed by the TPM after {:?}", request.code);
            }
        }
        Ok(response)
    }

    /// Flush a transient object, sequence or session handle from the device
    pub fn flush_context(&mut self, handle: u32) -> Result<()> {
        let mut params = CommandBuffer::with_capacity(4);
        params.put_u32(handle);
        self.execute(TpmRequest::new(TpmCc::FlushContext).params(params))?;
        debug!("flushed handle 0x{handle:08x}");
        Ok(())
    }

    /// TPM2_ContextSave: the opaque TPMS_CONTEXT blob for `handle`
    pub(crate) fn context_save(&mut self, handle: u32) -> Result<Vec<u8>> {
        let response = self.execute(TpmRequest::new(TpmCc::ContextSave).handle(handle))?;
        Ok(response.params)
    }

    /// TPM2_ContextLoad of an opaque TPMS_CONTEXT blob
    pub(crate) fn context_load(&mut self, blob: &[u8]) -> Result<u32> {
        let mut params = CommandBuffer::with_capacity(blob.len());
        params.put_bytes(blob);
        let response = self.execute(TpmRequest::new(TpmCc::ContextLoad).params(params))?;
        response.out_handle()
    }
}

impl<T: Transport> Drop for TpmContext<T> {
    fn drop(&mut self) {
        for (sequence, handle) in self.sequences.drain() {
            if let Err(err) = self.flush_context(handle) {
                warn!("failed to flush abandoned {sequence}: {err}");
            }
        }
        for (session, entry) in self.sessions.drain() {
            if let Err(err) = self.flush_context(entry.handle) {
                warn!("failed to flush abandoned {session}: {err}");
            }
        }
    }
}

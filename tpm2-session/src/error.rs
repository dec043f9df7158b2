// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the authorization and session engine

use thiserror::Error;

use crate::constants::{ResponseCode, TpmCc};
use crate::session::Session;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed user-supplied authorization descriptor
    #[error("invalid auth descriptor: {0}")]
    InvalidAuthDescriptor(String),

    /// Use of a session that was closed, flushed, or never started
    #[error("stale session: {0}")]
    StaleSession(Session),

    /// The device rejected a command
    #[error("{command:?} failed with TPM error {rc}")]
    Device { command: TpmCc, rc: ResponseCode },

    /// The device declined a policy assertion; restarting the session recovers
    #[error("policy step {command:?} rejected with TPM error {rc}")]
    PolicyStepRejected { command: TpmCc, rc: ResponseCode },

    /// A hash/HMAC sequence operation was attempted out of order
    #[error("sequence state error: {0}")]
    SequenceState(String),

    /// The authorization slots of one command are inconsistent
    #[error("shandle conflict: {0}")]
    ShandleConflict(String),

    #[error("invalid credential file: {0}")]
    InvalidCredentialFile(String),

    /// Malformed wire data
    #[error("marshal error: {0}")]
    Marshal(String),

    /// The device could not be reached
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True for errors raised by the device or the path to it
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::Device { .. } | Error::PolicyStepRejected { .. } | Error::Transport(_)
        )
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            Error::Device { rc, .. } | Error::PolicyStepRejected { rc, .. } => Some(*rc),
            _ => None,
        }
    }

    /// Re-tag a device rejection of a policy assertion
    pub(crate) fn into_policy_rejection(self) -> Self {
        match self {
            Error::Device { command, rc } => Error::PolicyStepRejected { command, rc },
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TpmRc;

    #[test]
    fn test_policy_rejection_is_device_error() {
        let err = Error::Device {
            command: TpmCc::PolicyOr,
            rc: TpmRc::Value.into(),
        }
        .into_policy_rejection();
        assert!(matches!(err, Error::PolicyStepRejected { .. }));
        assert!(err.is_device_error());
        assert_eq!(err.response_code(), Some(ResponseCode(0x084)));
    }

    #[test]
    fn test_local_errors_are_not_device_errors() {
        assert!(!Error::InvalidAuthDescriptor("x".into()).is_device_error());
        assert!(!Error::SequenceState("done".into()).is_device_error());
    }
}

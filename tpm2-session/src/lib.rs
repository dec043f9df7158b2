// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 authorization and session engine
//!
//! This crate owns everything between "the user typed an authorization
//! string" and "the TPM accepted the command": sessions, the session handles
//! placed in command authorization slots, policy assertions and chunked
//! hash/HMAC sequences. It talks to `/dev/tpmrm0` directly, without the C
//! TSS stack.
//!
//! ## Components
//!
//! - **Auth descriptors** ([`AuthDescriptor`]): `str:`, `hex:`, `file:`,
//!   `session:`, `pcr:` and `hmac:` strings resolved into a [`Credential`]
//! - **Session registry**: [`Session`] tokens that go stale once the session
//!   is closed, saved or flushed by the TPM
//! - **Shandle resolver** ([`Shandle`]): which session, if any, fills each
//!   authorization slot
//! - **Policy engine** ([`PolicyStep`]): PolicyPCR, PolicySecret, PolicyOR,
//!   PolicyAuthorize and friends, plus trial digests
//! - **Sequence driver** ([`DigestSource`]): one-shot Hash/HMAC for short
//!   inputs, Start/Update/Complete sequences otherwise
//!
//! [`SoftTpm`] is an in-process device for tests and dry runs.
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_session::{Config, TpmAlgId, TpmContext};
//!
//! let mut ctx = TpmContext::open(Config::from_env()?)?;
//! let key = ctx.load_object_with_auth("0x81000002", "str:secret")?;
//! let mac = ctx.hmac(&key, b"message", TpmAlgId::Sha256)?;
//! ctx.close_object(key)?;
//! # let _ = mac;
//! # Ok::<(), tpm2_session::Error>(())
//! ```

mod auth;
mod config;
mod constants;
mod context;
mod credential;
pub mod crypto;
mod device;
mod error;
mod marshal;
mod object;
mod policy;
mod sequence;
mod session;
mod shandle;
mod sim;
mod tools;
mod types;

pub use auth::{AuthDescriptor, Credential};
pub use config::Config;
pub use constants::*;
pub use context::TpmContext;
pub use credential::{CredentialBlob, CREDENTIAL_MAGIC, CREDENTIAL_VERSION};
pub use device::{AuthSlot, TpmDevice, TpmRequest, TpmResponse, Transport};
pub use error::{Error, Result};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use object::{parse_handle, LoadedObject};
pub use policy::{PolicySecretOutput, PolicySecretParams, PolicyState, PolicyStep};
pub use sequence::{DigestOutput, DigestSource, Sequence};
pub use session::{Session, SessionGuard, SessionParams};
pub use shandle::{Authorization, Shandle, ShandleSlots};
pub use sim::SoftTpm;
pub use tools::{CertifyOutput, NvDefineParams, PublicInfo};
pub use types::*;

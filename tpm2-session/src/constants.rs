// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 constants, command codes and response codes

use std::fmt;

/// TPM 2.0 Command Codes (TPM_CC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmCc {
    EvictControl = 0x0000_0120,
    NvDefineSpace = 0x0000_012A,
    SequenceComplete = 0x0000_013E,
    ActivateCredential = 0x0000_0147,
    Certify = 0x0000_0148,
    PolicySecret = 0x0000_0151,
    Hmac = 0x0000_0155,
    HmacStart = 0x0000_015B,
    SequenceUpdate = 0x0000_015C,
    ContextLoad = 0x0000_0161,
    ContextSave = 0x0000_0162,
    FlushContext = 0x0000_0165,
    PolicyAuthorize = 0x0000_016A,
    PolicyAuthValue = 0x0000_016B,
    PolicyCommandCode = 0x0000_016C,
    PolicyLocality = 0x0000_016F,
    PolicyOr = 0x0000_0171,
    ReadPublic = 0x0000_0173,
    StartAuthSession = 0x0000_0176,
    Hash = 0x0000_017D,
    PcrRead = 0x0000_017E,
    PolicyPcr = 0x0000_017F,
    PolicyRestart = 0x0000_0180,
    HashSequenceStart = 0x0000_0186,
    PolicyDuplicationSelect = 0x0000_0188,
    PolicyGetDigest = 0x0000_0189,
    PolicyPassword = 0x0000_018C,
}

impl TpmCc {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    /// Number of handles the TPM places in the response handle area
    pub fn response_handles(self) -> usize {
        match self {
            TpmCc::StartAuthSession
            | TpmCc::HashSequenceStart
            | TpmCc::HmacStart
            | TpmCc::ContextLoad => 1,
            _ => 0,
        }
    }
}

/// Base TPM 2.0 response codes (TPM_RC), with parameter/handle/session numbering removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TpmRc {
    Success = 0x000,
    // Format 0
    Initialize = 0x100,
    Failure = 0x101,
    Sequence = 0x103,
    AuthMissing = 0x125,
    Policy = 0x126,
    Pcr = 0x127,
    PcrChanged = 0x128,
    CommandCode = 0x143,
    AuthContext = 0x145,
    NvRange = 0x146,
    NvLocked = 0x148,
    NvAuthorization = 0x149,
    NvSpace = 0x14B,
    NvDefined = 0x14C,
    // Format 1
    Hash = 0x083,
    Value = 0x084,
    Hierarchy = 0x085,
    Handle = 0x08B,
    AuthFail = 0x08E,
    Size = 0x095,
    PolicyFail = 0x09D,
    Ticket = 0x0A0,
    BadAuth = 0x0A2,
    Expired = 0x0A3,
    PolicyCc = 0x0A4,
    // Warnings
    ObjectMemory = 0x902,
    SessionMemory = 0x903,
    Memory = 0x904,
    SessionHandles = 0x905,
    ObjectHandles = 0x906,
    Locality = 0x907,
    Retry = 0x922,
    Unknown = 0xFFF,
}

/// Where a format-1 error points
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RcSubject {
    Parameter(u8),
    Handle(u8),
    Session(u8),
}

/// A raw TPM response code as returned by the device
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ResponseCode(pub u32);

impl ResponseCode {
    pub const SUCCESS: Self = Self(0);

    const RC_FMT1: u32 = 0x080;
    const RC_WARN: u32 = 0x900;

    /// Build a format-1 code pointing at a parameter, handle or session
    pub fn format1(base: TpmRc, subject: RcSubject) -> Self {
        let base = base as u32;
        let n = match subject {
            RcSubject::Parameter(n) => 0x040 | (u32::from(n & 0xF) << 8),
            RcSubject::Handle(n) => u32::from(n & 0x7) << 8,
            RcSubject::Session(n) => 0x800 | (u32::from(n & 0x7) << 8),
        };
        Self(base | n)
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    fn is_format1(self) -> bool {
        self.0 & Self::RC_FMT1 != 0
    }

    /// The base code with format-1 numbering stripped
    pub fn base(self) -> u32 {
        if self.is_format1() {
            Self::RC_FMT1 | (self.0 & 0x3F)
        } else {
            self.0 & 0xFFF
        }
    }

    pub fn subject(self) -> Option<RcSubject> {
        if !self.is_format1() {
            return None;
        }
        let n = ((self.0 >> 8) & 0xF) as u8;
        Some(if self.0 & 0x040 != 0 {
            RcSubject::Parameter(n)
        } else if n & 0x8 != 0 {
            RcSubject::Session(n & 0x7)
        } else {
            RcSubject::Handle(n & 0x7)
        })
    }

    pub fn kind(self) -> TpmRc {
        match self.base() {
            0x000 => TpmRc::Success,
            0x100 => TpmRc::Initialize,
            0x101 => TpmRc::Failure,
            0x103 => TpmRc::Sequence,
            0x125 => TpmRc::AuthMissing,
            0x126 => TpmRc::Policy,
            0x127 => TpmRc::Pcr,
            0x128 => TpmRc::PcrChanged,
            0x143 => TpmRc::CommandCode,
            0x145 => TpmRc::AuthContext,
            0x146 => TpmRc::NvRange,
            0x148 => TpmRc::NvLocked,
            0x149 => TpmRc::NvAuthorization,
            0x14B => TpmRc::NvSpace,
            0x14C => TpmRc::NvDefined,
            0x083 => TpmRc::Hash,
            0x084 => TpmRc::Value,
            0x085 => TpmRc::Hierarchy,
            0x08B => TpmRc::Handle,
            0x08E => TpmRc::AuthFail,
            0x095 => TpmRc::Size,
            0x09D => TpmRc::PolicyFail,
            0x0A0 => TpmRc::Ticket,
            0x0A2 => TpmRc::BadAuth,
            0x0A3 => TpmRc::Expired,
            0x0A4 => TpmRc::PolicyCc,
            0x902 => TpmRc::ObjectMemory,
            0x903 => TpmRc::SessionMemory,
            0x904 => TpmRc::Memory,
            0x905 => TpmRc::SessionHandles,
            0x906 => TpmRc::ObjectHandles,
            0x907 => TpmRc::Locality,
            0x922 => TpmRc::Retry,
            _ => TpmRc::Unknown,
        }
    }

    pub fn is_warning(self) -> bool {
        !self.is_format1() && self.0 & 0xF00 == Self::RC_WARN
    }

    /// The device ran out of session or object slots
    pub fn is_resource_exhaustion(self) -> bool {
        matches!(
            self.kind(),
            TpmRc::ObjectMemory
                | TpmRc::SessionMemory
                | TpmRc::Memory
                | TpmRc::SessionHandles
                | TpmRc::ObjectHandles
        )
    }
}

impl From<TpmRc> for ResponseCode {
    fn from(rc: TpmRc) -> Self {
        Self(rc as u32)
    }
}

impl fmt::Debug for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ResponseCode(0x{:08x})", self.0)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subject() {
            Some(subject) => write!(f, "0x{:08x} ({:?}, {:?})", self.0, self.kind(), subject),
            None => write!(f, "0x{:08x} ({:?})", self.0, self.kind()),
        }
    }
}

/// TPM 2.0 Algorithm IDs (TPM_ALG_ID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum TpmAlgId {
    Rsa = 0x0001,
    Sha1 = 0x0004,
    Hmac = 0x0005,
    Aes = 0x0006,
    KeyedHash = 0x0008,
    Sha256 = 0x000B,
    Sha384 = 0x000C,
    Sha512 = 0x000D,
    Null = 0x0010,
    RsaSsa = 0x0014,
    EcDsa = 0x0018,
    Ecc = 0x0023,
    SymCipher = 0x0025,
    Cfb = 0x0043,
}

impl TpmAlgId {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => TpmAlgId::Rsa,
            0x0004 => TpmAlgId::Sha1,
            0x0005 => TpmAlgId::Hmac,
            0x0006 => TpmAlgId::Aes,
            0x0008 => TpmAlgId::KeyedHash,
            0x000B => TpmAlgId::Sha256,
            0x000C => TpmAlgId::Sha384,
            0x000D => TpmAlgId::Sha512,
            0x0010 => TpmAlgId::Null,
            0x0014 => TpmAlgId::RsaSsa,
            0x0018 => TpmAlgId::EcDsa,
            0x0023 => TpmAlgId::Ecc,
            0x0025 => TpmAlgId::SymCipher,
            0x0043 => TpmAlgId::Cfb,
            _ => return None,
        })
    }

    /// Parse a PCR bank / hash name as used on the command line
    pub fn from_hash_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Some(TpmAlgId::Sha1),
            "sha256" => Some(TpmAlgId::Sha256),
            "sha384" => Some(TpmAlgId::Sha384),
            "sha512" => Some(TpmAlgId::Sha512),
            _ => None,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            TpmAlgId::Sha1 => 20,
            TpmAlgId::Sha256 => 32,
            TpmAlgId::Sha384 => 48,
            TpmAlgId::Sha512 => 64,
            _ => 0,
        }
    }

    pub fn is_hash(self) -> bool {
        self.digest_size() != 0
    }
}

/// TPM 2.0 Permanent Handles
pub mod tpm_rh {
    pub const OWNER: u32 = 0x4000_0001;
    pub const NULL: u32 = 0x4000_0007;
    pub const PW: u32 = 0x4000_0009; // Password authorization
    pub const LOCKOUT: u32 = 0x4000_000A;
    pub const ENDORSEMENT: u32 = 0x4000_000B;
    pub const PLATFORM: u32 = 0x4000_000C;
}

/// Handle ranges by type (top byte)
pub mod tpm_ht {
    pub const NV_INDEX: u8 = 0x01;
    pub const HMAC_SESSION: u8 = 0x02;
    pub const POLICY_SESSION: u8 = 0x03;
    pub const TRANSIENT: u8 = 0x80;
    pub const PERSISTENT: u8 = 0x81;

    pub fn of(handle: u32) -> u8 {
        (handle >> 24) as u8
    }
}

/// TPM 2.0 Session Types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TpmSe {
    Hmac = 0x00,
    Policy = 0x01,
    Trial = 0x03,
}

impl TpmSe {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(TpmSe::Hmac),
            0x01 => Some(TpmSe::Policy),
            0x03 => Some(TpmSe::Trial),
            _ => None,
        }
    }

    pub fn is_policy(self) -> bool {
        matches!(self, TpmSe::Policy | TpmSe::Trial)
    }
}

/// TPM 2.0 Session Attributes (TPMA_SESSION)
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TpmaSession(pub u8);

impl TpmaSession {
    pub const CONTINUE_SESSION: u8 = 1 << 0;
    pub const AUDIT_EXCLUSIVE: u8 = 1 << 1;
    pub const AUDIT_RESET: u8 = 1 << 2;
    pub const DECRYPT: u8 = 1 << 5;
    pub const ENCRYPT: u8 = 1 << 6;
    pub const AUDIT: u8 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_continue_session(mut self) -> Self {
        self.0 |= Self::CONTINUE_SESSION;
        self
    }

    pub fn with_decrypt(mut self) -> Self {
        self.0 |= Self::DECRYPT;
        self
    }

    pub fn with_encrypt(mut self) -> Self {
        self.0 |= Self::ENCRYPT;
        self
    }

    pub fn with_audit(mut self) -> Self {
        self.0 |= Self::AUDIT;
        self
    }

    pub fn contains(self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn continue_session(self) -> bool {
        self.contains(Self::CONTINUE_SESSION)
    }

    /// Change only the bits selected by `mask`, taking their new values from `flags`
    pub fn masked_update(self, flags: TpmaSession, mask: TpmaSession) -> Self {
        Self((self.0 & !mask.0) | (flags.0 & mask.0))
    }
}

impl fmt::Debug for TpmaSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(u8, &str); 6] = [
            (TpmaSession::CONTINUE_SESSION, "continueSession"),
            (TpmaSession::AUDIT_EXCLUSIVE, "auditExclusive"),
            (TpmaSession::AUDIT_RESET, "auditReset"),
            (TpmaSession::DECRYPT, "decrypt"),
            (TpmaSession::ENCRYPT, "encrypt"),
            (TpmaSession::AUDIT, "audit"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect();
        write!(f, "TpmaSession({})", set.join("|"))
    }
}

/// TPM 2.0 Locality (TPMA_LOCALITY)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaLocality(pub u8);

impl TpmaLocality {
    pub const ZERO: u8 = 1 << 0;
    pub const ONE: u8 = 1 << 1;
    pub const TWO: u8 = 1 << 2;
    pub const THREE: u8 = 1 << 3;
    pub const FOUR: u8 = 1 << 4;
}

/// TPM 2.0 NV Attributes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TpmaNv(pub u32);

impl TpmaNv {
    pub const OWNER_WRITE: u32 = 1 << 1;
    pub const AUTH_WRITE: u32 = 1 << 2;
    pub const POLICY_WRITE: u32 = 1 << 3;
    pub const OWNER_READ: u32 = 1 << 17;
    pub const AUTH_READ: u32 = 1 << 18;
    pub const POLICY_READ: u32 = 1 << 19;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_owner_write(mut self) -> Self {
        self.0 |= Self::OWNER_WRITE;
        self
    }

    pub fn with_owner_read(mut self) -> Self {
        self.0 |= Self::OWNER_READ;
        self
    }

    pub fn with_auth_write(mut self) -> Self {
        self.0 |= Self::AUTH_WRITE;
        self
    }

    pub fn with_auth_read(mut self) -> Self {
        self.0 |= Self::AUTH_READ;
        self
    }
}

/// TPM command header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmSt {
    NoSessions = 0x8001,
    Sessions = 0x8002,
    RspCommand = 0x00C4,
    Verified = 0x8022,
    Auth = 0x8025,
    Hashcheck = 0x8024,
}

impl TpmSt {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x8001 => Some(TpmSt::NoSessions),
            0x8002 => Some(TpmSt::Sessions),
            0x00C4 => Some(TpmSt::RspCommand),
            0x8022 => Some(TpmSt::Verified),
            0x8025 => Some(TpmSt::Auth),
            0x8024 => Some(TpmSt::Hashcheck),
            _ => None,
        }
    }
}

/// Largest buffer accepted by Hash, HMAC and SequenceUpdate (TPM2_MAX_DIGEST_BUFFER)
pub const MAX_DIGEST_BUFFER: usize = 1024;

/// Largest authorization value: sizeof(TPMU_HA)
pub const MAX_AUTH_SIZE: usize = 64;

/// Number of session slots a single command can carry
pub const MAX_SESSION_SLOTS: usize = 3;

/// Highest PCR index in the default selection size
pub const MAX_PCR_INDEX: u32 = 23;

#![forbid(unsafe_code)]

//! Authenticated identification for constrained secure tokens.
//!
//! A token provisioned with a pre-shared AES-128 key and a 16-byte identifier runs a two-pass
//! mutual challenge-response exchange with a terminal. Only a terminal that proves possession of
//! the shared key learns the identifier, and only in encrypted form under a per-attempt
//! ephemeral key. Observability hooks (tracing + metrics) are gated behind the `observability`
//! feature so the command path stays minimal by default.

pub mod apdu;
pub mod cipher;
pub mod nonce;
pub mod provisioning;
pub mod session;
pub mod terminal;
pub mod token;

pub use apdu::{CommandApdu, ResponseApdu, StatusWord};
pub use cipher::{decrypt_block, encrypt_block, Block};
pub use nonce::{generate_card_nonce, generate_terminal_nonce, NonceSource};
pub use provisioning::ProvisioningRecord;
pub use session::{Session, SessionPhase};
pub use terminal::{CardChannel, Terminal, TerminalError};
pub use token::IdentificationToken;

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

/// Bytes in an AES-128 key.
pub const KEY_BYTES: usize = 16;
/// Bytes in a single cipher block.
pub const BLOCK_BYTES: usize = 16;
/// Bytes in a card or terminal nonce.
pub const NONCE_BYTES: usize = 8;
/// Bytes in the provisioned identifier.
pub const IDENTIFIER_BYTES: usize = 16;
/// Minimum provisioning block: pre-shared key followed by identifier.
pub const PROVISIONING_BYTES: usize = KEY_BYTES + IDENTIFIER_BYTES;

/// Proprietary class byte expected on every protocol command.
pub const CLA_PROPRIETARY: u8 = 0x80;
pub const INS_AUTH_INIT: u8 = 0x10;
pub const INS_AUTH: u8 = 0x11;
pub const INS_GET_ID: u8 = 0x12;
/// ISO 7816-4 SELECT, reserved for the transport layer.
pub const INS_SELECT: u8 = 0xA4;

/// Status message encrypted under the ephemeral key after a successful AUTH.
pub const AUTH_SUCCESS_MESSAGE: [u8; BLOCK_BYTES] = *b"AUTH_SUCCESS\0\0\0\0";
/// Status message encrypted under the ephemeral key after a failed AUTH.
pub const AUTH_FAILURE_MESSAGE: [u8; BLOCK_BYTES] = *b"AUTH_FAILURE\0\0\0\0";

/// Telemetry-friendly reason codes for instrumentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TelemetryCode {
    ClassRejected,
    InstructionRejected,
    LengthRejected,
    PreconditionNotMet,
    ProvisioningRejected,
    EntropyFailure,
    ConfigRejected,
}

impl TelemetryCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryCode::ClassRejected => "class_rejected",
            TelemetryCode::InstructionRejected => "instruction_rejected",
            TelemetryCode::LengthRejected => "length_rejected",
            TelemetryCode::PreconditionNotMet => "precondition_not_met",
            TelemetryCode::ProvisioningRejected => "provisioning_rejected",
            TelemetryCode::EntropyFailure => "entropy_failure",
            TelemetryCode::ConfigRejected => "config_rejected",
        }
    }
}

/// Errors surfaced by the token. Key material, nonces and the identifier never appear in
/// `Display` or `Debug`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("class byte {cla:#04x} not supported")]
    UnsupportedClass { cla: u8 },
    #[error("instruction {ins:#04x} not supported")]
    UnsupportedInstruction { ins: u8 },
    #[error("payload length {actual} does not match expected {expected}")]
    WrongLength { expected: usize, actual: usize },
    #[error("malformed command: {0}")]
    MalformedCommand(&'static str),
    #[error("malformed response: {0}")]
    MalformedResponse(&'static str),
    #[error("conditions of use not satisfied")]
    PreconditionNotMet,
    #[error("provisioning data too short: {actual} bytes")]
    ProvisioningDataTooShort { actual: usize },
    #[error("entropy source unavailable")]
    EntropySourceUnavailable,
    #[error("configuration rejected: {0}")]
    Config(String),
}

impl TokenError {
    /// Map errors to telemetry codes without revealing secrets.
    pub fn to_telemetry(&self) -> TelemetryCode {
        match self {
            TokenError::UnsupportedClass { .. } => TelemetryCode::ClassRejected,
            TokenError::UnsupportedInstruction { .. } => TelemetryCode::InstructionRejected,
            TokenError::WrongLength { .. }
            | TokenError::MalformedCommand(_)
            | TokenError::MalformedResponse(_) => TelemetryCode::LengthRejected,
            TokenError::PreconditionNotMet => TelemetryCode::PreconditionNotMet,
            TokenError::ProvisioningDataTooShort { .. } => TelemetryCode::ProvisioningRejected,
            TokenError::EntropySourceUnavailable => TelemetryCode::EntropyFailure,
            TokenError::Config(_) => TelemetryCode::ConfigRejected,
        }
    }

    /// Fatal errors leave the affected instance unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TokenError::EntropySourceUnavailable | TokenError::ProvisioningDataTooShort { .. }
        )
    }
}

/// Zeroized AES-128 key material.
#[derive(Clone)]
pub struct SecretKey {
    inner: Zeroizing<[u8; KEY_BYTES]>,
}

impl SecretKey {
    pub fn new(bytes: [u8; KEY_BYTES]) -> Self {
        Self {
            inner: Zeroizing::new(bytes),
        }
    }

    /// Exposes the key bytes for block cipher initialization.
    ///
    /// Callers must never log, serialize or copy the returned bytes anywhere other than into
    /// the cipher key schedule.
    pub(crate) fn expose(&self) -> &[u8; KEY_BYTES] {
        &self.inner
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Long-term key shared between the token and authorized terminals.
#[derive(Clone)]
pub struct PreSharedKey(SecretKey);

/// Per-attempt key `CardNonce ‖ TerminalNonce`.
pub struct EphemeralKey(SecretKey);

impl PreSharedKey {
    pub fn new(bytes: [u8; KEY_BYTES]) -> Self {
        Self(SecretKey::new(bytes))
    }

    pub fn secret(&self) -> &SecretKey {
        &self.0
    }
}

impl EphemeralKey {
    /// Concatenate the nonces of a single attempt into an AES-128 key.
    pub fn derive(card_nonce: &CardNonce, terminal_nonce: &TerminalNonce) -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_BYTES]);
        bytes[..NONCE_BYTES].copy_from_slice(card_nonce.expose());
        bytes[NONCE_BYTES..].copy_from_slice(terminal_nonce.expose());
        Self(SecretKey::new(*bytes))
    }

    pub fn secret(&self) -> &SecretKey {
        &self.0
    }
}

impl fmt::Debug for PreSharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PreSharedKey").field(&"[REDACTED]").finish()
    }
}

impl fmt::Debug for EphemeralKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EphemeralKey").field(&"[REDACTED]").finish()
    }
}

/// Zeroized nonce wrapper.
#[derive(Clone)]
pub struct SecretNonce<const N: usize> {
    inner: Zeroizing<[u8; N]>,
}

impl<const N: usize> SecretNonce<N> {
    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, TokenError> {
        if bytes.len() != N {
            return Err(TokenError::WrongLength {
                expected: N,
                actual: bytes.len(),
            });
        }
        let mut arr = Zeroizing::new([0u8; N]);
        arr.copy_from_slice(bytes);
        Ok(Self { inner: arr })
    }

    pub fn from_array(bytes: [u8; N]) -> Self {
        Self {
            inner: Zeroizing::new(bytes),
        }
    }

    pub(crate) fn expose(&self) -> &[u8; N] {
        &self.inner
    }
}

impl<const N: usize> fmt::Debug for SecretNonce<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SecretNonce").field(&"[REDACTED]").finish()
    }
}

/// Nonce drawn by the token at AUTH_INIT (`rc`).
///
/// The raw bytes stay inside the crate:
///
/// ```compile_fail
/// let nonce = idtoken::CardNonce::new([0u8; 8]);
/// let _ = nonce.expose();
/// ```
#[derive(Clone, Debug)]
pub struct CardNonce(SecretNonce<NONCE_BYTES>);

/// Nonce chosen by the terminal and recovered during AUTH (`rt`).
#[derive(Clone, Debug)]
pub struct TerminalNonce(SecretNonce<NONCE_BYTES>);

impl CardNonce {
    pub fn new(bytes: [u8; NONCE_BYTES]) -> Self {
        Self(SecretNonce::from_array(bytes))
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, TokenError> {
        SecretNonce::try_from_slice(bytes).map(Self)
    }

    pub(crate) fn expose(&self) -> &[u8; NONCE_BYTES] {
        self.0.expose()
    }
}

impl TerminalNonce {
    pub fn new(bytes: [u8; NONCE_BYTES]) -> Self {
        Self(SecretNonce::from_array(bytes))
    }

    pub fn try_from_slice(bytes: &[u8]) -> Result<Self, TokenError> {
        SecretNonce::try_from_slice(bytes).map(Self)
    }

    pub(crate) fn expose(&self) -> &[u8; NONCE_BYTES] {
        self.0.expose()
    }
}

/// Confidential identifier disclosed only to authenticated terminals.
#[derive(Clone)]
pub struct Identifier(Zeroizing<[u8; IDENTIFIER_BYTES]>);

impl Identifier {
    pub fn new(bytes: [u8; IDENTIFIER_BYTES]) -> Self {
        Self(Zeroizing::new(bytes))
    }

    pub fn expose(&self) -> &[u8; IDENTIFIER_BYTES] {
        &self.0
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identifier").field(&"[REDACTED]").finish()
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        constant_time_equal(self.expose(), other.expose())
    }
}

impl Eq for Identifier {}

/// Compare two equally sized byte strings without branching on where they first differ.
///
/// The byte-wise XOR of both operands is OR-accumulated over the full length and only the
/// accumulator is tested against zero.
pub fn constant_time_equal<const N: usize>(a: &[u8; N], b: &[u8; N]) -> bool {
    let diff = a
        .iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff.ct_eq(&0u8).into()
}

/// Command encoding used by a token instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenConfig {
    pub class_byte: u8,
    pub ins_auth_init: u8,
    pub ins_auth: u8,
    pub ins_get_id: u8,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            class_byte: CLA_PROPRIETARY,
            ins_auth_init: INS_AUTH_INIT,
            ins_auth: INS_AUTH,
            ins_get_id: INS_GET_ID,
        }
    }
}

/// Protocol operation selected by an instruction byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Instruction {
    AuthInit,
    Auth,
    GetId,
}

impl Instruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Instruction::AuthInit => "auth_init",
            Instruction::Auth => "auth",
            Instruction::GetId => "get_id",
        }
    }
}

impl TokenConfig {
    pub fn builder() -> TokenConfigBuilder {
        TokenConfigBuilder::default()
    }

    pub fn instruction(&self, ins: u8) -> Option<Instruction> {
        if ins == self.ins_auth_init {
            Some(Instruction::AuthInit)
        } else if ins == self.ins_auth {
            Some(Instruction::Auth)
        } else if ins == self.ins_get_id {
            Some(Instruction::GetId)
        } else {
            None
        }
    }

    pub fn instruction_byte(&self, instruction: Instruction) -> u8 {
        match instruction {
            Instruction::AuthInit => self.ins_auth_init,
            Instruction::Auth => self.ins_auth,
            Instruction::GetId => self.ins_get_id,
        }
    }

    pub fn validate(&self) -> Result<(), TokenError> {
        if self.class_byte & CLA_PROPRIETARY == 0 {
            return Err(TokenError::Config("class byte must be proprietary".into()));
        }
        let codes = [self.ins_auth_init, self.ins_auth, self.ins_get_id];
        if codes.contains(&INS_SELECT) {
            return Err(TokenError::Config(
                "instruction collides with SELECT".into(),
            ));
        }
        if codes[0] == codes[1] || codes[0] == codes[2] || codes[1] == codes[2] {
            return Err(TokenError::Config(
                "instruction codes must be distinct".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`TokenConfig`].
#[derive(Debug, Default)]
pub struct TokenConfigBuilder {
    class_byte: Option<u8>,
    ins_auth_init: Option<u8>,
    ins_auth: Option<u8>,
    ins_get_id: Option<u8>,
}

impl TokenConfigBuilder {
    pub fn class_byte(mut self, cla: u8) -> Self {
        self.class_byte = Some(cla);
        self
    }

    pub fn ins_auth_init(mut self, ins: u8) -> Self {
        self.ins_auth_init = Some(ins);
        self
    }

    pub fn ins_auth(mut self, ins: u8) -> Self {
        self.ins_auth = Some(ins);
        self
    }

    pub fn ins_get_id(mut self, ins: u8) -> Self {
        self.ins_get_id = Some(ins);
        self
    }

    pub fn build(self) -> Result<TokenConfig, TokenError> {
        let config = TokenConfig {
            class_byte: self.class_byte.unwrap_or(CLA_PROPRIETARY),
            ins_auth_init: self.ins_auth_init.unwrap_or(INS_AUTH_INIT),
            ins_auth: self.ins_auth.unwrap_or(INS_AUTH),
            ins_get_id: self.ins_get_id.unwrap_or(INS_GET_ID),
        };
        config.validate()?;
        Ok(config)
    }
}

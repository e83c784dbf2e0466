//! Terminal side of the exchange.
//!
//! The terminal proves possession of the pre-shared key by echoing the card nonce, contributes
//! its own nonce to the ephemeral key and finally decrypts the disclosed identifier.

use rand::rngs::OsRng;
use thiserror::Error;

#[cfg(feature = "observability")]
use tracing::{debug, instrument};

use crate::apdu::{CommandApdu, ResponseApdu, StatusWord};
use crate::cipher::{decrypt_block, encrypt_block, Block};
use crate::nonce::{generate_terminal_nonce, NonceSource};
use crate::token::IdentificationToken;
use crate::{
    constant_time_equal, CardNonce, EphemeralKey, Identifier, Instruction, PreSharedKey,
    TokenConfig, TokenError, AUTH_FAILURE_MESSAGE, AUTH_SUCCESS_MESSAGE, BLOCK_BYTES, NONCE_BYTES,
};

/// Errors raised while driving a token from the terminal side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminalError {
    #[error("token returned status {0}")]
    Token(StatusWord),
    #[error("response body of {actual} bytes, expected a single block")]
    ResponseLength { actual: usize },
    #[error("challenge padding invalid; token does not share our key")]
    ChallengeMalformed,
    #[error("token rejected authentication")]
    Rejected,
    #[error("unrecognized authentication status message")]
    UnexpectedStatusMessage,
    #[error("no challenge outstanding")]
    NoChallenge,
    #[error("terminal not authenticated")]
    NotAuthenticated,
    #[error(transparent)]
    Codec(#[from] TokenError),
}

/// Half-duplex command/response channel to a token.
pub trait CardChannel {
    fn transmit(&mut self, command: &CommandApdu) -> Result<ResponseApdu, TerminalError>;
}

impl<R: NonceSource> CardChannel for IdentificationToken<R> {
    fn transmit(&mut self, command: &CommandApdu) -> Result<ResponseApdu, TerminalError> {
        let bytes = command.to_bytes()?;
        Ok(self.process_apdu(&bytes))
    }
}

enum TerminalState {
    Idle,
    Challenged(EphemeralKey),
    Authenticated(EphemeralKey),
}

/// Terminal holding the pre-shared key.
pub struct Terminal<R = OsRng> {
    psk: PreSharedKey,
    config: TokenConfig,
    rng: R,
    state: TerminalState,
}

impl<R: NonceSource> Terminal<R> {
    pub fn new(psk: PreSharedKey, rng: R) -> Self {
        Self {
            psk,
            config: TokenConfig::default(),
            rng,
            state: TerminalState::Idle,
        }
    }

    pub fn with_config(mut self, config: TokenConfig) -> Self {
        self.config = config;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, TerminalState::Authenticated(_))
    }

    fn command(&self, instruction: Instruction, data: Vec<u8>) -> CommandApdu {
        CommandApdu::new(
            self.config.class_byte,
            self.config.instruction_byte(instruction),
            0x00,
            0x00,
            data,
        )
        .with_le(BLOCK_BYTES as u16)
    }

    pub fn auth_init_command(&self) -> CommandApdu {
        self.command(Instruction::AuthInit, Vec::new())
    }

    pub fn get_id_command(&self) -> CommandApdu {
        self.command(Instruction::GetId, Vec::new())
    }

    /// Answer an AUTH_INIT challenge with the AUTH command carrying `E(psk, rt ‖ rc)`.
    pub fn respond_to_challenge(&mut self, challenge: &[u8]) -> Result<CommandApdu, TerminalError> {
        self.state = TerminalState::Idle;
        let challenge = as_block(challenge)?;
        let plain = decrypt_block(self.psk.secret(), challenge);
        let (rc, padding) = plain.split_at(NONCE_BYTES);
        let mut padding_block = [0u8; NONCE_BYTES];
        padding_block.copy_from_slice(padding);
        if !constant_time_equal(&padding_block, &[0u8; NONCE_BYTES]) {
            return Err(TerminalError::ChallengeMalformed);
        }
        let card_nonce = CardNonce::try_from_slice(rc)?;
        let terminal_nonce = generate_terminal_nonce(&mut self.rng)?;

        let mut message = [0u8; BLOCK_BYTES];
        message[..NONCE_BYTES].copy_from_slice(terminal_nonce.expose());
        message[NONCE_BYTES..].copy_from_slice(card_nonce.expose());
        let payload = encrypt_block(self.psk.secret(), &message);
        message.fill(0);

        self.state = TerminalState::Challenged(EphemeralKey::derive(&card_nonce, &terminal_nonce));
        Ok(self.command(Instruction::Auth, payload.to_vec()))
    }

    /// Check the token's encrypted AUTH outcome.
    pub fn verify_auth_response(&mut self, response: &[u8]) -> Result<(), TerminalError> {
        if !matches!(self.state, TerminalState::Challenged(_)) {
            return Err(TerminalError::NoChallenge);
        }
        let response = as_block(response)?;
        let TerminalState::Challenged(key) =
            std::mem::replace(&mut self.state, TerminalState::Idle)
        else {
            return Err(TerminalError::NoChallenge);
        };
        let status = decrypt_block(key.secret(), response);
        if constant_time_equal(&*status, &AUTH_SUCCESS_MESSAGE) {
            self.state = TerminalState::Authenticated(key);
            Ok(())
        } else if constant_time_equal(&*status, &AUTH_FAILURE_MESSAGE) {
            Err(TerminalError::Rejected)
        } else {
            Err(TerminalError::UnexpectedStatusMessage)
        }
    }

    /// Decrypt a GET_ID response under the authenticated ephemeral key.
    pub fn decrypt_identifier(&self, response: &[u8]) -> Result<Identifier, TerminalError> {
        let TerminalState::Authenticated(key) = &self.state else {
            return Err(TerminalError::NotAuthenticated);
        };
        let response = as_block(response)?;
        let plain = decrypt_block(key.secret(), response);
        Ok(Identifier::new(*plain))
    }

    /// Run AUTH_INIT, AUTH and GET_ID against `card` and return the disclosed identifier.
    #[cfg_attr(feature = "observability", instrument(skip_all))]
    pub fn identify<C: CardChannel + ?Sized>(
        &mut self,
        card: &mut C,
    ) -> Result<Identifier, TerminalError> {
        self.state = TerminalState::Idle;

        let challenge = expect_success(card.transmit(&self.auth_init_command())?)?;
        let auth = self.respond_to_challenge(&challenge)?;
        #[cfg(feature = "observability")]
        debug!("challenge answered");

        let outcome = expect_success(card.transmit(&auth)?)?;
        self.verify_auth_response(&outcome)?;
        #[cfg(feature = "observability")]
        debug!("token confirmed authentication");

        let disclosed = expect_success(card.transmit(&self.get_id_command())?)?;
        self.decrypt_identifier(&disclosed)
    }
}

fn as_block(bytes: &[u8]) -> Result<&Block, TerminalError> {
    bytes.try_into().map_err(|_| TerminalError::ResponseLength {
        actual: bytes.len(),
    })
}

fn expect_success(response: ResponseApdu) -> Result<Vec<u8>, TerminalError> {
    if response.status.is_success() {
        Ok(response.data)
    } else {
        Err(TerminalError::Token(response.status))
    }
}

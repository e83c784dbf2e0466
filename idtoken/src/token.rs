//! Protocol handler: the token side of the authenticated identification exchange.

use rand::rngs::OsRng;

#[cfg(feature = "observability")]
use metrics::counter;
#[cfg(feature = "observability")]
use tracing::{debug, instrument, warn};

use crate::apdu::{CommandApdu, ResponseApdu};
use crate::cipher::{decrypt_block, encrypt_block, Block};
use crate::nonce::{generate_card_nonce, NonceSource};
use crate::session::{Session, SessionPhase};
use crate::{
    Instruction, ProvisioningRecord, TokenConfig, TokenError, AUTH_FAILURE_MESSAGE,
    AUTH_SUCCESS_MESSAGE, BLOCK_BYTES, NONCE_BYTES,
};

/// A provisioned token processing one command at a time.
pub struct IdentificationToken<R = OsRng> {
    record: ProvisioningRecord,
    config: TokenConfig,
    session: Session,
    rng: R,
    poisoned: bool,
}

impl IdentificationToken<OsRng> {
    /// Provision from a `psk ‖ id` parameter block with the default encoding and the OS RNG.
    pub fn install(params: &[u8]) -> Result<Self, TokenError> {
        let record = ProvisioningRecord::from_params(params)?;
        Self::new(record, TokenConfig::default(), OsRng)
    }
}

impl<R: NonceSource> IdentificationToken<R> {
    pub fn new(
        record: ProvisioningRecord,
        config: TokenConfig,
        rng: R,
    ) -> Result<Self, TokenError> {
        config.validate()?;
        Ok(Self {
            record,
            config,
            session: Session::new(),
            rng,
            poisoned: false,
        })
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    pub fn session_phase(&self) -> SessionPhase {
        self.session.phase()
    }

    /// Transport-level session (re)start. Must run before the first command of a new session.
    pub fn on_session_start(&mut self) {
        self.session.reset();
        #[cfg(feature = "observability")]
        debug!("session reset");
    }

    /// Wire entry point: parse, dispatch and encode the response with its status word.
    pub fn process_apdu(&mut self, bytes: &[u8]) -> ResponseApdu {
        let result = CommandApdu::parse(bytes).and_then(|command| self.process(&command));
        match result {
            Ok(block) => ResponseApdu::success(block.to_vec()),
            Err(err) => ResponseApdu::from(&err),
        }
    }

    /// Validate the envelope and dispatch to the selected operation.
    pub fn process(&mut self, command: &CommandApdu) -> Result<Block, TokenError> {
        let result = self.dispatch(command);
        #[cfg(feature = "observability")]
        if let Err(err) = &result {
            counter!("idtoken_rejections_total", "code" => err.to_telemetry().as_str())
                .increment(1);
        }
        result
    }

    fn dispatch(&mut self, command: &CommandApdu) -> Result<Block, TokenError> {
        if self.poisoned {
            return Err(TokenError::EntropySourceUnavailable);
        }
        if command.cla != self.config.class_byte {
            return Err(TokenError::UnsupportedClass { cla: command.cla });
        }
        let Some(instruction) = self.config.instruction(command.ins) else {
            return Err(TokenError::UnsupportedInstruction { ins: command.ins });
        };

        #[cfg(feature = "observability")]
        counter!("idtoken_commands_total", "ins" => instruction.as_str()).increment(1);

        match instruction {
            Instruction::AuthInit => {
                expect_empty(&command.data)?;
                self.auth_init()
            }
            Instruction::Auth => self.auth(&command.data),
            Instruction::GetId => {
                expect_empty(&command.data)?;
                self.get_id()
            }
        }
    }

    /// AUTH_INIT: draw a card nonce and return `E(psk, rc ‖ 0^64)`.
    #[cfg_attr(feature = "observability", instrument(skip_all))]
    pub fn auth_init(&mut self) -> Result<Block, TokenError> {
        if self.poisoned {
            return Err(TokenError::EntropySourceUnavailable);
        }
        let card_nonce = match generate_card_nonce(&mut self.rng) {
            Ok(nonce) => nonce,
            Err(err) => {
                self.session.reset();
                self.poisoned = true;
                #[cfg(feature = "observability")]
                warn!("entropy source failed; token disabled");
                return Err(err);
            }
        };

        let mut challenge = [0u8; BLOCK_BYTES];
        challenge[..NONCE_BYTES].copy_from_slice(card_nonce.expose());
        let ciphertext = encrypt_block(self.record.psk().secret(), &challenge);
        self.session.start_attempt(card_nonce);

        #[cfg(feature = "observability")]
        debug!("challenge issued");
        Ok(ciphertext)
    }

    /// AUTH: recover `rt ‖ rc'`, check the echo, derive `rc ‖ rt` and return the encrypted
    /// status message.
    #[cfg_attr(feature = "observability", instrument(skip_all))]
    pub fn auth(&mut self, payload: &[u8]) -> Result<Block, TokenError> {
        if self.poisoned {
            return Err(TokenError::EntropySourceUnavailable);
        }
        let ciphertext: &Block = payload.try_into().map_err(|_| TokenError::WrongLength {
            expected: BLOCK_BYTES,
            actual: payload.len(),
        })?;
        if self.session.phase() != SessionPhase::Initiated {
            return Err(TokenError::PreconditionNotMet);
        }

        let message = decrypt_block(self.record.psk().secret(), ciphertext);
        let authenticated = self.session.resolve(&message)?;
        let status = if authenticated {
            &AUTH_SUCCESS_MESSAGE
        } else {
            &AUTH_FAILURE_MESSAGE
        };
        let key = self
            .session
            .ephemeral_key()
            .ok_or(TokenError::PreconditionNotMet)?;
        let response = encrypt_block(key.secret(), status);

        #[cfg(feature = "observability")]
        {
            let outcome = if authenticated { "success" } else { "failure" };
            counter!("idtoken_auth_total", "outcome" => outcome).increment(1);
            if authenticated {
                debug!("terminal authenticated");
            } else {
                warn!("terminal failed to echo card nonce");
            }
        }
        Ok(response)
    }

    /// GET_ID: encrypt the identifier under the ephemeral key of a successful attempt.
    #[cfg_attr(feature = "observability", instrument(skip_all))]
    pub fn get_id(&self) -> Result<Block, TokenError> {
        if self.poisoned {
            return Err(TokenError::EntropySourceUnavailable);
        }
        let key = self.session.disclosure_key()?;
        Ok(encrypt_block(
            key.secret(),
            self.record.identifier().expose(),
        ))
    }
}

fn expect_empty(data: &[u8]) -> Result<(), TokenError> {
    if data.is_empty() {
        Ok(())
    } else {
        Err(TokenError::WrongLength {
            expected: 0,
            actual: data.len(),
        })
    }
}

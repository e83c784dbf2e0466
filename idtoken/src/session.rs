//! Per-connection session record.
//!
//! The session owns every session-scoped secret: the live card nonce, the derived ephemeral key
//! and the authentication outcome. It is rebuilt from scratch on each transport-level session
//! start, which drops (and zeroizes) everything the previous session held.

use zeroize::Zeroizing;

use crate::cipher::Block;
use crate::{constant_time_equal, CardNonce, EphemeralKey, TerminalNonce, TokenError, NONCE_BYTES};

/// Observable phase of the session, free of secret material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Initiated,
    Resolved { authenticated: bool },
}

enum SessionState {
    Idle,
    Initiated {
        card_nonce: CardNonce,
    },
    Resolved {
        ephemeral_key: EphemeralKey,
        authenticated: bool,
    },
}

/// Mutable session record driven exclusively by the protocol handler.
pub struct Session {
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        match &self.state {
            SessionState::Idle => SessionPhase::Idle,
            SessionState::Initiated { .. } => SessionPhase::Initiated,
            SessionState::Resolved { authenticated, .. } => SessionPhase::Resolved {
                authenticated: *authenticated,
            },
        }
    }

    /// Begin a new attempt with a freshly drawn card nonce. Any previous ephemeral key and
    /// outcome are discarded.
    pub fn start_attempt(&mut self, card_nonce: CardNonce) {
        self.state = SessionState::Initiated { card_nonce };
    }

    /// Resolve the pending attempt from the terminal's decrypted message `rt ‖ rc'`.
    ///
    /// The echoed nonce is compared in constant time against the stored card nonce. The
    /// ephemeral key `rc ‖ rt` is derived regardless of the outcome; disclosure stays gated on
    /// the returned flag.
    pub fn resolve(&mut self, message: &Block) -> Result<bool, TokenError> {
        let SessionState::Initiated { card_nonce } = &self.state else {
            return Err(TokenError::PreconditionNotMet);
        };

        let (terminal_half, echoed_half) = message.split_at(NONCE_BYTES);
        let terminal_nonce = TerminalNonce::try_from_slice(terminal_half)?;
        let mut echoed = Zeroizing::new([0u8; NONCE_BYTES]);
        echoed.copy_from_slice(echoed_half);

        let authenticated = constant_time_equal(&echoed, card_nonce.expose());
        let ephemeral_key = EphemeralKey::derive(card_nonce, &terminal_nonce);

        self.state = SessionState::Resolved {
            ephemeral_key,
            authenticated,
        };
        Ok(authenticated)
    }

    /// Ephemeral key of the resolved attempt, whatever its outcome.
    pub fn ephemeral_key(&self) -> Option<&EphemeralKey> {
        match &self.state {
            SessionState::Resolved { ephemeral_key, .. } => Some(ephemeral_key),
            _ => None,
        }
    }

    /// Ephemeral key usable for identifier disclosure.
    pub fn disclosure_key(&self) -> Result<&EphemeralKey, TokenError> {
        match &self.state {
            SessionState::Resolved {
                ephemeral_key,
                authenticated: true,
            } => Ok(ephemeral_key),
            _ => Err(TokenError::PreconditionNotMet),
        }
    }

    /// Return to `Idle`, dropping the nonce, ephemeral key and outcome.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("phase", &self.phase())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RC: [u8; NONCE_BYTES] = [0xC0, 0xC1, 0xC2, 0xC3, 0xC4, 0xC5, 0xC6, 0xC7];
    const RT: [u8; NONCE_BYTES] = [0x70, 0x71, 0x72, 0x73, 0x74, 0x75, 0x76, 0x77];

    fn message(terminal: [u8; NONCE_BYTES], echoed: [u8; NONCE_BYTES]) -> Block {
        let mut block = [0u8; 16];
        block[..NONCE_BYTES].copy_from_slice(&terminal);
        block[NONCE_BYTES..].copy_from_slice(&echoed);
        block
    }

    #[test]
    fn starts_idle_without_keys() {
        let session = Session::new();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.ephemeral_key().is_none());
        assert_eq!(
            session.disclosure_key().unwrap_err(),
            TokenError::PreconditionNotMet
        );
    }

    #[test]
    fn matching_echo_authenticates() {
        let mut session = Session::new();
        session.start_attempt(CardNonce::new(RC));
        assert_eq!(session.phase(), SessionPhase::Initiated);
        assert!(session.resolve(&message(RT, RC)).unwrap());
        assert_eq!(
            session.phase(),
            SessionPhase::Resolved {
                authenticated: true
            }
        );
        let key = session.disclosure_key().unwrap();
        let mut expected = [0u8; 16];
        expected[..8].copy_from_slice(&RC);
        expected[8..].copy_from_slice(&RT);
        assert_eq!(key.secret().expose(), &expected);
    }

    #[test]
    fn mismatched_echo_derives_key_but_blocks_disclosure() {
        let mut session = Session::new();
        session.start_attempt(CardNonce::new(RC));
        let mut wrong = RC;
        wrong[7] ^= 0x80;
        assert!(!session.resolve(&message(RT, wrong)).unwrap());
        assert!(session.ephemeral_key().is_some());
        assert_eq!(
            session.disclosure_key().unwrap_err(),
            TokenError::PreconditionNotMet
        );
    }

    #[test]
    fn resolve_requires_pending_attempt() {
        let mut session = Session::new();
        assert_eq!(
            session.resolve(&message(RT, [0u8; NONCE_BYTES])),
            Err(TokenError::PreconditionNotMet)
        );
        assert_eq!(session.phase(), SessionPhase::Idle);

        session.start_attempt(CardNonce::new(RC));
        session.resolve(&message(RT, RC)).unwrap();
        assert_eq!(
            session.resolve(&message(RT, RC)),
            Err(TokenError::PreconditionNotMet)
        );
        assert!(session.disclosure_key().is_ok());
    }

    #[test]
    fn new_attempt_discards_previous_key() {
        let mut session = Session::new();
        session.start_attempt(CardNonce::new(RC));
        session.resolve(&message(RT, RC)).unwrap();
        session.start_attempt(CardNonce::new([0x01; NONCE_BYTES]));
        assert!(session.ephemeral_key().is_none());
        assert!(session.disclosure_key().is_err());
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut session = Session::new();
        session.start_attempt(CardNonce::new(RC));
        session.resolve(&message(RT, RC)).unwrap();
        session.reset();
        assert_eq!(session.phase(), SessionPhase::Idle);
        assert!(session.disclosure_key().is_err());
        assert_eq!(format!("{session:?}"), "Session { phase: Idle }");
    }
}

//! Random nonce source.
//!
//! Any cryptographically secure RNG can feed the protocol. A failing entropy source is fatal:
//! there is no fallback to a weaker generator and no reuse of a previous nonce.

use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use crate::{CardNonce, TerminalNonce, TokenError, NONCE_BYTES};

/// Produces unpredictable byte strings.
pub trait NonceSource {
    fn fill_nonce(&mut self, dest: &mut [u8]) -> Result<(), TokenError>;
}

impl<R: RngCore + CryptoRng> NonceSource for R {
    fn fill_nonce(&mut self, dest: &mut [u8]) -> Result<(), TokenError> {
        self.try_fill_bytes(dest)
            .map_err(|_| TokenError::EntropySourceUnavailable)
    }
}

/// Draw `N` fresh bytes.
pub fn next_bytes<const N: usize>(
    source: &mut (impl NonceSource + ?Sized),
) -> Result<Zeroizing<[u8; N]>, TokenError> {
    let mut bytes = Zeroizing::new([0u8; N]);
    source.fill_nonce(&mut bytes[..])?;
    Ok(bytes)
}

/// Draw the card's challenge nonce for a new authentication attempt.
pub fn generate_card_nonce(
    source: &mut (impl NonceSource + ?Sized),
) -> Result<CardNonce, TokenError> {
    let bytes = next_bytes::<NONCE_BYTES>(source)?;
    Ok(CardNonce::new(*bytes))
}

/// Draw the terminal's contribution to the ephemeral key.
pub fn generate_terminal_nonce(
    source: &mut (impl NonceSource + ?Sized),
) -> Result<TerminalNonce, TokenError> {
    let bytes = next_bytes::<NONCE_BYTES>(source)?;
    Ok(TerminalNonce::new(*bytes))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// RNG that replays a fixed script of bytes and then fails.
    pub struct ScriptedRng {
        script: Vec<u8>,
        cursor: usize,
    }

    impl ScriptedRng {
        pub fn new(script: &[u8]) -> Self {
            Self {
                script: script.to_vec(),
                cursor: 0,
            }
        }
    }

    impl RngCore for ScriptedRng {
        fn next_u32(&mut self) -> u32 {
            rand_core::impls::next_u32_via_fill(self)
        }

        fn next_u64(&mut self) -> u64 {
            rand_core::impls::next_u64_via_fill(self)
        }

        fn fill_bytes(&mut self, dest: &mut [u8]) {
            if self.try_fill_bytes(dest).is_err() {
                panic!("scripted rng exhausted");
            }
        }

        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            let end = self.cursor + dest.len();
            if end > self.script.len() {
                return Err(rand_core::Error::new("scripted rng exhausted"));
            }
            dest.copy_from_slice(&self.script[self.cursor..end]);
            self.cursor = end;
            Ok(())
        }
    }

    impl CryptoRng for ScriptedRng {}
}

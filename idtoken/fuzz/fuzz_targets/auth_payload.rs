#![no_main]
use idtoken::*;
use libfuzzer_sys::arbitrary::{self, Arbitrary};
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

#[derive(Arbitrary, Debug)]
struct AuthInput {
    seed: u64,
    payload: Vec<u8>,
}

fuzz_target!(|input: AuthInput| {
    let psk = PreSharedKey::new([0x33; KEY_BYTES]);
    let record = ProvisioningRecord::new(psk.clone(), Identifier::new([0x44; IDENTIFIER_BYTES]));
    let Ok(mut token) = IdentificationToken::new(
        record,
        TokenConfig::default(),
        ChaCha20Rng::seed_from_u64(input.seed),
    ) else {
        return;
    };
    let Ok(challenge) = token.auth_init() else {
        return;
    };

    match token.auth(&input.payload) {
        Ok(_) => {
            assert_eq!(input.payload.len(), BLOCK_BYTES);
            // An arbitrary payload only authenticates if it echoes the card nonce.
            let plain = decrypt_block(psk.secret(), &challenge);
            let mut payload = [0u8; BLOCK_BYTES];
            payload.copy_from_slice(&input.payload);
            let echoed = decrypt_block(psk.secret(), &payload);
            let authenticated = echoed[NONCE_BYTES..] == plain[..NONCE_BYTES];
            assert_eq!(token.get_id().is_ok(), authenticated);
        }
        Err(TokenError::WrongLength { expected, actual }) => {
            assert_eq!(expected, BLOCK_BYTES);
            assert_eq!(actual, input.payload.len());
            assert_eq!(token.session_phase(), SessionPhase::Initiated);
        }
        Err(other) => panic!("unexpected error {other}"),
    }
});

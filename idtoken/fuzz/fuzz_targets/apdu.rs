#![no_main]
use idtoken::*;
use libfuzzer_sys::fuzz_target;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

fuzz_target!(|data: &[u8]| {
    let record = ProvisioningRecord::new(
        PreSharedKey::new([0x11; KEY_BYTES]),
        Identifier::new([0x22; IDENTIFIER_BYTES]),
    );
    let Ok(mut token) = IdentificationToken::new(
        record,
        TokenConfig::default(),
        ChaCha20Rng::seed_from_u64(0),
    ) else {
        return;
    };
    for frame in data.split(|byte| *byte == 0xFF) {
        if frame.first() == Some(&INS_SELECT) {
            token.on_session_start();
            continue;
        }
        let response = token.process_apdu(frame);
        if response.status.is_success() {
            assert_eq!(response.data.len(), BLOCK_BYTES);
        } else {
            assert!(response.data.is_empty());
        }
    }
    if token.session_phase() != (SessionPhase::Resolved { authenticated: true }) {
        assert!(token.get_id().is_err());
    }
});

//! Single-block AES-128 with no chaining and no padding.
//!
//! Every protocol message is exactly one block, so a raw keyed permutation is all the token
//! needs. Callers never feed more than one block per key.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use zeroize::Zeroizing;

use crate::{SecretKey, BLOCK_BYTES};

/// One AES block.
pub type Block = [u8; BLOCK_BYTES];

fn keyed(key: &SecretKey) -> Aes128 {
    // The key schedule is zeroized when the cipher drops at the end of the call.
    Aes128::new(GenericArray::from_slice(key.expose()))
}

/// Encrypt exactly one block under `key`.
pub fn encrypt_block(key: &SecretKey, plaintext: &Block) -> Block {
    let mut out = *plaintext;
    keyed(key).encrypt_block(GenericArray::from_mut_slice(&mut out));
    out
}

/// Decrypt exactly one block under `key`. The recovered plaintext is zeroized on drop.
pub fn decrypt_block(key: &SecretKey, ciphertext: &Block) -> Zeroizing<Block> {
    let mut out = Zeroizing::new(*ciphertext);
    keyed(key).decrypt_block(GenericArray::from_mut_slice(&mut out[..]));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // FIPS-197 appendix C.1.
    const FIPS_KEY: [u8; 16] = [
        0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
        0x0f,
    ];
    const FIPS_PLAINTEXT: Block = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee,
        0xff,
    ];
    const FIPS_CIPHERTEXT: Block = [
        0x69, 0xc4, 0xe0, 0xd8, 0x6a, 0x7b, 0x04, 0x30, 0xd8, 0xcd, 0xb7, 0x80, 0x70, 0xb4, 0xc5,
        0x5a,
    ];

    #[test]
    fn fips_197_known_answer() {
        let key = SecretKey::new(FIPS_KEY);
        assert_eq!(encrypt_block(&key, &FIPS_PLAINTEXT), FIPS_CIPHERTEXT);
        assert_eq!(*decrypt_block(&key, &FIPS_CIPHERTEXT), FIPS_PLAINTEXT);
    }

    #[test]
    fn different_keys_give_different_ciphertexts() {
        let a = SecretKey::new([0x11; 16]);
        let b = SecretKey::new([0x22; 16]);
        assert_ne!(
            encrypt_block(&a, &FIPS_PLAINTEXT),
            encrypt_block(&b, &FIPS_PLAINTEXT)
        );
    }

    proptest! {
        #[test]
        fn proptest_round_trip(key in any::<[u8; 16]>(), block in any::<[u8; 16]>()) {
            let key = SecretKey::new(key);
            let ciphertext = encrypt_block(&key, &block);
            prop_assert_eq!(*decrypt_block(&key, &ciphertext), block);
        }
    }
}

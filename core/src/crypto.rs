//! AES-CFB at-rest encryption for env-var and registry-credential values,
//! matching the original `internal/crypto/crypto.go`: payload
//! `hex(iv):hex(ciphertext)`, key is a hex-decoded 32-byte secret, iv is 16
//! random bytes. No authenticity guarantee is claimed (testable property #10).

use aes::Aes256;
use cfb_mode::{Decryptor, Encryptor};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};

use crate::error::{Error, Result};

type Aes256CfbEnc = Encryptor<Aes256>;
type Aes256CfbDec = Decryptor<Aes256>;

const IV_LEN: usize = 16;

pub fn encrypt(hex_key: &str, plaintext: &str) -> Result<String> {
    let key = hex::decode(hex_key)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid encryption key hex: {e}")))?;
    let mut iv = [0u8; IV_LEN];
    rand::Rng::fill(&mut rand::rng(), &mut iv);

    let mut buf = plaintext.as_bytes().to_vec();
    let enc = Aes256CfbEnc::new_from_slices(&key, &iv)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid key/iv length: {e}")))?;
    enc.encrypt(&mut buf);

    Ok(format!("{}:{}", hex::encode(iv), hex::encode(buf)))
}

pub fn decrypt(hex_key: &str, hash: &str) -> Result<String> {
    let key = hex::decode(hex_key)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid encryption key hex: {e}")))?;
    let (iv_hex, ct_hex) = hash
        .split_once(':')
        .ok_or_else(|| Error::Transient(anyhow::anyhow!("invalid hash format")))?;
    let iv = hex::decode(iv_hex)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid iv hex: {e}")))?;
    let mut buf = hex::decode(ct_hex)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid ciphertext hex: {e}")))?;

    let dec = Aes256CfbDec::new_from_slices(&key, &iv)
        .map_err(|e| Error::Transient(anyhow::anyhow!("invalid key/iv length: {e}")))?;
    dec.decrypt(&mut buf);

    String::from_utf8(buf).map_err(|e| Error::Transient(anyhow::anyhow!("decrypted non-utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> String {
        hex::encode([7u8; 32])
    }

    #[test]
    fn round_trips_arbitrary_strings() {
        let key = test_key();
        for s in ["", "hello", "a bit longer plaintext with spaces", "🦀 unicode"] {
            let enc = encrypt(&key, s).unwrap();
            assert_eq!(decrypt(&key, &enc).unwrap(), s);
        }
    }

    #[test]
    fn tampering_with_ciphertext_changes_plaintext() {
        let key = test_key();
        let enc = encrypt(&key, "sensitive-value").unwrap();
        let (iv_hex, ct_hex) = enc.split_once(':').unwrap();
        let mut ct = hex::decode(ct_hex).unwrap();
        ct[0] ^= 0xFF;
        let tampered = format!("{iv_hex}:{}", hex::encode(ct));
        let decrypted = decrypt(&key, &tampered).unwrap();
        assert_ne!(decrypted, "sensitive-value");
    }

    #[test]
    fn rejects_malformed_hash() {
        assert!(decrypt(&test_key(), "not-a-valid-hash").is_err());
    }
}

//! NIP-04 encrypted direct messages.
//!
//! The shared key is the x coordinate of the ECDH point between one party's
//! secret key and the other's (even-parity) x-only public key. Content is
//! AES-256-CBC with PKCS#7 padding, written as `base64(ciphertext)?iv=base64(iv)`.

use aes::Aes256;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::secp256k1::{ecdh, rand, Parity, SecretKey, XOnlyPublicKey};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

type Encryptor = cbc::Encryptor<Aes256>;
type Decryptor = cbc::Decryptor<Aes256>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Nip04Error {
    #[error("content is not in ciphertext?iv=... form")]
    InvalidFormat,
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("invalid key or iv length")]
    InvalidLength,
    #[error("decryption failed")]
    Decrypt,
    #[error("plaintext is not utf-8")]
    Utf8,
}

/// ECDH shared secret between `secret` and `public`.
pub fn shared_secret(secret: &SecretKey, public: &XOnlyPublicKey) -> [u8; 32] {
    let point = ecdh::shared_secret_point(&public.public_key(Parity::Even), secret);
    let mut x = [0u8; 32];
    x.copy_from_slice(&point[..32]);
    x
}

/// Encrypt `plaintext` from the owner of `secret` to `public`.
pub fn encrypt(
    secret: &SecretKey,
    public: &XOnlyPublicKey,
    plaintext: &str,
) -> Result<String, Nip04Error> {
    let key = shared_secret(secret, public);
    let iv: [u8; 16] = rand::random();
    let ciphertext = Encryptor::new_from_slices(&key, &iv)
        .map_err(|_| Nip04Error::InvalidLength)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}?iv={}", STANDARD.encode(ciphertext), STANDARD.encode(iv)))
}

/// Decrypt `content` sent to the owner of `secret` by `public`.
pub fn decrypt(
    secret: &SecretKey,
    public: &XOnlyPublicKey,
    content: &str,
) -> Result<String, Nip04Error> {
    let (ciphertext, iv) = content.split_once("?iv=").ok_or(Nip04Error::InvalidFormat)?;
    let ciphertext = STANDARD
        .decode(ciphertext)
        .map_err(|e| Nip04Error::Base64(e.to_string()))?;
    let iv = STANDARD
        .decode(iv)
        .map_err(|e| Nip04Error::Base64(e.to_string()))?;

    let key = shared_secret(secret, public);
    let plaintext = Decryptor::new_from_slices(&key, &iv)
        .map_err(|_| Nip04Error::InvalidLength)?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| Nip04Error::Decrypt)?;
    String::from_utf8(plaintext).map_err(|_| Nip04Error::Utf8)
}

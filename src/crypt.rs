use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use sha2::{Digest, Sha256};

/// Bytes of random salt stored in clear at the start of every file.
pub const SALT_SIZE: usize = 64;

/// Caller-supplied symmetric key material. One key encrypts the binlog and
/// every data file of a store.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey {
    data: Vec<u8>,
}

impl EncryptionKey {
    /// Expected length of the key material in bytes.
    pub const SIZE: usize = 256;

    pub fn new(data: Vec<u8>) -> Self {
        assert_eq!(data.len(), Self::SIZE, "encryption key must be 256 bytes");
        Self { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The per-file cipher for a given salt.
    pub(crate) fn prepare_cipher(&self, salt: &[u8; SALT_SIZE]) -> PayloadCipher {
        PayloadCipher::new(self, salt)
    }

    /// Keyed checksum binding this key to a file header. A mismatch on read
    /// means the file was written with a different key.
    pub(crate) fn header_checksum(&self, salt: &[u8; SALT_SIZE], covered: &[u8]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(&self.data);
        hasher.update(salt);
        hasher.update(covered);
        hasher.finalize().into()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("EncryptionKey").finish_non_exhaustive()
    }
}

/// Seekable stream cipher over a file's encrypted region. Offsets are byte
/// positions within that region, so reads and writes at arbitrary positions
/// line up with the keystream.
pub(crate) struct PayloadCipher {
    inner: ChaCha20,
}

impl PayloadCipher {
    fn new(key: &EncryptionKey, salt: &[u8; SALT_SIZE]) -> Self {
        let mut cipher_key = Sha256::new();
        cipher_key.update(key.data());
        cipher_key.update(salt);
        let cipher_key: [u8; 32] = cipher_key.finalize().into();

        let mut nonce_full = Sha256::new();
        nonce_full.update(salt);
        nonce_full.update(key.data());
        let nonce_full: [u8; 32] = nonce_full.finalize().into();
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&nonce_full[..12]);

        Self {
            inner: ChaCha20::new(&cipher_key.into(), &nonce.into()),
        }
    }

    /// XORs the keystream at `offset` over `data`. Encryption and decryption
    /// are the same operation.
    pub fn apply(&mut self, data: &mut [u8], offset: u64) {
        self.inner.seek(offset);
        self.inner.apply_keystream(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey::new((0..=255u8).collect())
    }

    #[test]
    fn test_roundtrip_at_offset() {
        let key = test_key();
        let salt = [7u8; SALT_SIZE];
        let mut cipher = key.prepare_cipher(&salt);

        let mut data = b"some payload bytes".to_vec();
        cipher.apply(&mut data, 48);
        assert_ne!(&data, b"some payload bytes");

        let mut other = key.prepare_cipher(&salt);
        other.apply(&mut data, 48);
        assert_eq!(&data, b"some payload bytes");
    }

    #[test]
    fn test_offset_matters() {
        let key = test_key();
        let salt = [7u8; SALT_SIZE];
        let mut cipher = key.prepare_cipher(&salt);

        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        cipher.apply(&mut a, 0);
        cipher.apply(&mut b, 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_piecewise_matches_contiguous() {
        let key = test_key();
        let salt = [3u8; SALT_SIZE];
        let mut cipher = key.prepare_cipher(&salt);

        let mut whole = vec![0x5Au8; 64];
        cipher.apply(&mut whole, 0);

        let mut first = vec![0x5Au8; 24];
        let mut second = vec![0x5Au8; 40];
        cipher.apply(&mut first, 0);
        cipher.apply(&mut second, 24);
        first.extend_from_slice(&second);
        assert_eq!(whole, first);
    }

    #[test]
    fn test_salt_changes_keystream() {
        let key = test_key();
        let mut a_cipher = key.prepare_cipher(&[1u8; SALT_SIZE]);
        let mut b_cipher = key.prepare_cipher(&[2u8; SALT_SIZE]);
        let mut a = vec![0u8; 16];
        let mut b = vec![0u8; 16];
        a_cipher.apply(&mut a, 0);
        b_cipher.apply(&mut b, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_header_checksum_detects_wrong_key() {
        let salt = [9u8; SALT_SIZE];
        let covered = b"header fields";
        let right = test_key().header_checksum(&salt, covered);
        let wrong = EncryptionKey::new(vec![0x42; EncryptionKey::SIZE])
            .header_checksum(&salt, covered);
        assert_ne!(right, wrong);
    }
}

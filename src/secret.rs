use std::fmt;

/// The one persisted secret: ciphertext and the IV it was sealed with.
///
/// The two halves only ever exist together. A store either holds a whole
/// pair or nothing.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredCiphertext {
    /// AES-GCM ciphertext with the 16 byte tag appended
    ciphertext: Vec<u8>,
    /// 96-bit IV bound by the provider at encryption time
    iv: Vec<u8>,
}

impl StoredCiphertext {
    pub fn new(ciphertext: Vec<u8>, iv: Vec<u8>) -> Self {
        Self { ciphertext, iv }
    }

    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<u8>) {
        (self.ciphertext, self.iv)
    }
}

impl fmt::Debug for StoredCiphertext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCiphertext")
            .field("ciphertext_len", &self.ciphertext.len())
            .field("iv_len", &self.iv.len())
            .finish()
    }
}

//! Keyed sponge stream cipher over trytes.

use raam_spec::RaamError;
use raam_ternary::{
    pad_trits, trit_sum, trits_from_trytes, trytes_from_trits, Curl, Trit, HASH_LENGTH, HASH_TRYTES,
};

/// Symmetric tryte stream cipher: successive 243-trit sponge masks folded
/// into 81-tryte chunks. The sponge is never reset between chunks, so one
/// cipher instance processes one contiguous stream.
pub struct StreamCipher {
    curl: Curl,
}

impl StreamCipher {
    /// Key the sponge with `key` and an optional salt, each zero-padded to a
    /// whole sponge block.
    pub fn new(key: &[Trit], salt: Option<&[Trit]>) -> Self {
        let mut curl = Curl::new();
        curl.absorb(&pad_trits(key.to_vec(), HASH_LENGTH));
        if let Some(salt) = salt {
            curl.absorb(&pad_trits(salt.to_vec(), HASH_LENGTH));
        }
        Self { curl }
    }

    /// Encrypt the next stretch of the stream.
    pub fn encrypt(&mut self, trytes: &str) -> Result<String, RaamError> {
        self.apply(trytes, false)
    }

    /// Decrypt the next stretch of the stream.
    pub fn decrypt(&mut self, trytes: &str) -> Result<String, RaamError> {
        self.apply(trytes, true)
    }

    fn apply(&mut self, trytes: &str, invert: bool) -> Result<String, RaamError> {
        let mut out = String::with_capacity(trytes.len());
        for chunk in trytes.as_bytes().chunks(HASH_TRYTES) {
            let chunk = std::str::from_utf8(chunk).map_err(|_| RaamError::InvalidMessage)?;
            let trits = trits_from_trytes(chunk)?;
            let mask = self.curl.squeeze(HASH_LENGTH);
            let mixed: Vec<Trit> = trits
                .iter()
                .zip(&mask)
                .map(|(t, m)| trit_sum(*t, if invert { -*m } else { *m }))
                .collect();
            out.push_str(&trytes_from_trits(&mixed));
        }
        Ok(out)
    }
}

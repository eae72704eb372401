//! Balanced-ternary primitives: trit/tryte codecs, integer encodings,
//! carry and carry-less addition, and the Curl sponge.
#![deny(missing_docs)]

use thiserror::Error;

mod curl;
pub use curl::{curl_hash, Curl, STATE_LENGTH};

/// A balanced ternary digit, one of −1, 0, +1.
pub type Trit = i8;

/// Trits per tryte.
pub const TRITS_PER_TRYTE: usize = 3;

/// Sponge rate and digest width in trits.
pub const HASH_LENGTH: usize = 243;

/// Digest width in trytes.
pub const HASH_TRYTES: usize = HASH_LENGTH / TRITS_PER_TRYTE;

/// The 27-symbol tryte alphabet; `9` encodes zero.
pub const TRYTE_ALPHABET: &str = "9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Ternary conversion error surface.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TernaryError {
    /// A character outside the tryte alphabet.
    #[error("character {0:?} is not a tryte")]
    InvalidTryte(char),
    /// A trit slice whose length is not a whole number of trytes.
    #[error("trit length {0} is not a multiple of 3")]
    UnevenTrits(usize),
    /// An integer too large for the requested tryte width.
    #[error("value {value} does not fit in {width} trytes")]
    Overflow {
        /// The value that failed to encode.
        value: u64,
        /// The requested width in trytes.
        width: usize,
    },
}

fn tryte_value(c: char) -> Result<u8, TernaryError> {
    match c {
        '9' => Ok(0),
        'A'..='Z' => Ok(c as u8 - b'A' + 1),
        _ => Err(TernaryError::InvalidTryte(c)),
    }
}

/// Decode a tryte string into balanced trits, three per tryte, little-endian
/// within each tryte.
pub fn trits_from_trytes(trytes: &str) -> Result<Vec<Trit>, TernaryError> {
    let mut out = Vec::with_capacity(trytes.len() * TRITS_PER_TRYTE);
    for c in trytes.chars() {
        let value = tryte_value(c)? as i8;
        // The upper half of the alphabet encodes the negative values.
        let mut balanced = if value > 13 { value - 27 } else { value };
        for _ in 0..TRITS_PER_TRYTE {
            let mut trit = balanced % 3;
            balanced /= 3;
            if trit > 1 {
                trit -= 3;
                balanced += 1;
            } else if trit < -1 {
                trit += 3;
                balanced -= 1;
            }
            out.push(trit);
        }
    }
    Ok(out)
}

/// Encode balanced trits back into a tryte string.
pub fn trytes_from_trits(trits: &[Trit]) -> String {
    debug_assert!(trits.len() % TRITS_PER_TRYTE == 0);
    let alphabet = TRYTE_ALPHABET.as_bytes();
    let mut out = String::with_capacity(trits.len() / TRITS_PER_TRYTE);
    for group in trits.chunks(TRITS_PER_TRYTE) {
        let value = group[0] as i32 + 3 * group[1] as i32 + 9 * group[2] as i32;
        out.push(alphabet[value.rem_euclid(27) as usize] as char);
    }
    out
}

/// Encode an integer as radix-27 trytes, big-endian, left-padded with `9`.
pub fn int_to_trytes(mut value: u64, width: usize) -> Result<String, TernaryError> {
    let alphabet = TRYTE_ALPHABET.as_bytes();
    let mut out = vec![b'9'; width];
    for slot in out.iter_mut().rev() {
        *slot = alphabet[(value % 27) as usize];
        value /= 27;
    }
    if value > 0 {
        return Err(TernaryError::Overflow { value, width });
    }
    Ok(String::from_utf8(out).expect("alphabet is ASCII"))
}

/// Decode radix-27 big-endian trytes into an integer. Digits are read as
/// their alphabet positions 0..26; the negative half wraps rather than errors.
pub fn trytes_to_int(trytes: &str) -> Result<u64, TernaryError> {
    let mut value: u64 = 0;
    for c in trytes.chars() {
        value = value * 27 + tryte_value(c)? as u64;
    }
    Ok(value)
}

/// Minimal little-endian balanced-ternary encoding of an integer.
pub fn int_to_trits(mut value: u64) -> Vec<Trit> {
    let mut out = Vec::new();
    while value > 0 {
        let rem = (value % 3) as i8;
        value /= 3;
        if rem == 2 {
            out.push(-1);
            value += 1;
        } else {
            out.push(rem);
        }
    }
    out
}

/// Saturating trinary sum: 2 folds to −1 and −2 folds to +1.
pub fn trit_sum(a: Trit, b: Trit) -> Trit {
    match a + b {
        2 => -1,
        -2 => 1,
        s => s,
    }
}

/// Fold `addend` into `target` trit-wise, without carry.
pub fn add_assign(target: &mut [Trit], addend: &[Trit]) {
    debug_assert!(addend.len() <= target.len());
    for (t, a) in target.iter_mut().zip(addend) {
        *t = trit_sum(*t, *a);
    }
}

/// Fold `subtrahend` out of `target` trit-wise, without borrow.
pub fn sub_assign(target: &mut [Trit], subtrahend: &[Trit]) {
    debug_assert!(subtrahend.len() <= target.len());
    for (t, s) in target.iter_mut().zip(subtrahend) {
        *t = trit_sum(*t, -*s);
    }
}

/// Add an integer into a trit register with full carry propagation.
/// Overflow past the register width is dropped.
pub fn carry_add(trits: &mut [Trit], value: u64) {
    let addend = int_to_trits(value);
    let mut carry: i8 = 0;
    for (i, slot) in trits.iter_mut().enumerate() {
        let digit = addend.get(i).copied().unwrap_or(0);
        if i >= addend.len() && carry == 0 {
            break;
        }
        let mut sum = *slot + digit + carry;
        carry = 0;
        if sum > 1 {
            sum -= 3;
            carry = 1;
        } else if sum < -1 {
            sum += 3;
            carry = -1;
        }
        *slot = sum;
    }
}

/// Zero-pad a trit vector up to the next multiple of `multiple`.
pub fn pad_trits(mut trits: Vec<Trit>, multiple: usize) -> Vec<Trit> {
    let rem = trits.len() % multiple;
    if rem != 0 {
        trits.resize(trits.len() + multiple - rem, 0);
    }
    trits
}

/// `9`-pad a tryte string up to the next multiple of `multiple`.
pub fn pad_trytes(mut trytes: String, multiple: usize) -> String {
    let rem = trytes.len() % multiple;
    if rem != 0 {
        for _ in 0..multiple - rem {
            trytes.push('9');
        }
    }
    trytes
}

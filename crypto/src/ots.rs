//! Winternitz-style one-time signatures over balanced ternary.

use raam_spec::{RaamError, FRAG_TRITS};
use raam_ternary::{
    carry_add, curl_hash, pad_trits, trits_from_trytes, Curl, Trit, HASH_LENGTH,
};

/// Signed digest values per security gram.
const VALUES_PER_GRAM: usize = 27;

/// Largest balanced tryte value; also the signing chain radius.
const MAX_VALUE: i8 = 13;

/// Total chain length from private slot to public chain end.
const CHAIN_ROUNDS: usize = 26;

/// Derive the 243-trit subseed for one leaf: seed register plus index with
/// carry, hashed once.
pub fn subseed(seed: &str, index: u64) -> Result<Vec<Trit>, RaamError> {
    let mut register = pad_trits(trits_from_trytes(seed)?, HASH_LENGTH);
    carry_add(&mut register, index);
    Ok(curl_hash(&register, HASH_LENGTH))
}

/// Generate a private key of `security * 27` sponge-squeezed 243-trit slots.
pub fn private_key(subseed: &[Trit], security: usize) -> Vec<Trit> {
    let mut curl = Curl::new();
    curl.absorb(subseed);
    curl.squeeze(security * FRAG_TRITS)
}

/// Compress the 26-round chain ends of every private slot into the public
/// verifying key of `security * 243` trits.
pub fn public_key(private: &[Trit], security: usize) -> Vec<Trit> {
    let mut curl = Curl::new();
    for slot in private.chunks(HASH_LENGTH) {
        curl.absorb(&chain(slot, CHAIN_ROUNDS));
    }
    curl.squeeze(security * HASH_LENGTH)
}

/// Hash a message into `security * 27` balanced values in [−13, 12], with
/// the forgeable value 13 removed and the sum balanced towards zero.
pub fn normalized_digest(message: &str, security: usize) -> Result<Vec<i8>, RaamError> {
    let values = security * VALUES_PER_GRAM;
    let width = (values * 3).div_ceil(HASH_LENGTH) * HASH_LENGTH;
    let trits = pad_trits(trits_from_trytes(message)?, HASH_LENGTH);
    let digest = curl_hash(&trits, width);
    let mut out: Vec<i8> = digest
        .chunks(3)
        .take(values)
        .map(|t| t[0] + 3 * t[1] + 9 * t[2])
        .collect();
    // A slot at 13 would sign with zero hash rounds, handing out the private
    // slot itself.
    for value in out.iter_mut() {
        if *value == MAX_VALUE {
            *value = MAX_VALUE - 1;
        }
    }
    let mut sum: i32 = out.iter().map(|v| *v as i32).sum();
    while sum > 0 {
        for value in out.iter_mut() {
            if *value > -MAX_VALUE {
                *value -= 1;
                sum -= 1;
                break;
            }
        }
    }
    while sum < 0 {
        for value in out.iter_mut() {
            if *value < MAX_VALUE - 1 {
                *value += 1;
                sum += 1;
                break;
            }
        }
    }
    Ok(out)
}

/// Sign a normalized digest: slot i is chained `13 − d_i` rounds.
pub fn sign(digest: &[i8], private: &[Trit]) -> Vec<Trit> {
    let mut signature = Vec::with_capacity(digest.len() * HASH_LENGTH);
    for (value, slot) in digest.iter().zip(private.chunks(HASH_LENGTH)) {
        signature.extend(chain(slot, (MAX_VALUE - value) as usize));
    }
    signature
}

/// Verify a signature against a normalized digest and a verifying key.
pub fn verify(signature: &[Trit], digest: &[i8], public: &[Trit]) -> bool {
    if signature.len() != digest.len() * HASH_LENGTH {
        return false;
    }
    let mut curl = Curl::new();
    for (value, slot) in digest.iter().zip(signature.chunks(HASH_LENGTH)) {
        curl.absorb(&chain(slot, (value + MAX_VALUE) as usize));
    }
    curl.squeeze(public.len()) == public
}

fn chain(slot: &[Trit], rounds: usize) -> Vec<Trit> {
    let mut current = slot.to_vec();
    for _ in 0..rounds {
        current = curl_hash(&current, HASH_LENGTH);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const SEED: &str = "RAAMTESTSEED";

    #[test]
    fn subseeds_differ_per_index() {
        let a = subseed(SEED, 0).unwrap();
        let b = subseed(SEED, 1).unwrap();
        assert_eq!(a.len(), HASH_LENGTH);
        assert_ne!(a, b);
        assert_eq!(a, subseed(SEED, 0).unwrap());
    }

    #[test]
    fn key_lengths_scale_with_security() {
        for security in [1usize, 2, 4] {
            let sub = subseed(SEED, 3).unwrap();
            let private = private_key(&sub, security);
            assert_eq!(private.len(), security * FRAG_TRITS);
            let public = public_key(&private, security);
            assert_eq!(public.len(), security * HASH_LENGTH);
        }
    }

    #[test]
    fn digest_is_normalized() {
        for security in [1usize, 2, 3, 4] {
            let digest = normalized_digest("THEQUICKBROWNFOX", security).unwrap();
            assert_eq!(digest.len(), security * 27);
            assert!(digest.iter().all(|v| (-13..=12).contains(v)));
            assert_eq!(digest.iter().map(|v| *v as i32).sum::<i32>(), 0);
        }
    }

    #[test]
    fn sign_then_verify() {
        let sub = subseed(SEED, 7).unwrap();
        let private = private_key(&sub, 1);
        let public = public_key(&private, 1);
        let digest = normalized_digest("HELLO9WORLD", 1).unwrap();
        let signature = sign(&digest, &private);
        assert_eq!(signature.len(), FRAG_TRITS);
        assert!(verify(&signature, &digest, &public));
    }

    #[test]
    fn tampered_message_fails() {
        let sub = subseed(SEED, 7).unwrap();
        let private = private_key(&sub, 2);
        let public = public_key(&private, 2);
        let digest = normalized_digest("HELLO9WORLD", 2).unwrap();
        let signature = sign(&digest, &private);
        let other = normalized_digest("HELLO9WORLE", 2).unwrap();
        assert!(verify(&signature, &digest, &public));
        assert!(!verify(&signature, &other, &public));
    }

    #[test]
    fn tampered_signature_fails() {
        let sub = subseed(SEED, 2).unwrap();
        let private = private_key(&sub, 1);
        let public = public_key(&private, 1);
        let digest = normalized_digest("MESSAGE", 1).unwrap();
        let mut signature = sign(&digest, &private);
        signature[100] = match signature[100] {
            1 => -1,
            t => t + 1,
        };
        assert!(!verify(&signature, &digest, &public));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn normalization_holds_for_random_messages(
            message in "[9A-Z]{1,64}",
            security in 1usize..=4,
        ) {
            let digest = normalized_digest(&message, security).unwrap();
            prop_assert_eq!(digest.len(), security * 27);
            prop_assert!(digest.iter().all(|v| (-13..=12).contains(v)));
            prop_assert_eq!(digest.iter().map(|v| *v as i32).sum::<i32>(), 0);
        }
    }
}

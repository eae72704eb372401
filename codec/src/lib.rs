//! Assembly and parsing of on-ledger RAAM message bundles: address and
//! cipher-key derivation, framing, signing, and the inverse verify path.
#![deny(missing_docs)]

use tracing::trace;

use raam_crypto::{normalized_digest, recompute_root, sign, verify, StreamCipher};
use raam_spec::{
    validate_length, validate_message, RaamError, Record, RecordDraft, ADDRESS_TRYTES, FRAG_TRYTES,
    HEADER_TRYTES, INDEX_TRYTES, LENGTH_TRYTES, MAX_HEIGHT, MAX_MESSAGE_TRYTES, MAX_SECURITY,
    MIN_HEIGHT, TAG_TRYTES,
};
use raam_ternary::{
    add_assign, int_to_trits, int_to_trytes, pad_trits, pad_trytes, sub_assign, trits_from_trytes,
    trytes_from_trits, trytes_to_int, Curl, Trit, HASH_LENGTH,
};

/// Derive the 81-tryte ledger address of a channel message.
///
/// The index trits fold into the root without carry; the channel password,
/// when present, is absorbed as a separate zero-padded block.
pub fn address(root: &[Trit], index: u64, channel_password: Option<&str>) -> Result<String, RaamError> {
    let mut subroot = root.to_vec();
    add_assign(&mut subroot, &int_to_trits(index));
    let mut curl = Curl::new();
    curl.absorb(&subroot);
    if let Some(password) = channel_password {
        curl.absorb(&pad_trits(trits_from_trytes(password)?, HASH_LENGTH));
    }
    Ok(trytes_from_trits(&curl.squeeze(HASH_LENGTH)))
}

/// Derive the stream-cipher key for one message. The basis is the message
/// password, else the channel password, else the channel root; the index
/// folds in without carry.
pub fn message_key(
    root: &[Trit],
    index: u64,
    channel_password: Option<&str>,
    message_password: Option<&str>,
) -> Result<Vec<Trit>, RaamError> {
    let mut basis = match (message_password, channel_password) {
        (Some(password), _) => trits_from_trytes(password)?,
        (None, Some(password)) => trits_from_trytes(password)?,
        (None, None) => root.to_vec(),
    };
    let index_trits = int_to_trits(index);
    if basis.len() < index_trits.len() {
        let width = index_trits.len().div_ceil(3) * 3;
        basis.resize(width, 0);
    }
    add_assign(&mut basis, &index_trits);
    Ok(basis)
}

/// The per-message password that makes a message public: the address minus
/// the index trits (balanced, no borrow). Folding the index back in during
/// key derivation yields the address itself, so possession of the address is
/// enough to decrypt.
pub fn public_password(address: &str, index: u64) -> Result<String, RaamError> {
    let mut trits = trits_from_trytes(address)?;
    sub_assign(&mut trits, &int_to_trits(index));
    Ok(trytes_from_trits(&trits))
}

/// The tryte stream both sides sign and verify: message, index, verifying
/// key, optional branch root, then the authentication path.
pub fn signing_digest(
    message: &str,
    index: u64,
    verifying_key: &str,
    next_root: Option<&str>,
    auth_path: &str,
) -> Result<String, RaamError> {
    let mut digest = String::with_capacity(
        message.len() + INDEX_TRYTES + verifying_key.len() + auth_path.len(),
    );
    digest.push_str(message);
    digest.push_str(&int_to_trytes(index, INDEX_TRYTES)?);
    digest.push_str(verifying_key);
    if let Some(root) = next_root {
        digest.push_str(root);
    }
    digest.push_str(auth_path);
    Ok(digest)
}

/// Everything the codec needs to frame one channel message.
pub struct MessageInput<'a> {
    /// Message body in trytes.
    pub message: &'a str,
    /// Channel index the message is published at.
    pub index: u64,
    /// Channel tree height.
    pub height: usize,
    /// Channel security level.
    pub security: usize,
    /// The leaf's one-time signing key.
    pub private_key: &'a [Trit],
    /// The leaf's verifying key.
    pub verifying_key: &'a [Trit],
    /// Sibling hashes authenticating the leaf, leaves-first.
    pub auth_path: &'a [Vec<Trit>],
    /// Channel root trits.
    pub root: &'a [Trit],
    /// Channel password, folded into address and key derivation.
    pub channel_password: Option<&'a str>,
    /// Per-message password overriding the key basis.
    pub message_password: Option<&'a str>,
    /// Optional root of a follow-up channel.
    pub next_root: Option<&'a str>,
}

/// Frame, sign, encrypt, and split a message into ledger record drafts.
pub fn assemble(input: &MessageInput<'_>) -> Result<Vec<RecordDraft>, RaamError> {
    validate_message(input.message)?;
    validate_length(input.message.len())?;
    let next_root_security = match input.next_root {
        Some(root) => {
            validate_message(root)?;
            let grams = root.len() / ADDRESS_TRYTES;
            if root.is_empty() || root.len() % ADDRESS_TRYTES != 0 || grams > MAX_SECURITY {
                return Err(RaamError::InvalidSecurityLevel(grams));
            }
            grams
        }
        None => 0,
    };

    let header = pack_header(
        input.index,
        input.security,
        next_root_security,
        input.height,
        input.message.len(),
    )?;
    let verifying_key = trytes_from_trits(input.verifying_key);
    let auth_path: String = input
        .auth_path
        .iter()
        .map(|hash| trytes_from_trits(hash))
        .collect();

    let source = signing_digest(
        input.message,
        input.index,
        &verifying_key,
        input.next_root,
        &auth_path,
    )?;
    let digest = normalized_digest(&source, input.security)?;
    let signature = trytes_from_trits(&sign(&digest, input.private_key));

    let mut payload = header;
    payload.push_str(input.message);
    payload.push_str(&verifying_key);
    payload.push_str(&auth_path);
    if let Some(root) = input.next_root {
        payload.push_str(root);
    }

    let address = address(input.root, input.index, input.channel_password)?;
    let key = message_key(
        input.root,
        input.index,
        input.channel_password,
        input.message_password,
    )?;
    let mut stream = StreamCipher::new(&key, None).encrypt(&pad_trytes(payload, FRAG_TRYTES))?;
    stream.push_str(&signature);

    let tag = int_to_trytes(input.index, TAG_TRYTES)?;
    let records: Vec<RecordDraft> = stream
        .as_bytes()
        .chunks(FRAG_TRYTES)
        .map(|fragment| RecordDraft {
            address: address.clone(),
            message: String::from_utf8(fragment.to_vec()).expect("trytes are ASCII"),
            tag: tag.clone(),
            value: 0,
        })
        .collect();
    trace!(
        index = input.index,
        records = records.len(),
        "message assembled"
    );
    Ok(records)
}

/// Caller-side knowledge checked against the decoded header.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParseExpectations {
    /// The index the caller queried, if known.
    pub index: Option<u64>,
    /// The channel height, if known.
    pub height: Option<usize>,
    /// The channel security, if known.
    pub security: Option<usize>,
}

/// A decoded and decrypted channel message, before verification.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    /// Channel index from the header.
    pub index: u64,
    /// Channel height from the header.
    pub height: usize,
    /// Security level from the header.
    pub security: usize,
    /// Decrypted message body.
    pub message: String,
    /// The leaf verifying key.
    pub verifying_key: Vec<Trit>,
    /// Sibling hashes authenticating the leaf.
    pub auth_path: Vec<Vec<Trit>>,
    /// Root of a follow-up channel, if the message carries a branch.
    pub next_root: Option<String>,
    /// The detached one-time signature.
    pub signature: Vec<Trit>,
}

/// Decrypt and disassemble the records of one bundle.
///
/// Records are deduplicated and ordered by `current_index`; the payload is
/// decrypted as one contiguous cipher stream; the signature is consumed from
/// whatever follows the payload records, trailing slack ignored.
pub fn parse(
    records: &[Record],
    key: &[Trit],
    expect: &ParseExpectations,
) -> Result<ParsedMessage, RaamError> {
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by_key(|record| record.current_index);
    sorted.dedup_by_key(|record| record.current_index);
    if sorted.len() < 2 {
        return Err(RaamError::ShortMessage);
    }
    for record in &sorted {
        if record.message.len() != FRAG_TRYTES {
            return Err(RaamError::InvalidLength(record.message.len()));
        }
    }

    let mut cipher = StreamCipher::new(key, None);
    let mut payload = cipher.decrypt(&sorted[0].message)?;
    let header = unpack_header(&payload[..HEADER_TRYTES])?;
    if let Some(expected) = expect.index {
        if header.index != expected {
            return Err(RaamError::WrongIndex {
                expected,
                found: header.index,
            });
        }
    }
    if let Some(expected) = expect.height {
        if header.height != expected {
            return Err(RaamError::WrongHeight {
                expected,
                found: header.height,
            });
        }
    }
    if let Some(expected) = expect.security {
        if header.security != expected {
            return Err(RaamError::WrongSecurity {
                expected,
                found: header.security,
            });
        }
    }

    let gram = header.security * ADDRESS_TRYTES;
    let body_trytes =
        header.length + (header.height + 1) * gram + header.next_root_security * ADDRESS_TRYTES;
    let payload_records = (HEADER_TRYTES + body_trytes).div_ceil(FRAG_TRYTES);
    if sorted.len() < payload_records + header.security {
        return Err(RaamError::ShortMessage);
    }
    for record in &sorted[1..payload_records] {
        payload.push_str(&cipher.decrypt(&record.message)?);
    }

    let mut cursor = HEADER_TRYTES;
    let message = payload[cursor..cursor + header.length].to_string();
    cursor += header.length;
    let verifying_key = trits_from_trytes(&payload[cursor..cursor + gram])?;
    cursor += gram;
    let mut auth_path = Vec::with_capacity(header.height);
    for _ in 0..header.height {
        auth_path.push(trits_from_trytes(&payload[cursor..cursor + gram])?);
        cursor += gram;
    }
    let next_root = if header.next_root_security > 0 {
        let width = header.next_root_security * ADDRESS_TRYTES;
        let root = payload[cursor..cursor + width].to_string();
        Some(root)
    } else {
        None
    };

    let signature_trytes = header.security * FRAG_TRYTES;
    let mut signature = String::with_capacity(signature_trytes);
    for record in &sorted[payload_records..] {
        if signature.len() >= signature_trytes {
            break;
        }
        signature.push_str(&record.message);
    }
    if signature.len() < signature_trytes {
        return Err(RaamError::ShortMessage);
    }
    signature.truncate(signature_trytes);

    trace!(index = header.index, payload_records, "bundle parsed");
    Ok(ParsedMessage {
        index: header.index,
        height: header.height,
        security: header.security,
        message,
        verifying_key,
        auth_path,
        next_root,
        signature: trits_from_trytes(&signature)?,
    })
}

/// Verify a parsed message: one-time signature, then the Merkle path.
///
/// Returns the channel root implied by the leaf and its path. When
/// `expected_root` is given the recomputation must match it; public-mode
/// readers pass `None` and adopt the returned root.
pub fn authenticate(
    parsed: &ParsedMessage,
    expected_root: Option<&[Trit]>,
) -> Result<Vec<Trit>, RaamError> {
    let verifying_key = trytes_from_trits(&parsed.verifying_key);
    let auth_path: String = parsed
        .auth_path
        .iter()
        .map(|hash| trytes_from_trits(hash))
        .collect();
    let source = signing_digest(
        &parsed.message,
        parsed.index,
        &verifying_key,
        parsed.next_root.as_deref(),
        &auth_path,
    )?;
    let digest = normalized_digest(&source, parsed.security)?;
    if !verify(&parsed.signature, &digest, &parsed.verifying_key) {
        return Err(RaamError::VerificationFailed);
    }
    let root = recompute_root(
        &parsed.verifying_key,
        parsed.index,
        &parsed.auth_path,
        parsed.security,
    );
    if let Some(expected) = expected_root {
        if root != expected {
            return Err(RaamError::AuthenticationFailed);
        }
    }
    Ok(root)
}

struct Header {
    index: u64,
    security: usize,
    next_root_security: usize,
    height: usize,
    length: usize,
}

fn pack_header(
    index: u64,
    security: usize,
    next_root_security: usize,
    height: usize,
    length: usize,
) -> Result<String, RaamError> {
    let mut header = int_to_trytes(index, INDEX_TRYTES)?;
    let indicator = (security - 1 + 4 * next_root_security) as u64;
    header.push_str(&int_to_trytes(indicator, 1)?);
    header.push_str(&int_to_trytes(height as u64, 1)?);
    header.push_str(&int_to_trytes(length as u64, LENGTH_TRYTES)?);
    Ok(header)
}

fn unpack_header(trytes: &str) -> Result<Header, RaamError> {
    let index = trytes_to_int(&trytes[..INDEX_TRYTES])?;
    let indicator = trytes_to_int(&trytes[INDEX_TRYTES..INDEX_TRYTES + 1])? as usize;
    let height = trytes_to_int(&trytes[INDEX_TRYTES + 1..INDEX_TRYTES + 2])? as usize;
    let length = trytes_to_int(&trytes[INDEX_TRYTES + 2..HEADER_TRYTES])? as usize;
    let security = indicator % 4 + 1;
    let next_root_security = indicator / 4;
    if !(MIN_HEIGHT..=MAX_HEIGHT).contains(&height) {
        return Err(RaamError::InvalidHeight(height));
    }
    if next_root_security > MAX_SECURITY {
        return Err(RaamError::InvalidSecurityLevel(next_root_security));
    }
    if length > MAX_MESSAGE_TRYTES {
        return Err(RaamError::InvalidLength(length));
    }
    Ok(Header {
        index,
        security,
        next_root_security,
        height,
        length,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use raam_crypto::{create_tree, MerkleTree};

    const SEED: &str = "CODECTESTSEED";

    async fn tree(height: usize, security: usize) -> MerkleTree {
        create_tree(SEED, height, security, 0, None).await.unwrap()
    }

    fn records_of(drafts: Vec<RecordDraft>) -> Vec<Record> {
        let last = drafts.len() - 1;
        drafts
            .into_iter()
            .enumerate()
            .map(|(i, draft)| Record {
                address: draft.address,
                bundle: "BUNDLE9".into(),
                current_index: i,
                last_index: last,
                message: draft.message,
                tag: draft.tag,
                timestamp: 1,
            })
            .collect()
    }

    fn input<'a>(
        tree: &'a MerkleTree,
        index: u64,
        message: &'a str,
        auth_path: &'a [Vec<Trit>],
    ) -> MessageInput<'a> {
        MessageInput {
            message,
            index,
            height: tree.height(),
            security: tree.security(),
            private_key: &tree.leaf(index).unwrap().private,
            verifying_key: &tree.leaf(index).unwrap().public,
            auth_path,
            root: tree.root(),
            channel_password: None,
            message_password: None,
            next_root: None,
        }
    }

    #[test]
    fn addresses_are_stable_and_password_sensitive() {
        let root = trits_from_trytes(&"R".repeat(81)).unwrap();
        let plain = address(&root, 5, None).unwrap();
        assert_eq!(plain.len(), ADDRESS_TRYTES);
        assert_eq!(plain, address(&root, 5, None).unwrap());
        assert_ne!(plain, address(&root, 6, None).unwrap());
        assert_ne!(plain, address(&root, 5, Some("PASSWORD")).unwrap());
    }

    #[test]
    fn public_key_equals_address_trits() {
        let root = trits_from_trytes(&"Q".repeat(81)).unwrap();
        let addr = address(&root, 9, None).unwrap();
        let password = public_password(&addr, 9).unwrap();
        let key = message_key(&root, 9, None, Some(&password)).unwrap();
        assert_eq!(key, trits_from_trytes(&addr).unwrap());
    }

    #[test]
    fn key_basis_precedence() {
        let root = trits_from_trytes(&"K".repeat(81)).unwrap();
        let by_root = message_key(&root, 1, None, None).unwrap();
        let by_channel = message_key(&root, 1, Some("CHANNEL"), None).unwrap();
        let by_message = message_key(&root, 1, Some("CHANNEL"), Some("MSG")).unwrap();
        assert_ne!(by_root, by_channel);
        assert_ne!(by_channel, by_message);
        assert_eq!(
            by_message,
            message_key(&root, 1, None, Some("MSG")).unwrap()
        );
    }

    #[tokio::test]
    async fn assemble_parse_roundtrip() {
        let tree = tree(2, 1).await;
        let path = tree.auth_path(1).unwrap();
        let drafts = assemble(&input(&tree, 1, "HELLO9RAAM", &path)).unwrap();
        assert!(drafts.iter().all(|d| d.message.len() == FRAG_TRYTES));
        let records = records_of(drafts);
        let key = message_key(tree.root(), 1, None, None).unwrap();
        let parsed = parse(
            &records,
            &key,
            &ParseExpectations {
                index: Some(1),
                height: Some(2),
                security: Some(1),
            },
        )
        .unwrap();
        assert_eq!(parsed.message, "HELLO9RAAM");
        assert_eq!(parsed.index, 1);
        assert_eq!(parsed.height, 2);
        assert_eq!(parsed.security, 1);
        assert_eq!(parsed.next_root, None);
        assert_eq!(parsed.verifying_key, tree.leaf(1).unwrap().public);
        let root = authenticate(&parsed, Some(tree.root())).unwrap();
        assert_eq!(root, tree.root());
    }

    #[tokio::test]
    async fn roundtrip_carries_branch_root() {
        let tree = tree(1, 1).await;
        let next = "N".repeat(81);
        let path = tree.auth_path(0).unwrap();
        let mut message_input = input(&tree, 0, "BRANCHING", &path);
        message_input.next_root = Some(&next);
        let records = records_of(assemble(&message_input).unwrap());
        let key = message_key(tree.root(), 0, None, None).unwrap();
        let parsed = parse(&records, &key, &ParseExpectations::default()).unwrap();
        assert_eq!(parsed.next_root.as_deref(), Some(next.as_str()));
        authenticate(&parsed, Some(tree.root())).unwrap();
    }

    #[tokio::test]
    async fn boundary_message_lengths_roundtrip() {
        let tree = tree(1, 1).await;
        let path = tree.auth_path(0).unwrap();
        for message in [
            String::new(),
            "9".repeat(FRAG_TRYTES),
            "A".repeat(FRAG_TRYTES + 1),
        ] {
            let records = records_of(assemble(&input(&tree, 0, &message, &path)).unwrap());
            let key = message_key(tree.root(), 0, None, None).unwrap();
            let parsed = parse(&records, &key, &ParseExpectations::default()).unwrap();
            assert_eq!(parsed.message, message);
            authenticate(&parsed, Some(tree.root())).unwrap();
        }
    }

    #[tokio::test]
    async fn short_bundle_is_rejected() {
        let tree = tree(1, 1).await;
        let path = tree.auth_path(0).unwrap();
        let mut records = records_of(assemble(&input(&tree, 0, "SHORT", &path)).unwrap());
        records.pop();
        let key = message_key(tree.root(), 0, None, None).unwrap();
        assert_eq!(
            parse(&records, &key, &ParseExpectations::default()).unwrap_err(),
            RaamError::ShortMessage
        );
    }

    #[tokio::test]
    async fn wrong_index_is_detected() {
        let tree = tree(2, 1).await;
        let path = tree.auth_path(3).unwrap();
        let records = records_of(assemble(&input(&tree, 3, "MOVED", &path)).unwrap());
        let key = message_key(tree.root(), 3, None, None).unwrap();
        assert_eq!(
            parse(
                &records,
                &key,
                &ParseExpectations {
                    index: Some(2),
                    ..Default::default()
                },
            )
            .unwrap_err(),
            RaamError::WrongIndex {
                expected: 2,
                found: 3
            }
        );
    }

    #[tokio::test]
    async fn tampered_payload_fails_verification() {
        let tree = tree(1, 1).await;
        let path = tree.auth_path(0).unwrap();
        let records = records_of(assemble(&input(&tree, 0, "INTACT", &path)).unwrap());
        let key = message_key(tree.root(), 0, None, None).unwrap();
        let mut parsed = parse(&records, &key, &ParseExpectations::default()).unwrap();
        parsed.message = "FORGED".into();
        assert_eq!(
            authenticate(&parsed, Some(tree.root())).unwrap_err(),
            RaamError::VerificationFailed
        );
    }

    #[tokio::test]
    async fn foreign_root_fails_authentication() {
        let tree = tree(1, 1).await;
        let other = create_tree("OTHERSEED", 1, 1, 0, None).await.unwrap();
        let path = tree.auth_path(0).unwrap();
        let records = records_of(assemble(&input(&tree, 0, "OWNED", &path)).unwrap());
        let key = message_key(tree.root(), 0, None, None).unwrap();
        let parsed = parse(&records, &key, &ParseExpectations::default()).unwrap();
        assert_eq!(
            authenticate(&parsed, Some(other.root())).unwrap_err(),
            RaamError::AuthenticationFailed
        );
    }

    #[test]
    fn header_packs_and_unpacks() {
        let header = pack_header(123, 3, 2, 17, 4000).unwrap();
        assert_eq!(header.len(), HEADER_TRYTES);
        let decoded = unpack_header(&header).unwrap();
        assert_eq!(decoded.index, 123);
        assert_eq!(decoded.security, 3);
        assert_eq!(decoded.next_root_security, 2);
        assert_eq!(decoded.height, 17);
        assert_eq!(decoded.length, 4000);
    }
}

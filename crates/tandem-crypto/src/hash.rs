//! Message identifiers.
//!
//! An outgoing message keeps one identifier for every device copy the
//! fanout produces, so the id depends only on who sent it, when, and a
//! per-message random nonce. Never on the recipient.

use sha3::{Digest, Sha3_256};
use tandem_types::{IdentityKey, MessageId, Nonce, Timestamp};

const MESSAGE_ID_DOMAIN: &[u8] = b"tandem/message-id/v1";

/// `SHA3-256(domain || sender || unix_millis_be || nonce)`.
pub fn compute_message_id(sender: &IdentityKey, timestamp: &Timestamp, nonce: &Nonce) -> MessageId {
    let millis = timestamp.as_datetime().timestamp_millis();
    let digest = Sha3_256::new()
        .chain_update(MESSAGE_ID_DOMAIN)
        .chain_update(sender.as_ref())
        .chain_update(millis.to_be_bytes())
        .chain_update(nonce.as_ref())
        .finalize();
    MessageId::new(digest.into())
}

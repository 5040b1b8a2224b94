use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A message that can be signed or verified.
///
/// The base string is the ordered concatenation of the message's named
/// fields, no delimiters. Optional fields are emitted only when set.
pub trait SignableMessage {
    fn signature_base_string(&self) -> String;
}

/// An inbound message carrying a signature to verify
pub trait AuthenticatedRequest: SignableMessage {
    /// The decoded binary signature from the request
    fn signature(&self) -> Result<Vec<u8>, hex::FromHexError>;
}

/// HMAC-SHA-256 over the message base string with the per-project secret
pub fn sign(secret: &[u8], msg: &impl SignableMessage) -> Vec<u8> {
    sign_base_string(secret, &msg.signature_base_string())
}

pub fn sign_base_string(secret: &[u8], base: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(base.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time signature verification
pub fn verify(secret: &[u8], msg: &impl SignableMessage, signature: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(msg.signature_base_string().as_bytes());
    mac.verify_slice(signature).is_ok()
}

/// Append metadata to a base string as `key + value` pairs with keys in
/// lexicographic order
pub fn write_sorted_metadata(
    buf: &mut String,
    metadata: &std::collections::HashMap<String, String>,
) {
    let mut keys: Vec<&String> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        buf.push_str(key);
        buf.push_str(&metadata[key]);
    }
}

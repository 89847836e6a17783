use md5::{Digest, Md5};

use crate::error::ProtocolError;

/// The MD5 challenge response defined by the protocol startup flow:
/// `"md5" + hex(md5(hex(md5(password || username)) || salt))`, 35 ASCII
/// bytes in total.
pub fn password_content(username: &str, password: &str, salt: &[u8; 4]) -> String {
    let mut digest = Md5::new();
    digest.update(password.as_bytes());
    digest.update(username.as_bytes());
    let inner = hex::encode(digest.finalize());

    let mut digest = Md5::new();
    digest.update(inner.as_bytes());
    digest.update(salt);
    format!("md5{}", hex::encode(digest.finalize()))
}

/// Byte-for-byte comparison of the client's password message against the
/// expected challenge response for the proxy-configured credentials.
pub fn verify_password(
    hashed: &[u8],
    username: &str,
    password: &str,
    salt: &[u8; 4],
) -> Result<(), ProtocolError> {
    let expected = password_content(username, password, salt);
    if hashed != expected.as_bytes() {
        return Err(ProtocolError::AuthenticationFailed(username.to_string()));
    }
    Ok(())
}

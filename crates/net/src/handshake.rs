//! Join request ("hail") format and the server-side approval policy.

use crate::codec::{PacketReader, PacketWriter};
use crate::error::{AuthError, NetError};
use crate::protocol::{MAX_CREDENTIAL_LEN, MAX_NAME_LEN};

/// Data a client sends alongside its connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hail {
    /// Password supplied by the player; may be empty.
    pub credential: String,
    /// Requested display name.
    pub name: String,
}

impl Hail {
    /// Build a hail.
    pub fn new(credential: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            name: name.into(),
        }
    }

    /// Wire layout: `[credential: str][name: str]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = PacketWriter::with_capacity(4 + self.credential.len() + self.name.len());
        writer.write_str(&self.credential);
        writer.write_str(&self.name);
        writer.finish()
    }

    /// Parse a hail, enforcing length limits.
    pub fn decode(payload: &[u8]) -> Result<Self, NetError> {
        let mut reader = PacketReader::new(payload);
        let credential = reader.read_str()?;
        let name = reader.read_str()?;
        if credential.len() > MAX_CREDENTIAL_LEN {
            return Err(NetError::malformed("credential too long"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(NetError::malformed("name too long"));
        }
        Ok(Self { credential, name })
    }
}

/// Decide whether a hail may join.
///
/// With a password configured, the trimmed credential must equal it. The
/// name must contain something other than whitespace. On success the
/// accepted display name is returned.
pub fn evaluate_hail(hail: &Hail, password: Option<&str>) -> Result<String, AuthError> {
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        if hail.credential.trim() != password.trim() {
            return Err(AuthError::IncorrectPassword);
        }
    }
    if hail.name.trim().is_empty() {
        return Err(AuthError::InvalidName);
    }
    Ok(hail.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hail_wire_layout() {
        let hail = Hail::new("pw", "ann");
        let bytes = hail.encode();
        assert_eq!(bytes, vec![2, 0, b'p', b'w', 3, 0, b'a', b'n', b'n']);
        assert_eq!(Hail::decode(&bytes).unwrap(), hail);
    }

    #[test]
    fn truncated_hail_is_malformed() {
        let bytes = Hail::new("pw", "ann").encode();
        assert!(Hail::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Hail::decode(&[]).is_err());
    }

    #[test]
    fn oversized_name_is_rejected() {
        let bytes = Hail::new("", "x".repeat(MAX_NAME_LEN + 1)).encode();
        assert!(Hail::decode(&bytes).is_err());
    }

    #[test]
    fn password_is_compared_after_trimming() {
        let hail = Hail::new("  secret \n", "bob");
        assert_eq!(evaluate_hail(&hail, Some("secret")), Ok("bob".to_string()));
        assert_eq!(
            evaluate_hail(&Hail::new("wrong", "bob"), Some("secret")),
            Err(AuthError::IncorrectPassword)
        );
    }

    #[test]
    fn any_credential_passes_without_password() {
        assert!(evaluate_hail(&Hail::new("whatever", "bob"), None).is_ok());
        assert!(evaluate_hail(&Hail::new("", "bob"), Some("")).is_ok());
    }

    #[test]
    fn blank_name_is_invalid() {
        assert_eq!(
            evaluate_hail(&Hail::new("", "   "), None),
            Err(AuthError::InvalidName)
        );
        assert_eq!(
            evaluate_hail(&Hail::new("", ""), None),
            Err(AuthError::InvalidName)
        );
    }

    #[test]
    fn password_checked_before_name() {
        assert_eq!(
            evaluate_hail(&Hail::new("bad", ""), Some("secret")),
            Err(AuthError::IncorrectPassword)
        );
    }
}

// Credential decryption port
//
// Encryption itself lives outside the core; data source passwords arrive as
// ciphertext or plaintext and are decrypted only at the connector boundary.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Decryption failed: {0}")]
    DecryptFailed(String),
}

/// Decrypts data source credentials on demand. Implementations must never log
/// plaintext.
pub trait SecretBox: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError>;
    fn is_encrypted(&self, value: &str) -> bool;
}

/// Pass-through box for deployments storing plaintext credentials and for
/// tests.
#[derive(Debug, Default, Clone)]
pub struct PlaintextSecretBox;

impl SecretBox for PlaintextSecretBox {
    fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
        Ok(ciphertext.to_string())
    }

    fn is_encrypted(&self, _value: &str) -> bool {
        false
    }
}

/// Resolve a stored password to plaintext
pub fn resolve_password(
    secret_box: &dyn SecretBox,
    stored: &str,
) -> Result<String, SecretError> {
    if secret_box.is_encrypted(stored) {
        secret_box.decrypt(stored)
    } else {
        Ok(stored.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_box_passes_through() {
        let sb = PlaintextSecretBox;
        assert!(!sb.is_encrypted("hunter2"));
        assert_eq!(resolve_password(&sb, "hunter2").unwrap(), "hunter2");
    }

    struct PrefixBox;

    impl SecretBox for PrefixBox {
        fn decrypt(&self, ciphertext: &str) -> Result<String, SecretError> {
            ciphertext
                .strip_prefix("enc:")
                .map(|s| s.to_string())
                .ok_or_else(|| SecretError::DecryptFailed("missing prefix".to_string()))
        }

        fn is_encrypted(&self, value: &str) -> bool {
            value.starts_with("enc:")
        }
    }

    #[test]
    fn test_encrypted_values_are_decrypted() {
        let sb = PrefixBox;
        assert_eq!(resolve_password(&sb, "enc:secret").unwrap(), "secret");
        assert_eq!(resolve_password(&sb, "plain").unwrap(), "plain");
    }
}

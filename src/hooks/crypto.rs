use crate::error::HookResult;

/// Message signing and encryption backend, used by rules.
///
/// Both operations take the collected body and return its replacement.
pub trait Crypto: Send + Sync {
    /// # Errors
    ///
    /// Returns an error when the body cannot be signed.
    fn sign(&self, body: &[u8]) -> HookResult<Vec<u8>>;

    /// Encrypt `body` to the keys of `recipients`.
    ///
    /// # Errors
    ///
    /// Returns an error when a key is missing or encryption fails.
    fn encrypt(&self, body: &[u8], recipients: &[String]) -> HookResult<Vec<u8>>;
}

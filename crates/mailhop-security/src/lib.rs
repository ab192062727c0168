mod cipher;
mod error;
mod keychain;
mod oauth;

pub use cipher::CredentialCipher;
pub use error::SecurityError;
pub use keychain::{SecretKey, SecretStore};
pub use oauth::{OAuthRefresher, OAuthTokenResult};

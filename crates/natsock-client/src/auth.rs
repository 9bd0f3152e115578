// Credential sourcing for the CONNECT frame.
use crate::error::Result;

/// Fields a credential source may contribute to CONNECT. All optional; empty
/// fields are elided from the JSON.
#[derive(Debug, Clone, Default)]
pub struct AuthCredentials {
    pub jwt: Option<String>,
    /// Base64 Ed25519 signature of the server nonce under the user's seed.
    pub signature: Option<String>,
    pub auth_token: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub nkey: Option<String>,
}

/// Supplies credentials during the handshake. The server nonce is passed in
/// (possibly empty) so signing schemes can respond to the challenge; the
/// signing primitive itself lives outside this crate.
pub trait Authenticator: Send + Sync {
    fn credentials(&self, nonce: &str) -> Result<AuthCredentials>;
}

/// Fixed credentials that ignore the nonce: user/pass, token, or a
/// pre-signed jwt pair.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    credentials: AuthCredentials,
}

impl StaticCredentials {
    pub fn user_pass(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Self {
            credentials: AuthCredentials {
                user: Some(user.into()),
                pass: Some(pass.into()),
                ..AuthCredentials::default()
            },
        }
    }

    pub fn token(token: impl Into<String>) -> Self {
        Self {
            credentials: AuthCredentials {
                auth_token: Some(token.into()),
                ..AuthCredentials::default()
            },
        }
    }

    pub fn from_credentials(credentials: AuthCredentials) -> Self {
        Self { credentials }
    }
}

impl Authenticator for StaticCredentials {
    fn credentials(&self, _nonce: &str) -> Result<AuthCredentials> {
        Ok(self.credentials.clone())
    }
}

//! Token verification seam.
//!
//! The core only needs `verify(token) -> subject + scopes`. Production
//! deployments plug in an external verifier; the bundled implementation
//! checks a static bearer token for the admin surface.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject: String,
    pub scopes: Vec<String>,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Compares against a single configured token. With no token configured the
/// surface is open (development mode).
pub struct StaticTokenVerifier {
    token: Option<String>,
}

impl StaticTokenVerifier {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn requires_token(&self) -> bool {
        self.token.is_some()
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        match &self.token {
            None => Ok(AuthContext {
                subject: "anonymous".to_string(),
                scopes: vec![],
            }),
            Some(expected) if token == expected => Ok(AuthContext {
                subject: "admin".to_string(),
                scopes: vec!["admin".to_string()],
            }),
            Some(_) => Err(AuthError::InvalidToken),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_verifier_accepts_anything() {
        let verifier = StaticTokenVerifier::new(None);
        assert!(!verifier.requires_token());
        assert!(verifier.verify("whatever").is_ok());
    }

    #[test]
    fn test_static_token() {
        let verifier = StaticTokenVerifier::new(Some("sekrit".to_string()));
        assert!(verifier.requires_token());

        let ctx = verifier.verify("sekrit").unwrap();
        assert_eq!(ctx.subject, "admin");
        assert_eq!(ctx.scopes, vec!["admin"]);

        assert!(matches!(
            verifier.verify("wrong"),
            Err(AuthError::InvalidToken)
        ));
    }
}

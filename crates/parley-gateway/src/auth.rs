use std::sync::Arc;

use jsonwebtoken::{DecodingKey, Validation, decode};
use thiserror::Error;
use uuid::Uuid;

use parley_db::Database;
use parley_types::api::Claims;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidToken,

    #[error("account unknown or deactivated")]
    Inactive,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: Uuid,
    pub username: String,
}

/// Session authenticator seam: turns a presented bearer credential into a
/// user identity plus an active-account check. Credential issuance lives
/// elsewhere; the gateway only consumes tokens through this trait.
///
/// Blocking (may hit the user store) — async callers wrap it in
/// `spawn_blocking`.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<AuthedUser, AuthError>;
}

/// HS256 bearer tokens, validated against the user table's active flag.
pub struct JwtAuthenticator {
    secret: String,
    db: Arc<Database>,
}

impl JwtAuthenticator {
    pub fn new(secret: String, db: Arc<Database>) -> Self {
        Self { secret, db }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<AuthedUser, AuthError> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| AuthError::InvalidToken)?;

        let user = self
            .db
            .get_user_by_id(&token_data.claims.sub.to_string())?
            .ok_or(AuthError::Inactive)?;
        if !user.is_active {
            return Err(AuthError::Inactive);
        }

        Ok(AuthedUser {
            user_id: token_data.claims.sub,
            username: user.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use parley_db::now_rfc3339;

    fn token(secret: &str, sub: Uuid) -> String {
        let claims = Claims {
            sub,
            username: "alice".into(),
            exp: (unix_now() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn unix_now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn seeded() -> (Arc<Database>, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), "alice", &now_rfc3339())
            .unwrap();
        (db, id)
    }

    #[test]
    fn valid_token_resolves_identity() {
        let (db, id) = seeded();
        let auth = JwtAuthenticator::new("s3cret".into(), db);

        let user = auth.authenticate(&token("s3cret", id)).unwrap();
        assert_eq!(user.user_id, id);
        assert_eq!(user.username, "alice");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (db, id) = seeded();
        let auth = JwtAuthenticator::new("s3cret".into(), db);

        assert!(matches!(
            auth.authenticate(&token("other", id)),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn deactivated_account_is_rejected() {
        let (db, id) = seeded();
        db.set_user_active(&id.to_string(), false).unwrap();
        let auth = JwtAuthenticator::new("s3cret".into(), db);

        assert!(matches!(
            auth.authenticate(&token("s3cret", id)),
            Err(AuthError::Inactive)
        ));
    }

    #[test]
    fn unknown_user_is_rejected() {
        let (db, _) = seeded();
        let auth = JwtAuthenticator::new("s3cret".into(), db);

        assert!(matches!(
            auth.authenticate(&token("s3cret", Uuid::new_v4())),
            Err(AuthError::Inactive)
        ));
    }
}

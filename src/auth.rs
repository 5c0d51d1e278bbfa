use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{Account, Role};

type HmacSha256 = Hmac<Sha256>;

const SALT_LEN: usize = 16;
const HASH_ROUNDS: u32 = 10_000;

/// Hash a password as `salt$digest`, both base64.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = stretch(&salt, password);
    format!("{}${}", B64URL.encode(salt), B64URL.encode(digest))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt, digest)) = stored.split_once('$') else {
        return false;
    };
    let (Ok(salt), Ok(expected)) = (B64URL.decode(salt), B64URL.decode(digest)) else {
        return false;
    };
    let actual = stretch(&salt, password);
    constant_time_eq(&actual, &expected)
}

fn stretch(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    let mut digest: [u8; 32] = hasher.finalize().into();
    for _ in 1..HASH_ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(salt);
        digest = hasher.finalize().into();
    }
    digest
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// What a verified token vouches for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::forbidden("Access denied - Admins only"))
        }
    }

}

/// Issues and verifies `payload.signature` bearer tokens signed with
/// HMAC-SHA256.
pub struct TokenIssuer {
    key: Vec<u8>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl TokenIssuer {
    pub fn new(key: Vec<u8>, ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self { key, ttl, clock }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| AppError::internal(format!("token key: {e}")))
    }

    pub fn issue(&self, account: &Account) -> Result<String> {
        let claims = Claims {
            sub: account.id.clone(),
            role: account.role,
            exp: self
                .clock
                .now()
                .checked_add_signed(self.ttl)
                .ok_or_else(|| AppError::internal("token expiry out of range"))?
                .timestamp(),
        };
        let payload = serde_json::to_vec(&claims).map_err(|e| AppError::internal(e.to_string()))?;
        let payload = B64URL.encode(payload);

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        let signature = B64URL.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let invalid = || AppError::unauthorized("Invalid token");
        let (payload, signature) = token.split_once('.').ok_or_else(invalid)?;
        let signature = B64URL.decode(signature).map_err(|_| invalid())?;

        let mut mac = self.mac()?;
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature).map_err(|_| invalid())?;

        let payload = B64URL.decode(payload).map_err(|_| invalid())?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| invalid())?;
        if claims.exp <= self.clock.now().timestamp() {
            return Err(AppError::unauthorized("Token expired"));
        }
        Ok(claims)
    }

    /// Verify an `Authorization: Bearer <token>` header value.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<Claims> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::unauthorized("Unauthorized - No token provided"))?;
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    fn account(role: Role) -> Account {
        Account {
            id: "acc-1".to_string(),
            name: "Ravi".to_string(),
            email: "ravi@example.com".to_string(),
            password_hash: String::new(),
            role,
            place: String::new(),
            pincode: String::new(),
            phone: String::new(),
            is_approved: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn password_hash_verifies_only_the_same_password() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
        assert!(!verify_password("hunter3", &stored));
        assert!(!verify_password("hunter2", "garbage"));
        assert_ne!(stored, hash_password("hunter2"), "salts differ per hash");
    }

    #[test]
    fn issued_token_carries_id_and_role() {
        let clock = Arc::new(ManualClock::default());
        let issuer = TokenIssuer::new(b"secret".to_vec(), chrono::Duration::hours(1), clock);
        let token = issuer.issue(&account(Role::Responder)).unwrap();
        let claims = issuer.verify(&token).unwrap();
        assert_eq!(claims.sub, "acc-1");
        assert_eq!(claims.role, Role::Responder);
    }

    #[test]
    fn unrepresentable_expiry_is_an_error() {
        let issuer = TokenIssuer::new(b"secret".to_vec(), chrono::Duration::MAX, Arc::new(ManualClock::default()));
        assert!(matches!(issuer.issue(&account(Role::User)), Err(AppError::Internal(_))));
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let clock = Arc::new(ManualClock::default());
        let issuer = TokenIssuer::new(b"secret".to_vec(), chrono::Duration::hours(1), clock.clone());
        let other = TokenIssuer::new(b"other".to_vec(), chrono::Duration::hours(1), clock);
        let token = other.issue(&account(Role::Admin)).unwrap();
        assert_eq!(issuer.verify(&token), Err(AppError::unauthorized("Invalid token")));

        let forged_payload = B64URL.encode(br#"{"sub":"acc-1","role":"admin","exp":99999999999}"#);
        let genuine = issuer.issue(&account(Role::User)).unwrap();
        let signature = genuine.split_once('.').unwrap().1;
        let forged = format!("{forged_payload}.{signature}");
        assert!(issuer.verify(&forged).is_err());
    }

    #[test]
    fn tokens_expire() {
        let clock = Arc::new(ManualClock::default());
        let issuer = TokenIssuer::new(b"secret".to_vec(), chrono::Duration::hours(1), clock.clone());
        let token = issuer.issue(&account(Role::User)).unwrap();
        clock.advance(chrono::Duration::hours(2));
        assert_eq!(issuer.verify(&token), Err(AppError::unauthorized("Token expired")));
    }

    #[test]
    fn bearer_header_is_required() {
        let clock = Arc::new(ManualClock::default());
        let issuer = TokenIssuer::new(b"secret".to_vec(), chrono::Duration::hours(1), clock);
        assert!(matches!(issuer.verify_bearer(None), Err(AppError::Unauthorized(_))));
        assert!(matches!(issuer.verify_bearer(Some("Token abc")), Err(AppError::Unauthorized(_))));
        let token = issuer.issue(&account(Role::User)).unwrap();
        assert!(issuer.verify_bearer(Some(&format!("Bearer {token}"))).is_ok());
    }

    #[test]
    fn role_guards() {
        let claims = Claims { sub: "x".to_string(), role: Role::User, exp: 0 };
        assert!(claims.require_admin().is_err());
        let admin = Claims { role: Role::Admin, ..claims };
        assert!(admin.require_admin().is_ok());
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::notify::{otp_email, welcome_email, Notifier};

/// Wrong guesses allowed before a code is thrown away.
const MAX_ATTEMPTS: u32 = 5;

struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
    failed_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OtpCheck {
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OtpCheck {
    fn failed(message: &str) -> Self {
        Self { verified: false, message: Some(message.to_string()) }
    }
}

/// Six-digit verification codes, one outstanding per email, kept in memory.
pub struct OtpService {
    codes: RwLock<HashMap<String, PendingCode>>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl OtpService {
    pub fn new(notifier: Arc<dyn Notifier>, clock: Arc<dyn Clock>, ttl: chrono::Duration) -> Self {
        Self {
            codes: RwLock::new(HashMap::new()),
            notifier,
            clock,
            ttl,
        }
    }

    /// Mail a fresh code and a welcome note. The code is only stored once
    /// both mails were handed off.
    pub async fn send(&self, email: &str, name: &str) -> Result<()> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || name.trim().is_empty() {
            return Err(AppError::validation("Email and name are required"));
        }

        let code = rand::thread_rng().gen_range(100_000..1_000_000).to_string();
        self.notifier
            .send(otp_email(&email, name, &code, self.ttl.num_minutes()))
            .await?;
        self.notifier.send(welcome_email(&email, name)).await?;

        let now = self.clock.now();
        let pending = PendingCode {
            code,
            expires_at: now + self.ttl,
            failed_attempts: 0,
        };
        let mut codes = self.codes.write().await;
        codes.retain(|_, p| p.expires_at >= now);
        codes.insert(email.clone(), pending);
        info!("OTP issued for {email}");
        Ok(())
    }

    /// Check a code. A matching or expired code is consumed, and so is one
    /// that has been guessed wrong too often.
    pub async fn verify(&self, email: &str, code: &str) -> Result<OtpCheck> {
        let email = email.trim().to_lowercase();
        if email.is_empty() || code.trim().is_empty() {
            return Err(AppError::validation("Email and OTP required"));
        }

        let mut codes = self.codes.write().await;
        let Some(pending) = codes.get_mut(&email) else {
            return Ok(OtpCheck::failed("OTP not found"));
        };
        if self.clock.now() > pending.expires_at {
            codes.remove(&email);
            warn!("Expired OTP presented for {email}");
            return Ok(OtpCheck::failed("OTP expired"));
        }
        if pending.code != code.trim() {
            pending.failed_attempts += 1;
            if pending.failed_attempts >= MAX_ATTEMPTS {
                codes.remove(&email);
                warn!("Too many wrong OTPs for {email}, code discarded");
                return Ok(OtpCheck::failed("Too many attempts, request a new OTP"));
            }
            return Ok(OtpCheck::failed("Invalid OTP"));
        }
        codes.remove(&email);
        Ok(OtpCheck { verified: true, message: None })
    }

    #[cfg(test)]
    async fn outstanding(&self) -> usize {
        self.codes.read().await.len()
    }

    #[cfg(test)]
    async fn code_for(&self, email: &str) -> Option<String> {
        self.codes.read().await.get(email).map(|p| p.code.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::notify::Email;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<Email>>);

    #[async_trait]
    impl Notifier for Outbox {
        async fn send(&self, email: Email) -> Result<()> {
            self.0.lock().unwrap().push(email);
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl Notifier for Down {
        async fn send(&self, _email: Email) -> Result<()> {
            Err(AppError::upstream("smtp unreachable"))
        }
    }

    #[tokio::test]
    async fn code_verifies_once() {
        let outbox = Arc::new(Outbox::default());
        let clock = Arc::new(ManualClock::default());
        let otp = OtpService::new(outbox.clone(), clock, chrono::Duration::minutes(5));

        otp.send("Mira@Example.com", "Mira").await.unwrap();
        assert_eq!(outbox.0.lock().unwrap().len(), 2);
        let code = otp.code_for("mira@example.com").await.unwrap();
        assert_eq!(code.len(), 6);

        assert_eq!(
            otp.verify("mira@example.com", "000000x").await.unwrap(),
            OtpCheck::failed("Invalid OTP")
        );
        assert!(otp.verify("mira@example.com", &code).await.unwrap().verified);
        assert_eq!(
            otp.verify("mira@example.com", &code).await.unwrap(),
            OtpCheck::failed("OTP not found")
        );
    }

    #[tokio::test]
    async fn expired_code_is_rejected() {
        let clock = Arc::new(ManualClock::default());
        let otp = OtpService::new(Arc::new(Outbox::default()), clock.clone(), chrono::Duration::minutes(5));
        otp.send("a@example.com", "A").await.unwrap();
        let code = otp.code_for("a@example.com").await.unwrap();
        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(
            otp.verify("a@example.com", &code).await.unwrap(),
            OtpCheck::failed("OTP expired")
        );
    }

    #[tokio::test]
    async fn mail_failure_stores_no_code() {
        let otp = OtpService::new(Arc::new(Down), Arc::new(ManualClock::default()), chrono::Duration::minutes(5));
        let err = otp.send("a@example.com", "A").await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
        assert!(otp.code_for("a@example.com").await.is_none());
    }

    #[tokio::test]
    async fn missing_fields_fail_validation() {
        let otp = OtpService::new(Arc::new(Outbox::default()), Arc::new(ManualClock::default()), chrono::Duration::minutes(5));
        assert!(matches!(otp.send("", "A").await, Err(AppError::Validation(_))));
        assert!(matches!(otp.verify("a@example.com", " ").await, Err(AppError::Validation(_))));
    }

    #[tokio::test]
    async fn repeated_wrong_guesses_burn_the_code() {
        let otp = OtpService::new(Arc::new(Outbox::default()), Arc::new(ManualClock::default()), chrono::Duration::minutes(5));
        otp.send("a@example.com", "A").await.unwrap();
        let code = otp.code_for("a@example.com").await.unwrap();
        let wrong = if code == "100000" { "100001" } else { "100000" };

        for _ in 1..MAX_ATTEMPTS {
            assert_eq!(
                otp.verify("a@example.com", wrong).await.unwrap(),
                OtpCheck::failed("Invalid OTP")
            );
        }
        assert_eq!(
            otp.verify("a@example.com", wrong).await.unwrap(),
            OtpCheck::failed("Too many attempts, request a new OTP")
        );
        assert_eq!(
            otp.verify("a@example.com", &code).await.unwrap(),
            OtpCheck::failed("OTP not found")
        );
    }

    #[tokio::test]
    async fn sending_prunes_abandoned_codes() {
        let clock = Arc::new(ManualClock::default());
        let otp = OtpService::new(Arc::new(Outbox::default()), clock.clone(), chrono::Duration::minutes(5));
        otp.send("a@example.com", "A").await.unwrap();
        otp.send("b@example.com", "B").await.unwrap();
        clock.advance(chrono::Duration::minutes(6));

        otp.send("c@example.com", "C").await.unwrap();
        assert_eq!(otp.outstanding().await, 1);
        assert!(otp.code_for("c@example.com").await.is_some());
    }
}

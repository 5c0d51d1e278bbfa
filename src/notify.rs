use async_trait::async_trait;
use log::info;

use crate::error::Result;
use crate::models::Alert;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

/// Outbound mail. Delivery is someone else's job; callers only learn
/// whether the hand-off succeeded.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, email: Email) -> Result<()>;
}

/// Writes mail to the log instead of a mail server.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, email: Email) -> Result<()> {
        info!(
            "Mail to {} recipient(s): {}",
            email.to.len(),
            email.subject
        );
        Ok(())
    }
}

pub fn new_alert_email(alert: &Alert, recipients: Vec<String>) -> Email {
    let origin = match alert.source {
        crate::models::AlertSource::Admin => "Admin",
        crate::models::AlertSource::User => "User",
    };
    let details = if alert.details.is_empty() { "N/A" } else { alert.details.as_str() };
    Email {
        to: recipients,
        subject: format!("New {origin} Alert Created"),
        html: format!(
            "<h3>New {origin} Alert Details</h3>\
             <p><strong>Incident:</strong> {}</p>\
             <p><strong>Location:</strong> {}</p>\
             <p><strong>Severity:</strong> {:?}</p>\
             <p><strong>Description:</strong> {details}</p>",
            alert.incident, alert.location.address, alert.severity
        ),
    }
}

pub fn otp_email(email: &str, name: &str, code: &str, ttl_minutes: i64) -> Email {
    Email {
        to: vec![email.to_string()],
        subject: "Emergency System OTP Verification".to_string(),
        html: format!(
            "<h2>Hello {name},</h2><p>Your OTP for verification is:</p>\
             <h1>{code}</h1><p>This code is valid for {ttl_minutes} minutes.</p>"
        ),
    }
}

pub fn welcome_email(email: &str, name: &str) -> Email {
    Email {
        to: vec![email.to_string()],
        subject: "Welcome to Emergency Response System!".to_string(),
        html: format!(
            "<h2>Hi {name},</h2><p>Thank you for registering with \
             <strong>Emergency Response System</strong>.</p><p>Stay safe, stay connected.</p>"
        ),
    }
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = String;
pub type AlertId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Responder,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::User => "user",
            Role::Responder => "responder",
            Role::Admin => "admin",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub place: String,
    pub pincode: String,
    pub phone: String,
    pub is_approved: bool,
    pub created_at: DateTime<Utc>,
}

/// Account as shown to clients: everything but the credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub id: AccountId,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub place: String,
    pub pincode: String,
    pub phone: String,
    pub is_approved: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            email: account.email.clone(),
            role: account.role,
            place: account.place.clone(),
            pincode: account.pincode.clone(),
            phone: account.phone.clone(),
            is_approved: account.is_approved,
            created_at: account.created_at,
        }
    }
}

/// Reference to an account resolved for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub id: AccountId,
    pub name: String,
    pub email: String,
}

impl AccountSummary {
    pub fn unknown(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: "Unknown".to_string(),
            email: String::new(),
        }
    }
}

impl From<&Account> for AccountSummary {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            email: account.email.clone(),
        }
    }
}

/// Who raised an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSource {
    Admin,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "moderate" => Ok(Severity::Moderate),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("Unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProgressStatus {
    #[default]
    Dispatched,
    #[serde(rename = "On the Way")]
    OnTheWay,
    Arrived,
    #[serde(rename = "Handling Incident")]
    HandlingIncident,
    Resolved,
}

impl ProgressStatus {
    pub const ALL: [ProgressStatus; 5] = [
        ProgressStatus::Dispatched,
        ProgressStatus::OnTheWay,
        ProgressStatus::Arrived,
        ProgressStatus::HandlingIncident,
        ProgressStatus::Resolved,
    ];

    pub fn is_terminal(self) -> bool {
        self == ProgressStatus::Resolved
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProgressStatus::Dispatched => "Dispatched",
            ProgressStatus::OnTheWay => "On the Way",
            ProgressStatus::Arrived => "Arrived",
            ProgressStatus::HandlingIncident => "Handling Incident",
            ProgressStatus::Resolved => "Resolved",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponderEntry {
    pub account_id: AccountId,
    pub responded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: AlertId,
    pub source: AlertSource,
    pub incident: String,
    pub severity: Severity,
    pub details: String,
    pub location: Location,
    /// Reporter of a user-origin alert.
    pub owner: Option<AccountId>,
    pub responders: Vec<ResponderEntry>,
    pub assigned_responder: Option<AccountId>,
    /// Only user-origin alerts track progress.
    pub progress_status: Option<ProgressStatus>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn has_responder(&self, account_id: &str) -> bool {
        self.responders.iter().any(|r| r.account_id == account_id)
    }

    pub fn is_owned_by(&self, account_id: &str) -> bool {
        self.owner.as_deref() == Some(account_id)
    }

    pub fn is_assigned_to(&self, account_id: &str) -> bool {
        self.assigned_responder.as_deref() == Some(account_id)
    }
}

/// Body of an alert creation request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAlert {
    pub incident: String,
    pub severity: Severity,
    #[serde(default, alias = "description", alias = "additionalDetails")]
    pub details: String,
    #[serde(alias = "place")]
    pub location: LocationInput,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

/// Clients send either a bare address string or a full location object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LocationInput {
    Address(String),
    Full(Location),
}

impl LocationInput {
    pub fn into_location(self, coordinates: Option<Coordinates>) -> Location {
        match self {
            LocationInput::Address(address) => Location { address, coordinates },
            LocationInput::Full(mut location) => {
                if location.coordinates.is_none() {
                    location.coordinates = coordinates;
                }
                location
            }
        }
    }
}

/// Partial update: absent fields keep their stored value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertPatch {
    pub incident: Option<String>,
    pub severity: Option<Severity>,
    #[serde(default, alias = "description", alias = "additionalDetails")]
    pub details: Option<String>,
    #[serde(default, alias = "place")]
    pub location: Option<LocationInput>,
    #[serde(default)]
    pub coordinates: Option<Coordinates>,
}

impl AlertPatch {
    pub fn apply(self, alert: &mut Alert) {
        if let Some(incident) = self.incident.filter(|s| !s.trim().is_empty()) {
            alert.incident = incident;
        }
        if let Some(severity) = self.severity {
            alert.severity = severity;
        }
        if let Some(details) = self.details.filter(|s| !s.trim().is_empty()) {
            alert.details = details;
        }
        match (self.location, self.coordinates) {
            (Some(location), coordinates) => {
                let coordinates = coordinates.or(alert.location.coordinates);
                alert.location = location.into_location(coordinates);
            }
            (None, Some(coordinates)) => alert.location.coordinates = Some(coordinates),
            (None, None) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponderView {
    pub user: AccountSummary,
    pub responded_at: DateTime<Utc>,
}

/// Alert with account references resolved, as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertView {
    pub id: AlertId,
    pub source: AlertSource,
    pub incident: String,
    pub severity: Severity,
    pub details: String,
    pub location: Location,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reported_by: Option<AccountSummary>,
    pub responders: Vec<ResponderView>,
    pub assigned_responder: Option<AccountSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_status: Option<ProgressStatus>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletion_scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub alert_id: AlertId,
    pub sender_id: AccountId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessageView {
    pub id: String,
    pub alert_id: AlertId,
    pub sender: AccountSummary,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Donation {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub amount: f64,
    pub amount_minor: i64,
    pub payment_intent_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_alert() -> Alert {
        Alert {
            id: "a1".to_string(),
            source: AlertSource::User,
            incident: "Fire".to_string(),
            severity: Severity::High,
            details: "Smoke on the third floor".to_string(),
            location: Location {
                address: "12 Main St".to_string(),
                coordinates: Some(Coordinates { lat: 1.0, lng: 2.0 }),
            },
            owner: Some("u1".to_string()),
            responders: Vec::new(),
            assigned_responder: None,
            progress_status: Some(ProgressStatus::Dispatched),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn progress_status_uses_display_names_on_the_wire() {
        let json = serde_json::to_string(&ProgressStatus::OnTheWay).unwrap();
        assert_eq!(json, "\"On the Way\"");
        let parsed: ProgressStatus = serde_json::from_str("\"Handling Incident\"").unwrap();
        assert_eq!(parsed, ProgressStatus::HandlingIncident);
        assert!(serde_json::from_str::<ProgressStatus>("\"Finished\"").is_err());
    }

    #[test]
    fn new_alert_accepts_address_string_and_aliases() {
        let body = r#"{"incident":"Flood","severity":"Critical","place":"River road","description":"rising"}"#;
        let alert: NewAlert = serde_json::from_str(body).unwrap();
        assert_eq!(alert.details, "rising");
        let location = alert.location.into_location(None);
        assert_eq!(location.address, "River road");
        assert!(location.coordinates.is_none());
    }

    #[test]
    fn unknown_severity_is_rejected() {
        let body = r#"{"incident":"Flood","severity":"Apocalyptic","location":"x"}"#;
        assert!(serde_json::from_str::<NewAlert>(body).is_err());
    }

    #[test]
    fn patch_only_overwrites_provided_fields() {
        let mut alert = sample_alert();
        let patch: AlertPatch = serde_json::from_str(r#"{"severity":"Critical"}"#).unwrap();
        patch.apply(&mut alert);
        assert_eq!(alert.severity, Severity::Critical);
        assert_eq!(alert.incident, "Fire");
        assert_eq!(alert.details, "Smoke on the third floor");
        assert_eq!(alert.location.address, "12 Main St");
    }

    #[test]
    fn patch_location_keeps_existing_coordinates() {
        let mut alert = sample_alert();
        let patch: AlertPatch = serde_json::from_str(r#"{"location":"14 Main St"}"#).unwrap();
        patch.apply(&mut alert);
        assert_eq!(alert.location.address, "14 Main St");
        assert_eq!(alert.location.coordinates, Some(Coordinates { lat: 1.0, lng: 2.0 }));
    }

    #[test]
    fn account_view_drops_the_hash() {
        let account = Account {
            id: "u1".to_string(),
            name: "Asha".to_string(),
            email: "asha@example.com".to_string(),
            password_hash: "secret".to_string(),
            role: Role::User,
            place: "Pune".to_string(),
            pincode: "411001".to_string(),
            phone: "999".to_string(),
            is_approved: true,
            created_at: Utc::now(),
        };
        let json = serde_json::to_value(AccountView::from(&account)).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert_eq!(json["role"], "user");
    }
}

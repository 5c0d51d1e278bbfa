use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use log::{error, info};
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::Claims;
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{
    Alert, AlertPatch, AlertSource, AlertView, NewAlert, Page, ProgressStatus, ResponderView, Role,
    Severity,
};
use crate::notify::{new_alert_email, Notifier};
use crate::room::ChatHub;
use crate::store::{AlertFilter, Store};

const ADMIN_PAGE_SIZE: usize = 6;
const USER_PAGE_SIZE: usize = 4;
const MAX_PAGE_SIZE: usize = 100;

/// Query string of the alert listings. Everything is optional and empty
/// values count as absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AlertQuery {
    pub severity: Option<String>,
    pub search: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

/// Accepts RFC 3339 timestamps or plain `YYYY-MM-DD` dates. A plain date
/// covers the whole day, so `to` resolves to its last instant.
fn parse_bound(value: &str, end_of_day: bool) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| AppError::validation(format!("Invalid date: {value}")))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        Some(NaiveTime::MIN)
    };
    let time = time.ok_or_else(|| AppError::internal("invalid time of day"))?;
    Ok(date.and_time(time).and_utc())
}

/// Alert ingestion and query for both alert sources. Admin-origin alerts
/// are managed by admins; user-origin alerts belong to their reporter.
pub struct AlertService {
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    hub: ChatHub,
    clock: Arc<dyn Clock>,
}

impl AlertService {
    pub fn new(store: Arc<Store>, notifier: Arc<dyn Notifier>, hub: ChatHub, clock: Arc<dyn Clock>) -> Self {
        Self { store, notifier, hub, clock }
    }

    pub async fn create(&self, source: AlertSource, caller: &Claims, input: NewAlert) -> Result<AlertView> {
        if source == AlertSource::Admin {
            caller.require_admin()?;
        }
        if input.incident.trim().is_empty() {
            return Err(AppError::validation("Incident is required"));
        }

        let user_origin = source == AlertSource::User;
        let alert = Alert {
            id: Uuid::new_v4().to_string(),
            source,
            incident: input.incident.trim().to_string(),
            severity: input.severity,
            details: input.details,
            location: input.location.into_location(input.coordinates),
            owner: user_origin.then(|| caller.sub.clone()),
            responders: Vec::new(),
            assigned_responder: None,
            progress_status: user_origin.then_some(ProgressStatus::default()),
            created_at: self.clock.now(),
        };
        self.store.insert_alert(alert.clone()).await?;
        info!(
            "{:?} alert {} created by {}: {} ({:?})",
            source, alert.id, caller.sub, alert.incident, alert.severity
        );

        self.notify_responders(&alert).await;
        Ok(self.view(alert).await)
    }

    /// Mail every responder about a new alert without holding up the
    /// request. The alert stays stored whatever the mailer does.
    async fn notify_responders(&self, alert: &Alert) {
        let recipients: Vec<String> = self
            .store
            .accounts_with_role(Role::Responder)
            .await
            .into_iter()
            .map(|a| a.email)
            .collect();
        if recipients.is_empty() {
            return;
        }

        let email = new_alert_email(alert, recipients);
        let notifier = self.notifier.clone();
        let alert_id = alert.id.clone();
        tokio::spawn(async move {
            if let Err(e) = notifier.send(email).await {
                error!("Failed to notify responders about alert {alert_id}: {e}");
            }
        });
    }

    pub async fn get(&self, source: AlertSource, alert_id: &str) -> Result<AlertView> {
        let alert = self.store.alert(alert_id, source).await?;
        Ok(self.view(alert).await)
    }

    pub async fn list(&self, source: AlertSource, query: &AlertQuery) -> Result<Page<AlertView>> {
        let severity = non_empty(query.severity.as_ref())
            .map(str::parse::<Severity>)
            .transpose()
            .map_err(AppError::validation)?;

        let mut filter = AlertFilter {
            source: Some(source),
            severity,
            search: non_empty(query.search.as_ref()).map(str::to_string),
            ..AlertFilter::default()
        };
        // The date range only narrows admin listings, and only as a pair.
        if source == AlertSource::Admin {
            if let (Some(from), Some(to)) = (non_empty(query.from.as_ref()), non_empty(query.to.as_ref())) {
                filter.created_from = Some(parse_bound(from, false)?);
                filter.created_to = Some(parse_bound(to, true)?);
            }
        }

        let default_limit = match source {
            AlertSource::Admin => ADMIN_PAGE_SIZE,
            AlertSource::User => USER_PAGE_SIZE,
        };
        let limit = query.limit.filter(|l| *l > 0).unwrap_or(default_limit).min(MAX_PAGE_SIZE);
        let page = query.page.unwrap_or(1).max(1);

        let (alerts, total) = self.store.list_alerts(&filter, (page - 1).saturating_mul(limit), limit).await;
        let mut items = Vec::with_capacity(alerts.len());
        for alert in alerts {
            items.push(self.view(alert).await);
        }
        Ok(Page { items, total })
    }

    /// User-origin alerts reported by the caller, newest first.
    pub async fn mine(&self, caller: &Claims) -> Result<Vec<AlertView>> {
        let filter = AlertFilter {
            source: Some(AlertSource::User),
            owner: Some(caller.sub.clone()),
            ..AlertFilter::default()
        };
        let (alerts, _) = self.store.list_alerts(&filter, 0, usize::MAX).await;
        let mut items = Vec::with_capacity(alerts.len());
        for alert in alerts {
            items.push(self.view(alert).await);
        }
        Ok(items)
    }

    pub async fn update(
        &self,
        source: AlertSource,
        alert_id: &str,
        caller: &Claims,
        patch: AlertPatch,
    ) -> Result<AlertView> {
        if source == AlertSource::Admin {
            caller.require_admin()?;
        }
        let alert = self
            .store
            .update_alert(alert_id, source, |alert| {
                if source == AlertSource::User && !alert.is_owned_by(&caller.sub) {
                    return Err(AppError::forbidden("Not authorized to update this alert"));
                }
                patch.apply(alert);
                Ok(alert.clone())
            })
            .await?;
        info!("Alert {alert_id} updated by {}", caller.sub);
        Ok(self.view(alert).await)
    }

    /// Remove the alert with its chat history and pending deletion, then
    /// close its live room.
    pub async fn delete(&self, source: AlertSource, alert_id: &str, caller: &Claims) -> Result<()> {
        if source == AlertSource::Admin {
            caller.require_admin()?;
        }
        let removed = self
            .store
            .remove_alert(alert_id, Some(source), |alert| {
                if source == AlertSource::User && !alert.is_owned_by(&caller.sub) {
                    return Err(AppError::forbidden("Not authorized to delete this alert"));
                }
                Ok(())
            })
            .await?;
        info!(
            "Alert {alert_id} deleted by {} ({} chat messages purged, pending deletion cancelled: {})",
            caller.sub, removed.messages, removed.job_cancelled
        );
        self.hub.close_room(alert_id).await;
        Ok(())
    }

    /// Resolve account references for the API.
    pub async fn view(&self, alert: Alert) -> AlertView {
        let reported_by = match &alert.owner {
            Some(owner) => Some(self.store.account_summary(owner).await),
            None => None,
        };
        let assigned_responder = match &alert.assigned_responder {
            Some(id) => Some(self.store.account_summary(id).await),
            None => None,
        };
        let mut responders = Vec::with_capacity(alert.responders.len());
        for entry in &alert.responders {
            responders.push(ResponderView {
                user: self.store.account_summary(&entry.account_id).await,
                responded_at: entry.responded_at,
            });
        }
        let deletion_scheduled_at = self.store.pending_deletion(&alert.id).await;

        AlertView {
            id: alert.id,
            source: alert.source,
            incident: alert.incident,
            severity: alert.severity,
            details: alert.details,
            location: alert.location,
            reported_by,
            responders,
            assigned_responder,
            progress_status: alert.progress_status,
            created_at: alert.created_at,
            deletion_scheduled_at,
        }
    }
}

use std::sync::Arc;

use log::info;

use crate::accounts::AccountService;
use crate::auth::Claims;
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::{Alert, AlertSource, ProgressStatus, ResponderEntry};
use crate::scheduler::DeletionScheduler;
use crate::store::Store;

/// Outcome of a RecordAvailability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Recorded,
    AlreadyRecorded,
}

/// Mediates many volunteering responders down to one assignment per alert
/// and drives the progress of user-reported alerts.
pub struct ResponseEngine {
    store: Arc<Store>,
    accounts: Arc<AccountService>,
    scheduler: Arc<DeletionScheduler>,
    clock: Arc<dyn Clock>,
}

impl ResponseEngine {
    pub fn new(
        store: Arc<Store>,
        accounts: Arc<AccountService>,
        scheduler: Arc<DeletionScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, accounts, scheduler, clock }
    }

    pub async fn record_availability(
        &self,
        source: AlertSource,
        alert_id: &str,
        caller: &Claims,
    ) -> Result<Availability> {
        self.accounts.require_active_responder(caller).await?;
        let now = self.clock.now();
        let outcome = self
            .store
            .update_alert(alert_id, source, |alert| {
                if alert.has_responder(&caller.sub) {
                    return Ok(Availability::AlreadyRecorded);
                }
                alert.responders.push(ResponderEntry {
                    account_id: caller.sub.clone(),
                    responded_at: now,
                });
                Ok(Availability::Recorded)
            })
            .await?;

        if outcome == Availability::Recorded {
            info!("Responder {} available for alert {alert_id}", caller.sub);
        }
        Ok(outcome)
    }

    /// First assignment wins: the "already assigned" check and the write
    /// run in one store critical section.
    pub async fn assign_responder(
        &self,
        source: AlertSource,
        alert_id: &str,
        responder_id: &str,
        caller: &Claims,
    ) -> Result<Alert> {
        caller.require_admin()?;
        let responder_id = responder_id.trim();
        if responder_id.is_empty() {
            return Err(AppError::validation("responderId is required"));
        }

        let alert = self
            .store
            .update_alert(alert_id, source, |alert| {
                if alert.assigned_responder.is_some() {
                    return Err(AppError::conflict("Responder already assigned"));
                }
                if !alert.has_responder(responder_id) {
                    return Err(AppError::validation(
                        "Responder has not marked themselves available for this alert",
                    ));
                }
                alert.assigned_responder = Some(responder_id.to_string());
                Ok(alert.clone())
            })
            .await?;

        info!("Responder {responder_id} assigned to alert {alert_id}");
        Ok(alert)
    }

    /// Set the progress of a user-reported alert. Any status may follow any
    /// other; reaching Resolved queues the alert for deletion once.
    pub async fn advance_progress(
        &self,
        alert_id: &str,
        status: ProgressStatus,
        caller: &Claims,
    ) -> Result<Alert> {
        let alert = self
            .store
            .update_alert(alert_id, AlertSource::User, |alert| {
                if !caller.is_admin() && !alert.is_assigned_to(&caller.sub) {
                    return Err(AppError::forbidden(
                        "Only the assigned responder or an admin can update progress",
                    ));
                }
                alert.progress_status = Some(status);
                Ok(alert.clone())
            })
            .await?;

        info!("Alert {alert_id} progress set to {status}");
        if status.is_terminal() {
            self.scheduler.schedule(alert_id).await?;
        }
        Ok(alert)
    }

    pub async fn progress(&self, alert_id: &str) -> Result<ProgressStatus> {
        let alert = self.store.alert(alert_id, AlertSource::User).await?;
        Ok(alert.progress_status.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::RegisterRequest;
    use crate::auth::TokenIssuer;
    use crate::clock::ManualClock;
    use crate::models::{Location, Role, Severity};
    use crate::room::ChatHub;
    use chrono::Utc;

    struct Fixture {
        store: Arc<Store>,
        clock: Arc<ManualClock>,
        scheduler: Arc<DeletionScheduler>,
        engine: ResponseEngine,
        accounts: Arc<AccountService>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::in_memory());
        let clock = Arc::new(ManualClock::default());
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let tokens = Arc::new(TokenIssuer::new(b"k".to_vec(), chrono::Duration::hours(1), dyn_clock.clone()));
        let accounts = Arc::new(AccountService::new(store.clone(), tokens, dyn_clock.clone(), None));
        let scheduler = Arc::new(DeletionScheduler::new(
            store.clone(),
            ChatHub::new(),
            dyn_clock.clone(),
            chrono::Duration::minutes(10),
        ));
        let engine = ResponseEngine::new(store.clone(), accounts.clone(), scheduler.clone(), dyn_clock);
        Fixture { store, clock, scheduler, engine, accounts }
    }

    fn admin() -> Claims {
        Claims { sub: "admin".to_string(), role: Role::Admin, exp: i64::MAX }
    }

    async fn responder(fx: &Fixture, email: &str, approved: bool) -> Claims {
        fx.accounts
            .register(RegisterRequest {
                name: email.to_string(),
                email: email.to_string(),
                password: "pw".to_string(),
                role: Some(Role::Responder),
                place: "p".to_string(),
                pincode: "1".to_string(),
                phone: "2".to_string(),
            })
            .await
            .unwrap();
        let account = fx.store.account_by_email(email).await.unwrap();
        if approved {
            fx.accounts.set_approval(&admin(), &account.id, true).await.unwrap();
        }
        Claims { sub: account.id, role: Role::Responder, exp: i64::MAX }
    }

    async fn insert(fx: &Fixture, id: &str, source: AlertSource) {
        fx.store
            .insert_alert(Alert {
                id: id.to_string(),
                source,
                incident: "Fire".to_string(),
                severity: Severity::High,
                details: String::new(),
                location: Location::default(),
                owner: (source == AlertSource::User).then(|| "owner".to_string()),
                responders: Vec::new(),
                assigned_responder: None,
                progress_status: (source == AlertSource::User).then_some(ProgressStatus::Dispatched),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn availability_is_idempotent() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::Admin).await;
        let r = responder(&fx, "r@example.com", true).await;

        assert_eq!(
            fx.engine.record_availability(AlertSource::Admin, "a1", &r).await.unwrap(),
            Availability::Recorded
        );
        assert_eq!(
            fx.engine.record_availability(AlertSource::Admin, "a1", &r).await.unwrap(),
            Availability::AlreadyRecorded
        );
        let alert = fx.store.alert("a1", AlertSource::Admin).await.unwrap();
        assert_eq!(alert.responders.iter().filter(|e| e.account_id == r.sub).count(), 1);
    }

    #[tokio::test]
    async fn availability_requires_an_approved_responder() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::User).await;
        let pending = responder(&fx, "p@example.com", false).await;
        let citizen = Claims { sub: "u".to_string(), role: Role::User, exp: i64::MAX };

        assert!(matches!(
            fx.engine.record_availability(AlertSource::User, "a1", &pending).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            fx.engine.record_availability(AlertSource::User, "a1", &citizen).await,
            Err(AppError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn availability_on_missing_alert_is_not_found() {
        let fx = fixture();
        let r = responder(&fx, "r@example.com", true).await;
        assert!(matches!(
            fx.engine.record_availability(AlertSource::User, "nope", &r).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn second_assignment_conflicts_and_keeps_the_first() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::User).await;
        let r1 = responder(&fx, "r1@example.com", true).await;
        let r2 = responder(&fx, "r2@example.com", true).await;
        fx.engine.record_availability(AlertSource::User, "a1", &r1).await.unwrap();
        fx.engine.record_availability(AlertSource::User, "a1", &r2).await.unwrap();

        fx.engine.assign_responder(AlertSource::User, "a1", &r1.sub, &admin()).await.unwrap();
        for candidate in [r2.sub.as_str(), r1.sub.as_str(), "never-volunteered"] {
            let err = fx
                .engine
                .assign_responder(AlertSource::User, "a1", candidate, &admin())
                .await
                .unwrap_err();
            assert!(matches!(err, AppError::Conflict(_)));
        }
        let alert = fx.store.alert("a1", AlertSource::User).await.unwrap();
        assert_eq!(alert.assigned_responder.as_deref(), Some(r1.sub.as_str()));
    }

    #[tokio::test]
    async fn assignment_is_admin_only_and_needs_a_volunteer() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::Admin).await;
        let r = responder(&fx, "r@example.com", true).await;

        assert!(matches!(
            fx.engine.assign_responder(AlertSource::Admin, "a1", &r.sub, &r).await,
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            fx.engine.assign_responder(AlertSource::Admin, "a1", &r.sub, &admin()).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            fx.engine.assign_responder(AlertSource::Admin, "missing", &r.sub, &admin()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_assignments_have_one_winner() {
        let fx = Arc::new(fixture());
        insert(&fx, "a1", AlertSource::Admin).await;
        let mut ids = Vec::new();
        for i in 0..8 {
            let r = responder(&fx, &format!("r{i}@example.com"), true).await;
            fx.engine.record_availability(AlertSource::Admin, "a1", &r).await.unwrap();
            ids.push(r.sub);
        }

        let mut handles = Vec::new();
        for id in ids {
            let fx = fx.clone();
            handles.push(tokio::spawn(async move {
                fx.engine.assign_responder(AlertSource::Admin, "a1", &id, &admin()).await
            }));
        }
        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, AppError::Conflict(_))),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn progress_accepts_any_order() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::User).await;
        // Walk the lifecycle backwards.
        for status in ProgressStatus::ALL.into_iter().rev() {
            fx.engine.advance_progress("a1", status, &admin()).await.unwrap();
            assert_eq!(fx.engine.progress("a1").await.unwrap(), status);
        }
    }

    #[tokio::test]
    async fn progress_is_limited_to_assigned_responder_or_admin() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::User).await;
        let r1 = responder(&fx, "r1@example.com", true).await;
        let r2 = responder(&fx, "r2@example.com", true).await;
        fx.engine.record_availability(AlertSource::User, "a1", &r1).await.unwrap();
        fx.engine.assign_responder(AlertSource::User, "a1", &r1.sub, &admin()).await.unwrap();

        assert!(matches!(
            fx.engine.advance_progress("a1", ProgressStatus::Arrived, &r2).await,
            Err(AppError::Forbidden(_))
        ));
        assert_eq!(fx.engine.progress("a1").await.unwrap(), ProgressStatus::Dispatched);
        fx.engine.advance_progress("a1", ProgressStatus::Arrived, &r1).await.unwrap();
        assert_eq!(fx.engine.progress("a1").await.unwrap(), ProgressStatus::Arrived);
    }

    #[tokio::test]
    async fn progress_is_not_tracked_for_admin_alerts() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::Admin).await;
        assert!(matches!(fx.engine.progress("a1").await, Err(AppError::NotFound(_))));
        assert!(matches!(
            fx.engine.advance_progress("a1", ProgressStatus::Arrived, &admin()).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolving_twice_deletes_exactly_once() {
        let fx = fixture();
        insert(&fx, "a1", AlertSource::User).await;

        fx.engine.advance_progress("a1", ProgressStatus::Resolved, &admin()).await.unwrap();
        let first_due = fx.scheduler.pending("a1").await.unwrap();
        fx.clock.advance(chrono::Duration::minutes(4));
        fx.engine.advance_progress("a1", ProgressStatus::Resolved, &admin()).await.unwrap();
        assert_eq!(fx.scheduler.pending("a1").await, Some(first_due));

        fx.clock.advance(chrono::Duration::minutes(5));
        assert!(fx.scheduler.run_due().await.unwrap().is_empty());
        fx.clock.advance(chrono::Duration::minutes(1));
        assert_eq!(fx.scheduler.run_due().await.unwrap(), vec!["a1".to_string()]);
        assert!(fx.scheduler.run_due().await.unwrap().is_empty());
        assert!(matches!(fx.engine.progress("a1").await, Err(AppError::NotFound(_))));
    }
}

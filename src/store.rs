use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{AppError, Result};
use crate::models::{
    Account, AccountSummary, Alert, AlertSource, ChatMessage, Donation, Role, Severity,
};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Storage(err.to_string())
    }
}

#[derive(Default, Serialize, Deserialize)]
struct StoreData {
    accounts: HashMap<String, Account>,
    alerts: HashMap<String, Alert>,
    /// Kept in the message log next to the snapshot, not in the snapshot.
    #[serde(skip)]
    messages: Vec<ChatMessage>,
    donations: Vec<Donation>,
    /// alert id -> when it is due for deletion
    deletion_jobs: HashMap<String, DateTime<Utc>>,
}

/// Filter for alert listings.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
    pub source: Option<AlertSource>,
    pub severity: Option<Severity>,
    /// Case-insensitive substring of the incident.
    pub search: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub owner: Option<String>,
}

impl AlertFilter {
    fn matches(&self, alert: &Alert) -> bool {
        if self.source.is_some_and(|s| s != alert.source) {
            return false;
        }
        if self.severity.is_some_and(|s| s != alert.severity) {
            return false;
        }
        if let Some(needle) = self.search.as_deref().filter(|s| !s.is_empty()) {
            if !alert.incident.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| alert.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| alert.created_at > to) {
            return false;
        }
        if let Some(owner) = &self.owner {
            if !alert.is_owned_by(owner) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub responders: usize,
    pub users: usize,
    pub alerts: usize,
}

/// What a cascade delete removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removed {
    pub messages: usize,
    pub job_cancelled: bool,
}

/// Where the snapshot and the chat message log live on disk.
struct SnapshotFiles {
    snapshot: PathBuf,
    messages: PathBuf,
}

impl SnapshotFiles {
    fn new(path: &Path) -> Self {
        Self {
            snapshot: path.to_path_buf(),
            messages: path.with_extension("messages.jsonl"),
        }
    }
}

async fn write_atomically(path: &Path, bytes: Vec<u8>) -> std::result::Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn load_messages(path: &Path) -> Result<Vec<ChatMessage>> {
    let text = match fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::from(e).into()),
    };
    let mut messages = Vec::new();
    for (n, line) in text.lines().enumerate().filter(|(_, l)| !l.trim().is_empty()) {
        match serde_json::from_str(line) {
            Ok(message) => messages.push(message),
            // a torn append from a crash
            Err(e) => warn!("Skipping unreadable line {} of {}: {e}", n + 1, path.display()),
        }
    }
    Ok(messages)
}

/// Document store for accounts, alerts, chat history, donations and
/// deletion jobs. Each operation runs under one lock acquisition, so a
/// check and the write that depends on it cannot interleave with another
/// request.
///
/// With a snapshot path every mutation is written through to disk before
/// the call returns. Chat messages go to an append-only log beside the
/// snapshot so a new message never rewrites the rest of the store. When a
/// write fails the in-memory change is undone and the call fails with
/// `AppError::Storage`.
pub struct Store {
    data: RwLock<StoreData>,
    files: Option<SnapshotFiles>,
}

impl Store {
    pub fn in_memory() -> Self {
        Store {
            data: RwLock::new(StoreData::default()),
            files: None,
        }
    }

    /// Open a store backed by a JSON snapshot, loading it and its message
    /// log if they exist.
    pub async fn open(path: &Path) -> Result<Self> {
        let files = SnapshotFiles::new(path);
        let mut data = match fs::read(&files.snapshot).await {
            Ok(bytes) => serde_json::from_slice::<StoreData>(&bytes).map_err(StoreError::from)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", path.display());
                StoreData::default()
            }
            Err(e) => return Err(StoreError::from(e).into()),
        };
        data.messages = load_messages(&files.messages).await?;
        info!(
            "Loaded snapshot {} ({} accounts, {} alerts, {} messages, {} pending deletions)",
            path.display(),
            data.accounts.len(),
            data.alerts.len(),
            data.messages.len(),
            data.deletion_jobs.len()
        );

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(StoreError::from)?;
        }

        Ok(Store {
            data: RwLock::new(data),
            files: Some(files),
        })
    }

    async fn persist(&self, data: &StoreData) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let bytes = serde_json::to_vec(data).map_err(StoreError::from)?;
        write_atomically(&files.snapshot, bytes).await?;
        debug!("Snapshot written to {}", files.snapshot.display());
        Ok(())
    }

    /// Rewrite the whole message log, after messages were removed.
    async fn persist_messages(&self, data: &StoreData) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let mut bytes = Vec::new();
        for message in &data.messages {
            serde_json::to_writer(&mut bytes, message).map_err(StoreError::from)?;
            bytes.push(b'\n');
        }
        write_atomically(&files.messages, bytes).await?;
        Ok(())
    }

    async fn append_message(&self, message: &ChatMessage) -> Result<()> {
        let Some(files) = &self.files else {
            return Ok(());
        };
        let mut line = serde_json::to_vec(message).map_err(StoreError::from)?;
        line.push(b'\n');
        let mut log = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&files.messages)
            .await
            .map_err(StoreError::from)?;
        log.write_all(&line).await.map_err(StoreError::from)?;
        log.flush().await.map_err(StoreError::from)?;
        Ok(())
    }

    /// Write the snapshot, or run `undo` on the live data if that fails.
    async fn persist_or_undo(&self, data: &mut StoreData, undo: impl FnOnce(&mut StoreData)) -> Result<()> {
        if let Err(e) = self.persist(data).await {
            undo(data);
            return Err(e);
        }
        Ok(())
    }

    // accounts

    /// Insert a new account; emails are unique regardless of case.
    pub async fn insert_account(&self, account: Account) -> Result<()> {
        let mut data = self.data.write().await;
        let email = account.email.to_lowercase();
        if data.accounts.values().any(|a| a.email.to_lowercase() == email) {
            return Err(AppError::conflict("User already exists"));
        }
        let id = account.id.clone();
        data.accounts.insert(id.clone(), account);
        self.persist_or_undo(&mut data, |data| {
            data.accounts.remove(&id);
        })
        .await
    }

    pub async fn account(&self, id: &str) -> Option<Account> {
        self.data.read().await.accounts.get(id).cloned()
    }

    pub async fn account_by_email(&self, email: &str) -> Option<Account> {
        let email = email.to_lowercase();
        let data = self.data.read().await;
        data.accounts
            .values()
            .find(|a| a.email.to_lowercase() == email)
            .cloned()
    }

    pub async fn accounts_with_role(&self, role: Role) -> Vec<Account> {
        let data = self.data.read().await;
        let mut accounts: Vec<Account> = data
            .accounts
            .values()
            .filter(|a| a.role == role)
            .cloned()
            .collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        accounts
    }

    pub async fn account_summary(&self, id: &str) -> AccountSummary {
        let data = self.data.read().await;
        data.accounts
            .get(id)
            .map_or_else(|| AccountSummary::unknown(id), AccountSummary::from)
    }

    /// Read-modify-write of one account. Nothing changes unless `apply`
    /// succeeds and the result is stored.
    pub async fn update_account<T>(
        &self,
        id: &str,
        apply: impl FnOnce(&mut Account) -> Result<T>,
    ) -> Result<T> {
        let mut data = self.data.write().await;
        let mut draft = data
            .accounts
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("User not found"))?;
        let out = apply(&mut draft)?;
        let previous = data.accounts.insert(id.to_string(), draft);
        self.persist_or_undo(&mut data, |data| {
            if let Some(previous) = previous {
                data.accounts.insert(id.to_string(), previous);
            }
        })
        .await?;
        Ok(out)
    }

    pub async fn counts(&self) -> Counts {
        let data = self.data.read().await;
        Counts {
            responders: data.accounts.values().filter(|a| a.role == Role::Responder).count(),
            users: data.accounts.values().filter(|a| a.role == Role::User).count(),
            alerts: data.alerts.len(),
        }
    }

    // alerts

    pub async fn insert_alert(&self, alert: Alert) -> Result<()> {
        let mut data = self.data.write().await;
        let id = alert.id.clone();
        let previous = data.alerts.insert(id.clone(), alert);
        self.persist_or_undo(&mut data, |data| match previous {
            Some(previous) => {
                data.alerts.insert(id, previous);
            }
            None => {
                data.alerts.remove(&id);
            }
        })
        .await
    }

    /// Look up an alert of the given source; other sources are invisible.
    pub async fn alert(&self, id: &str, source: AlertSource) -> Result<Alert> {
        let data = self.data.read().await;
        data.alerts
            .get(id)
            .filter(|a| a.source == source)
            .cloned()
            .ok_or_else(|| AppError::not_found("Alert not found"))
    }

    /// Look up an alert regardless of source.
    pub async fn any_alert(&self, id: &str) -> Result<Alert> {
        let data = self.data.read().await;
        data.alerts
            .get(id)
            .cloned()
            .ok_or_else(|| AppError::not_found("Alert not found"))
    }

    /// Matching alerts newest first, with the total before pagination.
    pub async fn list_alerts(&self, filter: &AlertFilter, skip: usize, limit: usize) -> (Vec<Alert>, usize) {
        let data = self.data.read().await;
        let mut matching: Vec<&Alert> = data.alerts.values().filter(|a| filter.matches(a)).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        let total = matching.len();
        let page = matching.into_iter().skip(skip).take(limit).cloned().collect();
        (page, total)
    }

    /// Read-modify-write of one alert as a single critical section. An
    /// error from `apply` or from writing the snapshot leaves the stored
    /// alert as it was.
    pub async fn update_alert<T>(
        &self,
        id: &str,
        source: AlertSource,
        apply: impl FnOnce(&mut Alert) -> Result<T>,
    ) -> Result<T> {
        let mut data = self.data.write().await;
        let mut draft = data
            .alerts
            .get(id)
            .filter(|a| a.source == source)
            .cloned()
            .ok_or_else(|| AppError::not_found("Alert not found"))?;
        let out = apply(&mut draft)?;
        let previous = data.alerts.insert(id.to_string(), draft);
        self.persist_or_undo(&mut data, |data| {
            if let Some(previous) = previous {
                data.alerts.insert(id.to_string(), previous);
            }
        })
        .await?;
        Ok(out)
    }

    /// Remove an alert together with its chat history and pending deletion
    /// job. `guard` sees the alert first and can veto the removal.
    pub async fn remove_alert(
        &self,
        id: &str,
        source: Option<AlertSource>,
        guard: impl FnOnce(&Alert) -> Result<()>,
    ) -> Result<Removed> {
        let mut data = self.data.write().await;
        let alert = data
            .alerts
            .get(id)
            .filter(|a| source.map_or(true, |s| a.source == s))
            .ok_or_else(|| AppError::not_found("Alert not found"))?;
        guard(alert)?;

        let Some(alert) = data.alerts.remove(id) else {
            return Err(AppError::not_found("Alert not found"));
        };
        let (gone, kept): (Vec<ChatMessage>, Vec<ChatMessage>) =
            std::mem::take(&mut data.messages).into_iter().partition(|m| m.alert_id == id);
        data.messages = kept;
        let job = data.deletion_jobs.remove(id);
        let removed = Removed {
            messages: gone.len(),
            job_cancelled: job.is_some(),
        };

        let written = match self.persist(&data).await {
            Ok(()) if gone.is_empty() => Ok(()),
            Ok(()) => self.persist_messages(&data).await.map_err(|e| (e, true)),
            Err(e) => Err((e, false)),
        };
        if let Err((e, snapshot_written)) = written {
            data.alerts.insert(id.to_string(), alert);
            data.messages.extend(gone);
            if let Some(due_at) = job {
                data.deletion_jobs.insert(id.to_string(), due_at);
            }
            if snapshot_written {
                if let Err(restore) = self.persist(&data).await {
                    error!("Could not restore snapshot after failed removal of {id}: {restore}");
                }
            }
            return Err(e);
        }
        Ok(removed)
    }

    // deletion jobs

    /// Enqueue a deletion unless one is already pending for this alert.
    /// Returns whether a new job was created.
    pub async fn enqueue_deletion(&self, alert_id: &str, due_at: DateTime<Utc>) -> Result<bool> {
        let mut data = self.data.write().await;
        if data.deletion_jobs.contains_key(alert_id) {
            return Ok(false);
        }
        data.deletion_jobs.insert(alert_id.to_string(), due_at);
        self.persist_or_undo(&mut data, |data| {
            data.deletion_jobs.remove(alert_id);
        })
        .await?;
        Ok(true)
    }

    pub async fn pending_deletion(&self, alert_id: &str) -> Option<DateTime<Utc>> {
        self.data.read().await.deletion_jobs.get(alert_id).copied()
    }

    /// Alert ids whose deletion is due, earliest first.
    pub async fn due_deletions(&self, now: DateTime<Utc>) -> Vec<String> {
        let data = self.data.read().await;
        let mut due: Vec<(&String, &DateTime<Utc>)> =
            data.deletion_jobs.iter().filter(|(_, at)| **at <= now).collect();
        due.sort_by(|a, b| a.1.cmp(b.1));
        due.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Drop a job whose alert is already gone.
    pub async fn discard_deletion(&self, alert_id: &str) -> Result<bool> {
        let mut data = self.data.write().await;
        let Some(due_at) = data.deletion_jobs.remove(alert_id) else {
            return Ok(false);
        };
        self.persist_or_undo(&mut data, |data| {
            data.deletion_jobs.insert(alert_id.to_string(), due_at);
        })
        .await?;
        Ok(true)
    }

    // chat

    /// Append one message. Only the message log is touched.
    pub async fn insert_message(&self, message: ChatMessage) -> Result<()> {
        let mut data = self.data.write().await;
        self.append_message(&message).await?;
        data.messages.push(message);
        Ok(())
    }

    /// Messages of one alert in insertion order.
    pub async fn messages_for(&self, alert_id: &str) -> Vec<ChatMessage> {
        let data = self.data.read().await;
        data.messages
            .iter()
            .filter(|m| m.alert_id == alert_id)
            .cloned()
            .collect()
    }

    pub async fn purge_messages(&self, alert_id: &str) -> Result<usize> {
        let mut data = self.data.write().await;
        let (gone, kept): (Vec<ChatMessage>, Vec<ChatMessage>) =
            std::mem::take(&mut data.messages).into_iter().partition(|m| m.alert_id == alert_id);
        data.messages = kept;
        if gone.is_empty() {
            return Ok(0);
        }
        if let Err(e) = self.persist_messages(&data).await {
            data.messages.extend(gone);
            return Err(e);
        }
        Ok(gone.len())
    }

    // donations

    pub async fn insert_donation(&self, donation: Donation) -> Result<()> {
        let mut data = self.data.write().await;
        data.donations.push(donation);
        self.persist_or_undo(&mut data, |data| {
            data.donations.pop();
        })
        .await
    }

    pub async fn donations(&self) -> Vec<Donation> {
        let data = self.data.read().await;
        let mut donations = data.donations.clone();
        donations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        donations
    }
}

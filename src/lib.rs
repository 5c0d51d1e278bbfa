pub mod accounts;
pub mod alerts;
pub mod auth;
pub mod chat;
pub mod clock;
pub mod config;
pub mod donations;
pub mod engine;
pub mod error;
pub mod messages;
pub mod models;
pub mod notify;
pub mod otp;
pub mod room;
pub mod routes;
pub mod scheduler;
pub mod server;
pub mod store;

use std::sync::Arc;

use log::info;

use crate::accounts::AccountService;
use crate::alerts::AlertService;
use crate::auth::TokenIssuer;
use crate::chat::ChatService;
use crate::clock::Clock;
use crate::config::Config;
use crate::donations::{DonationService, PaymentGateway};
use crate::engine::ResponseEngine;
use crate::error::Result;
use crate::notify::Notifier;
use crate::otp::OtpService;
use crate::room::ChatHub;
use crate::scheduler::DeletionScheduler;
use crate::store::Store;

/// Everything a request handler needs, cheap to clone into filters.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub clock: Arc<dyn Clock>,
    pub tokens: Arc<TokenIssuer>,
    pub hub: ChatHub,
    pub accounts: Arc<AccountService>,
    pub alerts: Arc<AlertService>,
    pub engine: Arc<ResponseEngine>,
    pub chat: Arc<ChatService>,
    pub scheduler: Arc<DeletionScheduler>,
    pub otp: Arc<OtpService>,
    pub donations: Arc<DonationService>,
}

impl App {
    /// Wire up the services. Opens the snapshot when `DATA_PATH` is set and
    /// seeds the admin account when credentials are configured.
    pub async fn build(
        config: Config,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self> {
        let store = Arc::new(match &config.data_path {
            Some(path) => Store::open(path).await?,
            None => {
                info!("No DATA_PATH set, keeping state in memory only");
                Store::in_memory()
            }
        });
        let hub = ChatHub::new();

        let tokens = Arc::new(TokenIssuer::new(
            config.token_secret.clone(),
            config.token_ttl,
            clock.clone(),
        ));
        let accounts = Arc::new(AccountService::new(
            store.clone(),
            tokens.clone(),
            clock.clone(),
            config.admin.as_ref().map(|a| a.email.clone()),
        ));
        if let Some(admin) = &config.admin {
            accounts.seed_admin(admin).await?;
        }

        let scheduler = Arc::new(DeletionScheduler::new(
            store.clone(),
            hub.clone(),
            clock.clone(),
            config.resolved_alert_ttl,
        ));
        let engine = Arc::new(ResponseEngine::new(
            store.clone(),
            accounts.clone(),
            scheduler.clone(),
            clock.clone(),
        ));
        let alerts = Arc::new(AlertService::new(store.clone(), notifier.clone(), hub.clone(), clock.clone()));
        let chat = Arc::new(ChatService::new(store.clone(), hub.clone(), clock.clone()));
        let otp = Arc::new(OtpService::new(notifier, clock.clone(), config.otp_ttl));
        let donations = Arc::new(DonationService::new(store.clone(), gateway, clock.clone()));

        Ok(App {
            config: Arc::new(config),
            store,
            clock,
            tokens,
            hub,
            accounts,
            alerts,
            engine,
            chat,
            scheduler,
            otp,
            donations,
        })
    }
}

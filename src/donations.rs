use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Claims;
use crate::clock::Clock;
use crate::error::{AppError, Result};
use crate::models::Donation;
use crate::store::Store;

pub const MIN_DONATION: f64 = 50.0;
pub const CURRENCY: &str = "inr";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    pub status: String,
    pub client_secret: String,
}

/// Card payment provider. Amounts are in minor units of `currency`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        receipt_email: Option<&str>,
    ) -> Result<PaymentIntent>;
}

/// Gateway that approves intents locally, for running without a provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalGateway;

#[async_trait]
impl PaymentGateway for LocalGateway {
    async fn create_intent(
        &self,
        amount_minor: i64,
        currency: &str,
        _receipt_email: Option<&str>,
    ) -> Result<PaymentIntent> {
        let id = format!("pi_{}", Uuid::new_v4().simple());
        info!("Local payment intent {id} for {amount_minor} {currency}");
        Ok(PaymentIntent {
            client_secret: format!("{id}_secret_{}", Uuid::new_v4().simple()),
            id,
            status: "requires_payment_method".to_string(),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DonationRequest {
    pub amount: Option<f64>,
    pub name: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationResponse {
    pub client_secret: String,
}

pub struct DonationService {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
}

impl DonationService {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn PaymentGateway>, clock: Arc<dyn Clock>) -> Self {
        Self { store, gateway, clock }
    }

    pub async fn create(&self, request: DonationRequest) -> Result<DonationResponse> {
        let amount = request
            .amount
            .filter(|a| a.is_finite() && *a >= MIN_DONATION)
            .ok_or_else(|| AppError::validation("Minimum donation is ₹50"))?;
        if request.name.trim().is_empty() {
            return Err(AppError::validation("Name is required"));
        }
        let email = request.email.map(|e| e.trim().to_string()).filter(|e| !e.is_empty());

        #[allow(clippy::cast_possible_truncation)]
        let amount_minor = (amount * 100.0).round() as i64;
        let intent = self
            .gateway
            .create_intent(amount_minor, CURRENCY, email.as_deref())
            .await
            .map_err(|e| {
                error!("Payment intent creation failed: {e}");
                AppError::upstream("Payment intent creation failed")
            })?;

        self.store
            .insert_donation(Donation {
                id: Uuid::new_v4().to_string(),
                name: request.name.trim().to_string(),
                email,
                amount,
                amount_minor,
                payment_intent_id: intent.id.clone(),
                status: intent.status,
                created_at: self.clock.now(),
            })
            .await?;
        info!("Donation of {amount} {CURRENCY} recorded with intent {}", intent.id);
        Ok(DonationResponse { client_secret: intent.client_secret })
    }

    /// Newest first, admins only.
    pub async fn list(&self, caller: &Claims) -> Result<Vec<Donation>> {
        caller.require_admin()?;
        Ok(self.store.donations().await)
    }
}

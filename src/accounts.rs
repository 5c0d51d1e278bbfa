use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{hash_password, verify_password, Claims, TokenIssuer};
use crate::clock::Clock;
use crate::config::AdminCredentials;
use crate::error::{AppError, Result};
use crate::models::{Account, AccountView, Role};
use crate::store::{Counts, Store};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    pub role: Option<Role>,
    pub place: String,
    pub pincode: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub message: String,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub role: Role,
    pub is_approved: bool,
    pub requires_approval: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub message: String,
    pub user: AccountView,
}

pub struct AccountService {
    store: Arc<Store>,
    tokens: Arc<TokenIssuer>,
    clock: Arc<dyn Clock>,
    admin_email: Option<String>,
}

impl AccountService {
    pub fn new(
        store: Arc<Store>,
        tokens: Arc<TokenIssuer>,
        clock: Arc<dyn Clock>,
        admin_email: Option<String>,
    ) -> Self {
        Self {
            store,
            tokens,
            clock,
            admin_email: admin_email.map(|e| e.to_lowercase()),
        }
    }

    /// Create the configured admin account unless it already exists.
    pub async fn seed_admin(&self, admin: &AdminCredentials) -> Result<()> {
        if let Some(existing) = self.store.account_by_email(&admin.email).await {
            if existing.role != Role::Admin {
                warn!("Admin email {} belongs to a {} account", admin.email, existing.role);
            }
            return Ok(());
        }
        let account = Account {
            id: Uuid::new_v4().to_string(),
            name: admin.name.clone(),
            email: admin.email.clone(),
            password_hash: hash_password(&admin.password),
            role: Role::Admin,
            place: String::new(),
            pincode: String::new(),
            phone: String::new(),
            is_approved: true,
            created_at: self.clock.now(),
        };
        self.store.insert_account(account).await?;
        info!("Seeded admin account {}", admin.email);
        Ok(())
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let is_admin_email = self
            .admin_email
            .as_deref()
            .is_some_and(|admin| admin == request.email.trim().to_lowercase());
        if request.role == Some(Role::Admin) || is_admin_email {
            return Err(AppError::forbidden("Admin cannot be registered manually."));
        }

        let required = [
            &request.name,
            &request.email,
            &request.password,
            &request.place,
            &request.pincode,
            &request.phone,
        ];
        let Some(role) = request.role else {
            return Err(AppError::validation("Please fill all required fields"));
        };
        if required.iter().any(|field| field.trim().is_empty()) {
            return Err(AppError::validation("Please fill all required fields"));
        }

        let account = Account {
            id: Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            email: request.email.trim().to_string(),
            password_hash: hash_password(&request.password),
            role,
            place: request.place,
            pincode: request.pincode,
            phone: request.phone,
            is_approved: role != Role::Responder,
            created_at: self.clock.now(),
        };
        let requires_approval = !account.is_approved;
        self.store.insert_account(account).await?;
        info!("Registered {role} account {}", request.email.trim());

        let message = if requires_approval {
            "Responder registered successfully! Your account is pending admin approval."
        } else {
            "User registered successfully!"
        };
        Ok(RegisterResponse {
            message: message.to_string(),
            requires_approval,
        })
    }

    pub async fn login(&self, request: LoginRequest) -> Result<LoginResponse> {
        let invalid = || AppError::unauthorized("Invalid credentials");
        let account = self
            .store
            .account_by_email(request.email.trim())
            .await
            .ok_or_else(invalid)?;
        if !verify_password(&request.password, &account.password_hash) {
            warn!("Failed login for {}", account.email);
            return Err(invalid());
        }

        let token = self.tokens.issue(&account)?;
        Ok(LoginResponse {
            token,
            role: account.role,
            is_approved: account.is_approved,
            requires_approval: account.role == Role::Responder && !account.is_approved,
        })
    }

    pub async fn me(&self, claims: &Claims) -> Result<AccountView> {
        self.store
            .account(&claims.sub)
            .await
            .map(|a| AccountView::from(&a))
            .ok_or_else(|| AppError::not_found("User not found"))
    }

    pub async fn set_approval(&self, caller: &Claims, user_id: &str, approved: bool) -> Result<ApprovalResponse> {
        caller.require_admin()?;
        let account = self
            .store
            .update_account(user_id, |account| {
                if account.role != Role::Responder {
                    return Err(AppError::validation("User is not a responder"));
                }
                account.is_approved = approved;
                Ok(account.clone())
            })
            .await?;

        let verb = if approved { "approved" } else { "disapproved" };
        info!("Responder {} {verb}", account.email);
        Ok(ApprovalResponse {
            message: format!("Responder {verb} successfully"),
            user: AccountView::from(&account),
        })
    }

    pub async fn list_role(&self, caller: &Claims, role: Role) -> Result<Vec<AccountView>> {
        caller.require_admin()?;
        Ok(self
            .store
            .accounts_with_role(role)
            .await
            .iter()
            .map(AccountView::from)
            .collect())
    }

    /// Fail unless the caller may act as a responder: admins always,
    /// responders once approved.
    pub async fn require_active_responder(&self, caller: &Claims) -> Result<()> {
        match caller.role {
            Role::Admin => Ok(()),
            Role::Responder => {
                let account = self
                    .store
                    .account(&caller.sub)
                    .await
                    .ok_or_else(|| AppError::not_found("User not found"))?;
                if account.is_approved {
                    Ok(())
                } else {
                    Err(AppError::forbidden("Account pending approval"))
                }
            }
            Role::User => Err(AppError::forbidden("Only responders can respond to alerts")),
        }
    }

    pub async fn stats(&self) -> Counts {
        self.store.counts().await
    }
}

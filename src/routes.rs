use std::convert::Infallible;

use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use warp::http::StatusCode;
use warp::reply::{Reply, Response};
use warp::{Filter, Rejection};

use crate::accounts::{LoginRequest, RegisterRequest};
use crate::alerts::AlertQuery;
use crate::auth::Claims;
use crate::donations::DonationRequest;
use crate::engine::Availability;
use crate::error::{AppError, ErrorBody};
use crate::models::{AlertPatch, AlertSource, NewAlert, ProgressStatus, Role};
use crate::server;
use crate::App;

const MAX_BODY_BYTES: u64 = 64 * 1024;

type Handled = Result<Response, Rejection>;

fn with_app(app: App) -> impl Filter<Extract = (App,), Error = Infallible> + Clone {
    warp::any().map(move || app.clone())
}

fn with_source(source: AlertSource) -> impl Filter<Extract = (AlertSource,), Error = Infallible> + Clone {
    warp::any().map(move || source)
}

/// Claims from a valid `Authorization: Bearer` header.
fn authenticated(app: App) -> impl Filter<Extract = (Claims,), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and(with_app(app))
        .and_then(|header: Option<String>, app: App| async move {
            app.tokens.verify_bearer(header.as_deref()).map_err(Rejection::from)
        })
}

fn json_body<T: DeserializeOwned + Send>() -> impl Filter<Extract = (T,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

fn json<T: Serialize>(value: &T) -> Response {
    warp::reply::json(value).into_response()
}

fn message(text: &str) -> Response {
    json(&json!({ "message": text }))
}

pub fn routes(app: App) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    auth_routes(app.clone())
        .or(user_routes(app.clone()))
        .unify()
        .or(alert_routes(app.clone(), AlertSource::Admin, "alerts"))
        .unify()
        .or(alert_routes(app.clone(), AlertSource::User, "user-alerts"))
        .unify()
        .or(progress_routes(app.clone()))
        .unify()
        .or(chat_routes(app.clone()))
        .unify()
        .or(donation_routes(app.clone()))
        .unify()
        .or(ws_route(app))
        .unify()
        .recover(handle_rejection)
}

// auth

fn auth_routes(app: App) -> warp::filters::BoxedFilter<(Response,)> {
    let base = warp::path("api").and(warp::path("auth"));

    let register_route = warp::post()
        .and(base.clone())
        .and(warp::path("register"))
        .and(warp::path::end())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(register);
    let login_route = warp::post()
        .and(base.clone())
        .and(warp::path("login"))
        .and(warp::path::end())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(login);
    let me_route = warp::get()
        .and(base.clone())
        .and(warp::path("me"))
        .and(warp::path::end())
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(me);
    let approval_route = warp::put()
        .and(base.clone())
        .and(warp::path("responder-approval"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(authenticated(app.clone()))
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(set_approval);
    let stats_route = warp::get()
        .and(base.clone())
        .and(warp::path("stats"))
        .and(warp::path::end())
        .and(with_app(app.clone()))
        .and_then(stats);
    let send_otp_route = warp::post()
        .and(base.clone())
        .and(warp::path("send-otp"))
        .and(warp::path::end())
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(send_otp);
    let verify_otp_route = warp::post()
        .and(base.clone())
        .and(warp::path("verify-otp"))
        .and(warp::path::end())
        .and(json_body())
        .and(with_app(app))
        .and_then(verify_otp);

    register_route
        .or(login_route)
        .unify()
        .or(me_route)
        .unify()
        .or(approval_route)
        .unify()
        .or(stats_route)
        .unify()
        .or(send_otp_route)
        .unify()
        .or(verify_otp_route)
        .unify()
        .boxed()
}

async fn register(request: RegisterRequest, app: App) -> Handled {
    let res = app.accounts.register(request).await?;
    Ok(warp::reply::with_status(warp::reply::json(&res), StatusCode::CREATED).into_response())
}

async fn login(request: LoginRequest, app: App) -> Handled {
    Ok(json(&app.accounts.login(request).await?))
}

async fn me(claims: Claims, app: App) -> Handled {
    Ok(json(&app.accounts.me(&claims).await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalBody {
    is_approved: bool,
}

async fn set_approval(user_id: String, claims: Claims, body: ApprovalBody, app: App) -> Handled {
    Ok(json(&app.accounts.set_approval(&claims, &user_id, body.is_approved).await?))
}

async fn stats(app: App) -> Handled {
    Ok(json(&app.accounts.stats().await))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct OtpRequest {
    email: String,
    name: String,
    otp: String,
}

async fn send_otp(body: OtpRequest, app: App) -> Handled {
    app.otp.send(&body.email, &body.name).await?;
    Ok(message("OTP sent successfully"))
}

async fn verify_otp(body: OtpRequest, app: App) -> Handled {
    let check = app.otp.verify(&body.email, &body.otp).await?;
    let status = if check.verified { StatusCode::OK } else { StatusCode::BAD_REQUEST };
    Ok(warp::reply::with_status(warp::reply::json(&check), status).into_response())
}

// user listings

fn user_routes(app: App) -> warp::filters::BoxedFilter<(Response,)> {
    let responders = warp::path!("api" / "users" / "responders").map(|| Role::Responder);
    let users = warp::path!("api" / "users" / "users").map(|| Role::User);

    warp::get()
        .and(responders.or(users).unify())
        .and(authenticated(app.clone()))
        .and(with_app(app))
        .and_then(|role: Role, claims: Claims, app: App| async move {
            let listing = app.accounts.list_role(&claims, role).await?;
            Ok::<_, Rejection>(json(&listing))
        })
        .boxed()
}

// alerts, mounted once per source

fn alert_routes(app: App, source: AlertSource, prefix: &'static str) -> warp::filters::BoxedFilter<(Response,)> {
    let base = warp::path("api").and(warp::path(prefix));

    let create = warp::post()
        .and(base.clone())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(create_alert);
    let list = warp::get()
        .and(base.clone())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(warp::query::<AlertQuery>())
        .and(with_app(app.clone()))
        .and_then(list_alerts);
    let respond_route = warp::post()
        .and(base.clone())
        .and(warp::path("respond"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(respond);
    let assign_route = warp::post()
        .and(base.clone())
        .and(warp::path("assign"))
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(assign);
    let get = warp::get()
        .and(base.clone())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(get_alert);
    let update = warp::put()
        .and(base.clone())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(update_alert);
    let delete = warp::delete()
        .and(base.clone())
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(with_source(source))
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(delete_alert);

    let routes = create
        .or(list)
        .unify()
        .or(respond_route)
        .unify()
        .or(assign_route)
        .unify()
        .boxed();

    // `my-alerts` has to be tried before the `:id` lookup.
    let routes = if source == AlertSource::User {
        let mine = warp::get()
            .and(base)
            .and(warp::path("my-alerts"))
            .and(warp::path::end())
            .and(authenticated(app.clone()))
            .and(with_app(app))
            .and_then(my_alerts);
        routes.or(mine).unify().boxed()
    } else {
        routes
    };

    routes
        .or(get)
        .unify()
        .or(update)
        .unify()
        .or(delete)
        .unify()
        .boxed()
}

async fn create_alert(source: AlertSource, claims: Claims, input: NewAlert, app: App) -> Handled {
    let view = app.alerts.create(source, &claims, input).await?;
    Ok(warp::reply::with_status(warp::reply::json(&view), StatusCode::CREATED).into_response())
}

async fn list_alerts(source: AlertSource, _claims: Claims, query: AlertQuery, app: App) -> Handled {
    Ok(json(&app.alerts.list(source, &query).await?))
}

async fn my_alerts(claims: Claims, app: App) -> Handled {
    Ok(json(&app.alerts.mine(&claims).await?))
}

async fn get_alert(alert_id: String, source: AlertSource, _claims: Claims, app: App) -> Handled {
    Ok(json(&app.alerts.get(source, &alert_id).await?))
}

async fn update_alert(alert_id: String, source: AlertSource, claims: Claims, patch: AlertPatch, app: App) -> Handled {
    Ok(json(&app.alerts.update(source, &alert_id, &claims, patch).await?))
}

async fn delete_alert(alert_id: String, source: AlertSource, claims: Claims, app: App) -> Handled {
    app.alerts.delete(source, &alert_id, &claims).await?;
    Ok(message("Alert deleted successfully"))
}

async fn respond(alert_id: String, source: AlertSource, claims: Claims, app: App) -> Handled {
    let outcome = app.engine.record_availability(source, &alert_id, &claims).await?;
    Ok(json(&json!({
        "message": "Marked as available",
        "recorded": outcome == Availability::Recorded,
    })))
}

#[derive(Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct AssignBody {
    responder_id: String,
}

async fn assign(alert_id: String, source: AlertSource, claims: Claims, body: AssignBody, app: App) -> Handled {
    let alert = app
        .engine
        .assign_responder(source, &alert_id, &body.responder_id, &claims)
        .await?;
    let view = app.alerts.view(alert).await;
    Ok(json(&json!({ "message": "Responder assigned successfully", "alert": view })))
}

// progress of user-origin alerts

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressBody {
    progress_status: ProgressStatus,
}

fn progress_routes(app: App) -> warp::filters::BoxedFilter<(Response,)> {
    let path = warp::path!("api" / "user-alerts" / String / "progress");

    let advance = warp::put()
        .and(path)
        .and(authenticated(app.clone()))
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(|alert_id: String, claims: Claims, body: ProgressBody, app: App| async move {
            let alert = app
                .engine
                .advance_progress(&alert_id, body.progress_status, &claims)
                .await?;
            Ok::<_, Rejection>(json(&app.alerts.view(alert).await))
        });
    let current = warp::get()
        .and(path)
        .and(authenticated(app.clone()))
        .and(with_app(app))
        .and_then(|alert_id: String, _claims: Claims, app: App| async move {
            let status = app.engine.progress(&alert_id).await?;
            Ok::<_, Rejection>(json(&json!({ "progressStatus": status })))
        });

    advance.or(current).unify().boxed()
}

// chat history

fn chat_routes(app: App) -> warp::filters::BoxedFilter<(Response,)> {
    let path = warp::path!("api" / "chat" / String);

    let history = warp::get()
        .and(path)
        .and(authenticated(app.clone()))
        .and(with_app(app.clone()))
        .and_then(|alert_id: String, claims: Claims, app: App| async move {
            Ok::<_, Rejection>(json(&app.chat.history(&alert_id, &claims).await?))
        });
    let purge = warp::delete()
        .and(path)
        .and(authenticated(app.clone()))
        .and(with_app(app))
        .and_then(|alert_id: String, claims: Claims, app: App| async move {
            let deleted = app.chat.purge(&alert_id, &claims).await?;
            Ok::<_, Rejection>(json(&json!({ "message": "Messages deleted", "deleted": deleted })))
        });

    history.or(purge).unify().boxed()
}

// donations

fn donation_routes(app: App) -> warp::filters::BoxedFilter<(Response,)> {
    let create = warp::post()
        .and(warp::path!("api" / "create-payment-intent"))
        .and(json_body())
        .and(with_app(app.clone()))
        .and_then(|request: DonationRequest, app: App| async move {
            Ok::<_, Rejection>(json(&app.donations.create(request).await?))
        });
    let ledger = warp::get()
        .and(warp::path!("api" / "donations"))
        .and(authenticated(app.clone()))
        .and(with_app(app))
        .and_then(|claims: Claims, app: App| async move {
            Ok::<_, Rejection>(json(&app.donations.list(&claims).await?))
        });

    create.or(ledger).unify().boxed()
}

// websocket

#[derive(Deserialize)]
struct WsAuth {
    token: Option<String>,
}

fn ws_route(app: App) -> warp::filters::BoxedFilter<(Response,)> {
    warp::path("ws")
        .and(warp::path::end())
        .and(warp::ws())
        .and(warp::query::<WsAuth>())
        .and(with_app(app))
        .and_then(|ws: warp::ws::Ws, auth: WsAuth, app: App| async move {
            let token = auth
                .token
                .filter(|t| !t.is_empty())
                .ok_or_else(|| AppError::unauthorized("Unauthorized - No token provided"))?;
            let claims = app.tokens.verify(&token)?;
            Ok::<_, Rejection>(
                ws.on_upgrade(move |socket| server::handle_connection(app, socket, claims))
                    .into_response(),
            )
        })
        .boxed()
}

/// Turn every rejection into a JSON `{ "error": ... }` body.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, text) = if let Some(e) = err.find::<AppError>() {
        match e {
            AppError::Storage(_) | AppError::Internal(_) => error!("Request failed ({}): {e}", e.category()),
            _ => warn!("Request rejected ({}): {e}", e.category()),
        }
        (e.status_code(), e.to_string())
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not found".to_string())
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {e}"))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, format!("Invalid query: {e}"))
    } else if err.find::<warp::reject::PayloadTooLarge>().is_some() {
        (StatusCode::PAYLOAD_TOO_LARGE, "Payload too large".to_string())
    } else if err.find::<warp::reject::LengthRequired>().is_some() {
        (StatusCode::LENGTH_REQUIRED, "Content-Length required".to_string())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "Method not allowed".to_string())
    } else {
        error!("Unhandled rejection: {err:?}");
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
    };

    Ok(warp::reply::with_status(warp::reply::json(&ErrorBody { error: text }), status).into_response())
}

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{hash_password, verify_password, Auth, Role};
use crate::error::ApiError;
use crate::models::NewParent;
use crate::routes::AppState;
use crate::validation::{Checks, EMAIL};

const INVALID_CREDENTIALS: ApiError = ApiError::Unauthorized("INVALID_CREDENTIALS");

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LoginPayload {
    identifier: String,
    username: String,
    email: String,
    password: String,
}

impl LoginPayload {
    /// First non-blank of `identifier`, `username`, `email`.
    fn ident(&self) -> &str {
        [&self.identifier, &self.username, &self.email]
            .into_iter()
            .map(|s| s.trim())
            .find(|s| !s.is_empty())
            .unwrap_or("")
    }
}

async fn staff_session(data: &AppState, payload: &LoginPayload, admin_only: bool) -> Result<HttpResponse, ApiError> {
    let ident = payload.ident();
    if ident.is_empty() || payload.password.is_empty() {
        return Err(ApiError::MISSING_FIELDS);
    }
    if !data.login_throttle.allow("staff", ident) {
        tracing::warn!(username = ident, "staff login throttled");
        return Err(ApiError::RateLimited);
    }
    let user = data.repo.find_user_by_username(ident).await?.ok_or(INVALID_CREDENTIALS)?;
    if !verify_password(&payload.password, &user.password_hash) {
        return Err(INVALID_CREDENTIALS);
    }
    if !user.enabled {
        return Err(ApiError::Forbidden("ACCOUNT_DISABLED"));
    }
    if admin_only && user.role != Role::Admin {
        return Err(ApiError::FORBIDDEN);
    }
    data.repo.record_login(user.id).await?;
    data.login_throttle.succeeded("staff", ident);

    let token = data.jwt.issue(user.id, user.role, &user.username)?;
    tracing::info!(user_id = user.id, role = user.role.as_str(), "staff login");
    Ok(HttpResponse::Ok().json(json!({
        "token": token,
        "token_type": "Bearer",
        "user": {
            "id": user.id,
            "username": user.username,
            "role": user.role,
            "force_password_change": user.force_password_change,
        }
    })))
}

pub async fn staff_login(data: web::Data<AppState>, payload: web::Json<LoginPayload>) -> Result<HttpResponse, ApiError> {
    staff_session(&data, &payload, false).await
}

pub async fn admin_login(data: web::Data<AppState>, payload: web::Json<LoginPayload>) -> Result<HttpResponse, ApiError> {
    staff_session(&data, &payload, true).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ParentRegistration {
    email: String,
    phone: String,
    password: String,
    name: String,
    pdpa_ok: bool,
}

pub async fn parent_register(data: web::Data<AppState>, payload: web::Json<ParentRegistration>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    let email = p.email.trim().to_lowercase();
    let phone = p.phone.trim().to_string();
    let name = p.name.trim().to_string();

    let mut checks = Checks::new();
    if checks.matches("email", &email, &EMAIL, "must be a valid email address") {
        checks.max_chars("email", &email, 100);
    }
    if p.password.chars().count() < 8 {
        checks.fail("password", "must be at least 8 characters");
    }
    if !phone.is_empty() {
        checks.phone("phone", &phone);
    }
    checks.max_chars("name", &name, 100);
    checks.finish()?;

    let parent = data
        .repo
        .create_parent(NewParent {
            email,
            phone,
            password_hash: hash_password(&p.password, data.password_cost)?,
            name,
            pdpa_ok: p.pdpa_ok,
        })
        .await?;
    tracing::info!(parent_id = parent.id, "parent registered");
    Ok(HttpResponse::Created().json(parent))
}

pub async fn parent_login(data: web::Data<AppState>, payload: web::Json<LoginPayload>) -> Result<HttpResponse, ApiError> {
    let ident = payload.ident().to_lowercase();
    if ident.is_empty() || payload.password.is_empty() {
        return Err(ApiError::MISSING_FIELDS);
    }
    if !data.login_throttle.allow("parent", &ident) {
        tracing::warn!(email = %ident, "parent login throttled");
        return Err(ApiError::RateLimited);
    }
    let parent = data.repo.find_parent_by_email(&ident).await?.ok_or(INVALID_CREDENTIALS)?;
    if !verify_password(&payload.password, &parent.password_hash) {
        return Err(INVALID_CREDENTIALS);
    }
    data.login_throttle.succeeded("parent", &ident);

    let display = if parent.name.is_empty() { parent.email.clone() } else { parent.name.clone() };
    let token = data.jwt.issue(parent.id, Role::Parent, &display)?;
    Ok(HttpResponse::Ok().json(json!({
        "token": token,
        "token_type": "Bearer",
        "user": { "id": parent.id, "email": parent.email, "name": parent.name, "role": Role::Parent }
    })))
}

pub async fn me(auth: Auth) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "id": auth.0.sub, "name": auth.0.name, "role": auth.0.role }))
}

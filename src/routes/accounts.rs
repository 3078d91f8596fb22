use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::auth::{hash_password, one_time_password, Role};
use crate::error::ApiError;
use crate::models::{AccountFlags, Id, NewUser, User};
use crate::routes::{created, AppState};
use crate::validation::{Checks, LooseId};

const NOT_TEACHER_ACCOUNT: ApiError = ApiError::Forbidden("NOT_TEACHER_ACCOUNT");
const MIN_PASSWORD: usize = 8;
const MAX_GENERATED: usize = 64;

#[derive(Debug, Serialize)]
pub struct AccountView {
    #[serde(flatten)]
    user: User,
    teacher_name: String,
}

pub async fn list(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let mut users = data.repo.list_users_with_role(Role::Teacher).await?;
    users.sort_by_key(|u| u.id);
    let teacher_ids: Vec<Id> = users.iter().filter_map(|u| u.teacher_id).collect();
    let names: HashMap<Id, String> = data
        .repo
        .find_teachers(&teacher_ids)
        .await?
        .into_iter()
        .map(|t| (t.id, t.full_name()))
        .collect();
    let rows: Vec<AccountView> = users
        .into_iter()
        .map(|user| {
            let teacher_name = user.teacher_id.and_then(|id| names.get(&id).cloned()).unwrap_or_default();
            AccountView { user, teacher_name }
        })
        .collect();
    Ok(HttpResponse::Ok().json(rows))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AccountPayload {
    teacher_id: Option<LooseId>,
    username: String,
    password: String,
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<AccountPayload>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    let username = p.username.trim().to_string();
    let mut c = Checks::new();
    let teacher_id = match &p.teacher_id {
        Some(raw) => {
            let id = raw.as_id();
            if id.is_none() {
                c.fail("teacher_id", "must be a numeric id");
            }
            id
        }
        None => {
            c.fail("teacher_id", "required");
            None
        }
    };
    if c.required("username", &username) {
        c.max_chars("username", &username, 50);
    }
    if p.password.chars().count() < MIN_PASSWORD {
        c.fail("password", "must be at least 8 characters");
    }
    c.finish()?;
    let teacher_id = teacher_id.ok_or(ApiError::MISSING_FIELDS)?;

    let teacher = data.repo.get_teacher(teacher_id).await.map_err(|e| e.not_found_as("TEACHER_NOT_FOUND"))?;
    let user = data
        .repo
        .create_user(NewUser {
            username,
            password_hash: hash_password(&p.password, data.password_cost)?,
            role: Role::Teacher,
            teacher_id: Some(teacher.id),
            email: teacher.email.clone(),
            phone: teacher.phone.clone(),
            force_password_change: true,
        })
        .await?;
    tracing::info!(user_id = user.id, teacher_id = teacher.id, "teacher account created");
    Ok(created(&AccountView { user, teacher_name: teacher.full_name() }))
}

async fn teacher_account(data: &AppState, id: Id) -> Result<User, ApiError> {
    let user = data.repo.get_user(id).await?;
    if user.role != Role::Teacher {
        return Err(NOT_TEACHER_ACCOUNT);
    }
    Ok(user)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ResetPayload {
    length: Option<usize>,
}

pub async fn reset_password(
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: Option<web::Json<ResetPayload>>,
) -> Result<HttpResponse, ApiError> {
    let length = payload.and_then(|p| p.length).unwrap_or(12);
    if length < MIN_PASSWORD {
        return Err(ApiError::field("length", "must be at least 8"));
    }
    let length = length.min(MAX_GENERATED);
    let user = teacher_account(&data, path.into_inner()).await?;

    let password = one_time_password(length);
    data.repo.set_password(user.id, hash_password(&password, data.password_cost)?, true).await?;
    tracing::info!(user_id = user.id, "teacher password reset");
    Ok(HttpResponse::Ok().json(json!({ "one_time_password": password })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FlagsPayload {
    enabled: Option<bool>,
    force_password_change: Option<bool>,
}

pub async fn set_flags(data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<FlagsPayload>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    if p.enabled.is_none() && p.force_password_change.is_none() {
        return Err(ApiError::BadRequest("NO_FIELDS_TO_UPDATE"));
    }
    let user = teacher_account(&data, path.into_inner()).await?;
    let user = data
        .repo
        .set_account_flags(user.id, AccountFlags { enabled: p.enabled, force_password_change: p.force_password_change })
        .await?;
    tracing::info!(user_id = user.id, enabled = user.enabled, "teacher account flags changed");
    Ok(HttpResponse::Ok().json(user))
}

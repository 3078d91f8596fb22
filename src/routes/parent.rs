use actix_web::{web, HttpResponse};

use crate::auth::Auth;
use crate::error::ApiError;
use crate::repo::RepoError;
use crate::routes::leave::{self, LeavePayload};
use crate::routes::AppState;

pub async fn me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let parent = data.repo.get_parent(auth.user_id()).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::Unauthorized("INVALID_TOKEN"),
        other => other.into(),
    })?;
    Ok(HttpResponse::Ok().json(parent))
}

/// The caller's own submissions only.
pub async fn list_leaves(auth: Auth, data: web::Data<AppState>, params: web::Query<leave::ListParams>) -> Result<HttpResponse, ApiError> {
    let query = params.into_inner().into_query(Some(auth.user_id()))?;
    let page = data.repo.list_leaves(&query).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn submit_leave(auth: Auth, data: web::Data<AppState>, payload: web::Json<LeavePayload>) -> Result<HttpResponse, ApiError> {
    leave::submit(&data, &payload, Some(auth.user_id())).await
}

use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::auth::{hash_password, verify_password, Auth};
use crate::error::ApiError;
use crate::models::{Homeroom, HomeroomStatus, ProfileChanges, StudentSummary, Teacher, User};
use crate::repo::{RepoError, StudentSummaryQuery};
use crate::routes::AppState;
use crate::validation::clamp_limit;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SummaryParams {
    q: Option<String>,
    grade: Option<String>,
    room: Option<String>,
    limit: Option<String>,
}

pub async fn students_summary(data: web::Data<AppState>, params: web::Query<SummaryParams>) -> Result<HttpResponse, ApiError> {
    let p = params.into_inner();
    let limit = clamp_limit(p.limit.as_deref(), 200, 1000);
    let students = data
        .repo
        .summarize_students(&StudentSummaryQuery { q: p.q, grade: p.grade, room: p.room, limit })
        .await?;
    let rows: Vec<StudentSummary> = students.iter().map(StudentSummary::from).collect();
    Ok(HttpResponse::Ok().json(rows))
}

#[derive(Debug, Serialize)]
struct HomeroomBrief {
    #[serde(flatten)]
    homeroom: Homeroom,
    code: String,
}

#[derive(Debug, Serialize)]
struct MeView {
    teacher: Option<Teacher>,
    homeroom: Option<HomeroomBrief>,
    account: User,
}

/// An active assignment when there is one, else the most recent.
pub fn current_homeroom(rows: Vec<Homeroom>) -> Option<Homeroom> {
    rows.into_iter().max_by_key(|h| (h.status == HomeroomStatus::Active, h.created_at, h.id))
}

async fn caller_account(data: &AppState, auth: &Auth) -> Result<User, ApiError> {
    data.repo.get_user(auth.user_id()).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::Unauthorized("INVALID_TOKEN"),
        other => other.into(),
    })
}

pub async fn me(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let account = caller_account(&data, &auth).await?;
    let (teacher, homeroom) = match account.teacher_id {
        Some(tid) => {
            let teacher = match data.repo.get_teacher(tid).await {
                Ok(t) => Some(t),
                Err(RepoError::NotFound) => None,
                Err(e) => return Err(e.into()),
            };
            let homeroom = current_homeroom(data.repo.homerooms_for_teacher(tid).await?)
                .map(|h| HomeroomBrief { code: format!("{}/{}", h.grade, h.room), homeroom: h });
            (teacher, homeroom)
        }
        None => (None, None),
    };
    Ok(HttpResponse::Ok().json(MeView { teacher, homeroom, account }))
}

pub async fn get_profile(auth: Auth, data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let account = caller_account(&data, &auth).await?;
    Ok(HttpResponse::Ok().json(account))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ProfilePayload {
    email: Option<String>,
    phone: Option<String>,
    timezone: Option<String>,
    locale: Option<String>,
}

fn profile_changes(p: &ProfilePayload) -> Result<ProfileChanges, ApiError> {
    let given = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let changes = ProfileChanges {
        email: given(&p.email).map(|e| e.to_lowercase()),
        phone: given(&p.phone),
        timezone: given(&p.timezone),
        locale: given(&p.locale),
    };
    if changes.email.is_none() && changes.phone.is_none() && changes.timezone.is_none() && changes.locale.is_none() {
        return Err(ApiError::BadRequest("EMPTY"));
    }
    if changes.email.as_deref().is_some_and(|e| !e.contains('@')) {
        return Err(ApiError::BadRequest("INVALID_EMAIL"));
    }
    Ok(changes)
}

pub async fn update_profile(auth: Auth, data: web::Data<AppState>, payload: web::Json<ProfilePayload>) -> Result<HttpResponse, ApiError> {
    let changes = profile_changes(&payload)?;
    let account = caller_account(&data, &auth).await?;
    let phone = changes.phone.clone();
    let updated = data.repo.update_profile(account.id, changes).await?;
    if let (Some(phone), Some(tid)) = (phone, updated.teacher_id) {
        match data.repo.set_teacher_phone(tid, &phone).await {
            Ok(()) | Err(RepoError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(HttpResponse::Ok().json(updated))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PasswordChange {
    #[serde(alias = "current_password")]
    current: String,
    #[serde(alias = "new_password")]
    next: String,
}

pub async fn change_password(auth: Auth, data: web::Data<AppState>, payload: web::Json<PasswordChange>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    if p.current.is_empty() || p.next.is_empty() {
        return Err(ApiError::MISSING_FIELDS);
    }
    if p.next.chars().count() < 8 {
        return Err(ApiError::BadRequest("WEAK_PASSWORD"));
    }
    let account = caller_account(&data, &auth).await?;
    if !verify_password(&p.current, &account.password_hash) {
        return Err(ApiError::Unauthorized("INVALID_CURRENT_PASSWORD"));
    }
    data.repo.set_password(account.id, hash_password(&p.next, data.password_cost)?, false).await?;
    tracing::info!(user_id = account.id, "password changed");
    Ok(HttpResponse::Ok().json(serde_json::json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EducationStage, HomeroomPosition};
    use chrono::{Duration, Utc};

    fn homeroom(id: i64, status: HomeroomStatus, age_days: i64) -> Homeroom {
        let at = Utc::now() - Duration::days(age_days);
        Homeroom {
            id,
            academic_year: "2568".into(),
            education_stage: EducationStage::Primary,
            grade: "P.1".into(),
            room: id.to_string(),
            position: HomeroomPosition::Main,
            teacher_id: 1,
            status,
            note: String::new(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn active_homeroom_beats_newer_inactive_one() {
        let rows = vec![homeroom(1, HomeroomStatus::Active, 30), homeroom(2, HomeroomStatus::Terminated, 1)];
        assert_eq!(current_homeroom(rows).map(|h| h.id), Some(1));
        let rows = vec![homeroom(3, HomeroomStatus::Terminated, 30), homeroom(4, HomeroomStatus::MainChanged, 2)];
        assert_eq!(current_homeroom(rows).map(|h| h.id), Some(4));
        assert!(current_homeroom(vec![]).is_none());
    }

    #[test]
    fn profile_update_needs_a_field_and_a_plausible_email() {
        assert_eq!(profile_changes(&ProfilePayload::default()).unwrap_err().code(), "EMPTY");
        let bad = ProfilePayload { email: Some("nobody".into()), ..Default::default() };
        assert_eq!(profile_changes(&bad).unwrap_err().code(), "INVALID_EMAIL");
        let ok = ProfilePayload { phone: Some(" 0812345678 ".into()), locale: Some("  ".into()), ..Default::default() };
        let changes = profile_changes(&ok).unwrap();
        assert_eq!(changes.phone.as_deref(), Some("0812345678"));
        assert!(changes.locale.is_none());
    }
}

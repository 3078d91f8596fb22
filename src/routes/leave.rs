use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::{Id, LeaveDecision, LeaveStatus, LeaveType, NewLeaveRequest};
use crate::repo::LeaveQuery;
use crate::routes::{created, AppState};
use crate::validation::{parse_date, Checks, LooseId, PageParams};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LeavePayload {
    #[serde(alias = "studentId")]
    pub student_id: Option<LooseId>,
    #[serde(rename = "type", alias = "leave_type")]
    pub leave_type: String,
    pub reason: String,
    #[serde(alias = "dateFrom")]
    pub date_from: String,
    #[serde(alias = "dateTo")]
    pub date_to: String,
    pub attachments: Vec<String>,
}

pub fn validate(p: &LeavePayload, parent_id: Option<Id>) -> Result<NewLeaveRequest, ApiError> {
    let mut c = Checks::new();
    let student_id = match &p.student_id {
        Some(raw) => {
            let id = raw.as_id();
            if id.is_none() {
                c.fail("student_id", "must be a numeric id");
            }
            id
        }
        None => {
            c.fail("student_id", "required");
            None
        }
    };
    let leave_type = c.choice::<LeaveType>("type", &p.leave_type, LeaveType::NAMES);
    let reason = p.reason.trim().to_string();
    c.max_chars("reason", &reason, 1000);
    let from = c.date("date_from", &p.date_from);
    let to = c.date("date_to", &p.date_to);
    if let (Some(f), Some(t)) = (from, to) {
        if t < f {
            c.fail("date_to", "must not be before date_from");
        }
    }
    c.finish()?;
    match (student_id, leave_type, from, to) {
        (Some(student_id), Some(leave_type), Some(date_from), Some(date_to)) => Ok(NewLeaveRequest {
            student_id,
            parent_id,
            leave_type,
            reason,
            date_from,
            date_to,
            attachments: p.attachments.iter().map(|a| a.trim().to_string()).filter(|a| !a.is_empty()).collect(),
        }),
        _ => Err(ApiError::MISSING_FIELDS),
    }
}

/// Creates a pending request after checking the student exists.
pub(crate) async fn submit(data: &AppState, p: &LeavePayload, parent_id: Option<Id>) -> Result<HttpResponse, ApiError> {
    let new = validate(p, parent_id)?;
    data.repo.get_student(new.student_id).await.map_err(|e| e.not_found_as("STUDENT_NOT_FOUND"))?;
    let leave = data.repo.create_leave(new).await?;
    tracing::info!(leave_id = leave.id, student_id = leave.student_id, parent_id = ?parent_id, "leave request submitted");
    Ok(created(&leave))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListParams {
    status: Option<String>,
    #[serde(rename = "type")]
    leave_type: Option<String>,
    student_id: Option<String>,
    from: Option<String>,
    to: Option<String>,
    q: Option<String>,
    #[serde(flatten)]
    paging: PageParams,
}

fn present(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl ListParams {
    pub(crate) fn into_query(self, parent_id: Option<Id>) -> Result<LeaveQuery, ApiError> {
        let status = match present(&self.status) {
            Some(raw) => Some(raw.parse::<LeaveStatus>().map_err(|_| {
                ApiError::field("status", &format!("must be one of: {}", LeaveStatus::NAMES.join(", ")))
            })?),
            None => None,
        };
        let leave_type = match present(&self.leave_type) {
            Some(raw) => Some(raw.parse::<LeaveType>().map_err(|_| {
                ApiError::field("type", &format!("must be one of: {}", LeaveType::NAMES.join(", ")))
            })?),
            None => None,
        };
        let student_id = match present(&self.student_id) {
            Some(raw) => Some(raw.parse::<Id>().map_err(|_| ApiError::INVALID_ID)?),
            None => None,
        };
        let date = |field: &str, v: &Option<String>| match present(v) {
            Some(raw) => parse_date(raw).map(Some).ok_or_else(|| ApiError::field(field, "must be a date in YYYY-MM-DD format")),
            None => Ok(None),
        };
        let from = date("from", &self.from)?;
        let to = date("to", &self.to)?;
        let (page, size) = self.paging.resolve(10, 100);
        Ok(LeaveQuery { status, leave_type, student_id, parent_id, from, to, q: self.q, page, size })
    }
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let page = data.repo.list_leaves(&params.into_inner().into_query(None)?).await?;
    Ok(HttpResponse::Ok().json(page))
}

pub async fn pending_count(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let count = data.repo.count_pending_leaves().await?;
    Ok(HttpResponse::Ok().json(json!({ "count": count })))
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<LeavePayload>) -> Result<HttpResponse, ApiError> {
    submit(&data, &payload, None).await
}

async fn decide(data: &AppState, id: Id, decision: LeaveDecision) -> Result<HttpResponse, ApiError> {
    let status = decision.status;
    let leave = data.repo.decide_leave(id, decision).await?;
    tracing::info!(leave_id = id, status = status.as_str(), decided_by = ?leave.decided_by, "leave request decided");
    Ok(HttpResponse::Ok().json(leave))
}

pub async fn approve(auth: Auth, data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let decision = LeaveDecision { status: LeaveStatus::Approved, decided_by: auth.0.name.clone(), reject_reason: None };
    decide(&data, path.into_inner(), decision).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RejectPayload {
    #[serde(rename = "rejectReason", alias = "reject_reason")]
    reject_reason: String,
}

pub async fn reject(
    auth: Auth,
    data: web::Data<AppState>,
    path: web::Path<Id>,
    payload: Option<web::Json<RejectPayload>>,
) -> Result<HttpResponse, ApiError> {
    let reason = payload.map(|p| p.reject_reason.trim().to_string()).unwrap_or_default();
    if reason.is_empty() {
        return Err(ApiError::BadRequest("REJECT_REASON_REQUIRED"));
    }
    let decision = LeaveDecision { status: LeaveStatus::Rejected, decided_by: auth.0.name.clone(), reject_reason: Some(reason) };
    decide(&data, path.into_inner(), decision).await
}

use actix_web::{web, HttpResponse};
use chrono::{Local, NaiveTime, Timelike};
use serde::Deserialize;

use crate::auth::Auth;
use crate::error::ApiError;
use crate::models::{AttendanceStatus, Id, NewAttendance};
use crate::repo::AttendanceQuery;
use crate::routes::{created, AppState};
use crate::validation::{parse_date, LooseId};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct MarkPayload {
    #[serde(alias = "studentId")]
    student_id: Option<LooseId>,
    date: String,
    status: String,
    note: String,
    operator: String,
    retro: bool,
}

/// Resolves status aliases; the second value is the note used when none is sent.
pub fn resolve_status(raw: &str) -> Option<(AttendanceStatus, &'static str)> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "sick_leave" => Some((AttendanceStatus::Leave, "sick")),
        "personal_leave" => Some((AttendanceStatus::Leave, "personal business")),
        other => other.parse().ok().map(|s| (s, "")),
    }
}

fn wall_clock() -> Option<NaiveTime> {
    let now = Local::now();
    NaiveTime::from_hms_opt(now.hour(), now.minute(), 0)
}

pub async fn mark(auth: Auth, data: web::Data<AppState>, payload: web::Json<MarkPayload>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    let raw_id = match &p.student_id {
        Some(id) if !id.as_text().is_empty() => id,
        _ => return Err(ApiError::MISSING_FIELDS),
    };
    if p.date.trim().is_empty() || p.status.trim().is_empty() {
        return Err(ApiError::MISSING_FIELDS);
    }
    let student_id = raw_id.as_id().ok_or(ApiError::INVALID_ID)?;
    let date = parse_date(&p.date).ok_or_else(|| ApiError::field("date", "must be a date in YYYY-MM-DD format"))?;
    let (status, default_note) = resolve_status(&p.status).ok_or_else(|| {
        ApiError::field("status", &format!("must be one of: {}, sick_leave, personal_leave", AttendanceStatus::NAMES.join(", ")))
    })?;
    data.repo.get_student(student_id).await.map_err(|e| e.not_found_as("STUDENT_NOT_FOUND"))?;

    let note = match p.note.trim() {
        "" => default_note.to_string(),
        n => n.to_string(),
    };
    let operator = match p.operator.trim() {
        "" => auth.0.name.clone(),
        o => o.to_string(),
    };
    let time = if status.is_timeless() { None } else { wall_clock() };
    let row = data
        .repo
        .record_attendance(NewAttendance { student_id, date, time, status, note, operator, retro: p.retro })
        .await?;
    tracing::info!(attendance_id = row.id, student_id, status = status.as_str(), "attendance marked");
    Ok(created(&row))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListParams {
    start: Option<String>,
    end: Option<String>,
    student_id: Option<String>,
    statuses: Option<String>,
    grade: Option<String>,
    room: Option<String>,
    q: Option<String>,
}

fn optional_date(field: &str, raw: Option<&str>) -> Result<Option<chrono::NaiveDate>, ApiError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => parse_date(s).map(Some).ok_or_else(|| ApiError::field(field, "must be a date in YYYY-MM-DD format")),
        None => Ok(None),
    }
}

/// Comma separated statuses; aliases map onto their base status.
fn parse_statuses(raw: Option<&str>) -> Result<Vec<AttendanceStatus>, ApiError> {
    let mut out = Vec::new();
    for part in raw.unwrap_or("").split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (status, _) = resolve_status(part).ok_or_else(|| ApiError::field("statuses", &format!("unknown status `{part}`")))?;
        if !out.contains(&status) {
            out.push(status);
        }
    }
    Ok(out)
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let p = params.into_inner();
    let student_id = match p.student_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<Id>().map_err(|_| ApiError::INVALID_ID)?),
        None => None,
    };
    let query = AttendanceQuery {
        start: optional_date("start", p.start.as_deref())?,
        end: optional_date("end", p.end.as_deref())?,
        student_id,
        statuses: parse_statuses(p.statuses.as_deref())?,
        grade: p.grade.filter(|s| !s.trim().is_empty()),
        room: p.room.filter(|s| !s.trim().is_empty()),
        q: p.q,
    };
    let rows = data.repo.list_attendance(&query).await?;
    Ok(HttpResponse::Ok().json(rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leave_aliases_carry_default_notes() {
        assert_eq!(resolve_status("sick_leave"), Some((AttendanceStatus::Leave, "sick")));
        assert_eq!(resolve_status(" Personal_Leave "), Some((AttendanceStatus::Leave, "personal business")));
        assert_eq!(resolve_status("late"), Some((AttendanceStatus::Late, "")));
        assert_eq!(resolve_status("napping"), None);
    }

    #[test]
    fn status_filter_is_deduplicated() {
        let s = parse_statuses(Some("present, late,present,sick_leave")).unwrap();
        assert_eq!(s, vec![AttendanceStatus::Present, AttendanceStatus::Late, AttendanceStatus::Leave]);
        assert!(parse_statuses(Some("present,bogus")).is_err());
        assert!(parse_statuses(None).unwrap().is_empty());
    }
}

use std::collections::HashSet;

use actix_web::{web, HttpResponse};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ApiError;
use crate::models::{ClassSlot, Id, MoveChanges, NewStudentMove, StudentMove, StudentSummary};
use crate::repo::{MoveQuery, RepoError};
use crate::routes::{created, AppState};
use crate::validation::{clamp_limit, digits_only, parse_date, parse_offset, Checks, LooseId, HOMEROOM_ROOM};

#[derive(Debug, Clone, Deserialize)]
pub struct StudentRef {
    pub id: LooseId,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MovePayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub move_date: String,
    pub from_year: String,
    pub from_grade: String,
    pub from_room: String,
    pub to_year: String,
    pub to_grade: String,
    pub to_room: String,
    pub students: Vec<StudentRef>,
    pub note: String,
}

/// A move request that passed field validation.
#[derive(Debug, Clone)]
pub struct ValidMove {
    pub move_date: NaiveDate,
    pub from_year: String,
    pub from: Option<ClassSlot>,
    pub to_year: String,
    pub to: ClassSlot,
    pub student_ids: Vec<Id>,
    pub note: String,
}

impl ValidMove {
    fn record_for(&self, student_id: Id, from: Option<ClassSlot>) -> NewStudentMove {
        NewStudentMove {
            student_id,
            from_year: self.from_year.clone(),
            from,
            to_year: self.to_year.clone(),
            to: self.to.clone(),
            move_date: self.move_date,
            note: self.note.clone(),
        }
    }
}

pub fn validate(p: &MovePayload) -> Result<ValidMove, ApiError> {
    let mut c = Checks::new();
    let move_date = c.date("moveDate", &p.move_date);
    let to_year = p.to_year.trim().to_string();
    let to_grade = p.to_grade.trim().to_string();
    let to_room = digits_only(&p.to_room);
    c.required("toYear", &to_year);
    c.required("toGrade", &to_grade);
    c.matches("toRoom", &to_room, &HOMEROOM_ROOM, "must be 1-3 digits");

    let mut student_ids = Vec::with_capacity(p.students.len());
    let mut seen = HashSet::new();
    for s in &p.students {
        match s.id.as_id() {
            Some(id) => {
                if seen.insert(id) {
                    student_ids.push(id);
                }
            }
            None => c.fail("students", "every student needs a numeric id"),
        }
    }
    if p.students.is_empty() {
        c.fail("students", "required");
    }
    c.finish()?;

    let from_grade = p.from_grade.trim();
    let from_room = digits_only(&p.from_room);
    let from = (!from_grade.is_empty() && !from_room.is_empty())
        .then(|| ClassSlot { grade: from_grade.to_string(), room: from_room });
    Ok(ValidMove {
        move_date: move_date.ok_or(ApiError::MISSING_FIELDS)?,
        from_year: p.from_year.trim().to_string(),
        from,
        to_year,
        to: ClassSlot { grade: to_grade, room: to_room },
        student_ids,
        note: p.note.trim().to_string(),
    })
}

async fn single(data: &AppState, p: &MovePayload) -> Result<HttpResponse, ApiError> {
    let mv = validate(p)?;
    if mv.student_ids.len() != 1 {
        return Err(ApiError::field("students", "exactly one student is required"));
    }
    let student_id = mv.student_ids[0];
    data.repo.get_student(student_id).await.map_err(|e| e.not_found_as("STUDENT_NOT_FOUND"))?;

    let mut done = data
        .repo
        .record_moves(vec![mv.record_for(student_id, mv.from.clone())])
        .await
        .map_err(|e| e.not_found_as("STUDENT_NOT_FOUND"))?;
    let (record, student) = done.pop().ok_or(ApiError::Internal("MOVE_FAILED"))?;
    tracing::info!(move_id = record.id, student_id, to_grade = %record.to_grade, to_room = %record.to_room, "student moved");
    Ok(created(&json!({ "id": record.id, "moved": 1, "student": student, "record": record })))
}

/// Each student's current class is captured as the move's origin.
async fn bulk(data: &AppState, p: &MovePayload) -> Result<HttpResponse, ApiError> {
    let mv = validate(p)?;
    let found: HashSet<Id> = data.repo.find_students(&mv.student_ids).await?.into_iter().map(|s| s.id).collect();
    let not_found_ids: Vec<Id> = mv.student_ids.iter().copied().filter(|id| !found.contains(id)).collect();
    if found.is_empty() {
        return Err(ApiError::NotFound("STUDENTS_NOT_FOUND"));
    }

    let records: Vec<NewStudentMove> = mv
        .student_ids
        .iter()
        .filter(|id| found.contains(*id))
        .map(|id| mv.record_for(*id, None))
        .collect();
    let moved = data.repo.record_moves(records).await.map_err(|e| match e {
        // a student deleted between lookup and write
        RepoError::NotFound => ApiError::NotFound("STUDENTS_NOT_FOUND"),
        other => other.into(),
    })?;
    tracing::info!(moved = moved.len(), requested = mv.student_ids.len(), "bulk move recorded");
    Ok(created(&json!({
        "moved": moved.len(),
        "requested": mv.student_ids.len(),
        "not_found_ids": not_found_ids,
    })))
}

pub async fn move_single(data: web::Data<AppState>, payload: web::Json<MovePayload>) -> Result<HttpResponse, ApiError> {
    single(&data, &payload).await
}

pub async fn move_bulk(data: web::Data<AppState>, payload: web::Json<MovePayload>) -> Result<HttpResponse, ApiError> {
    bulk(&data, &payload).await
}

/// `POST /moves`, routed by the body's `type`.
pub async fn dispatch(data: web::Data<AppState>, payload: web::Json<MovePayload>) -> Result<HttpResponse, ApiError> {
    match payload.kind.trim().to_ascii_lowercase().as_str() {
        "single" => single(&data, &payload).await,
        "bulk" => bulk(&data, &payload).await,
        _ => Err(ApiError::field("type", "must be one of: single, bulk")),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListParams {
    from_year: Option<String>,
    from_grade: Option<String>,
    from_room: Option<String>,
    to_year: Option<String>,
    to_grade: Option<String>,
    to_room: Option<String>,
    q: Option<String>,
    limit: Option<String>,
    offset: Option<String>,
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let p = params.into_inner();
    let limit = clamp_limit(p.limit.as_deref(), 20, 100);
    let offset = parse_offset(p.offset.as_deref());
    let (rows, total) = data
        .repo
        .list_moves(&MoveQuery {
            from_year: p.from_year,
            from_grade: p.from_grade,
            from_room: p.from_room,
            to_year: p.to_year,
            to_grade: p.to_grade,
            to_room: p.to_room,
            q: p.q,
            limit,
            offset,
        })
        .await?;
    Ok(HttpResponse::Ok().json(json!({ "data": rows, "total": total, "limit": limit, "offset": offset })))
}

#[derive(Serialize)]
struct MoveDetail {
    #[serde(flatten)]
    record: StudentMove,
    student: Option<StudentSummary>,
}

pub async fn get(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let record = data.repo.get_move(path.into_inner()).await?;
    let student = match data.repo.get_student(record.student_id).await {
        Ok(s) => Some(StudentSummary::from(&s)),
        Err(RepoError::NotFound) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(HttpResponse::Ok().json(MoveDetail { record, student }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MoveUpdate {
    to_year: Option<String>,
    to_grade: Option<String>,
    to_room: Option<String>,
    move_date: Option<String>,
    note: Option<String>,
}

fn changes_from(u: &MoveUpdate) -> Result<MoveChanges, ApiError> {
    let present = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let mut c = Checks::new();
    let to_room = present(&u.to_room).map(|r| digits_only(&r));
    if let Some(room) = &to_room {
        c.matches("toRoom", room, &HOMEROOM_ROOM, "must be 1-3 digits");
    }
    let move_date = match present(&u.move_date) {
        Some(raw) => {
            let d = parse_date(&raw);
            if d.is_none() {
                c.fail("moveDate", "must be a date in YYYY-MM-DD format");
            }
            d
        }
        None => None,
    };
    c.finish()?;
    let changes = MoveChanges {
        to_year: present(&u.to_year),
        to_grade: present(&u.to_grade),
        to_room,
        move_date,
        note: u.note.as_deref().map(|n| n.trim().to_string()),
    };
    let empty = changes.to_year.is_none()
        && changes.to_grade.is_none()
        && changes.to_room.is_none()
        && changes.move_date.is_none()
        && changes.note.is_none();
    if empty {
        return Err(ApiError::BadRequest("NO_FIELDS_TO_UPDATE"));
    }
    Ok(changes)
}

pub async fn update(data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<MoveUpdate>) -> Result<HttpResponse, ApiError> {
    let changes = changes_from(&payload)?;
    let (record, student) = data.repo.update_move(path.into_inner(), changes).await?;
    Ok(HttpResponse::Ok().json(json!({ "record": record, "student": student })))
}

pub async fn delete(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_move(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> MovePayload {
        serde_json::from_value(json!({
            "type": "bulk",
            "moveDate": "2025-05-16",
            "fromYear": "2567",
            "toYear": "2568",
            "toGrade": "P.4",
            "toRoom": "room 02",
            "students": [{ "id": 3 }, { "id": "3" }, { "id": "7" }],
        }))
        .unwrap()
    }

    #[test]
    fn room_is_reduced_to_digits_and_ids_deduplicated() {
        let mv = validate(&payload()).unwrap();
        assert_eq!(mv.to.room, "02");
        assert_eq!(mv.student_ids, vec![3, 7]);
        assert!(mv.from.is_none());
    }

    #[test]
    fn bad_fields_are_reported_by_their_wire_names() {
        let mut p = payload();
        p.move_date = "16/05/2025".into();
        p.to_room = "abc".into();
        p.students = vec![StudentRef { id: LooseId::Text("x".into()) }];
        let ApiError::Validation(fields) = validate(&p).unwrap_err() else { panic!("expected validation error") };
        for f in ["moveDate", "toRoom", "students"] {
            assert!(fields.contains_key(f), "missing {f}");
        }
    }

    #[test]
    fn empty_update_is_rejected() {
        let err = changes_from(&MoveUpdate::default()).unwrap_err();
        assert_eq!(err.code(), "NO_FIELDS_TO_UPDATE");
        let ok = changes_from(&MoveUpdate { to_grade: Some(" P.5 ".into()), ..Default::default() }).unwrap();
        assert!(ok.touches_student());
        assert_eq!(ok.to_grade.as_deref(), Some("P.5"));
    }
}

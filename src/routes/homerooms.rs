use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::error::ApiError;
use crate::models::{EducationStage, Homeroom, HomeroomPosition, HomeroomStatus, Id, NewHomeroom, Teacher};
use crate::repo::HomeroomQuery;
use crate::routes::{created, AppState};
use crate::validation::{keep_or, Checks, LooseId, PageParams, HOMEROOM_ROOM, YEAR};

const TEACHER_NOT_FOUND: ApiError = ApiError::NotFound("TEACHER_NOT_FOUND");

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HomeroomPayload {
    academic_year: String,
    education_stage: String,
    grade: String,
    room: String,
    position: String,
    teacher_id: Option<LooseId>,
    status: String,
    note: Option<String>,
}

struct Fields {
    academic_year: String,
    education_stage: String,
    grade: String,
    room: String,
    position: String,
    status: String,
    note: String,
}

impl HomeroomPayload {
    fn fields(&self) -> Fields {
        Fields {
            academic_year: self.academic_year.trim().to_string(),
            education_stage: self.education_stage.trim().to_string(),
            grade: self.grade.trim().to_string(),
            room: self.room.trim().to_string(),
            position: self.position.trim().to_string(),
            status: self.status.trim().to_string(),
            note: self.note.as_deref().unwrap_or("").trim().to_string(),
        }
    }
}

/// Number, numeric string or teacher code.
async fn resolve_teacher(data: &AppState, raw: &LooseId) -> Result<Teacher, ApiError> {
    if let Some(id) = raw.as_id() {
        return data.repo.get_teacher(id).await.map_err(|e| e.not_found_as("TEACHER_NOT_FOUND"));
    }
    let code = raw.as_text();
    if code.is_empty() {
        return Err(ApiError::field("teacher_id", "required"));
    }
    data.repo.find_teacher_by_code(&code).await?.ok_or(TEACHER_NOT_FOUND)
}

fn validate(f: &Fields, teacher_id: Id) -> Result<NewHomeroom, ApiError> {
    let mut c = Checks::new();
    c.matches("academic_year", &f.academic_year, &YEAR, "must be a 4-digit year");
    let stage = c.choice::<EducationStage>("education_stage", &f.education_stage, EducationStage::NAMES);
    c.required("grade", &f.grade);
    c.matches("room", &f.room, &HOMEROOM_ROOM, "must be 1-3 digits");
    let position = c.choice::<HomeroomPosition>("position", &f.position, HomeroomPosition::NAMES);
    let status = if f.status.is_empty() {
        Some(HomeroomStatus::Active)
    } else {
        c.choice::<HomeroomStatus>("status", &f.status, HomeroomStatus::NAMES)
    };
    c.max_chars("note", &f.note, 255);
    c.finish()?;

    match (stage, position, status) {
        (Some(education_stage), Some(position), Some(status)) => Ok(NewHomeroom {
            academic_year: f.academic_year.clone(),
            education_stage,
            grade: f.grade.clone(),
            room: f.room.clone(),
            position,
            teacher_id,
            status,
            note: f.note.clone(),
        }),
        _ => Err(ApiError::MISSING_FIELDS),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    q: Option<String>,
    academic_year: Option<String>,
    teacher_id: Option<String>,
    #[serde(flatten)]
    paging: PageParams,
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let p = params.into_inner();
    let teacher_id = match p.teacher_id.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<Id>().map_err(|_| ApiError::INVALID_ID)?),
        None => None,
    };
    let (page, size) = p.paging.resolve(20, 100);
    let result = data
        .repo
        .list_homerooms(&HomeroomQuery { q: p.q, academic_year: p.academic_year, teacher_id, page, size })
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn get(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let homeroom = data.repo.get_homeroom(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(homeroom))
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<HomeroomPayload>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    let raw_teacher = p.teacher_id.clone().ok_or_else(|| ApiError::field("teacher_id", "required"))?;
    // field errors are reported before the teacher lookup
    let mut new = validate(&p.fields(), 0)?;
    let teacher = resolve_teacher(&data, &raw_teacher).await?;
    new.teacher_id = teacher.id;
    let homeroom = data.repo.create_homeroom(new).await?;
    tracing::info!(homeroom_id = homeroom.id, teacher_id = teacher.id, "homeroom assigned");
    Ok(created(&homeroom))
}

pub async fn update(data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<HomeroomPayload>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let stored: Homeroom = data.repo.get_homeroom(id).await?;
    let p = payload.into_inner();
    let incoming = p.fields();
    let merged = Fields {
        academic_year: keep_or(&incoming.academic_year, &stored.academic_year),
        education_stage: keep_or(&incoming.education_stage, stored.education_stage.as_str()),
        grade: keep_or(&incoming.grade, &stored.grade),
        room: keep_or(&incoming.room, &stored.room),
        position: keep_or(&incoming.position, stored.position.as_str()),
        status: keep_or(&incoming.status, stored.status.as_str()),
        note: if p.note.is_some() { incoming.note } else { stored.note.clone() },
    };
    let teacher_id = match p.teacher_id.as_ref().filter(|t| !t.as_text().is_empty()) {
        Some(raw) => resolve_teacher(&data, raw).await?.id,
        None => stored.teacher_id,
    };
    let homeroom = data.repo.update_homeroom(id, validate(&merged, teacher_id)?).await?;
    Ok(HttpResponse::Ok().json(homeroom))
}

pub async fn delete(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_homeroom(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

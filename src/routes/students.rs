use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::{EducationStage, Id, NewStudent, Student, StudentStatus};
use crate::repo::StudentQuery;
use crate::routes::{created, AppState};
use crate::validation::{
    collapse_spaces, keep_or, BulkIssue, Checks, FieldErrors, PageParams, NAME_PREFIX, NATIONAL_ID, PERSON_NAME,
    STUDENT_CODE, STUDENT_ROOM,
};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct StudentPayload {
    #[serde(alias = "code")]
    pub student_code: String,
    pub national_id: String,
    pub prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: String,
    pub education_stage: String,
    pub grade: String,
    pub room: String,
    pub address: String,
    pub phone: String,
    pub status: String,
}

impl StudentPayload {
    fn normalized(mut self) -> Self {
        for f in [
            &mut self.student_code,
            &mut self.national_id,
            &mut self.prefix,
            &mut self.birth_date,
            &mut self.education_stage,
            &mut self.grade,
            &mut self.room,
            &mut self.address,
            &mut self.phone,
            &mut self.status,
        ] {
            *f = f.trim().to_string();
        }
        self.first_name = collapse_spaces(&self.first_name);
        self.last_name = collapse_spaces(&self.last_name);
        self
    }

    /// Blank fields take the stored value.
    fn over(self, s: &Student) -> Self {
        let birth = s.birth_date.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
        Self {
            student_code: keep_or(&self.student_code, &s.student_code),
            national_id: keep_or(&self.national_id, &s.national_id),
            prefix: keep_or(&self.prefix, &s.prefix),
            first_name: keep_or(&self.first_name, &s.first_name),
            last_name: keep_or(&self.last_name, &s.last_name),
            birth_date: keep_or(&self.birth_date, &birth),
            education_stage: keep_or(&self.education_stage, s.education_stage.as_str()),
            grade: keep_or(&self.grade, &s.grade),
            room: keep_or(&self.room, &s.room),
            address: keep_or(&self.address, &s.address),
            phone: keep_or(&self.phone, &s.phone),
            status: keep_or(&self.status, s.status.as_str()),
        }
    }
}

/// Validates a normalised payload; `code_limit` of 0 means no school-imposed cap.
pub fn validate(p: &StudentPayload, code_limit: usize) -> Result<NewStudent, FieldErrors> {
    let mut c = Checks::new();
    c.matches("national_id", &p.national_id, &NATIONAL_ID, "must be 1-13 digits");
    if c.matches("student_code", &p.student_code, &STUDENT_CODE, "may contain letters, digits and hyphens (max 20)")
        && code_limit > 0
    {
        c.max_chars("student_code", &p.student_code, code_limit);
    }
    c.matches("prefix", &p.prefix, &NAME_PREFIX, "may contain letters and dots only");
    c.matches("first_name", &p.first_name, &PERSON_NAME, "may contain Thai or English letters and spaces (max 50)");
    c.matches("last_name", &p.last_name, &PERSON_NAME, "may contain Thai or English letters and spaces (max 50)");
    let birth_date = c.optional_date("birth_date", &p.birth_date);
    let stage = c.choice::<EducationStage>("education_stage", &p.education_stage, EducationStage::NAMES);
    c.required("grade", &p.grade);
    c.matches("room", &p.room, &STUDENT_ROOM, "must be 1-5 digits");
    if c.required("address", &p.address) {
        c.max_chars("address", &p.address, 255);
    }
    c.phone("phone", &p.phone);
    let status = if p.status.is_empty() {
        Some(StudentStatus::Active)
    } else {
        c.choice::<StudentStatus>("status", &p.status, StudentStatus::NAMES)
    };

    match (stage, status) {
        (Some(education_stage), Some(status)) if c.is_empty() => Ok(NewStudent {
            student_code: p.student_code.clone(),
            national_id: p.national_id.clone(),
            prefix: p.prefix.clone(),
            first_name: p.first_name.clone(),
            last_name: p.last_name.clone(),
            birth_date,
            education_stage,
            grade: p.grade.clone(),
            room: p.room.clone(),
            address: p.address.clone(),
            phone: p.phone.clone(),
            status,
        }),
        _ => Err(c.into_errors()),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    q: Option<String>,
    grade: Option<String>,
    room: Option<String>,
    status: Option<String>,
    #[serde(flatten)]
    paging: PageParams,
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let p = params.into_inner();
    let status = match p.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            raw.parse::<StudentStatus>()
                .map_err(|_| ApiError::field("status", &format!("must be one of: {}", StudentStatus::NAMES.join(", "))))?,
        ),
        None => None,
    };
    let (page, size) = p.paging.resolve(20, 100);
    let result = data
        .repo
        .list_students(&StudentQuery { q: p.q, grade: p.grade, room: p.room, status, page, size })
        .await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn get(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let student = data.repo.get_student(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(student))
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<StudentPayload>) -> Result<HttpResponse, ApiError> {
    let (_, code_limit) = data.code_limits().await?;
    let new = validate(&payload.into_inner().normalized(), code_limit).map_err(ApiError::Validation)?;
    let student = data.repo.create_student(new).await?;
    tracing::info!(student_id = student.id, "student created");
    Ok(created(&student))
}

pub async fn update(data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<StudentPayload>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let stored = data.repo.get_student(id).await?;
    let (_, code_limit) = data.code_limits().await?;
    let merged = payload.into_inner().normalized().over(&stored);
    let upd = validate(&merged, code_limit).map_err(ApiError::Validation)?;
    let student = data.repo.update_student(id, upd).await?;
    Ok(HttpResponse::Ok().json(student))
}

pub async fn delete(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_student(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

/// Validates every row first; inserts nothing unless the whole batch is clean.
pub async fn import(data: web::Data<AppState>, payload: web::Json<Vec<StudentPayload>>) -> Result<HttpResponse, ApiError> {
    let rows = payload.into_inner();
    if rows.is_empty() {
        return Err(ApiError::MISSING_FIELDS);
    }
    let (_, code_limit) = data.code_limits().await?;

    let mut accepted = Vec::with_capacity(rows.len());
    let mut errors: Vec<FieldErrors> = Vec::with_capacity(rows.len());
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    for (index, row) in rows.into_iter().enumerate() {
        let row = row.normalized();
        let mut fields = match validate(&row, code_limit) {
            Ok(new) => {
                accepted.push((index, new));
                FieldErrors::new()
            }
            Err(f) => f,
        };
        if !row.student_code.is_empty() {
            if let Some(first) = first_seen.get(&row.student_code).copied() {
                fields
                    .entry("student_code".into())
                    .or_insert_with(|| format!("duplicate of row {first} in this file"));
            } else {
                first_seen.insert(row.student_code.clone(), index);
            }
        }
        errors.push(fields);
    }

    let codes: Vec<String> = accepted.iter().map(|(_, s)| s.student_code.clone()).collect();
    let taken = data.repo.student_codes_in_use(&codes).await?;
    for (index, s) in &accepted {
        if taken.contains(&s.student_code) {
            errors[*index].entry("student_code".into()).or_insert_with(|| "already exists".into());
        }
    }

    let issues: Vec<BulkIssue> = errors
        .into_iter()
        .enumerate()
        .filter(|(_, f)| !f.is_empty())
        .map(|(index, fields)| BulkIssue { index, fields })
        .collect();
    if !issues.is_empty() {
        return Err(ApiError::BulkValidation(issues));
    }

    let inserted = data.repo.import_students(accepted.into_iter().map(|(_, s)| s).collect()).await?;
    tracing::info!(inserted, "students imported");
    Ok(created(&json!({ "inserted": inserted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StudentPayload {
        StudentPayload {
            student_code: " S-001 ".into(),
            national_id: "1103700012345".into(),
            prefix: "ด.ช.".into(),
            first_name: "  Somchai   Noi ".into(),
            last_name: "Jaidee".into(),
            birth_date: "2015-04-01".into(),
            education_stage: "primary".into(),
            grade: "P.3".into(),
            room: "2".into(),
            address: "12/3 Moo 4".into(),
            phone: "0812345678".into(),
            status: String::new(),
        }
    }

    #[test]
    fn normalised_payload_validates_with_default_status() {
        let new = validate(&sample().normalized(), 0).unwrap();
        assert_eq!(new.student_code, "S-001");
        assert_eq!(new.first_name, "Somchai Noi");
        assert_eq!(new.status, StudentStatus::Active);
    }

    #[test]
    fn school_code_limit_applies() {
        let errs = validate(&sample().normalized(), 3).unwrap_err();
        assert!(errs.contains_key("student_code"));
    }

    #[test]
    fn every_bad_field_is_reported() {
        let mut p = sample();
        p.national_id = "12ab".into();
        p.room = "A".into();
        p.birth_date = "01/04/2015".into();
        p.education_stage = "college".into();
        let errs = validate(&p.normalized(), 0).unwrap_err();
        for f in ["national_id", "room", "birth_date", "education_stage"] {
            assert!(errs.contains_key(f), "missing {f}");
        }
    }
}

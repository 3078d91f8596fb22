use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::{Id, NewTeacher, Teacher};
use crate::repo::TeacherQuery;
use crate::routes::{created, AppState};
use crate::validation::{
    collapse_spaces, keep_or, BulkIssue, Checks, FieldErrors, PageParams, EMAIL, TEACHER_CODE, TEACHER_NAME,
    TEACHER_PREFIXES,
};

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct TeacherPayload {
    #[serde(alias = "code")]
    pub teacher_code: String,
    pub prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
    pub position: String,
}

impl TeacherPayload {
    fn normalized(self) -> Self {
        Self {
            teacher_code: self.teacher_code.trim().to_string(),
            prefix: self.prefix.trim().to_string(),
            first_name: collapse_spaces(&self.first_name),
            last_name: collapse_spaces(&self.last_name),
            phone: self.phone.trim().to_string(),
            email: self.email.trim().to_lowercase(),
            position: collapse_spaces(&self.position),
        }
    }

    fn over(self, t: &Teacher) -> Self {
        Self {
            teacher_code: keep_or(&self.teacher_code, &t.teacher_code),
            prefix: keep_or(&self.prefix, &t.prefix),
            first_name: keep_or(&self.first_name, &t.first_name),
            last_name: keep_or(&self.last_name, &t.last_name),
            phone: keep_or(&self.phone, &t.phone),
            email: keep_or(&self.email, &t.email),
            position: keep_or(&self.position, &t.position),
        }
    }
}

pub fn validate(p: &TeacherPayload, code_limit: usize) -> Result<NewTeacher, FieldErrors> {
    let mut c = Checks::new();
    if c.matches("teacher_code", &p.teacher_code, &TEACHER_CODE, "may contain letters and digits only (max 20)")
        && code_limit > 0
    {
        c.max_chars("teacher_code", &p.teacher_code, code_limit);
    }
    if c.required("prefix", &p.prefix) && !TEACHER_PREFIXES.contains(&p.prefix.as_str()) {
        c.fail("prefix", &format!("must be one of: {}", TEACHER_PREFIXES.join(", ")));
    }
    c.matches("first_name", &p.first_name, &TEACHER_NAME, "may contain letters, spaces and hyphens (max 50)");
    c.matches("last_name", &p.last_name, &TEACHER_NAME, "may contain letters, spaces and hyphens (max 50)");
    c.phone("phone", &p.phone);
    if c.matches("email", &p.email, &EMAIL, "must be a valid email address") {
        c.max_chars("email", &p.email, 50);
    }
    if c.required("position", &p.position) {
        c.max_chars("position", &p.position, 50);
    }
    if !c.is_empty() {
        return Err(c.into_errors());
    }
    Ok(NewTeacher {
        teacher_code: p.teacher_code.clone(),
        prefix: p.prefix.clone(),
        first_name: p.first_name.clone(),
        last_name: p.last_name.clone(),
        phone: p.phone.clone(),
        email: p.email.clone(),
        position: p.position.clone(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    q: Option<String>,
    #[serde(flatten)]
    paging: PageParams,
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let p = params.into_inner();
    let (page, size) = p.paging.resolve(20, 100);
    let result = data.repo.list_teachers(&TeacherQuery { q: p.q, page, size }).await?;
    Ok(HttpResponse::Ok().json(result))
}

pub async fn get(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    let teacher = data.repo.get_teacher(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(teacher))
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<TeacherPayload>) -> Result<HttpResponse, ApiError> {
    let (code_limit, _) = data.code_limits().await?;
    let new = validate(&payload.into_inner().normalized(), code_limit).map_err(ApiError::Validation)?;
    let teacher = data.repo.create_teacher(new).await?;
    tracing::info!(teacher_id = teacher.id, "teacher created");
    Ok(created(&teacher))
}

pub async fn update(data: web::Data<AppState>, path: web::Path<Id>, payload: web::Json<TeacherPayload>) -> Result<HttpResponse, ApiError> {
    let id = path.into_inner();
    let stored = data.repo.get_teacher(id).await?;
    let (code_limit, _) = data.code_limits().await?;
    let upd = validate(&payload.into_inner().normalized().over(&stored), code_limit).map_err(ApiError::Validation)?;
    let teacher = data.repo.update_teacher(id, upd).await?;
    Ok(HttpResponse::Ok().json(teacher))
}

pub async fn delete(data: web::Data<AppState>, path: web::Path<Id>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_teacher(path.into_inner()).await?;
    Ok(HttpResponse::NoContent().finish())
}

pub async fn import(data: web::Data<AppState>, payload: web::Json<Vec<TeacherPayload>>) -> Result<HttpResponse, ApiError> {
    let rows = payload.into_inner();
    if rows.is_empty() {
        return Err(ApiError::MISSING_FIELDS);
    }
    let (code_limit, _) = data.code_limits().await?;

    let mut accepted = Vec::with_capacity(rows.len());
    let mut errors: Vec<FieldErrors> = Vec::with_capacity(rows.len());
    let mut codes_seen: HashMap<String, usize> = HashMap::new();
    let mut emails_seen: HashMap<String, usize> = HashMap::new();
    for (index, row) in rows.into_iter().enumerate() {
        let row = row.normalized();
        let mut fields = match validate(&row, code_limit) {
            Ok(new) => {
                accepted.push((index, new));
                FieldErrors::new()
            }
            Err(f) => f,
        };
        for (field, key, seen) in [
            ("teacher_code", &row.teacher_code, &mut codes_seen),
            ("email", &row.email, &mut emails_seen),
        ] {
            if key.is_empty() {
                continue;
            }
            if let Some(first) = seen.get(key).copied() {
                fields.entry(field.into()).or_insert_with(|| format!("duplicate of row {first} in this file"));
            } else {
                seen.insert(key.clone(), index);
            }
        }
        errors.push(fields);
    }

    let codes: Vec<String> = accepted.iter().map(|(_, t)| t.teacher_code.clone()).collect();
    let emails: Vec<String> = accepted.iter().map(|(_, t)| t.email.clone()).collect();
    let (taken_codes, taken_emails) = data.repo.teacher_keys_in_use(&codes, &emails).await?;
    for (index, t) in &accepted {
        if taken_codes.contains(&t.teacher_code) {
            errors[*index].entry("teacher_code".into()).or_insert_with(|| "already exists".into());
        }
        if taken_emails.contains(&t.email) {
            errors[*index].entry("email".into()).or_insert_with(|| "already exists".into());
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

    let inserted = data.repo.import_teachers(accepted.into_iter().map(|(_, t)| t).collect()).await?;
    tracing::info!(inserted, "teachers imported");
    Ok(created(&json!({ "inserted": inserted })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_must_come_from_the_list() {
        let p = TeacherPayload {
            teacher_code: "T01".into(),
            prefix: "Sir".into(),
            first_name: "Anan".into(),
            last_name: "Suk-Jai".into(),
            phone: "021234567".into(),
            email: "Anan@School.ac.th".into(),
            position: "Teacher".into(),
        }
        .normalized();
        assert_eq!(p.email, "anan@school.ac.th");
        let errs = validate(&p, 0).unwrap_err();
        assert_eq!(errs.len(), 1);
        assert!(errs.contains_key("prefix"));
    }
}

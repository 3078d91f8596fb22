use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::{EducationLevel, NewSchool, School};
use crate::routes::{created, AppState};
use crate::validation::{keep_or, Checks, ADDRESS, SCHOOL_CODE, SCHOOL_NAME};

#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeLengths {
    pub teacher_code_digits: Option<i32>,
    pub student_code_digits: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SchoolPayload {
    school_code: String,
    school_name: String,
    address: String,
    phone: String,
    education_level: String,
    code_lengths: Option<CodeLengths>,
    teacher_code_digits: Option<i32>,
    student_code_digits: Option<i32>,
}

impl SchoolPayload {
    /// Nested `code_lengths` wins over the flat fields.
    fn lengths(&self) -> CodeLengths {
        let nested = self.code_lengths.unwrap_or_default();
        CodeLengths {
            teacher_code_digits: nested.teacher_code_digits.or(self.teacher_code_digits),
            student_code_digits: nested.student_code_digits.or(self.student_code_digits),
        }
    }
}

#[derive(Serialize)]
struct SchoolView {
    #[serde(flatten)]
    school: School,
    code_lengths: CodeLengths,
}

impl From<School> for SchoolView {
    fn from(school: School) -> Self {
        let code_lengths = CodeLengths {
            teacher_code_digits: Some(school.teacher_code_digits),
            student_code_digits: Some(school.student_code_digits),
        };
        Self { school, code_lengths }
    }
}

fn validate(code: &str, name: &str, address: &str, phone: &str, level: &str, lengths: CodeLengths) -> Result<NewSchool, ApiError> {
    let code = code.trim();
    let name = name.trim();
    let address = address.trim();
    let phone = phone.trim();

    let mut c = Checks::new();
    c.matches("school_code", code, &SCHOOL_CODE, "must be 1-20 Thai or English letters or digits");
    c.matches("school_name", name, &SCHOOL_NAME, "may contain letters, digits and spaces only (max 100)");
    c.matches("address", address, &ADDRESS, "may contain letters, digits, spaces and . , / - only (max 255)");
    c.phone("phone", phone);
    let level = c.choice::<EducationLevel>("education_level", level, EducationLevel::NAMES);
    c.finish()?;

    Ok(NewSchool {
        school_code: code.to_string(),
        school_name: name.to_string(),
        address: address.to_string(),
        phone: phone.to_string(),
        education_level: level.ok_or(ApiError::MISSING_FIELDS)?,
        teacher_code_digits: lengths.teacher_code_digits.unwrap_or(0).max(0),
        student_code_digits: lengths.student_code_digits.unwrap_or(0).max(0),
    })
}

pub async fn get(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let school = data.repo.get_school().await?;
    Ok(HttpResponse::Ok().json(SchoolView::from(school)))
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<SchoolPayload>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    let new = validate(&p.school_code, &p.school_name, &p.address, &p.phone, &p.education_level, p.lengths())?;
    let school = data.repo.create_school(new).await?;
    tracing::info!(school_id = school.id, "school created");
    Ok(created(&SchoolView::from(school)))
}

pub async fn update(data: web::Data<AppState>, payload: web::Json<SchoolPayload>) -> Result<HttpResponse, ApiError> {
    let p = payload.into_inner();
    let stored = data.repo.get_school().await?;
    let lengths = p.lengths();
    let merged = CodeLengths {
        teacher_code_digits: lengths.teacher_code_digits.or(Some(stored.teacher_code_digits)),
        student_code_digits: lengths.student_code_digits.or(Some(stored.student_code_digits)),
    };
    let upd = validate(
        &keep_or(&p.school_code, &stored.school_code),
        &keep_or(&p.school_name, &stored.school_name),
        &keep_or(&p.address, &stored.address),
        &keep_or(&p.phone, &stored.phone),
        &keep_or(&p.education_level, stored.education_level.as_str()),
        merged,
    )?;
    let school = data.repo.update_school(upd).await?;
    Ok(HttpResponse::Ok().json(SchoolView::from(school)))
}

pub async fn delete(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    data.repo.delete_school().await?;
    Ok(HttpResponse::NoContent().finish())
}

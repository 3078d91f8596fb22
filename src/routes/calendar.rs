use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

use crate::error::ApiError;
use crate::models::{hhmm, CalendarItem, CalendarKind, CalendarKindTag, Id, NewCalendarItem};
use crate::routes::{created, AppState};
use crate::validation::{keep_or, Checks};

/// Flat wire form of every calendar variant; which fields apply depends on the kind.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct CalendarPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub semester: String,
    pub academic_year: String,
    pub open_date: String,
    pub close_date: String,
    pub time_in: String,
    pub time_out: String,
    pub name: String,
    pub start_date: String,
    pub end_date: String,
    pub title: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub note: Option<String>,
}

fn date_text(d: &chrono::NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn time_text(t: &chrono::NaiveTime) -> String {
    t.format(hhmm::FORMAT).to_string()
}

impl CalendarPayload {
    fn from_item(item: &CalendarItem) -> Self {
        let mut p = CalendarPayload { kind: item.kind.tag().to_string(), note: Some(item.note.clone()), ..Default::default() };
        match &item.kind {
            CalendarKind::Normal { semester, academic_year, open_date, close_date, time_in, time_out } => {
                p.semester = semester.clone();
                p.academic_year = academic_year.clone();
                p.open_date = date_text(open_date);
                p.close_date = date_text(close_date);
                p.time_in = time_text(time_in);
                p.time_out = time_text(time_out);
            }
            CalendarKind::Holiday { name, start_date, end_date } => {
                p.name = name.clone();
                p.start_date = date_text(start_date);
                p.end_date = end_date.as_ref().map(date_text).unwrap_or_default();
            }
            CalendarKind::Event { title, date, start_time, end_time } => {
                p.title = title.clone();
                p.date = date_text(date);
                p.start_time = start_time.as_ref().map(time_text).unwrap_or_default();
                p.end_time = end_time.as_ref().map(time_text).unwrap_or_default();
            }
        }
        p
    }

    /// Blank incoming fields keep the stored value; `note` is replaced whenever sent.
    fn over(self, stored: CalendarPayload) -> Self {
        Self {
            kind: stored.kind,
            semester: keep_or(&self.semester, &stored.semester),
            academic_year: keep_or(&self.academic_year, &stored.academic_year),
            open_date: keep_or(&self.open_date, &stored.open_date),
            close_date: keep_or(&self.close_date, &stored.close_date),
            time_in: keep_or(&self.time_in, &stored.time_in),
            time_out: keep_or(&self.time_out, &stored.time_out),
            name: keep_or(&self.name, &stored.name),
            start_date: keep_or(&self.start_date, &stored.start_date),
            end_date: keep_or(&self.end_date, &stored.end_date),
            title: keep_or(&self.title, &stored.title),
            date: keep_or(&self.date, &stored.date),
            start_time: keep_or(&self.start_time, &stored.start_time),
            end_time: keep_or(&self.end_time, &stored.end_time),
            note: self.note.or(stored.note),
        }
    }
}

pub fn validate(tag: CalendarKindTag, p: &CalendarPayload) -> Result<NewCalendarItem, ApiError> {
    let mut c = Checks::new();
    let kind = match tag {
        CalendarKindTag::Normal => {
            c.required("semester", &p.semester);
            c.required("academic_year", &p.academic_year);
            let open = c.date("open_date", &p.open_date);
            let close = c.date("close_date", &p.close_date);
            let time_in = c.time("time_in", &p.time_in);
            let time_out = c.time("time_out", &p.time_out);
            if let (Some(o), Some(cl)) = (open, close) {
                if o > cl {
                    c.fail("close_date", "must not be before open_date");
                }
            }
            if let (Some(i), Some(o)) = (time_in, time_out) {
                if i >= o {
                    c.fail("time_out", "must be after time_in");
                }
            }
            match (open, close, time_in, time_out) {
                (Some(open_date), Some(close_date), Some(time_in), Some(time_out)) => Some(CalendarKind::Normal {
                    semester: p.semester.trim().to_string(),
                    academic_year: p.academic_year.trim().to_string(),
                    open_date,
                    close_date,
                    time_in,
                    time_out,
                }),
                _ => None,
            }
        }
        CalendarKindTag::Holiday => {
            c.required("name", &p.name);
            let start = c.date("start_date", &p.start_date);
            let end = c.optional_date("end_date", &p.end_date);
            if let (Some(s), Some(e)) = (start, end) {
                if e < s {
                    c.fail("end_date", "must not be before start_date");
                }
            }
            start.map(|start_date| CalendarKind::Holiday { name: p.name.trim().to_string(), start_date, end_date: end })
        }
        CalendarKindTag::Event => {
            c.required("title", &p.title);
            let date = c.date("date", &p.date);
            let start_time = c.optional_time("start_time", &p.start_time);
            let end_time = c.optional_time("end_time", &p.end_time);
            if let (Some(s), Some(e)) = (start_time, end_time) {
                if e <= s {
                    c.fail("end_time", "must be after start_time");
                }
            }
            date.map(|date| CalendarKind::Event { title: p.title.trim().to_string(), date, start_time, end_time })
        }
    };
    c.finish()?;
    let kind = kind.ok_or(ApiError::MISSING_FIELDS)?;
    Ok(NewCalendarItem { kind, note: p.note.as_deref().unwrap_or("").trim().to_string() })
}

fn kind_of(segment: &str) -> Result<CalendarKindTag, ApiError> {
    CalendarKindTag::from_segment(segment).ok_or(ApiError::NOT_FOUND)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    #[serde(rename = "type")]
    kind: Option<String>,
}

pub async fn list(data: web::Data<AppState>, params: web::Query<ListParams>) -> Result<HttpResponse, ApiError> {
    let tag = match params.kind.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            CalendarKindTag::from_segment(raw)
                .ok_or_else(|| ApiError::field("type", "must be one of: normal, holiday, event"))?,
        ),
        None => None,
    };
    let items = data.repo.list_calendar(tag).await?;
    Ok(HttpResponse::Ok().json(items))
}

/// `/calendar/{id}` for a numeric segment, else `/calendar/{kind}`.
pub async fn get_segment(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let segment = path.into_inner();
    if let Ok(id) = segment.trim().parse::<Id>() {
        let item = data.repo.get_calendar(id).await?;
        return Ok(HttpResponse::Ok().json(item));
    }
    let items = data.repo.list_calendar(Some(kind_of(&segment)?)).await?;
    Ok(HttpResponse::Ok().json(items))
}

async fn insert(data: &AppState, tag: CalendarKindTag, p: &CalendarPayload) -> Result<HttpResponse, ApiError> {
    let item = data.repo.create_calendar(validate(tag, p)?).await?;
    tracing::info!(calendar_id = item.id, kind = tag.as_str(), "calendar item created");
    Ok(created(&json!({ "id": item.id })))
}

pub async fn create(data: web::Data<AppState>, payload: web::Json<CalendarPayload>) -> Result<HttpResponse, ApiError> {
    let tag = CalendarKindTag::from_segment(&payload.kind)
        .ok_or_else(|| ApiError::field("type", "must be one of: normal, holiday, event"))?;
    insert(&data, tag, &payload).await
}

pub async fn create_kind(data: web::Data<AppState>, path: web::Path<String>, payload: web::Json<CalendarPayload>) -> Result<HttpResponse, ApiError> {
    let tag = kind_of(&path)?;
    insert(&data, tag, &payload).await
}

/// Fetches `id` and insists it is of the kind named in the path.
async fn stored_of_kind(data: &AppState, tag: CalendarKindTag, id: Id) -> Result<CalendarItem, ApiError> {
    let item = data.repo.get_calendar(id).await?;
    if item.kind.tag() != tag {
        return Err(ApiError::NOT_FOUND);
    }
    Ok(item)
}

pub async fn update(data: web::Data<AppState>, path: web::Path<(String, Id)>, payload: web::Json<CalendarPayload>) -> Result<HttpResponse, ApiError> {
    let (segment, id) = path.into_inner();
    let tag = kind_of(&segment)?;
    let stored = stored_of_kind(&data, tag, id).await?;
    let merged = payload.into_inner().over(CalendarPayload::from_item(&stored));
    let item = data.repo.update_calendar(id, validate(tag, &merged)?).await?;
    Ok(HttpResponse::Ok().json(item))
}

pub async fn delete(data: web::Data<AppState>, path: web::Path<(String, Id)>) -> Result<HttpResponse, ApiError> {
    let (segment, id) = path.into_inner();
    let tag = kind_of(&segment)?;
    stored_of_kind(&data, tag, id).await?;
    data.repo.delete_calendar(id).await?;
    Ok(HttpResponse::NoContent().finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normal() -> CalendarPayload {
        CalendarPayload {
            semester: "1".into(),
            academic_year: "2568".into(),
            open_date: "2025-05-16".into(),
            close_date: "2025-10-10".into(),
            time_in: "07:30".into(),
            time_out: "15:30".into(),
            ..Default::default()
        }
    }

    #[test]
    fn normal_term_orders_dates_and_times() {
        assert!(validate(CalendarKindTag::Normal, &normal()).is_ok());

        let mut p = normal();
        p.close_date = "2025-05-01".into();
        p.time_out = "07:30".into();
        let ApiError::Validation(f) = validate(CalendarKindTag::Normal, &p).unwrap_err() else { panic!() };
        assert!(f.contains_key("close_date"));
        assert!(f.contains_key("time_out"));
    }

    #[test]
    fn single_day_holiday_has_no_end() {
        let p = CalendarPayload { name: "Songkran".into(), start_date: "2025-04-13".into(), ..Default::default() };
        let item = validate(CalendarKindTag::Holiday, &p).unwrap();
        assert_eq!(item.kind.holiday_on("2025-04-13".parse().unwrap()), Some("Songkran"));
        assert_eq!(item.kind.holiday_on("2025-04-14".parse().unwrap()), None);
    }

    #[test]
    fn partial_update_keeps_stored_fields_and_may_clear_note() {
        let stored = CalendarPayload { note: Some("bring hats".into()), ..normal() };
        let incoming = CalendarPayload { time_out: "16:00".into(), note: Some(String::new()), ..Default::default() };
        let merged = incoming.over(stored);
        let item = validate(CalendarKindTag::Normal, &merged).unwrap();
        assert_eq!(item.note, "");
        match item.kind {
            CalendarKind::Normal { semester, time_out, .. } => {
                assert_eq!(semester, "1");
                assert_eq!(time_out.format("%H:%M").to_string(), "16:00");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

use std::collections::{BTreeMap, HashMap};

use actix_web::{web, HttpResponse};
use chrono::{Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::{hhmm, Attendance, AttendanceStatus, Id, LeaveRequest, SchoolCounts, Student};
use crate::repo::AttendanceQuery;
use crate::routes::AppState;
use crate::validation::parse_date;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RowId {
    Attendance(Id),
    Leave(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyRow {
    pub id: RowId,
    pub student_id: Id,
    pub student_name: String,
    pub status: AttendanceStatus,
    #[serde(with = "hhmm::option")]
    pub time: Option<NaiveTime>,
    pub note: String,
    pub operator: String,
    pub retro: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HolidayFlag {
    is_holiday: bool,
    name: String,
}

#[derive(Debug, Serialize)]
struct DailyView {
    date: NaiveDate,
    holiday: HolidayFlag,
    rows: Vec<DailyRow>,
}

/// One row per student: the most recently recorded attendance row (by
/// `created_at`, then id), replaced by an approved leave when one covers the
/// day. Rows come out by student id.
pub fn merge_daily(
    date: NaiveDate,
    attendance: &[Attendance],
    leaves: &[LeaveRequest],
    names: &HashMap<Id, String>,
) -> Vec<DailyRow> {
    let name_of = |id: Id| names.get(&id).cloned().unwrap_or_default();
    let mut latest: BTreeMap<Id, &Attendance> = BTreeMap::new();
    for a in attendance.iter().filter(|a| a.date == date) {
        let newer = latest.get(&a.student_id).map_or(true, |cur| (a.created_at, a.id) > (cur.created_at, cur.id));
        if newer {
            latest.insert(a.student_id, a);
        }
    }
    let mut by_student: BTreeMap<Id, DailyRow> = latest
        .into_iter()
        .map(|(student_id, a)| {
            let row = DailyRow {
                id: RowId::Attendance(a.id),
                student_id,
                student_name: name_of(student_id),
                status: a.status,
                time: a.time,
                note: a.note.clone(),
                operator: a.operator.clone(),
                retro: a.retro,
            };
            (student_id, row)
        })
        .collect();
    for l in leaves.iter().filter(|l| l.covers(date)) {
        let note = match l.leave_type.dashboard_note() {
            "" => l.reason.clone(),
            n => n.to_string(),
        };
        by_student.insert(
            l.student_id,
            DailyRow {
                id: RowId::Leave(format!("leave-{}-{}", date.format("%Y-%m-%d"), l.id)),
                student_id: l.student_id,
                student_name: name_of(l.student_id),
                status: AttendanceStatus::Leave,
                time: None,
                note,
                operator: String::new(),
                retro: false,
            },
        );
    }
    by_student.into_values().collect()
}

/// Parses `grade/room`; anything else is treated as no filter.
pub fn parse_classroom(raw: &str) -> Option<(String, String)> {
    let (grade, room) = raw.trim().split_once('/')?;
    let (grade, room) = (grade.trim(), room.trim());
    (!grade.is_empty() && !room.is_empty()).then(|| (grade.to_string(), room.to_string()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DailyParams {
    date: Option<String>,
    classroom: Option<String>,
    grade: Option<String>,
    room: Option<String>,
}

impl DailyParams {
    fn classroom(&self) -> Option<(String, String)> {
        if let Some(c) = self.classroom.as_deref().and_then(parse_classroom) {
            return Some(c);
        }
        let grade = self.grade.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let room = self.room.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        Some((grade.to_string(), room.to_string()))
    }
}

pub async fn daily(data: web::Data<AppState>, params: web::Query<DailyParams>) -> Result<HttpResponse, ApiError> {
    let date = match params.date.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => parse_date(raw).ok_or_else(|| ApiError::field("date", "must be a date in YYYY-MM-DD format"))?,
        None => Local::now().date_naive(),
    };
    let classroom = params.classroom();

    let holiday = match data.repo.holiday_on(date).await? {
        Some(item) => HolidayFlag {
            is_holiday: true,
            name: item.kind.holiday_on(date).unwrap_or_default().to_string(),
        },
        None => HolidayFlag { is_holiday: false, name: String::new() },
    };

    let (grade, room) = classroom.clone().unzip();
    let attendance = data
        .repo
        .list_attendance(&AttendanceQuery { start: Some(date), end: Some(date), grade, room, ..Default::default() })
        .await?;
    let leaves = data.repo.approved_leaves_on(date).await?;

    let mut ids: Vec<Id> = attendance.iter().map(|a| a.student_id).chain(leaves.iter().map(|l| l.student_id)).collect();
    ids.sort_unstable();
    ids.dedup();
    let students: HashMap<Id, Student> = data.repo.find_students(&ids).await?.into_iter().map(|s| (s.id, s)).collect();
    let leaves: Vec<LeaveRequest> = match &classroom {
        Some((g, r)) => leaves
            .into_iter()
            .filter(|l| students.get(&l.student_id).is_some_and(|s| s.in_class(g, r)))
            .collect(),
        None => leaves,
    };
    let names: HashMap<Id, String> = students.iter().map(|(id, s)| (*id, s.full_name())).collect();

    let rows = merge_daily(date, &attendance, &leaves, &names);
    Ok(HttpResponse::Ok().json(DailyView { date, holiday, rows }))
}

pub async fn summary(data: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let counts = SchoolCounts {
        students: data.repo.count_students().await?,
        teachers: data.repo.count_teachers().await?,
        homerooms: data.repo.count_homerooms().await?,
        pending_leaves: data.repo.count_pending_leaves().await?,
    };
    Ok(HttpResponse::Ok().json(counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LeaveStatus, LeaveType};
    use chrono::Utc;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn mark(id: Id, student_id: Id, status: AttendanceStatus, time: Option<(u32, u32)>) -> Attendance {
        Attendance {
            id,
            student_id,
            date: day(),
            time: time.and_then(|(h, m)| NaiveTime::from_hms_opt(h, m, 0)),
            status,
            note: String::new(),
            operator: "krusomsri".into(),
            retro: false,
            created_at: Utc::now(),
        }
    }

    fn approved(id: Id, student_id: Id, leave_type: LeaveType, reason: &str) -> LeaveRequest {
        LeaveRequest {
            id,
            student_id,
            parent_id: None,
            leave_type,
            reason: reason.into(),
            date_from: day(),
            date_to: day(),
            attachments: vec![],
            status: LeaveStatus::Approved,
            submitted_at: Utc::now(),
            decided_at: Some(Utc::now()),
            decided_by: Some("admin".into()),
            reject_reason: None,
        }
    }

    #[test]
    fn approved_leave_replaces_attendance() {
        let attendance = [mark(1, 10, AttendanceStatus::Present, Some((7, 40)))];
        let leaves = [approved(5, 10, LeaveType::Sick, "fever")];
        let rows = merge_daily(day(), &attendance, &leaves, &HashMap::new());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AttendanceStatus::Leave);
        assert_eq!(rows[0].id, RowId::Leave("leave-2025-06-02-5".into()));
        assert_eq!(rows[0].note, "sick");
        assert!(rows[0].time.is_none());
    }

    #[test]
    fn last_mark_of_the_day_wins() {
        let attendance = [
            mark(1, 10, AttendanceStatus::Present, Some((7, 40))),
            mark(2, 11, AttendanceStatus::Late, Some((8, 15))),
            mark(3, 10, AttendanceStatus::CheckedOut, Some((15, 30))),
        ];
        let names = HashMap::from([(10, "Somchai Jaidee".to_string())]);
        let rows = merge_daily(day(), &attendance, &[], &names);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].status, AttendanceStatus::CheckedOut);
        assert_eq!(rows[0].student_name, "Somchai Jaidee");
        assert_eq!(rows[1].student_name, "");
    }

    #[test]
    fn later_recorded_mark_wins_over_list_order() {
        // list order puts the timeless absent mark last; it was recorded first
        let mut absent = mark(1, 10, AttendanceStatus::Absent, None);
        absent.created_at = Utc::now() - chrono::Duration::minutes(5);
        let late = mark(2, 10, AttendanceStatus::Late, Some((8, 20)));
        let rows = merge_daily(day(), &[late, absent], &[], &HashMap::new());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, AttendanceStatus::Late);
        assert_eq!(rows[0].id, RowId::Attendance(2));
    }

    #[test]
    fn other_leave_uses_its_reason_as_note() {
        let rows = merge_daily(day(), &[], &[approved(8, 12, LeaveType::Other, "family trip")], &HashMap::new());
        assert_eq!(rows[0].note, "family trip");
    }

    #[test]
    fn classroom_parsing() {
        assert_eq!(parse_classroom(" P.1 / 2 "), Some(("P.1".into(), "2".into())));
        assert_eq!(parse_classroom("P.1"), None);
        assert_eq!(parse_classroom("/2"), None);
    }
}

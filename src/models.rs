use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Role;

pub type Id = i64;

/// Raised when a stored or submitted value is not one of an enumeration's variants.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown variant `{0}`")]
pub struct UnknownVariant(pub String);

/// Declares a closed set of wire values with `as_str` / `FromStr` / `TryFrom<String>`,
/// so the same text is used on the wire and in the database.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $text)] $variant),+
        }

        impl $name {
            pub const NAMES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self { $($name::$variant => $text),+ }
            }
        }

        impl std::str::FromStr for $name {
            type Err = UnknownVariant;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant(other.to_string())),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = UnknownVariant;
            fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(EducationLevel {
    Kindergarten => "kindergarten",
    Primary => "primary",
    Secondary => "secondary",
    AllLevels => "all_levels",
});

text_enum!(EducationStage {
    Kindergarten => "kindergarten",
    Primary => "primary",
    Secondary => "secondary",
});

text_enum!(StudentStatus {
    Active => "active",
    Suspended => "suspended",
    Left => "left",
    Graduated => "graduated",
});

text_enum!(HomeroomPosition {
    Main => "main",
    Secondary => "secondary",
});

text_enum!(HomeroomStatus {
    Active => "active",
    Terminated => "terminated",
    MainChanged => "main_changed",
    SecondaryChanged => "secondary_changed",
});

text_enum!(AttendanceStatus {
    Present => "present",
    CheckedOut => "checked_out",
    Late => "late",
    Absent => "absent",
    Leave => "leave",
    NotArrived => "not_arrived",
});

impl AttendanceStatus {
    /// Statuses recorded without a time of day.
    pub fn is_timeless(&self) -> bool {
        matches!(self, AttendanceStatus::Absent | AttendanceStatus::Leave | AttendanceStatus::NotArrived)
    }
}

text_enum!(LeaveType {
    Sick => "sick",
    Personal => "personal",
    Other => "other",
});

impl LeaveType {
    /// Note shown on the daily dashboard for an approved leave of this type.
    pub fn dashboard_note(&self) -> &'static str {
        match self {
            LeaveType::Sick => "sick",
            LeaveType::Personal => "personal business",
            LeaveType::Other => "",
        }
    }
}

text_enum!(LeaveStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

text_enum!(CalendarKindTag {
    Normal => "normal",
    Holiday => "holiday",
    Event => "event",
});

impl CalendarKindTag {
    /// Maps a route segment (`normals`, `holidays`, `events`) or a bare tag to a kind.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment.trim().to_ascii_lowercase().as_str() {
            "normals" | "normal" => Some(CalendarKindTag::Normal),
            "holidays" | "holiday" => Some(CalendarKindTag::Holiday),
            "events" | "event" => Some(CalendarKindTag::Event),
            _ => None,
        }
    }
}

/// `HH:MM` serde helpers for times of day.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%H:%M";

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&t.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::FORMAT;
        use chrono::NaiveTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<NaiveTime>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.serialize_some(&t.format(FORMAT).to_string()),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveTime>, D::Error> {
            match Option::<String>::deserialize(d)? {
                Some(raw) if !raw.trim().is_empty() => NaiveTime::parse_from_str(raw.trim(), FORMAT)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
                _ => Ok(None),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct School {
    pub id: Id,
    pub school_code: String,
    pub school_name: String,
    pub address: String,
    pub phone: String,
    #[sqlx(try_from = "String")]
    pub education_level: EducationLevel,
    pub teacher_code_digits: i32,
    pub student_code_digits: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSchool {
    pub school_code: String,
    pub school_name: String,
    pub address: String,
    pub phone: String,
    pub education_level: EducationLevel,
    pub teacher_code_digits: i32,
    pub student_code_digits: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Student {
    pub id: Id,
    pub student_code: String,
    pub national_id: String,
    pub prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    #[sqlx(try_from = "String")]
    pub education_stage: EducationStage,
    pub grade: String,
    pub room: String,
    pub address: String,
    pub phone: String,
    #[sqlx(try_from = "String")]
    pub status: StudentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    pub fn full_name(&self) -> String {
        join_name(&[&self.prefix, &self.first_name, &self.last_name])
    }

    pub fn in_class(&self, grade: &str, room: &str) -> bool {
        self.grade == grade && self.room == room
    }
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub student_code: String,
    pub national_id: String,
    pub prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub birth_date: Option<NaiveDate>,
    pub education_stage: EducationStage,
    pub grade: String,
    pub room: String,
    pub address: String,
    pub phone: String,
    pub status: StudentStatus,
}

/// Compact student projection used by teacher views and move details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentSummary {
    pub id: Id,
    pub code: String,
    pub full_name: String,
    pub grade: String,
    pub room: String,
}

impl From<&Student> for StudentSummary {
    fn from(s: &Student) -> Self {
        Self {
            id: s.id,
            code: s.student_code.clone(),
            full_name: s.full_name(),
            grade: s.grade.clone(),
            room: s.room.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Teacher {
    pub id: Id,
    pub teacher_code: String,
    pub prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
    pub position: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Teacher {
    pub fn full_name(&self) -> String {
        join_name(&[&self.prefix, &self.first_name, &self.last_name])
    }
}

#[derive(Debug, Clone)]
pub struct NewTeacher {
    pub teacher_code: String,
    pub prefix: String,
    pub first_name: String,
    pub last_name: String,
    pub phone: String,
    pub email: String,
    pub position: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Homeroom {
    pub id: Id,
    pub academic_year: String,
    #[sqlx(try_from = "String")]
    pub education_stage: EducationStage,
    pub grade: String,
    pub room: String,
    #[sqlx(try_from = "String")]
    pub position: HomeroomPosition,
    pub teacher_id: Id,
    #[sqlx(try_from = "String")]
    pub status: HomeroomStatus,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Homeroom {
    /// Same class slot and position, the tuple that must stay unique.
    pub fn same_slot(&self, new: &NewHomeroom) -> bool {
        self.academic_year == new.academic_year
            && self.education_stage == new.education_stage
            && self.grade == new.grade
            && self.room == new.room
            && self.position == new.position
    }
}

#[derive(Debug, Clone)]
pub struct NewHomeroom {
    pub academic_year: String,
    pub education_stage: EducationStage,
    pub grade: String,
    pub room: String,
    pub position: HomeroomPosition,
    pub teacher_id: Id,
    pub status: HomeroomStatus,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct HomeroomView {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub homeroom: Homeroom,
    pub teacher_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct StudentMove {
    pub id: Id,
    pub student_id: Id,
    pub from_year: String,
    pub from_grade: String,
    pub from_room: String,
    pub to_year: String,
    pub to_grade: String,
    pub to_room: String,
    pub move_date: NaiveDate,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSlot {
    pub grade: String,
    pub room: String,
}

#[derive(Debug, Clone)]
pub struct NewStudentMove {
    pub student_id: Id,
    pub from_year: String,
    /// `None` captures the student's current grade and room inside the write.
    pub from: Option<ClassSlot>,
    pub to_year: String,
    pub to: ClassSlot,
    pub move_date: NaiveDate,
    pub note: String,
}

#[derive(Debug, Clone, Default)]
pub struct MoveChanges {
    pub to_year: Option<String>,
    pub to_grade: Option<String>,
    pub to_room: Option<String>,
    pub move_date: Option<NaiveDate>,
    pub note: Option<String>,
}

impl MoveChanges {
    pub fn touches_student(&self) -> bool {
        self.to_grade.is_some() || self.to_room.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attendance {
    pub id: Id,
    pub student_id: Id,
    pub date: NaiveDate,
    #[serde(default, with = "hhmm::option")]
    pub time: Option<NaiveTime>,
    #[sqlx(try_from = "String")]
    pub status: AttendanceStatus,
    pub note: String,
    pub operator: String,
    pub retro: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub student_id: Id,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub status: AttendanceStatus,
    pub note: String,
    pub operator: String,
    pub retro: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LeaveRequest {
    pub id: Id,
    pub student_id: Id,
    pub parent_id: Option<Id>,
    #[serde(rename = "type")]
    #[sqlx(try_from = "String")]
    pub leave_type: LeaveType,
    pub reason: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub attachments: Vec<String>,
    #[sqlx(try_from = "String")]
    pub status: LeaveStatus,
    pub submitted_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decided_by: Option<String>,
    pub reject_reason: Option<String>,
}

impl LeaveRequest {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.date_from <= date && date <= self.date_to
    }
}

#[derive(Debug, Clone)]
pub struct NewLeaveRequest {
    pub student_id: Id,
    pub parent_id: Option<Id>,
    pub leave_type: LeaveType,
    pub reason: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LeaveDecision {
    pub status: LeaveStatus,
    pub decided_by: String,
    pub reject_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarKind {
    Normal {
        semester: String,
        academic_year: String,
        open_date: NaiveDate,
        close_date: NaiveDate,
        #[serde(with = "hhmm")]
        time_in: NaiveTime,
        #[serde(with = "hhmm")]
        time_out: NaiveTime,
    },
    Holiday {
        name: String,
        start_date: NaiveDate,
        #[serde(default)]
        end_date: Option<NaiveDate>,
    },
    Event {
        title: String,
        date: NaiveDate,
        #[serde(default, with = "hhmm::option")]
        start_time: Option<NaiveTime>,
        #[serde(default, with = "hhmm::option")]
        end_time: Option<NaiveTime>,
    },
}

impl CalendarKind {
    pub fn tag(&self) -> CalendarKindTag {
        match self {
            CalendarKind::Normal { .. } => CalendarKindTag::Normal,
            CalendarKind::Holiday { .. } => CalendarKindTag::Holiday,
            CalendarKind::Event { .. } => CalendarKindTag::Event,
        }
    }

    /// Date listings are ordered by.
    pub fn sort_date(&self) -> NaiveDate {
        match self {
            CalendarKind::Normal { open_date, .. } => *open_date,
            CalendarKind::Holiday { start_date, .. } => *start_date,
            CalendarKind::Event { date, .. } => *date,
        }
    }

    /// Holiday name when this is a holiday whose range contains `date`.
    pub fn holiday_on(&self, date: NaiveDate) -> Option<&str> {
        match self {
            CalendarKind::Holiday { name, start_date, end_date } => {
                let end = end_date.unwrap_or(*start_date);
                (*start_date <= date && date <= end).then_some(name.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarItem {
    pub id: Id,
    #[serde(flatten)]
    pub kind: CalendarKind,
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCalendarItem {
    pub kind: CalendarKind,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub username: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    #[sqlx(try_from = "String")]
    pub role: Role,
    pub teacher_id: Option<Id>,
    pub email: String,
    pub phone: String,
    pub timezone: String,
    pub locale: String,
    pub enabled: bool,
    pub force_password_change: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub last_password_change: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub teacher_id: Option<Id>,
    pub email: String,
    pub phone: String,
    pub force_password_change: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub timezone: Option<String>,
    pub locale: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AccountFlags {
    pub enabled: Option<bool>,
    pub force_password_change: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Parent {
    pub id: Id,
    pub email: String,
    pub phone: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub name: String,
    pub pdpa_ok: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewParent {
    pub email: String,
    pub phone: String,
    pub password_hash: String,
    pub name: String,
    pub pdpa_ok: bool,
}

/// One page of a listing plus the total row count before paging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub page: i64,
    pub size: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchoolCounts {
    pub students: i64,
    pub teachers: i64,
    pub homerooms: i64,
    pub pending_leaves: i64,
}

fn join_name(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::auth::Role;
use crate::models::*;

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

#[derive(thiserror::Error, Debug)]
pub enum RepoError {
    #[error("not found")] NotFound,
    /// Uniqueness rule violated; carries the client-facing code.
    #[error("conflict: {0}")] Conflict(&'static str),
    #[error("storage: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

pub const SCHOOL_EXISTS: &str = "EXISTS";
pub const STUDENT_CODE_EXISTS: &str = "STUDENT_CODE_EXISTS";
pub const DUP_CODE_OR_EMAIL: &str = "DUP_CODE_OR_EMAIL";
pub const DUP_CLASS_POSITION: &str = "DUP_CLASS_POSITION";
pub const TEACHER_ALREADY_MAIN: &str = "TEACHER_ALREADY_MAIN";
pub const USERNAME_TAKEN: &str = "USERNAME_TAKEN";
pub const TEACHER_ALREADY_HAS_ACCOUNT: &str = "TEACHER_ALREADY_HAS_ACCOUNT";
pub const EMAIL_EXISTS: &str = "EMAIL_EXISTS";

#[derive(Debug, Clone, Default)]
pub struct StudentQuery {
    pub q: Option<String>,
    pub grade: Option<String>,
    pub room: Option<String>,
    pub status: Option<StudentStatus>,
    pub page: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct StudentSummaryQuery {
    pub q: Option<String>,
    pub grade: Option<String>,
    pub room: Option<String>,
    pub limit: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TeacherQuery {
    pub q: Option<String>,
    pub page: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct HomeroomQuery {
    pub q: Option<String>,
    pub academic_year: Option<String>,
    pub teacher_id: Option<Id>,
    pub page: i64,
    pub size: i64,
}

#[derive(Debug, Clone, Default)]
pub struct MoveQuery {
    pub from_year: Option<String>,
    pub from_grade: Option<String>,
    pub from_room: Option<String>,
    pub to_year: Option<String>,
    pub to_grade: Option<String>,
    pub to_room: Option<String>,
    pub q: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Default)]
pub struct AttendanceQuery {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub student_id: Option<Id>,
    pub statuses: Vec<AttendanceStatus>,
    pub grade: Option<String>,
    pub room: Option<String>,
    pub q: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct LeaveQuery {
    pub status: Option<LeaveStatus>,
    pub leave_type: Option<LeaveType>,
    pub student_id: Option<Id>,
    pub parent_id: Option<Id>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub q: Option<String>,
    pub page: i64,
    pub size: i64,
}

pub(crate) fn offset_of(page: i64, size: i64) -> i64 {
    (page.max(1) - 1).saturating_mul(size.max(0))
}

/// Lower-cased, trimmed search needle; `None` when blank.
pub(crate) fn needle(q: &Option<String>) -> Option<String> {
    q.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_lowercase)
}

#[async_trait]
pub trait SchoolRepo: Send + Sync {
    async fn get_school(&self) -> RepoResult<School>;
    async fn create_school(&self, new: NewSchool) -> RepoResult<School>;
    async fn update_school(&self, upd: NewSchool) -> RepoResult<School>;
    async fn delete_school(&self) -> RepoResult<()>;
}

#[async_trait]
pub trait StudentRepo: Send + Sync {
    async fn list_students(&self, q: &StudentQuery) -> RepoResult<Page<Student>>;
    async fn get_student(&self, id: Id) -> RepoResult<Student>;
    async fn find_students(&self, ids: &[Id]) -> RepoResult<Vec<Student>>;
    async fn create_student(&self, new: NewStudent) -> RepoResult<Student>;
    async fn update_student(&self, id: Id, upd: NewStudent) -> RepoResult<Student>;
    async fn delete_student(&self, id: Id) -> RepoResult<()>;
    /// All rows or none.
    async fn import_students(&self, rows: Vec<NewStudent>) -> RepoResult<usize>;
    async fn student_codes_in_use(&self, codes: &[String]) -> RepoResult<HashSet<String>>;
    async fn summarize_students(&self, q: &StudentSummaryQuery) -> RepoResult<Vec<Student>>;
    async fn count_students(&self) -> RepoResult<i64>;
}

#[async_trait]
pub trait TeacherRepo: Send + Sync {
    async fn list_teachers(&self, q: &TeacherQuery) -> RepoResult<Page<Teacher>>;
    async fn get_teacher(&self, id: Id) -> RepoResult<Teacher>;
    async fn find_teacher_by_code(&self, code: &str) -> RepoResult<Option<Teacher>>;
    async fn find_teachers(&self, ids: &[Id]) -> RepoResult<Vec<Teacher>>;
    async fn create_teacher(&self, new: NewTeacher) -> RepoResult<Teacher>;
    async fn update_teacher(&self, id: Id, upd: NewTeacher) -> RepoResult<Teacher>;
    async fn set_teacher_phone(&self, id: Id, phone: &str) -> RepoResult<()>;
    async fn delete_teacher(&self, id: Id) -> RepoResult<()>;
    /// All rows or none.
    async fn import_teachers(&self, rows: Vec<NewTeacher>) -> RepoResult<usize>;
    /// Which of the given codes and (lower-cased) emails already belong to a teacher.
    async fn teacher_keys_in_use(&self, codes: &[String], emails: &[String]) -> RepoResult<(HashSet<String>, HashSet<String>)>;
    async fn count_teachers(&self) -> RepoResult<i64>;
}

#[async_trait]
pub trait HomeroomRepo: Send + Sync {
    async fn list_homerooms(&self, q: &HomeroomQuery) -> RepoResult<Page<HomeroomView>>;
    async fn get_homeroom(&self, id: Id) -> RepoResult<Homeroom>;
    /// Fails with `DUP_CLASS_POSITION` or `TEACHER_ALREADY_MAIN`.
    async fn create_homeroom(&self, new: NewHomeroom) -> RepoResult<Homeroom>;
    async fn update_homeroom(&self, id: Id, upd: NewHomeroom) -> RepoResult<Homeroom>;
    async fn delete_homeroom(&self, id: Id) -> RepoResult<()>;
    async fn homerooms_for_teacher(&self, teacher_id: Id) -> RepoResult<Vec<Homeroom>>;
    async fn count_homerooms(&self) -> RepoResult<i64>;
}

#[async_trait]
pub trait MoveRepo: Send + Sync {
    async fn list_moves(&self, q: &MoveQuery) -> RepoResult<(Vec<StudentMove>, i64)>;
    async fn get_move(&self, id: Id) -> RepoResult<StudentMove>;
    /// Inserts every audit row and relocates every student in one transaction.
    async fn record_moves(&self, moves: Vec<NewStudentMove>) -> RepoResult<Vec<(StudentMove, Student)>>;
    /// The student is returned when the destination class changed.
    async fn update_move(&self, id: Id, changes: MoveChanges) -> RepoResult<(StudentMove, Option<Student>)>;
    async fn delete_move(&self, id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait CalendarRepo: Send + Sync {
    async fn list_calendar(&self, kind: Option<CalendarKindTag>) -> RepoResult<Vec<CalendarItem>>;
    async fn get_calendar(&self, id: Id) -> RepoResult<CalendarItem>;
    async fn create_calendar(&self, new: NewCalendarItem) -> RepoResult<CalendarItem>;
    async fn update_calendar(&self, id: Id, upd: NewCalendarItem) -> RepoResult<CalendarItem>;
    async fn delete_calendar(&self, id: Id) -> RepoResult<()>;
    async fn holiday_on(&self, date: NaiveDate) -> RepoResult<Option<CalendarItem>>;
}

#[async_trait]
pub trait AttendanceRepo: Send + Sync {
    /// Ordered by date, time, id.
    async fn list_attendance(&self, q: &AttendanceQuery) -> RepoResult<Vec<Attendance>>;
    async fn record_attendance(&self, new: NewAttendance) -> RepoResult<Attendance>;
}

#[async_trait]
pub trait LeaveRepo: Send + Sync {
    async fn list_leaves(&self, q: &LeaveQuery) -> RepoResult<Page<LeaveRequest>>;
    async fn get_leave(&self, id: Id) -> RepoResult<LeaveRequest>;
    async fn create_leave(&self, new: NewLeaveRequest) -> RepoResult<LeaveRequest>;
    async fn decide_leave(&self, id: Id, decision: LeaveDecision) -> RepoResult<LeaveRequest>;
    async fn count_pending_leaves(&self) -> RepoResult<i64>;
    async fn approved_leaves_on(&self, date: NaiveDate) -> RepoResult<Vec<LeaveRequest>>;
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<User>>;
    async fn get_user(&self, id: Id) -> RepoResult<User>;
    /// Fails with `USERNAME_TAKEN` or `TEACHER_ALREADY_HAS_ACCOUNT`.
    async fn create_user(&self, new: NewUser) -> RepoResult<User>;
    async fn count_users_with_role(&self, role: Role) -> RepoResult<i64>;
    async fn list_users_with_role(&self, role: Role) -> RepoResult<Vec<User>>;
    async fn user_for_teacher(&self, teacher_id: Id) -> RepoResult<Option<User>>;
    async fn set_password(&self, id: Id, password_hash: String, force_change: bool) -> RepoResult<User>;
    async fn set_account_flags(&self, id: Id, flags: AccountFlags) -> RepoResult<User>;
    async fn record_login(&self, id: Id) -> RepoResult<()>;
    async fn update_profile(&self, id: Id, changes: ProfileChanges) -> RepoResult<User>;
}

#[async_trait]
pub trait ParentRepo: Send + Sync {
    async fn find_parent_by_email(&self, email: &str) -> RepoResult<Option<Parent>>;
    async fn get_parent(&self, id: Id) -> RepoResult<Parent>;
    /// Fails with `EMAIL_EXISTS`.
    async fn create_parent(&self, new: NewParent) -> RepoResult<Parent>;
}

pub trait Repo:
    SchoolRepo + StudentRepo + TeacherRepo + HomeroomRepo + MoveRepo + CalendarRepo + AttendanceRepo + LeaveRepo + UserRepo + ParentRepo
{
}

impl<T> Repo for T where
    T: SchoolRepo + StudentRepo + TeacherRepo + HomeroomRepo + MoveRepo + CalendarRepo + AttendanceRepo + LeaveRepo + UserRepo + ParentRepo
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_saturate_on_huge_pages() {
        assert_eq!(offset_of(1, 20), 0);
        assert_eq!(offset_of(3, 20), 40);
        assert_eq!(offset_of(i64::MAX, 100), i64::MAX);
    }
}

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};

use super::*;
use crate::auth::Role;
use crate::validation::contains_ci;

#[derive(Default, Clone)]
struct State {
    school: Option<School>,
    students: BTreeMap<Id, Student>,
    teachers: BTreeMap<Id, Teacher>,
    homerooms: BTreeMap<Id, Homeroom>,
    moves: BTreeMap<Id, StudentMove>,
    calendar: BTreeMap<Id, CalendarItem>,
    attendance: BTreeMap<Id, Attendance>,
    leaves: BTreeMap<Id, LeaveRequest>,
    users: BTreeMap<Id, User>,
    parents: BTreeMap<Id, Parent>,
    next_id: Id,
}

impl State {
    fn next_id(&mut self) -> Id {
        self.next_id += 1;
        self.next_id
    }

    fn student_code_taken(&self, code: &str, except: Option<Id>) -> bool {
        self.students.values().any(|s| s.student_code == code && Some(s.id) != except)
    }

    fn teacher_key_taken(&self, code: &str, email: &str, except: Option<Id>) -> bool {
        let email = email.to_lowercase();
        self.teachers.values().any(|t| {
            Some(t.id) != except && (t.teacher_code == code || t.email.to_lowercase() == email)
        })
    }

    fn insert_student(&mut self, new: NewStudent) -> RepoResult<Student> {
        if self.student_code_taken(&new.student_code, None) {
            return Err(RepoError::Conflict(STUDENT_CODE_EXISTS));
        }
        let now = Utc::now();
        let id = self.next_id();
        let student = Student {
            id,
            student_code: new.student_code,
            national_id: new.national_id,
            prefix: new.prefix,
            first_name: new.first_name,
            last_name: new.last_name,
            birth_date: new.birth_date,
            education_stage: new.education_stage,
            grade: new.grade,
            room: new.room,
            address: new.address,
            phone: new.phone,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        self.students.insert(id, student.clone());
        Ok(student)
    }

    fn insert_teacher(&mut self, new: NewTeacher) -> RepoResult<Teacher> {
        if self.teacher_key_taken(&new.teacher_code, &new.email, None) {
            return Err(RepoError::Conflict(DUP_CODE_OR_EMAIL));
        }
        let now = Utc::now();
        let id = self.next_id();
        let teacher = Teacher {
            id,
            teacher_code: new.teacher_code,
            prefix: new.prefix,
            first_name: new.first_name,
            last_name: new.last_name,
            phone: new.phone,
            email: new.email,
            position: new.position,
            created_at: now,
            updated_at: now,
        };
        self.teachers.insert(id, teacher.clone());
        Ok(teacher)
    }

    /// Both homeroom uniqueness rules, evaluated against every row except `except`.
    fn check_homeroom(&self, new: &NewHomeroom, except: Option<Id>) -> RepoResult<()> {
        let others = || self.homerooms.values().filter(move |h| Some(h.id) != except);
        if others().any(|h| h.same_slot(new)) {
            return Err(RepoError::Conflict(DUP_CLASS_POSITION));
        }
        if new.position == HomeroomPosition::Main
            && others().any(|h| h.teacher_id == new.teacher_id && h.position == HomeroomPosition::Main)
        {
            return Err(RepoError::Conflict(TEACHER_ALREADY_MAIN));
        }
        Ok(())
    }

    fn student(&self, id: Id) -> Option<&Student> {
        self.students.get(&id)
    }
}

#[derive(Clone, Default)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
    fail_student_write: Arc<AtomicBool>,
}

impl InMemRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next student relocation inside a move fail after its audit row
    /// was written, so callers can observe the rollback.
    pub fn fail_next_student_write(&self) {
        self.fail_student_write.store(true, Ordering::SeqCst);
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| RepoError::Internal("state lock poisoned".into()))
    }

    /// Applies `f` to a working copy and swaps it in only when `f` succeeds.
    fn transact<T>(&self, f: impl FnOnce(&mut State) -> RepoResult<T>) -> RepoResult<T> {
        let mut guard = self.write()?;
        let mut work = guard.clone();
        let out = f(&mut work)?;
        *guard = work;
        Ok(out)
    }
}

fn paginate<T>(rows: Vec<T>, page: i64, size: i64) -> Page<T> {
    let total = rows.len() as i64;
    let data = rows
        .into_iter()
        .skip(offset_of(page, size) as usize)
        .take(size.max(0) as usize)
        .collect();
    Page { data, page, size, total }
}

fn eq_opt(filter: &Option<String>, value: &str) -> bool {
    match filter.as_deref().map(str::trim) {
        Some(f) if !f.is_empty() => f == value,
        _ => true,
    }
}

#[async_trait]
impl SchoolRepo for InMemRepo {
    async fn get_school(&self) -> RepoResult<School> {
        self.read()?.school.clone().ok_or(RepoError::NotFound)
    }

    async fn create_school(&self, new: NewSchool) -> RepoResult<School> {
        let mut s = self.write()?;
        if s.school.is_some() {
            return Err(RepoError::Conflict(SCHOOL_EXISTS));
        }
        let now = Utc::now();
        let id = s.next_id();
        let school = School {
            id,
            school_code: new.school_code,
            school_name: new.school_name,
            address: new.address,
            phone: new.phone,
            education_level: new.education_level,
            teacher_code_digits: new.teacher_code_digits,
            student_code_digits: new.student_code_digits,
            created_at: now,
            updated_at: now,
        };
        s.school = Some(school.clone());
        Ok(school)
    }

    async fn update_school(&self, upd: NewSchool) -> RepoResult<School> {
        let mut s = self.write()?;
        let school = s.school.as_mut().ok_or(RepoError::NotFound)?;
        school.school_code = upd.school_code;
        school.school_name = upd.school_name;
        school.address = upd.address;
        school.phone = upd.phone;
        school.education_level = upd.education_level;
        school.teacher_code_digits = upd.teacher_code_digits;
        school.student_code_digits = upd.student_code_digits;
        school.updated_at = Utc::now();
        Ok(school.clone())
    }

    async fn delete_school(&self) -> RepoResult<()> {
        self.write()?.school.take().map(|_| ()).ok_or(RepoError::NotFound)
    }
}

#[async_trait]
impl StudentRepo for InMemRepo {
    async fn list_students(&self, q: &StudentQuery) -> RepoResult<Page<Student>> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let rows: Vec<Student> = s
            .students
            .values()
            .rev()
            .filter(|st| {
                needle.as_deref().map_or(true, |n| {
                    contains_ci(&st.student_code, n) || contains_ci(&st.first_name, n) || contains_ci(&st.last_name, n)
                })
            })
            .filter(|st| eq_opt(&q.grade, &st.grade) && eq_opt(&q.room, &st.room))
            .filter(|st| q.status.map_or(true, |status| st.status == status))
            .cloned()
            .collect();
        Ok(paginate(rows, q.page, q.size))
    }

    async fn get_student(&self, id: Id) -> RepoResult<Student> {
        self.read()?.students.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_students(&self, ids: &[Id]) -> RepoResult<Vec<Student>> {
        let s = self.read()?;
        Ok(ids.iter().filter_map(|id| s.students.get(id).cloned()).collect())
    }

    async fn create_student(&self, new: NewStudent) -> RepoResult<Student> {
        self.write()?.insert_student(new)
    }

    async fn update_student(&self, id: Id, upd: NewStudent) -> RepoResult<Student> {
        let mut s = self.write()?;
        if !s.students.contains_key(&id) {
            return Err(RepoError::NotFound);
        }
        if s.student_code_taken(&upd.student_code, Some(id)) {
            return Err(RepoError::Conflict(STUDENT_CODE_EXISTS));
        }
        let st = s.students.get_mut(&id).ok_or(RepoError::NotFound)?;
        st.student_code = upd.student_code;
        st.national_id = upd.national_id;
        st.prefix = upd.prefix;
        st.first_name = upd.first_name;
        st.last_name = upd.last_name;
        st.birth_date = upd.birth_date;
        st.education_stage = upd.education_stage;
        st.grade = upd.grade;
        st.room = upd.room;
        st.address = upd.address;
        st.phone = upd.phone;
        st.status = upd.status;
        st.updated_at = Utc::now();
        Ok(st.clone())
    }

    async fn delete_student(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        s.students.remove(&id).ok_or(RepoError::NotFound)?;
        // mirrors the ON DELETE CASCADE rules of the schema
        s.moves.retain(|_, m| m.student_id != id);
        s.attendance.retain(|_, a| a.student_id != id);
        s.leaves.retain(|_, l| l.student_id != id);
        Ok(())
    }

    async fn import_students(&self, rows: Vec<NewStudent>) -> RepoResult<usize> {
        self.transact(|s| {
            let n = rows.len();
            for row in rows {
                s.insert_student(row)?;
            }
            Ok(n)
        })
    }

    async fn student_codes_in_use(&self, codes: &[String]) -> RepoResult<HashSet<String>> {
        let s = self.read()?;
        Ok(codes.iter().filter(|c| s.student_code_taken(c, None)).cloned().collect())
    }

    async fn summarize_students(&self, q: &StudentSummaryQuery) -> RepoResult<Vec<Student>> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let mut rows: Vec<Student> = s
            .students
            .values()
            .filter(|st| {
                needle.as_deref().map_or(true, |n| {
                    contains_ci(&st.student_code, n) || contains_ci(&st.full_name(), n)
                })
            })
            .filter(|st| eq_opt(&q.grade, &st.grade) && eq_opt(&q.room, &st.room))
            .cloned()
            .collect();
        rows.sort_by(|a, b| (&a.grade, &a.room, &a.student_code).cmp(&(&b.grade, &b.room, &b.student_code)));
        rows.truncate(q.limit.max(0) as usize);
        Ok(rows)
    }

    async fn count_students(&self) -> RepoResult<i64> {
        Ok(self.read()?.students.len() as i64)
    }
}

#[async_trait]
impl TeacherRepo for InMemRepo {
    async fn list_teachers(&self, q: &TeacherQuery) -> RepoResult<Page<Teacher>> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let rows: Vec<Teacher> = s
            .teachers
            .values()
            .rev()
            .filter(|t| {
                needle.as_deref().map_or(true, |n| {
                    [&t.teacher_code, &t.prefix, &t.first_name, &t.last_name, &t.position, &t.email]
                        .iter()
                        .any(|field| contains_ci(field, n))
                })
            })
            .cloned()
            .collect();
        Ok(paginate(rows, q.page, q.size))
    }

    async fn get_teacher(&self, id: Id) -> RepoResult<Teacher> {
        self.read()?.teachers.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_teacher_by_code(&self, code: &str) -> RepoResult<Option<Teacher>> {
        Ok(self.read()?.teachers.values().find(|t| t.teacher_code == code).cloned())
    }

    async fn find_teachers(&self, ids: &[Id]) -> RepoResult<Vec<Teacher>> {
        let s = self.read()?;
        Ok(ids.iter().filter_map(|id| s.teachers.get(id).cloned()).collect())
    }

    async fn create_teacher(&self, new: NewTeacher) -> RepoResult<Teacher> {
        self.write()?.insert_teacher(new)
    }

    async fn update_teacher(&self, id: Id, upd: NewTeacher) -> RepoResult<Teacher> {
        let mut s = self.write()?;
        if !s.teachers.contains_key(&id) {
            return Err(RepoError::NotFound);
        }
        if s.teacher_key_taken(&upd.teacher_code, &upd.email, Some(id)) {
            return Err(RepoError::Conflict(DUP_CODE_OR_EMAIL));
        }
        let t = s.teachers.get_mut(&id).ok_or(RepoError::NotFound)?;
        t.teacher_code = upd.teacher_code;
        t.prefix = upd.prefix;
        t.first_name = upd.first_name;
        t.last_name = upd.last_name;
        t.phone = upd.phone;
        t.email = upd.email;
        t.position = upd.position;
        t.updated_at = Utc::now();
        Ok(t.clone())
    }

    async fn set_teacher_phone(&self, id: Id, phone: &str) -> RepoResult<()> {
        let mut s = self.write()?;
        let t = s.teachers.get_mut(&id).ok_or(RepoError::NotFound)?;
        t.phone = phone.to_string();
        t.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_teacher(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        s.teachers.remove(&id).ok_or(RepoError::NotFound)?;
        s.homerooms.retain(|_, h| h.teacher_id != id);
        for u in s.users.values_mut().filter(|u| u.teacher_id == Some(id)) {
            u.teacher_id = None;
        }
        Ok(())
    }

    async fn import_teachers(&self, rows: Vec<NewTeacher>) -> RepoResult<usize> {
        self.transact(|s| {
            let n = rows.len();
            for row in rows {
                s.insert_teacher(row)?;
            }
            Ok(n)
        })
    }

    async fn teacher_keys_in_use(&self, codes: &[String], emails: &[String]) -> RepoResult<(HashSet<String>, HashSet<String>)> {
        let s = self.read()?;
        let known_codes: HashSet<&str> = s.teachers.values().map(|t| t.teacher_code.as_str()).collect();
        let known_emails: HashSet<String> = s.teachers.values().map(|t| t.email.to_lowercase()).collect();
        let codes = codes.iter().filter(|c| known_codes.contains(c.as_str())).cloned().collect();
        let emails = emails
            .iter()
            .map(|e| e.to_lowercase())
            .filter(|e| known_emails.contains(e))
            .collect();
        Ok((codes, emails))
    }

    async fn count_teachers(&self) -> RepoResult<i64> {
        Ok(self.read()?.teachers.len() as i64)
    }
}

#[async_trait]
impl HomeroomRepo for InMemRepo {
    async fn list_homerooms(&self, q: &HomeroomQuery) -> RepoResult<Page<HomeroomView>> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let rows: Vec<HomeroomView> = s
            .homerooms
            .values()
            .rev()
            .map(|h| HomeroomView {
                homeroom: h.clone(),
                teacher_name: s.teachers.get(&h.teacher_id).map(Teacher::full_name).unwrap_or_default(),
            })
            .filter(|v| {
                needle.as_deref().map_or(true, |n| {
                    let h = &v.homeroom;
                    [&h.academic_year, &h.grade, &h.room, &h.note, &v.teacher_name]
                        .iter()
                        .any(|field| contains_ci(field, n))
                })
            })
            .filter(|v| eq_opt(&q.academic_year, &v.homeroom.academic_year))
            .filter(|v| q.teacher_id.map_or(true, |t| v.homeroom.teacher_id == t))
            .collect();
        Ok(paginate(rows, q.page, q.size))
    }

    async fn get_homeroom(&self, id: Id) -> RepoResult<Homeroom> {
        self.read()?.homerooms.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_homeroom(&self, new: NewHomeroom) -> RepoResult<Homeroom> {
        let mut s = self.write()?;
        s.check_homeroom(&new, None)?;
        let now = Utc::now();
        let id = s.next_id();
        let h = Homeroom {
            id,
            academic_year: new.academic_year,
            education_stage: new.education_stage,
            grade: new.grade,
            room: new.room,
            position: new.position,
            teacher_id: new.teacher_id,
            status: new.status,
            note: new.note,
            created_at: now,
            updated_at: now,
        };
        s.homerooms.insert(id, h.clone());
        Ok(h)
    }

    async fn update_homeroom(&self, id: Id, upd: NewHomeroom) -> RepoResult<Homeroom> {
        let mut s = self.write()?;
        if !s.homerooms.contains_key(&id) {
            return Err(RepoError::NotFound);
        }
        s.check_homeroom(&upd, Some(id))?;
        let h = s.homerooms.get_mut(&id).ok_or(RepoError::NotFound)?;
        h.academic_year = upd.academic_year;
        h.education_stage = upd.education_stage;
        h.grade = upd.grade;
        h.room = upd.room;
        h.position = upd.position;
        h.teacher_id = upd.teacher_id;
        h.status = upd.status;
        h.note = upd.note;
        h.updated_at = Utc::now();
        Ok(h.clone())
    }

    async fn delete_homeroom(&self, id: Id) -> RepoResult<()> {
        self.write()?.homerooms.remove(&id).map(|_| ()).ok_or(RepoError::NotFound)
    }

    async fn homerooms_for_teacher(&self, teacher_id: Id) -> RepoResult<Vec<Homeroom>> {
        let s = self.read()?;
        Ok(s.homerooms.values().rev().filter(|h| h.teacher_id == teacher_id).cloned().collect())
    }

    async fn count_homerooms(&self) -> RepoResult<i64> {
        Ok(self.read()?.homerooms.len() as i64)
    }
}

#[async_trait]
impl MoveRepo for InMemRepo {
    async fn list_moves(&self, q: &MoveQuery) -> RepoResult<(Vec<StudentMove>, i64)> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let rows: Vec<StudentMove> = s
            .moves
            .values()
            .rev()
            .filter(|m| {
                eq_opt(&q.from_year, &m.from_year)
                    && eq_opt(&q.from_grade, &m.from_grade)
                    && eq_opt(&q.from_room, &m.from_room)
                    && eq_opt(&q.to_year, &m.to_year)
                    && eq_opt(&q.to_grade, &m.to_grade)
                    && eq_opt(&q.to_room, &m.to_room)
            })
            .filter(|m| {
                needle.as_deref().map_or(true, |n| {
                    contains_ci(&m.note, n)
                        || s.student(m.student_id).map_or(false, |st| {
                            contains_ci(&st.student_code, n) || contains_ci(&st.full_name(), n)
                        })
                })
            })
            .cloned()
            .collect();
        let total = rows.len() as i64;
        let page = rows.into_iter().skip(q.offset.max(0) as usize).take(q.limit.max(0) as usize).collect();
        Ok((page, total))
    }

    async fn get_move(&self, id: Id) -> RepoResult<StudentMove> {
        self.read()?.moves.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn record_moves(&self, moves: Vec<NewStudentMove>) -> RepoResult<Vec<(StudentMove, Student)>> {
        let fault = &self.fail_student_write;
        self.transact(|s| {
            let mut out = Vec::with_capacity(moves.len());
            let now = Utc::now();
            for mv in moves {
                let current = s.student(mv.student_id).cloned().ok_or(RepoError::NotFound)?;
                let from = mv.from.unwrap_or(ClassSlot { grade: current.grade.clone(), room: current.room.clone() });
                let id = s.next_id();
                let record = StudentMove {
                    id,
                    student_id: mv.student_id,
                    from_year: mv.from_year,
                    from_grade: from.grade,
                    from_room: from.room,
                    to_year: mv.to_year,
                    to_grade: mv.to.grade.clone(),
                    to_room: mv.to.room.clone(),
                    move_date: mv.move_date,
                    note: mv.note,
                    created_at: now,
                };
                s.moves.insert(id, record.clone());

                if fault.swap(false, Ordering::SeqCst) {
                    return Err(RepoError::Internal("student relocation failed".into()));
                }
                let st = s.students.get_mut(&mv.student_id).ok_or(RepoError::NotFound)?;
                st.grade = mv.to.grade;
                st.room = mv.to.room;
                st.updated_at = now;
                out.push((record, st.clone()));
            }
            Ok(out)
        })
    }

    async fn update_move(&self, id: Id, changes: MoveChanges) -> RepoResult<(StudentMove, Option<Student>)> {
        self.transact(|s| {
            let rec = s.moves.get_mut(&id).ok_or(RepoError::NotFound)?;
            if let Some(v) = changes.to_year.clone() { rec.to_year = v; }
            if let Some(v) = changes.to_grade.clone() { rec.to_grade = v; }
            if let Some(v) = changes.to_room.clone() { rec.to_room = v; }
            if let Some(v) = changes.move_date { rec.move_date = v; }
            if let Some(v) = changes.note.clone() { rec.note = v; }
            let rec = rec.clone();
            if !changes.touches_student() {
                return Ok((rec, None));
            }
            let st = s.students.get_mut(&rec.student_id).ok_or(RepoError::NotFound)?;
            st.grade = rec.to_grade.clone();
            st.room = rec.to_room.clone();
            st.updated_at = Utc::now();
            Ok((rec, Some(st.clone())))
        })
    }

    async fn delete_move(&self, id: Id) -> RepoResult<()> {
        self.write()?.moves.remove(&id).map(|_| ()).ok_or(RepoError::NotFound)
    }
}

#[async_trait]
impl CalendarRepo for InMemRepo {
    async fn list_calendar(&self, kind: Option<CalendarKindTag>) -> RepoResult<Vec<CalendarItem>> {
        let s = self.read()?;
        let mut rows: Vec<CalendarItem> = s
            .calendar
            .values()
            .filter(|c| kind.map_or(true, |k| c.kind.tag() == k))
            .cloned()
            .collect();
        rows.sort_by_key(|c| (c.kind.sort_date(), c.id));
        Ok(rows)
    }

    async fn get_calendar(&self, id: Id) -> RepoResult<CalendarItem> {
        self.read()?.calendar.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_calendar(&self, new: NewCalendarItem) -> RepoResult<CalendarItem> {
        let mut s = self.write()?;
        let now = Utc::now();
        let id = s.next_id();
        let item = CalendarItem { id, kind: new.kind, note: new.note, created_at: now, updated_at: now };
        s.calendar.insert(id, item.clone());
        Ok(item)
    }

    async fn update_calendar(&self, id: Id, upd: NewCalendarItem) -> RepoResult<CalendarItem> {
        let mut s = self.write()?;
        let item = s.calendar.get_mut(&id).ok_or(RepoError::NotFound)?;
        item.kind = upd.kind;
        item.note = upd.note;
        item.updated_at = Utc::now();
        Ok(item.clone())
    }

    async fn delete_calendar(&self, id: Id) -> RepoResult<()> {
        self.write()?.calendar.remove(&id).map(|_| ()).ok_or(RepoError::NotFound)
    }

    async fn holiday_on(&self, date: NaiveDate) -> RepoResult<Option<CalendarItem>> {
        let s = self.read()?;
        Ok(s.calendar.values().find(|c| c.kind.holiday_on(date).is_some()).cloned())
    }
}

#[async_trait]
impl AttendanceRepo for InMemRepo {
    async fn list_attendance(&self, q: &AttendanceQuery) -> RepoResult<Vec<Attendance>> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let joins_student = needle.is_some() || q.grade.is_some() || q.room.is_some();
        let mut rows: Vec<Attendance> = s
            .attendance
            .values()
            .filter(|a| q.start.map_or(true, |d| a.date >= d) && q.end.map_or(true, |d| a.date <= d))
            .filter(|a| q.student_id.map_or(true, |id| a.student_id == id))
            .filter(|a| q.statuses.is_empty() || q.statuses.contains(&a.status))
            .filter(|a| {
                if !joins_student {
                    return true;
                }
                let Some(st) = s.student(a.student_id) else { return false };
                eq_opt(&q.grade, &st.grade)
                    && eq_opt(&q.room, &st.room)
                    && needle.as_deref().map_or(true, |n| {
                        contains_ci(&st.student_code, n) || contains_ci(&st.first_name, n) || contains_ci(&st.last_name, n)
                    })
            })
            .cloned()
            .collect();
        // timeless rows sort after timed ones on the same date
        rows.sort_by_key(|a| (a.date, a.time.is_none(), a.time, a.id));
        Ok(rows)
    }

    async fn record_attendance(&self, new: NewAttendance) -> RepoResult<Attendance> {
        let mut s = self.write()?;
        let id = s.next_id();
        let row = Attendance {
            id,
            student_id: new.student_id,
            date: new.date,
            time: new.time,
            status: new.status,
            note: new.note,
            operator: new.operator,
            retro: new.retro,
            created_at: Utc::now(),
        };
        s.attendance.insert(id, row.clone());
        Ok(row)
    }
}

#[async_trait]
impl LeaveRepo for InMemRepo {
    async fn list_leaves(&self, q: &LeaveQuery) -> RepoResult<Page<LeaveRequest>> {
        let s = self.read()?;
        let needle = needle(&q.q);
        let mut rows: Vec<LeaveRequest> = s
            .leaves
            .values()
            .filter(|l| q.status.map_or(true, |v| l.status == v))
            .filter(|l| q.leave_type.map_or(true, |v| l.leave_type == v))
            .filter(|l| q.student_id.map_or(true, |v| l.student_id == v))
            .filter(|l| q.parent_id.map_or(true, |v| l.parent_id == Some(v)))
            .filter(|l| q.from.map_or(true, |d| l.date_to >= d) && q.to.map_or(true, |d| l.date_from <= d))
            .filter(|l| needle.as_deref().map_or(true, |n| contains_ci(&l.reason, n)))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then(b.id.cmp(&a.id)));
        Ok(paginate(rows, q.page, q.size))
    }

    async fn get_leave(&self, id: Id) -> RepoResult<LeaveRequest> {
        self.read()?.leaves.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_leave(&self, new: NewLeaveRequest) -> RepoResult<LeaveRequest> {
        let mut s = self.write()?;
        let id = s.next_id();
        let leave = LeaveRequest {
            id,
            student_id: new.student_id,
            parent_id: new.parent_id,
            leave_type: new.leave_type,
            reason: new.reason,
            date_from: new.date_from,
            date_to: new.date_to,
            attachments: new.attachments,
            status: LeaveStatus::Pending,
            submitted_at: Utc::now(),
            decided_at: None,
            decided_by: None,
            reject_reason: None,
        };
        s.leaves.insert(id, leave.clone());
        Ok(leave)
    }

    async fn decide_leave(&self, id: Id, decision: LeaveDecision) -> RepoResult<LeaveRequest> {
        let mut s = self.write()?;
        let leave = s.leaves.get_mut(&id).ok_or(RepoError::NotFound)?;
        if leave.status != LeaveStatus::Pending {
            return Err(RepoError::Conflict("LEAVE_ALREADY_DECIDED"));
        }
        leave.status = decision.status;
        leave.decided_at = Some(Utc::now());
        leave.decided_by = Some(decision.decided_by);
        leave.reject_reason = decision.reject_reason;
        Ok(leave.clone())
    }

    async fn count_pending_leaves(&self) -> RepoResult<i64> {
        Ok(self.read()?.leaves.values().filter(|l| l.status == LeaveStatus::Pending).count() as i64)
    }

    async fn approved_leaves_on(&self, date: NaiveDate) -> RepoResult<Vec<LeaveRequest>> {
        let s = self.read()?;
        Ok(s.leaves
            .values()
            .filter(|l| l.status == LeaveStatus::Approved && l.covers(date))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UserRepo for InMemRepo {
    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        Ok(self.read()?.users.values().find(|u| u.username == username).cloned())
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        self.read()?.users.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_user(&self, new: NewUser) -> RepoResult<User> {
        let mut s = self.write()?;
        if s.users.values().any(|u| u.username == new.username) {
            return Err(RepoError::Conflict(USERNAME_TAKEN));
        }
        if let Some(tid) = new.teacher_id {
            if s.users.values().any(|u| u.teacher_id == Some(tid)) {
                return Err(RepoError::Conflict(TEACHER_ALREADY_HAS_ACCOUNT));
            }
        }
        let now = Utc::now();
        let id = s.next_id();
        let user = User {
            id,
            username: new.username,
            password_hash: new.password_hash,
            role: new.role,
            teacher_id: new.teacher_id,
            email: new.email,
            phone: new.phone,
            timezone: String::new(),
            locale: String::new(),
            enabled: true,
            force_password_change: new.force_password_change,
            last_login: None,
            last_password_change: None,
            created_at: now,
            updated_at: now,
        };
        s.users.insert(id, user.clone());
        Ok(user)
    }

    async fn count_users_with_role(&self, role: Role) -> RepoResult<i64> {
        Ok(self.read()?.users.values().filter(|u| u.role == role).count() as i64)
    }

    async fn list_users_with_role(&self, role: Role) -> RepoResult<Vec<User>> {
        Ok(self.read()?.users.values().filter(|u| u.role == role).cloned().collect())
    }

    async fn user_for_teacher(&self, teacher_id: Id) -> RepoResult<Option<User>> {
        Ok(self.read()?.users.values().find(|u| u.teacher_id == Some(teacher_id)).cloned())
    }

    async fn set_password(&self, id: Id, password_hash: String, force_change: bool) -> RepoResult<User> {
        let mut s = self.write()?;
        let u = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        let now = Utc::now();
        u.password_hash = password_hash;
        u.force_password_change = force_change;
        u.last_password_change = Some(now);
        u.updated_at = now;
        Ok(u.clone())
    }

    async fn set_account_flags(&self, id: Id, flags: AccountFlags) -> RepoResult<User> {
        let mut s = self.write()?;
        let u = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        if let Some(v) = flags.enabled { u.enabled = v; }
        if let Some(v) = flags.force_password_change { u.force_password_change = v; }
        u.updated_at = Utc::now();
        Ok(u.clone())
    }

    async fn record_login(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        let u = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        u.last_login = Some(Utc::now());
        Ok(())
    }

    async fn update_profile(&self, id: Id, changes: ProfileChanges) -> RepoResult<User> {
        let mut s = self.write()?;
        let u = s.users.get_mut(&id).ok_or(RepoError::NotFound)?;
        if let Some(v) = changes.email { u.email = v; }
        if let Some(v) = changes.phone { u.phone = v; }
        if let Some(v) = changes.timezone { u.timezone = v; }
        if let Some(v) = changes.locale { u.locale = v; }
        u.updated_at = Utc::now();
        Ok(u.clone())
    }
}

#[async_trait]
impl ParentRepo for InMemRepo {
    async fn find_parent_by_email(&self, email: &str) -> RepoResult<Option<Parent>> {
        let email = email.to_lowercase();
        Ok(self.read()?.parents.values().find(|p| p.email == email).cloned())
    }

    async fn get_parent(&self, id: Id) -> RepoResult<Parent> {
        self.read()?.parents.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_parent(&self, new: NewParent) -> RepoResult<Parent> {
        let mut s = self.write()?;
        let email = new.email.to_lowercase();
        if s.parents.values().any(|p| p.email == email) {
            return Err(RepoError::Conflict(EMAIL_EXISTS));
        }
        let id = s.next_id();
        let parent = Parent {
            id,
            email,
            phone: new.phone,
            password_hash: new.password_hash,
            name: new.name,
            pdpa_ok: new.pdpa_ok,
            created_at: Utc::now(),
        };
        s.parents.insert(id, parent.clone());
        Ok(parent)
    }
}

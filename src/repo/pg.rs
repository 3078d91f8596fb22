use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::{Pool, Postgres, QueryBuilder};

use super::*;
use crate::auth::Role;

const STUDENT_COLS: &str = "id, student_code, national_id, prefix, first_name, last_name, birth_date, \
    education_stage, grade, room, address, phone, status, created_at, updated_at";
const TEACHER_COLS: &str = "id, teacher_code, prefix, first_name, last_name, phone, email, position, created_at, updated_at";
const HOMEROOM_COLS: &str = "h.id, h.academic_year, h.education_stage, h.grade, h.room, h.position, h.teacher_id, \
    h.status, h.note, h.created_at, h.updated_at";
const MOVE_COLS: &str = "m.id, m.student_id, m.from_year, m.from_grade, m.from_room, m.to_year, m.to_grade, m.to_room, \
    m.move_date, m.note, m.created_at";
const CALENDAR_COLS: &str = "id, kind, semester, academic_year, open_date, close_date, time_in, time_out, name, \
    start_date, end_date, title, event_date, start_time, end_time, note, created_at, updated_at";
const ATTENDANCE_COLS: &str = "a.id, a.student_id, a.date, a.time, a.status, a.note, a.operator, a.retro, a.created_at";
const LEAVE_COLS: &str = "id, student_id, parent_id, leave_type, reason, date_from, date_to, attachments, status, \
    submitted_at, decided_at, decided_by, reject_reason";
const USER_COLS: &str = "id, username, password_hash, role, teacher_id, email, phone, timezone, locale, enabled, \
    force_password_change, last_login, last_password_change, created_at, updated_at";
const PARENT_COLS: &str = "id, email, phone, password_hash, name, pdpa_ok, created_at";
const SCHOOL_COLS: &str = "id, school_code, school_name, address, phone, education_level, teacher_code_digits, \
    student_code_digits, created_at, updated_at";

/// Translate driver errors; unique-index names map onto client conflict codes.
fn db_err(e: sqlx::Error) -> RepoError {
    match &e {
        sqlx::Error::RowNotFound => RepoError::NotFound,
        sqlx::Error::Database(db) if db.is_unique_violation() => match db.constraint() {
            Some("homerooms_class_position_key") => RepoError::Conflict(DUP_CLASS_POSITION),
            Some("homerooms_one_main_per_teacher") => RepoError::Conflict(TEACHER_ALREADY_MAIN),
            Some("students_student_code_key") => RepoError::Conflict(STUDENT_CODE_EXISTS),
            Some("teachers_teacher_code_key") | Some("teachers_email_key") => RepoError::Conflict(DUP_CODE_OR_EMAIL),
            Some("users_username_key") => RepoError::Conflict(USERNAME_TAKEN),
            Some("users_teacher_id_key") => RepoError::Conflict(TEACHER_ALREADY_HAS_ACCOUNT),
            Some("parents_email_key") => RepoError::Conflict(EMAIL_EXISTS),
            _ => RepoError::Conflict("CONFLICT"),
        },
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepoError::NotFound,
        _ => RepoError::Internal(e.to_string()),
    }
}

fn affected(rows: u64) -> RepoResult<()> {
    if rows == 0 { Err(RepoError::NotFound) } else { Ok(()) }
}

fn push_eq(qb: &mut QueryBuilder<'_, Postgres>, column: &str, value: &Option<String>) {
    if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        qb.push(format!(" AND {column} = ")).push_bind(v.to_string());
    }
}

/// Substring pattern for `ILIKE ... ESCAPE '\'`; LIKE metacharacters match literally.
fn contains_pattern(needle: &str) -> String {
    let mut out = String::with_capacity(needle.len() + 2);
    out.push('%');
    for c in needle.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

/// `AND (c1 ILIKE p OR c2 ILIKE p ...)` for a non-blank needle.
fn push_search(qb: &mut QueryBuilder<'_, Postgres>, columns: &[&str], q: &Option<String>) {
    let Some(n) = needle(q) else { return };
    let pattern = contains_pattern(&n);
    qb.push(" AND (");
    for (i, col) in columns.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push(format!("{col} ILIKE ")).push_bind(pattern.clone()).push(" ESCAPE '\\'");
    }
    qb.push(")");
}

#[derive(Clone)]
pub struct PgRepo { pool: Pool<Postgres> }

impl PgRepo {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> RepoResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| RepoError::Internal(format!("migration failed: {e}")))
    }

    async fn count(&self, sql: &str) -> RepoResult<i64> {
        sqlx::query_scalar::<_, i64>(sql).fetch_one(&self.pool).await.map_err(db_err)
    }
}

#[async_trait]
impl SchoolRepo for PgRepo {
    async fn get_school(&self) -> RepoResult<School> {
        sqlx::query_as::<_, School>(&format!("SELECT {SCHOOL_COLS} FROM schools ORDER BY id LIMIT 1"))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)
    }

    async fn create_school(&self, new: NewSchool) -> RepoResult<School> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("LOCK TABLE schools IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM schools)")
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists {
            return Err(RepoError::Conflict(SCHOOL_EXISTS));
        }
        let school = sqlx::query_as::<_, School>(&format!(
            "INSERT INTO schools (school_code, school_name, address, phone, education_level, teacher_code_digits, student_code_digits) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {SCHOOL_COLS}"
        ))
        .bind(&new.school_code)
        .bind(&new.school_name)
        .bind(&new.address)
        .bind(&new.phone)
        .bind(new.education_level.as_str())
        .bind(new.teacher_code_digits)
        .bind(new.student_code_digits)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(school)
    }

    async fn update_school(&self, upd: NewSchool) -> RepoResult<School> {
        sqlx::query_as::<_, School>(&format!(
            "UPDATE schools SET school_code=$1, school_name=$2, address=$3, phone=$4, education_level=$5, \
             teacher_code_digits=$6, student_code_digits=$7, updated_at=now() \
             WHERE id = (SELECT id FROM schools ORDER BY id LIMIT 1) RETURNING {SCHOOL_COLS}"
        ))
        .bind(&upd.school_code)
        .bind(&upd.school_name)
        .bind(&upd.address)
        .bind(&upd.phone)
        .bind(upd.education_level.as_str())
        .bind(upd.teacher_code_digits)
        .bind(upd.student_code_digits)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(RepoError::NotFound)
    }

    async fn delete_school(&self) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM schools WHERE id = (SELECT id FROM schools ORDER BY id LIMIT 1)")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        affected(res.rows_affected())
    }
}

fn push_student_filters(qb: &mut QueryBuilder<'_, Postgres>, q: &StudentQuery) {
    push_search(qb, &["student_code", "first_name", "last_name"], &q.q);
    push_eq(qb, "grade", &q.grade);
    push_eq(qb, "room", &q.room);
    if let Some(status) = q.status {
        qb.push(" AND status = ").push_bind(status.as_str());
    }
}

async fn insert_student<'c, E>(exec: E, new: &NewStudent) -> RepoResult<Student>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Student>(&format!(
        "INSERT INTO students (student_code, national_id, prefix, first_name, last_name, birth_date, education_stage, \
         grade, room, address, phone, status) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12) RETURNING {STUDENT_COLS}"
    ))
    .bind(&new.student_code)
    .bind(&new.national_id)
    .bind(&new.prefix)
    .bind(&new.first_name)
    .bind(&new.last_name)
    .bind(new.birth_date)
    .bind(new.education_stage.as_str())
    .bind(&new.grade)
    .bind(&new.room)
    .bind(&new.address)
    .bind(&new.phone)
    .bind(new.status.as_str())
    .fetch_one(exec)
    .await
    .map_err(db_err)
}

#[async_trait]
impl StudentRepo for PgRepo {
    async fn list_students(&self, q: &StudentQuery) -> RepoResult<Page<Student>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM students WHERE TRUE");
        push_student_filters(&mut count, q);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await.map_err(db_err)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {STUDENT_COLS} FROM students WHERE TRUE"));
        push_student_filters(&mut qb, q);
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(q.size).push(" OFFSET ").push_bind(offset_of(q.page, q.size));
        let data = qb.build_query_as::<Student>().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(Page { data, page: q.page, size: q.size, total })
    }

    async fn get_student(&self, id: Id) -> RepoResult<Student> {
        sqlx::query_as::<_, Student>(&format!("SELECT {STUDENT_COLS} FROM students WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn find_students(&self, ids: &[Id]) -> RepoResult<Vec<Student>> {
        sqlx::query_as::<_, Student>(&format!("SELECT {STUDENT_COLS} FROM students WHERE id = ANY($1) ORDER BY id"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_student(&self, new: NewStudent) -> RepoResult<Student> {
        insert_student(&self.pool, &new).await
    }

    async fn update_student(&self, id: Id, upd: NewStudent) -> RepoResult<Student> {
        sqlx::query_as::<_, Student>(&format!(
            "UPDATE students SET student_code=$2, national_id=$3, prefix=$4, first_name=$5, last_name=$6, birth_date=$7, \
             education_stage=$8, grade=$9, room=$10, address=$11, phone=$12, status=$13, updated_at=now() \
             WHERE id=$1 RETURNING {STUDENT_COLS}"
        ))
        .bind(id)
        .bind(&upd.student_code)
        .bind(&upd.national_id)
        .bind(&upd.prefix)
        .bind(&upd.first_name)
        .bind(&upd.last_name)
        .bind(upd.birth_date)
        .bind(upd.education_stage.as_str())
        .bind(&upd.grade)
        .bind(&upd.room)
        .bind(&upd.address)
        .bind(&upd.phone)
        .bind(upd.status.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn delete_student(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM students WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        affected(res.rows_affected())
    }

    async fn import_students(&self, rows: Vec<NewStudent>) -> RepoResult<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in &rows {
            insert_student(&mut *tx, row).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len())
    }

    async fn student_codes_in_use(&self, codes: &[String]) -> RepoResult<HashSet<String>> {
        let taken: Vec<String> = sqlx::query_scalar("SELECT student_code FROM students WHERE student_code = ANY($1)")
            .bind(codes)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(taken.into_iter().collect())
    }

    async fn summarize_students(&self, q: &StudentSummaryQuery) -> RepoResult<Vec<Student>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {STUDENT_COLS} FROM students WHERE TRUE"));
        push_search(
            &mut qb,
            &["student_code", "CONCAT_WS(' ', prefix, first_name, last_name)"],
            &q.q,
        );
        push_eq(&mut qb, "grade", &q.grade);
        push_eq(&mut qb, "room", &q.room);
        qb.push(" ORDER BY grade, room, student_code LIMIT ").push_bind(q.limit);
        qb.build_query_as::<Student>().fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn count_students(&self) -> RepoResult<i64> {
        self.count("SELECT COUNT(*) FROM students").await
    }
}

async fn insert_teacher<'c, E>(exec: E, new: &NewTeacher) -> RepoResult<Teacher>
where
    E: sqlx::Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, Teacher>(&format!(
        "INSERT INTO teachers (teacher_code, prefix, first_name, last_name, phone, email, position) \
         VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {TEACHER_COLS}"
    ))
    .bind(&new.teacher_code)
    .bind(&new.prefix)
    .bind(&new.first_name)
    .bind(&new.last_name)
    .bind(&new.phone)
    .bind(&new.email)
    .bind(&new.position)
    .fetch_one(exec)
    .await
    .map_err(db_err)
}

#[async_trait]
impl TeacherRepo for PgRepo {
    async fn list_teachers(&self, q: &TeacherQuery) -> RepoResult<Page<Teacher>> {
        const SEARCH: &[&str] = &["teacher_code", "prefix", "first_name", "last_name", "position", "email"];
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM teachers WHERE TRUE");
        push_search(&mut count, SEARCH, &q.q);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await.map_err(db_err)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {TEACHER_COLS} FROM teachers WHERE TRUE"));
        push_search(&mut qb, SEARCH, &q.q);
        qb.push(" ORDER BY id DESC LIMIT ").push_bind(q.size).push(" OFFSET ").push_bind(offset_of(q.page, q.size));
        let data = qb.build_query_as::<Teacher>().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(Page { data, page: q.page, size: q.size, total })
    }

    async fn get_teacher(&self, id: Id) -> RepoResult<Teacher> {
        sqlx::query_as::<_, Teacher>(&format!("SELECT {TEACHER_COLS} FROM teachers WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn find_teacher_by_code(&self, code: &str) -> RepoResult<Option<Teacher>> {
        sqlx::query_as::<_, Teacher>(&format!("SELECT {TEACHER_COLS} FROM teachers WHERE teacher_code = $1"))
            .bind(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn find_teachers(&self, ids: &[Id]) -> RepoResult<Vec<Teacher>> {
        sqlx::query_as::<_, Teacher>(&format!("SELECT {TEACHER_COLS} FROM teachers WHERE id = ANY($1) ORDER BY id"))
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_teacher(&self, new: NewTeacher) -> RepoResult<Teacher> {
        insert_teacher(&self.pool, &new).await
    }

    async fn update_teacher(&self, id: Id, upd: NewTeacher) -> RepoResult<Teacher> {
        sqlx::query_as::<_, Teacher>(&format!(
            "UPDATE teachers SET teacher_code=$2, prefix=$3, first_name=$4, last_name=$5, phone=$6, email=$7, position=$8, \
             updated_at=now() WHERE id=$1 RETURNING {TEACHER_COLS}"
        ))
        .bind(id)
        .bind(&upd.teacher_code)
        .bind(&upd.prefix)
        .bind(&upd.first_name)
        .bind(&upd.last_name)
        .bind(&upd.phone)
        .bind(&upd.email)
        .bind(&upd.position)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_teacher_phone(&self, id: Id, phone: &str) -> RepoResult<()> {
        let res = sqlx::query("UPDATE teachers SET phone=$2, updated_at=now() WHERE id=$1")
            .bind(id)
            .bind(phone)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        affected(res.rows_affected())
    }

    async fn delete_teacher(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM teachers WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        affected(res.rows_affected())
    }

    async fn import_teachers(&self, rows: Vec<NewTeacher>) -> RepoResult<usize> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for row in &rows {
            insert_teacher(&mut *tx, row).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(rows.len())
    }

    async fn teacher_keys_in_use(&self, codes: &[String], emails: &[String]) -> RepoResult<(HashSet<String>, HashSet<String>)> {
        let lowered: Vec<String> = emails.iter().map(|e| e.to_lowercase()).collect();
        let taken_codes: Vec<String> = sqlx::query_scalar("SELECT teacher_code FROM teachers WHERE teacher_code = ANY($1)")
            .bind(codes)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let taken_emails: Vec<String> = sqlx::query_scalar("SELECT lower(email) FROM teachers WHERE lower(email) = ANY($1)")
            .bind(&lowered)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok((taken_codes.into_iter().collect(), taken_emails.into_iter().collect()))
    }

    async fn count_teachers(&self) -> RepoResult<i64> {
        self.count("SELECT COUNT(*) FROM teachers").await
    }
}

fn push_homeroom_filters(qb: &mut QueryBuilder<'_, Postgres>, q: &HomeroomQuery) {
    push_search(
        qb,
        &["h.academic_year", "h.grade", "h.room", "h.note", "CONCAT_WS(' ', t.prefix, t.first_name, t.last_name)"],
        &q.q,
    );
    push_eq(qb, "h.academic_year", &q.academic_year);
    if let Some(tid) = q.teacher_id {
        qb.push(" AND h.teacher_id = ").push_bind(tid);
    }
}

#[async_trait]
impl HomeroomRepo for PgRepo {
    async fn list_homerooms(&self, q: &HomeroomQuery) -> RepoResult<Page<HomeroomView>> {
        const FROM: &str = " FROM homerooms h LEFT JOIN teachers t ON t.id = h.teacher_id WHERE TRUE";
        let mut count = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*){FROM}"));
        push_homeroom_filters(&mut count, q);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await.map_err(db_err)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {HOMEROOM_COLS}, \
             COALESCE(CONCAT_WS(' ', NULLIF(t.prefix, ''), NULLIF(t.first_name, ''), NULLIF(t.last_name, '')), '') AS teacher_name{FROM}"
        ));
        push_homeroom_filters(&mut qb, q);
        qb.push(" ORDER BY h.id DESC LIMIT ").push_bind(q.size).push(" OFFSET ").push_bind(offset_of(q.page, q.size));
        let data = qb.build_query_as::<HomeroomView>().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(Page { data, page: q.page, size: q.size, total })
    }

    async fn get_homeroom(&self, id: Id) -> RepoResult<Homeroom> {
        sqlx::query_as::<_, Homeroom>(&format!("SELECT {HOMEROOM_COLS} FROM homerooms h WHERE h.id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_homeroom(&self, new: NewHomeroom) -> RepoResult<Homeroom> {
        sqlx::query_as::<_, Homeroom>(&format!(
            "INSERT INTO homerooms AS h (academic_year, education_stage, grade, room, position, teacher_id, status, note) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8) RETURNING {HOMEROOM_COLS}"
        ))
        .bind(&new.academic_year)
        .bind(new.education_stage.as_str())
        .bind(&new.grade)
        .bind(&new.room)
        .bind(new.position.as_str())
        .bind(new.teacher_id)
        .bind(new.status.as_str())
        .bind(&new.note)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update_homeroom(&self, id: Id, upd: NewHomeroom) -> RepoResult<Homeroom> {
        sqlx::query_as::<_, Homeroom>(&format!(
            "UPDATE homerooms AS h SET academic_year=$2, education_stage=$3, grade=$4, room=$5, position=$6, \
             teacher_id=$7, status=$8, note=$9, updated_at=now() WHERE h.id=$1 RETURNING {HOMEROOM_COLS}"
        ))
        .bind(id)
        .bind(&upd.academic_year)
        .bind(upd.education_stage.as_str())
        .bind(&upd.grade)
        .bind(&upd.room)
        .bind(upd.position.as_str())
        .bind(upd.teacher_id)
        .bind(upd.status.as_str())
        .bind(&upd.note)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn delete_homeroom(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM homerooms WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        affected(res.rows_affected())
    }

    async fn homerooms_for_teacher(&self, teacher_id: Id) -> RepoResult<Vec<Homeroom>> {
        sqlx::query_as::<_, Homeroom>(&format!(
            "SELECT {HOMEROOM_COLS} FROM homerooms h WHERE h.teacher_id = $1 ORDER BY h.id DESC"
        ))
        .bind(teacher_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn count_homerooms(&self) -> RepoResult<i64> {
        self.count("SELECT COUNT(*) FROM homerooms").await
    }
}

fn push_move_filters(qb: &mut QueryBuilder<'_, Postgres>, q: &MoveQuery) {
    push_eq(qb, "m.from_year", &q.from_year);
    push_eq(qb, "m.from_grade", &q.from_grade);
    push_eq(qb, "m.from_room", &q.from_room);
    push_eq(qb, "m.to_year", &q.to_year);
    push_eq(qb, "m.to_grade", &q.to_grade);
    push_eq(qb, "m.to_room", &q.to_room);
    push_search(
        qb,
        &["m.note", "s.student_code", "CONCAT_WS(' ', s.prefix, s.first_name, s.last_name)"],
        &q.q,
    );
}

#[async_trait]
impl MoveRepo for PgRepo {
    async fn list_moves(&self, q: &MoveQuery) -> RepoResult<(Vec<StudentMove>, i64)> {
        const FROM: &str = " FROM student_moves m LEFT JOIN students s ON s.id = m.student_id WHERE TRUE";
        let mut count = QueryBuilder::<Postgres>::new(format!("SELECT COUNT(*){FROM}"));
        push_move_filters(&mut count, q);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await.map_err(db_err)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {MOVE_COLS}{FROM}"));
        push_move_filters(&mut qb, q);
        qb.push(" ORDER BY m.id DESC LIMIT ").push_bind(q.limit).push(" OFFSET ").push_bind(q.offset);
        let rows = qb.build_query_as::<StudentMove>().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok((rows, total))
    }

    async fn get_move(&self, id: Id) -> RepoResult<StudentMove> {
        sqlx::query_as::<_, StudentMove>(&format!("SELECT {MOVE_COLS} FROM student_moves m WHERE m.id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn record_moves(&self, moves: Vec<NewStudentMove>) -> RepoResult<Vec<(StudentMove, Student)>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut out = Vec::with_capacity(moves.len());
        for mv in moves {
            let current = sqlx::query_as::<_, Student>(&format!(
                "SELECT {STUDENT_COLS} FROM students WHERE id = $1 FOR UPDATE"
            ))
            .bind(mv.student_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or(RepoError::NotFound)?;
            let from = mv.from.unwrap_or(ClassSlot { grade: current.grade, room: current.room });

            let record = sqlx::query_as::<_, StudentMove>(&format!(
                "INSERT INTO student_moves AS m (student_id, from_year, from_grade, from_room, to_year, to_grade, to_room, \
                 move_date, note) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9) RETURNING {MOVE_COLS}"
            ))
            .bind(mv.student_id)
            .bind(&mv.from_year)
            .bind(&from.grade)
            .bind(&from.room)
            .bind(&mv.to_year)
            .bind(&mv.to.grade)
            .bind(&mv.to.room)
            .bind(mv.move_date)
            .bind(&mv.note)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;

            let student = sqlx::query_as::<_, Student>(&format!(
                "UPDATE students SET grade=$2, room=$3, updated_at=now() WHERE id=$1 RETURNING {STUDENT_COLS}"
            ))
            .bind(mv.student_id)
            .bind(&mv.to.grade)
            .bind(&mv.to.room)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            out.push((record, student));
        }
        tx.commit().await.map_err(db_err)?;
        Ok(out)
    }

    async fn update_move(&self, id: Id, changes: MoveChanges) -> RepoResult<(StudentMove, Option<Student>)> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let record = sqlx::query_as::<_, StudentMove>(&format!(
            "UPDATE student_moves AS m SET to_year=COALESCE($2, to_year), to_grade=COALESCE($3, to_grade), \
             to_room=COALESCE($4, to_room), move_date=COALESCE($5, move_date), note=COALESCE($6, note) \
             WHERE m.id=$1 RETURNING {MOVE_COLS}"
        ))
        .bind(id)
        .bind(changes.to_year.as_ref())
        .bind(changes.to_grade.as_ref())
        .bind(changes.to_room.as_ref())
        .bind(changes.move_date)
        .bind(changes.note.as_ref())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        let student = if changes.touches_student() {
            let st = sqlx::query_as::<_, Student>(&format!(
                "UPDATE students SET grade=$2, room=$3, updated_at=now() WHERE id=$1 RETURNING {STUDENT_COLS}"
            ))
            .bind(record.student_id)
            .bind(&record.to_grade)
            .bind(&record.to_room)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
            Some(st)
        } else {
            None
        };
        tx.commit().await.map_err(db_err)?;
        Ok((record, student))
    }

    async fn delete_move(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM student_moves WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        affected(res.rows_affected())
    }
}

/// One `calendar_items` row; variant columns are nullable.
#[derive(sqlx::FromRow)]
struct CalendarRow {
    id: Id,
    kind: String,
    semester: Option<String>,
    academic_year: Option<String>,
    open_date: Option<NaiveDate>,
    close_date: Option<NaiveDate>,
    time_in: Option<NaiveTime>,
    time_out: Option<NaiveTime>,
    name: Option<String>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    title: Option<String>,
    event_date: Option<NaiveDate>,
    start_time: Option<NaiveTime>,
    end_time: Option<NaiveTime>,
    note: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CalendarRow {
    fn into_item(self) -> RepoResult<CalendarItem> {
        let id = self.id;
        let missing = |col: &str| RepoError::Internal(format!("calendar item {id} lacks {col}"));
        let tag: CalendarKindTag = self.kind.parse().map_err(|e| RepoError::Internal(format!("calendar item {id}: {e}")))?;
        let kind = match tag {
            CalendarKindTag::Normal => CalendarKind::Normal {
                semester: self.semester.ok_or_else(|| missing("semester"))?,
                academic_year: self.academic_year.ok_or_else(|| missing("academic_year"))?,
                open_date: self.open_date.ok_or_else(|| missing("open_date"))?,
                close_date: self.close_date.ok_or_else(|| missing("close_date"))?,
                time_in: self.time_in.ok_or_else(|| missing("time_in"))?,
                time_out: self.time_out.ok_or_else(|| missing("time_out"))?,
            },
            CalendarKindTag::Holiday => CalendarKind::Holiday {
                name: self.name.ok_or_else(|| missing("name"))?,
                start_date: self.start_date.ok_or_else(|| missing("start_date"))?,
                end_date: self.end_date,
            },
            CalendarKindTag::Event => CalendarKind::Event {
                title: self.title.ok_or_else(|| missing("title"))?,
                date: self.event_date.ok_or_else(|| missing("event_date"))?,
                start_time: self.start_time,
                end_time: self.end_time,
            },
        };
        Ok(CalendarItem { id, kind, note: self.note, created_at: self.created_at, updated_at: self.updated_at })
    }
}

/// Column values for one variant, every other variant's columns left NULL.
#[derive(Default)]
struct CalendarColumns {
    semester: Option<String>,
    academic_year: Option<String>,
    open_date: Option<NaiveDate>,
    close_date: Option<NaiveDate>,
    time_in: Option<NaiveTime>,
    time_out: Option<NaiveTime>,
    name: Option<String>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    title: Option<String>,
    event_date: Option<NaiveDate>,
    start_time: Option<NaiveTime>,
    end_time: Option<NaiveTime>,
}

impl From<&CalendarKind> for CalendarColumns {
    fn from(kind: &CalendarKind) -> Self {
        match kind.clone() {
            CalendarKind::Normal { semester, academic_year, open_date, close_date, time_in, time_out } => CalendarColumns {
                semester: Some(semester),
                academic_year: Some(academic_year),
                open_date: Some(open_date),
                close_date: Some(close_date),
                time_in: Some(time_in),
                time_out: Some(time_out),
                ..Default::default()
            },
            CalendarKind::Holiday { name, start_date, end_date } => CalendarColumns {
                name: Some(name),
                start_date: Some(start_date),
                end_date,
                ..Default::default()
            },
            CalendarKind::Event { title, date, start_time, end_time } => CalendarColumns {
                title: Some(title),
                event_date: Some(date),
                start_time,
                end_time,
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl CalendarRepo for PgRepo {
    async fn list_calendar(&self, kind: Option<CalendarKindTag>) -> RepoResult<Vec<CalendarItem>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {CALENDAR_COLS} FROM calendar_items WHERE TRUE"));
        if let Some(k) = kind {
            qb.push(" AND kind = ").push_bind(k.as_str());
        }
        qb.push(" ORDER BY COALESCE(open_date, start_date, event_date), id");
        let rows = qb.build_query_as::<CalendarRow>().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter().map(CalendarRow::into_item).collect()
    }

    async fn get_calendar(&self, id: Id) -> RepoResult<CalendarItem> {
        sqlx::query_as::<_, CalendarRow>(&format!("SELECT {CALENDAR_COLS} FROM calendar_items WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .into_item()
    }

    async fn create_calendar(&self, new: NewCalendarItem) -> RepoResult<CalendarItem> {
        let c = CalendarColumns::from(&new.kind);
        sqlx::query_as::<_, CalendarRow>(&format!(
            "INSERT INTO calendar_items (kind, semester, academic_year, open_date, close_date, time_in, time_out, name, \
             start_date, end_date, title, event_date, start_time, end_time, note) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15) RETURNING {CALENDAR_COLS}"
        ))
        .bind(new.kind.tag().as_str())
        .bind(c.semester)
        .bind(c.academic_year)
        .bind(c.open_date)
        .bind(c.close_date)
        .bind(c.time_in)
        .bind(c.time_out)
        .bind(c.name)
        .bind(c.start_date)
        .bind(c.end_date)
        .bind(c.title)
        .bind(c.event_date)
        .bind(c.start_time)
        .bind(c.end_time)
        .bind(&new.note)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .into_item()
    }

    async fn update_calendar(&self, id: Id, upd: NewCalendarItem) -> RepoResult<CalendarItem> {
        let c = CalendarColumns::from(&upd.kind);
        sqlx::query_as::<_, CalendarRow>(&format!(
            "UPDATE calendar_items SET kind=$2, semester=$3, academic_year=$4, open_date=$5, close_date=$6, time_in=$7, \
             time_out=$8, name=$9, start_date=$10, end_date=$11, title=$12, event_date=$13, start_time=$14, end_time=$15, \
             note=$16, updated_at=now() WHERE id=$1 RETURNING {CALENDAR_COLS}"
        ))
        .bind(id)
        .bind(upd.kind.tag().as_str())
        .bind(c.semester)
        .bind(c.academic_year)
        .bind(c.open_date)
        .bind(c.close_date)
        .bind(c.time_in)
        .bind(c.time_out)
        .bind(c.name)
        .bind(c.start_date)
        .bind(c.end_date)
        .bind(c.title)
        .bind(c.event_date)
        .bind(c.start_time)
        .bind(c.end_time)
        .bind(&upd.note)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .into_item()
    }

    async fn delete_calendar(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("DELETE FROM calendar_items WHERE id = $1").bind(id).execute(&self.pool).await.map_err(db_err)?;
        affected(res.rows_affected())
    }

    async fn holiday_on(&self, date: NaiveDate) -> RepoResult<Option<CalendarItem>> {
        sqlx::query_as::<_, CalendarRow>(&format!(
            "SELECT {CALENDAR_COLS} FROM calendar_items WHERE kind = 'holiday' \
             AND start_date <= $1 AND COALESCE(end_date, start_date) >= $1 ORDER BY start_date, id LIMIT 1"
        ))
        .bind(date)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(CalendarRow::into_item)
        .transpose()
    }
}

#[async_trait]
impl AttendanceRepo for PgRepo {
    async fn list_attendance(&self, q: &AttendanceQuery) -> RepoResult<Vec<Attendance>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ATTENDANCE_COLS} FROM attendance a JOIN students s ON s.id = a.student_id WHERE TRUE"
        ));
        if let Some(d) = q.start {
            qb.push(" AND a.date >= ").push_bind(d);
        }
        if let Some(d) = q.end {
            qb.push(" AND a.date <= ").push_bind(d);
        }
        if let Some(id) = q.student_id {
            qb.push(" AND a.student_id = ").push_bind(id);
        }
        if !q.statuses.is_empty() {
            let statuses: Vec<String> = q.statuses.iter().map(|s| s.as_str().to_string()).collect();
            qb.push(" AND a.status = ANY(").push_bind(statuses).push(")");
        }
        push_eq(&mut qb, "s.grade", &q.grade);
        push_eq(&mut qb, "s.room", &q.room);
        push_search(&mut qb, &["s.student_code", "s.first_name", "s.last_name"], &q.q);
        qb.push(" ORDER BY a.date, a.time ASC NULLS LAST, a.id");
        qb.build_query_as::<Attendance>().fetch_all(&self.pool).await.map_err(db_err)
    }

    async fn record_attendance(&self, new: NewAttendance) -> RepoResult<Attendance> {
        sqlx::query_as::<_, Attendance>(&format!(
            "INSERT INTO attendance AS a (student_id, date, time, status, note, operator, retro) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {ATTENDANCE_COLS}"
        ))
        .bind(new.student_id)
        .bind(new.date)
        .bind(new.time)
        .bind(new.status.as_str())
        .bind(&new.note)
        .bind(&new.operator)
        .bind(new.retro)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

fn push_leave_filters(qb: &mut QueryBuilder<'_, Postgres>, q: &LeaveQuery) {
    if let Some(v) = q.status {
        qb.push(" AND status = ").push_bind(v.as_str());
    }
    if let Some(v) = q.leave_type {
        qb.push(" AND leave_type = ").push_bind(v.as_str());
    }
    if let Some(v) = q.student_id {
        qb.push(" AND student_id = ").push_bind(v);
    }
    if let Some(v) = q.parent_id {
        qb.push(" AND parent_id = ").push_bind(v);
    }
    if let Some(d) = q.from {
        qb.push(" AND date_to >= ").push_bind(d);
    }
    if let Some(d) = q.to {
        qb.push(" AND date_from <= ").push_bind(d);
    }
    push_search(qb, &["reason"], &q.q);
}

#[async_trait]
impl LeaveRepo for PgRepo {
    async fn list_leaves(&self, q: &LeaveQuery) -> RepoResult<Page<LeaveRequest>> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM leave_requests WHERE TRUE");
        push_leave_filters(&mut count, q);
        let (total,): (i64,) = count.build_query_as().fetch_one(&self.pool).await.map_err(db_err)?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {LEAVE_COLS} FROM leave_requests WHERE TRUE"));
        push_leave_filters(&mut qb, q);
        qb.push(" ORDER BY submitted_at DESC, id DESC LIMIT ")
            .push_bind(q.size)
            .push(" OFFSET ")
            .push_bind(offset_of(q.page, q.size));
        let data = qb.build_query_as::<LeaveRequest>().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(Page { data, page: q.page, size: q.size, total })
    }

    async fn get_leave(&self, id: Id) -> RepoResult<LeaveRequest> {
        sqlx::query_as::<_, LeaveRequest>(&format!("SELECT {LEAVE_COLS} FROM leave_requests WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_leave(&self, new: NewLeaveRequest) -> RepoResult<LeaveRequest> {
        sqlx::query_as::<_, LeaveRequest>(&format!(
            "INSERT INTO leave_requests (student_id, parent_id, leave_type, reason, date_from, date_to, attachments) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {LEAVE_COLS}"
        ))
        .bind(new.student_id)
        .bind(new.parent_id)
        .bind(new.leave_type.as_str())
        .bind(&new.reason)
        .bind(new.date_from)
        .bind(new.date_to)
        .bind(&new.attachments)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn decide_leave(&self, id: Id, decision: LeaveDecision) -> RepoResult<LeaveRequest> {
        let decided = sqlx::query_as::<_, LeaveRequest>(&format!(
            "UPDATE leave_requests SET status=$2, decided_at=now(), decided_by=$3, reject_reason=$4 \
             WHERE id=$1 AND status = 'pending' RETURNING {LEAVE_COLS}"
        ))
        .bind(id)
        .bind(decision.status.as_str())
        .bind(&decision.decided_by)
        .bind(decision.reject_reason.as_ref())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match decided {
            Some(leave) => Ok(leave),
            None => {
                let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM leave_requests WHERE id = $1)")
                    .bind(id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
                Err(if exists { RepoError::Conflict("LEAVE_ALREADY_DECIDED") } else { RepoError::NotFound })
            }
        }
    }

    async fn count_pending_leaves(&self) -> RepoResult<i64> {
        self.count("SELECT COUNT(*) FROM leave_requests WHERE status = 'pending'").await
    }

    async fn approved_leaves_on(&self, date: NaiveDate) -> RepoResult<Vec<LeaveRequest>> {
        sqlx::query_as::<_, LeaveRequest>(&format!(
            "SELECT {LEAVE_COLS} FROM leave_requests WHERE status = 'approved' AND date_from <= $1 AND date_to >= $1 ORDER BY id"
        ))
        .bind(date)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl UserRepo for PgRepo {
    async fn find_user_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM users WHERE username = $1"))
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_user(&self, id: Id) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_user(&self, new: NewUser) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "INSERT INTO users (username, password_hash, role, teacher_id, email, phone, force_password_change) \
             VALUES ($1,$2,$3,$4,$5,$6,$7) RETURNING {USER_COLS}"
        ))
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(new.role.as_str())
        .bind(new.teacher_id)
        .bind(&new.email)
        .bind(&new.phone)
        .bind(new.force_password_change)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn count_users_with_role(&self, role: Role) -> RepoResult<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE role = $1")
            .bind(role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_users_with_role(&self, role: Role) -> RepoResult<Vec<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM users WHERE role = $1 ORDER BY id"))
            .bind(role.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn user_for_teacher(&self, teacher_id: Id) -> RepoResult<Option<User>> {
        sqlx::query_as::<_, User>(&format!("SELECT {USER_COLS} FROM users WHERE teacher_id = $1"))
            .bind(teacher_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn set_password(&self, id: Id, password_hash: String, force_change: bool) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET password_hash=$2, force_password_change=$3, last_password_change=now(), updated_at=now() \
             WHERE id=$1 RETURNING {USER_COLS}"
        ))
        .bind(id)
        .bind(&password_hash)
        .bind(force_change)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_account_flags(&self, id: Id, flags: AccountFlags) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET enabled=COALESCE($2, enabled), force_password_change=COALESCE($3, force_password_change), \
             updated_at=now() WHERE id=$1 RETURNING {USER_COLS}"
        ))
        .bind(id)
        .bind(flags.enabled)
        .bind(flags.force_password_change)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn record_login(&self, id: Id) -> RepoResult<()> {
        let res = sqlx::query("UPDATE users SET last_login=now() WHERE id=$1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        affected(res.rows_affected())
    }

    async fn update_profile(&self, id: Id, changes: ProfileChanges) -> RepoResult<User> {
        sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET email=COALESCE($2, email), phone=COALESCE($3, phone), timezone=COALESCE($4, timezone), \
             locale=COALESCE($5, locale), updated_at=now() WHERE id=$1 RETURNING {USER_COLS}"
        ))
        .bind(id)
        .bind(changes.email.as_ref())
        .bind(changes.phone.as_ref())
        .bind(changes.timezone.as_ref())
        .bind(changes.locale.as_ref())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl ParentRepo for PgRepo {
    async fn find_parent_by_email(&self, email: &str) -> RepoResult<Option<Parent>> {
        sqlx::query_as::<_, Parent>(&format!("SELECT {PARENT_COLS} FROM parents WHERE email = $1"))
            .bind(email.to_lowercase())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn get_parent(&self, id: Id) -> RepoResult<Parent> {
        sqlx::query_as::<_, Parent>(&format!("SELECT {PARENT_COLS} FROM parents WHERE id = $1"))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn create_parent(&self, new: NewParent) -> RepoResult<Parent> {
        sqlx::query_as::<_, Parent>(&format!(
            "INSERT INTO parents (email, phone, password_hash, name, pdpa_ok) VALUES ($1,$2,$3,$4,$5) RETURNING {PARENT_COLS}"
        ))
        .bind(new.email.to_lowercase())
        .bind(&new.phone)
        .bind(&new.password_hash)
        .bind(&new.name)
        .bind(new.pdpa_ok)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }
}

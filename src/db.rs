use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "coursebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            instructions TEXT,
            due_date TEXT NOT NULL,
            max_points REAL NOT NULL,
            submission_type TEXT NOT NULL,
            allow_late_submission INTEGER NOT NULL DEFAULT 0,
            late_penalty REAL NOT NULL DEFAULT 0,
            allow_resubmission INTEGER NOT NULL DEFAULT 0,
            max_resubmissions INTEGER NOT NULL DEFAULT 1,
            resubmission_deadline TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            id TEXT PRIMARY KEY,
            assignment_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            current_version INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL,
            text_submission TEXT,
            file_submissions TEXT NOT NULL DEFAULT '[]',
            submitted_at TEXT NOT NULL,
            is_late INTEGER NOT NULL DEFAULT 0,
            grade REAL,
            effective_grade REAL,
            feedback TEXT,
            graded_at TEXT,
            FOREIGN KEY(assignment_id) REFERENCES assignments(id),
            UNIQUE(assignment_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_assignment ON submissions(assignment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_student ON submissions(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submission_versions(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            submitted_at TEXT NOT NULL,
            text_submission TEXT,
            file_submissions TEXT NOT NULL DEFAULT '[]',
            comments TEXT,
            FOREIGN KEY(submission_id) REFERENCES submissions(id),
            UNIQUE(submission_id, version)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submission_versions_submission
         ON submission_versions(submission_id, version)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_entries(
            id TEXT PRIMARY KEY,
            submission_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            grade REAL,
            effective_grade REAL,
            feedback TEXT,
            graded_at TEXT NOT NULL,
            FOREIGN KEY(submission_id) REFERENCES submissions(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_entries_submission
         ON feedback_entries(submission_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quizzes(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quizzes_course ON quizzes(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_questions(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            text TEXT NOT NULL,
            kind TEXT NOT NULL,
            points REAL NOT NULL,
            options TEXT NOT NULL DEFAULT '[]',
            correct_answer TEXT,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id),
            UNIQUE(quiz_id, idx)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_questions_quiz ON quiz_questions(quiz_id, idx)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS quiz_attempts(
            id TEXT PRIMARY KEY,
            quiz_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            answers TEXT NOT NULL DEFAULT '[]',
            score REAL NOT NULL DEFAULT 0,
            total_points REAL NOT NULL DEFAULT 0,
            percentage INTEGER NOT NULL DEFAULT 0,
            time_spent INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            submitted_at TEXT,
            is_completed INTEGER NOT NULL DEFAULT 0,
            teacher_grade REAL,
            teacher_feedback TEXT,
            FOREIGN KEY(quiz_id) REFERENCES quizzes(id),
            UNIQUE(quiz_id, student_id, attempt_number)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_quiz ON quiz_attempts(quiz_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_student ON quiz_attempts(student_id)",
        [],
    )?;

    // Workspaces created before the raw/effective grade split carry a single
    // grade column. Add and backfill the effective column if needed.
    ensure_submissions_effective_grade(&conn)?;
    ensure_feedback_entries_effective_grade(&conn)?;

    Ok(conn)
}

fn ensure_submissions_effective_grade(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "submissions", "effective_grade")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE submissions ADD COLUMN effective_grade REAL", [])?;
    // Best effort: older rows predate the late-penalty split, so the raw value
    // is the only value we have.
    conn.execute(
        "UPDATE submissions SET effective_grade = grade WHERE grade IS NOT NULL",
        [],
    )?;
    Ok(())
}

fn ensure_feedback_entries_effective_grade(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "feedback_entries", "effective_grade")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE feedback_entries ADD COLUMN effective_grade REAL",
        [],
    )?;
    conn.execute(
        "UPDATE feedback_entries SET effective_grade = grade WHERE grade IS NOT NULL",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use sqlx::{migrate::MigrateDatabase, postgres::{PgPool, PgPoolOptions}, Postgres, Row};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::config::Config;
use crate::models::{Ballot, Candidate, Election, ElectionStatus, Position, Student, VoteHistoryEntry};

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("student {student_id} has already voted in election {election_id}")]
    AlreadyVoted { student_id: String, election_id: String },
    #[error("election {0} not found")]
    ElectionNotFound(String),
    #[error("election {0} is not accepting votes")]
    ElectionClosed(String),
    #[error("student {0} is not registered")]
    UnknownStudent(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Everything a successful cast writes, applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct BallotSubmission {
    pub history: VoteHistoryEntry,
    pub ballots: Vec<Ballot>,
    pub token: String,
}

/// Raw per-position counts as read from the ballot table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BallotCounts {
    pub candidate_votes: BTreeMap<i64, u64>,
    pub abstentions: u64,
}

#[async_trait]
pub trait VoteStore: Send + Sync {
    async fn get_election(&self, election_id: &str) -> Result<Election, StoreError>;

    /// Serialises on the voter's row, rejects a second vote with
    /// `StoreError::AlreadyVoted`, and writes history, ballots, token and the
    /// election counter in one transaction.
    async fn record_vote(&self, submission: &BallotSubmission) -> Result<(), StoreError>;

    async fn position_counts(&self, election_id: &str, position_id: &str) -> Result<BallotCounts, StoreError>;

    async fn count_voters(&self, election_id: &str) -> Result<u64, StoreError>;

    /// Election scope of a verification token, if it was ever issued.
    async fn find_token(&self, token: &str) -> Result<Option<String>, StoreError>;

    /// Closes open elections whose end time is before `now`, returning their ids.
    async fn close_expired_elections(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError>;
}

#[async_trait]
pub trait StudentDirectory: Send + Sync {
    async fn find_student(&self, student_id: &str) -> Result<Option<Student>, StoreError>;
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let db_url = &config.database_url;

        // Create database if it doesn't exist
        if !Postgres::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database at {}", db_url);
            Postgres::create_database(db_url).await?;
        }

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    async fn init_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS students (
                student_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                surname TEXT NOT NULL,
                classroom TEXT,
                no INTEGER,
                national_id TEXT
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS elections (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                ends_at TIMESTAMPTZ,
                total_votes BIGINT NOT NULL DEFAULT 0
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                election_id TEXT NOT NULL REFERENCES elections(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                enabled BOOLEAN NOT NULL DEFAULT TRUE,
                sort_order INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id BIGINT PRIMARY KEY,
                position_id TEXT NOT NULL REFERENCES positions(id) ON DELETE CASCADE,
                name TEXT NOT NULL,
                number INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vote_history (
                student_id TEXT NOT NULL REFERENCES students(student_id),
                election_id TEXT NOT NULL REFERENCES elections(id),
                voted_at TIMESTAMPTZ NOT NULL,
                ip_address TEXT,
                PRIMARY KEY (student_id, election_id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        // Ballots: random key, no voter column, no timestamp.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                id UUID PRIMARY KEY,
                election_id TEXT NOT NULL REFERENCES elections(id),
                position_id TEXT NOT NULL REFERENCES positions(id),
                candidate_id BIGINT REFERENCES candidates(id),
                is_no_vote BOOLEAN NOT NULL,
                CHECK ((candidate_id IS NULL) = is_no_vote)
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vote_tokens (
                token TEXT PRIMARY KEY,
                election_id TEXT NOT NULL REFERENCES elections(id)
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn create_election(&self, election: &Election) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO elections (id, title, status, ends_at, total_votes)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&election.id)
        .bind(&election.title)
        .bind(election.status.as_str())
        .bind(election.ends_at)
        .bind(election.total_votes)
        .execute(&mut *tx)
        .await?;

        for (i, position) in election.positions.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO positions (id, election_id, title, enabled, sort_order)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&position.id)
            .bind(&election.id)
            .bind(&position.title)
            .bind(position.enabled)
            .bind(i as i32)
            .execute(&mut *tx)
            .await?;

            for candidate in &position.candidates {
                sqlx::query(
                    r#"
                    INSERT INTO candidates (id, position_id, name, number)
                    VALUES ($1, $2, $3, $4)
                    "#,
                )
                .bind(candidate.id)
                .bind(&position.id)
                .bind(&candidate.name)
                .bind(candidate.number)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_student(&self, student: &Student) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO students (student_id, name, surname, classroom, no, national_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student_id)
            DO UPDATE SET name = excluded.name, surname = excluded.surname,
                classroom = excluded.classroom, no = excluded.no, national_id = excluded.national_id
            "#,
        )
        .bind(&student.student_id)
        .bind(&student.name)
        .bind(&student.surname)
        .bind(&student.classroom)
        .bind(student.no)
        .bind(&student.national_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl VoteStore for Database {
    async fn get_election(&self, election_id: &str) -> Result<Election, StoreError> {
        let election_row = sqlx::query(
            r#"
            SELECT id, title, status, ends_at, total_votes
            FROM elections
            WHERE id = $1
            "#,
        )
        .bind(election_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::ElectionNotFound(election_id.to_string()))?;

        let status_str = election_row.get::<String, _>("status");
        let status = ElectionStatus::parse(&status_str)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown election status: {}", status_str)))?;

        let mut positions: Vec<Position> = sqlx::query(
            r#"
            SELECT id, title, enabled
            FROM positions
            WHERE election_id = $1
            ORDER BY sort_order
            "#,
        )
        .bind(election_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| Position {
            id: row.get::<String, _>("id"),
            title: row.get::<String, _>("title"),
            enabled: row.get::<bool, _>("enabled"),
            candidates: Vec::new(),
        })
        .collect();

        let candidate_rows = sqlx::query(
            r#"
            SELECT c.id, c.position_id, c.name, c.number
            FROM candidates c
            JOIN positions p ON p.id = c.position_id
            WHERE p.election_id = $1
            ORDER BY c.number, c.id
            "#,
        )
        .bind(election_id)
        .fetch_all(&self.pool)
        .await?;

        for row in candidate_rows {
            let position_id = row.get::<String, _>("position_id");
            match positions.iter_mut().find(|p| p.id == position_id) {
                Some(position) => position.candidates.push(Candidate {
                    id: row.get::<i64, _>("id"),
                    name: row.get::<String, _>("name"),
                    number: row.get::<i32, _>("number"),
                }),
                None => warn!("Candidate row for unknown position {}", position_id),
            }
        }

        Ok(Election {
            id: election_row.get::<String, _>("id"),
            title: election_row.get::<String, _>("title"),
            status,
            ends_at: election_row.get::<Option<DateTime<Utc>>, _>("ends_at"),
            total_votes: election_row.get::<i64, _>("total_votes"),
            positions,
        })
    }

    async fn record_vote(&self, submission: &BallotSubmission) -> Result<(), StoreError> {
        let history = &submission.history;
        let already_voted = || StoreError::AlreadyVoted {
            student_id: history.student_id.clone(),
            election_id: history.election_id.clone(),
        };

        // Dropping `tx` without commit rolls everything back.
        let mut tx = self.pool.begin().await?;

        // Row lock on this voter only; other voters proceed in parallel.
        let locked = sqlx::query("SELECT student_id FROM students WHERE student_id = $1 FOR UPDATE")
            .bind(&history.student_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(StoreError::UnknownStudent(history.student_id.clone()));
        }

        let previous = sqlx::query("SELECT 1 FROM vote_history WHERE student_id = $1 AND election_id = $2")
            .bind(&history.student_id)
            .bind(&history.election_id)
            .fetch_optional(&mut *tx)
            .await?;
        if previous.is_some() {
            return Err(already_voted());
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO vote_history (student_id, election_id, voted_at, ip_address)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&history.student_id)
        .bind(&history.election_id)
        .bind(history.voted_at)
        .bind(&history.ip_address)
        .execute(&mut *tx)
        .await;
        match inserted {
            Err(e) if is_unique_violation(&e) => return Err(already_voted()),
            Err(e) => return Err(e.into()),
            Ok(_) => {}
        }

        for ballot in &submission.ballots {
            sqlx::query(
                r#"
                INSERT INTO votes (id, election_id, position_id, candidate_id, is_no_vote)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(ballot.id)
            .bind(&ballot.election_id)
            .bind(&ballot.position_id)
            .bind(ballot.candidate_id)
            .bind(ballot.is_no_vote())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT INTO vote_tokens (token, election_id) VALUES ($1, $2)")
            .bind(&submission.token)
            .bind(&history.election_id)
            .execute(&mut *tx)
            .await?;

        // Last statement, so the election row lock is held only until commit.
        let counted = sqlx::query(
            r#"
            UPDATE elections
            SET total_votes = total_votes + 1
            WHERE id = $1 AND status = 'open' AND (ends_at IS NULL OR ends_at > clock_timestamp())
            "#,
        )
        .bind(&history.election_id)
        .execute(&mut *tx)
        .await?;
        if counted.rows_affected() == 0 {
            return Err(StoreError::ElectionClosed(history.election_id.clone()));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn position_counts(&self, election_id: &str, position_id: &str) -> Result<BallotCounts, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT candidate_id, COUNT(*) AS votes
            FROM votes
            WHERE election_id = $1 AND position_id = $2
            GROUP BY candidate_id
            "#,
        )
        .bind(election_id)
        .bind(position_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BallotCounts::default();
        for row in rows {
            let votes = row.get::<i64, _>("votes").max(0) as u64;
            match row.get::<Option<i64>, _>("candidate_id") {
                Some(candidate_id) => {
                    counts.candidate_votes.insert(candidate_id, votes);
                }
                None => counts.abstentions += votes,
            }
        }
        Ok(counts)
    }

    async fn count_voters(&self, election_id: &str) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS voted FROM vote_history WHERE election_id = $1")
            .bind(election_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("voted").max(0) as u64)
    }

    async fn find_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT election_id FROM vote_tokens WHERE token = $1")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("election_id")))
    }

    async fn close_expired_elections(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let closed = sqlx::query(
            r#"
            UPDATE elections
            SET status = 'closed'
            WHERE status = 'open' AND ends_at IS NOT NULL AND ends_at < $1
            RETURNING id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("id"))
        .collect();
        Ok(closed)
    }
}

#[async_trait]
impl StudentDirectory for Database {
    async fn find_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT student_id, name, surname, classroom, no, national_id
            FROM students
            WHERE student_id = $1
            "#,
        )
        .bind(student_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Student {
            student_id: row.get::<String, _>("student_id"),
            name: row.get::<String, _>("name"),
            surname: row.get::<String, _>("surname"),
            classroom: row.get::<Option<String>, _>("classroom"),
            no: row.get::<Option<i32>, _>("no"),
            national_id: row.get::<Option<String>, _>("national_id"),
        }))
    }
}

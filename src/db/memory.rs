//! In-process store used by tests and UI prototyping.
//!
//! Mirrors the locking of the PostgreSQL store: one async lock per
//! (voter, election) pair, and all writes of a cast applied under a single
//! critical section so readers never observe a partial vote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BallotCounts, BallotSubmission, StoreError, StudentDirectory, VoteStore};
use crate::models::{Ballot, Election, ElectionStatus, Student, VoteHistoryEntry};

type VoterKey = (String, String);

#[derive(Default)]
struct State {
    elections: HashMap<String, Election>,
    students: HashMap<String, Student>,
    history: HashMap<VoterKey, VoteHistoryEntry>,
    ballots: Vec<Ballot>,
    tokens: HashMap<String, String>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    voter_locks: Mutex<HashMap<VoterKey, Arc<tokio::sync::Mutex<()>>>>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))
    }

    fn voter_lock(&self, key: &VoterKey) -> Result<Arc<tokio::sync::Mutex<()>>, StoreError> {
        let mut locks = self
            .voter_locks
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        Ok(Arc::clone(locks.entry(key.clone()).or_default()))
    }

    pub fn insert_election(&self, election: Election) -> Result<(), StoreError> {
        self.state()?.elections.insert(election.id.clone(), election);
        Ok(())
    }

    pub fn insert_student(&self, student: Student) -> Result<(), StoreError> {
        self.state()?.students.insert(student.student_id.clone(), student);
        Ok(())
    }

    /// Makes the next `record_vote` fail after its checks pass, as if the
    /// connection dropped before commit.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn ballots(&self) -> Result<Vec<Ballot>, StoreError> {
        Ok(self.state()?.ballots.clone())
    }

    pub fn history(&self) -> Result<Vec<VoteHistoryEntry>, StoreError> {
        Ok(self.state()?.history.values().cloned().collect())
    }
}

#[async_trait]
impl VoteStore for MemoryStore {
    async fn get_election(&self, election_id: &str) -> Result<Election, StoreError> {
        self.state()?
            .elections
            .get(election_id)
            .cloned()
            .ok_or_else(|| StoreError::ElectionNotFound(election_id.to_string()))
    }

    async fn record_vote(&self, submission: &BallotSubmission) -> Result<(), StoreError> {
        let history = &submission.history;
        let key = (history.student_id.clone(), history.election_id.clone());

        let voter_lock = self.voter_lock(&key)?;
        let _guard = voter_lock.lock().await;

        {
            let state = self.state()?;
            if !state.students.contains_key(&history.student_id) {
                return Err(StoreError::UnknownStudent(history.student_id.clone()));
            }
            if state.history.contains_key(&key) {
                return Err(StoreError::AlreadyVoted {
                    student_id: history.student_id.clone(),
                    election_id: history.election_id.clone(),
                });
            }
        }

        // Stand-in for the round trips between check and commit.
        tokio::task::yield_now().await;

        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection lost before commit".to_string()));
        }

        let mut state = self.state()?;
        let election = state
            .elections
            .get_mut(&history.election_id)
            .ok_or_else(|| StoreError::ElectionNotFound(history.election_id.clone()))?;
        if !election.accepts_votes(Utc::now()) {
            return Err(StoreError::ElectionClosed(history.election_id.clone()));
        }
        election.total_votes += 1;

        state.history.insert(key, history.clone());
        state.ballots.extend(submission.ballots.iter().cloned());
        state
            .tokens
            .insert(submission.token.clone(), history.election_id.clone());
        Ok(())
    }

    async fn position_counts(&self, election_id: &str, position_id: &str) -> Result<BallotCounts, StoreError> {
        let state = self.state()?;
        let mut counts = BallotCounts::default();
        for ballot in state
            .ballots
            .iter()
            .filter(|b| b.election_id == election_id && b.position_id == position_id)
        {
            match ballot.candidate_id {
                Some(candidate_id) => *counts.candidate_votes.entry(candidate_id).or_insert(0) += 1,
                None => counts.abstentions += 1,
            }
        }
        Ok(counts)
    }

    async fn count_voters(&self, election_id: &str) -> Result<u64, StoreError> {
        let state = self.state()?;
        Ok(state.history.keys().filter(|(_, e)| e == election_id).count() as u64)
    }

    async fn find_token(&self, token: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state()?.tokens.get(token).cloned())
    }

    async fn close_expired_elections(&self, now: DateTime<Utc>) -> Result<Vec<String>, StoreError> {
        let mut state = self.state()?;
        let mut closed = Vec::new();
        for election in state.elections.values_mut() {
            let expired = election.ends_at.is_some_and(|ends| ends < now);
            if election.status == ElectionStatus::Open && expired {
                election.status = ElectionStatus::Closed;
                closed.push(election.id.clone());
            }
        }
        closed.sort();
        Ok(closed)
    }
}

#[async_trait]
impl StudentDirectory for MemoryStore {
    async fn find_student(&self, student_id: &str) -> Result<Option<Student>, StoreError> {
        Ok(self.state()?.students.get(student_id).cloned())
    }
}

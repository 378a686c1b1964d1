use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use thiserror::Error;

use crate::db::{BallotSubmission, StoreError, VoteStore};
use crate::models::{Ballot, Election, VoteChoice, VoteHistoryEntry, Voter};
use crate::voting::token::VerificationToken;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("Please sign in before voting.")]
    NotAuthenticated,
    #[error("You are not on the voter roll for this election.")]
    NotEligible,
    #[error("Election not found.")]
    ElectionNotFound,
    #[error("This election is not accepting votes.")]
    ElectionClosed,
    #[error("{0}")]
    InvalidChoices(String),
    #[error("You have already voted in this election.")]
    AlreadyVoted,
    #[error("Your vote could not be recorded and nothing was saved. Please try again.")]
    Storage(#[source] StoreError),
}

/// Machine-readable reason for a rejected cast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    NotAuthenticated,
    NotEligible,
    ElectionNotFound,
    ElectionClosed,
    InvalidChoices,
    AlreadyVoted,
    StorageFailure,
}

impl VoteError {
    pub fn rejection(&self) -> Rejection {
        match self {
            VoteError::NotAuthenticated => Rejection::NotAuthenticated,
            VoteError::NotEligible => Rejection::NotEligible,
            VoteError::ElectionNotFound => Rejection::ElectionNotFound,
            VoteError::ElectionClosed => Rejection::ElectionClosed,
            VoteError::InvalidChoices(_) => Rejection::InvalidChoices,
            VoteError::AlreadyVoted => Rejection::AlreadyVoted,
            VoteError::Storage(_) => Rejection::StorageFailure,
        }
    }
}

impl From<StoreError> for VoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyVoted { .. } => VoteError::AlreadyVoted,
            StoreError::ElectionNotFound(_) => VoteError::ElectionNotFound,
            StoreError::ElectionClosed(_) => VoteError::ElectionClosed,
            StoreError::UnknownStudent(_) => VoteError::NotEligible,
            other => VoteError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VoteOutcome {
    pub success: bool,
    pub message: String,
    pub token: Option<String>,
    pub rejection: Option<Rejection>,
}

impl VoteOutcome {
    fn accepted(token: VerificationToken) -> Self {
        Self {
            success: true,
            message: "Your vote has been recorded.".to_string(),
            token: Some(token.into_string()),
            rejection: None,
        }
    }

    fn rejected(err: &VoteError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            token: None,
            rejection: Some(err.rejection()),
        }
    }
}

/// Casts a full ballot for `voter` in one election.
///
/// At most one cast per (voter, election) ever succeeds; every later or
/// concurrent attempt comes back as `Rejection::AlreadyVoted`. Storage errors
/// never reach the caller, only a retry-safe message.
pub async fn cast_vote(
    store: &dyn VoteStore,
    voter: Option<&Voter>,
    election_id: &str,
    choices: &[VoteChoice],
    ip_address: Option<&str>,
) -> VoteOutcome {
    match try_cast_vote(store, voter, election_id, choices, ip_address).await {
        Ok(token) => {
            info!("Vote recorded in election {}", election_id);
            VoteOutcome::accepted(token)
        }
        Err(e) => {
            match &e {
                VoteError::Storage(inner) => {
                    error!("Vote transaction for election {} rolled back: {}", election_id, inner)
                }
                other => info!("Vote rejected in election {}: {:?}", election_id, other.rejection()),
            }
            VoteOutcome::rejected(&e)
        }
    }
}

async fn try_cast_vote(
    store: &dyn VoteStore,
    voter: Option<&Voter>,
    election_id: &str,
    choices: &[VoteChoice],
    ip_address: Option<&str>,
) -> Result<VerificationToken, VoteError> {
    let voter = voter.ok_or(VoteError::NotAuthenticated)?;

    let election = store.get_election(election_id).await?;
    if !election.accepts_votes(Utc::now()) {
        return Err(VoteError::ElectionClosed);
    }
    validate_choices(&election, choices)?;

    let token = VerificationToken::generate();
    let submission = BallotSubmission {
        history: VoteHistoryEntry {
            student_id: voter.student_id.clone(),
            election_id: election.id.clone(),
            voted_at: Utc::now(),
            ip_address: ip_address.map(str::to_string),
        },
        ballots: choices.iter().map(|choice| Ballot::new(&election.id, choice)).collect(),
        token: token.as_str().to_string(),
    };

    store.record_vote(&submission).await?;
    Ok(token)
}

/// One choice per enabled position, no extras, candidates from the right position.
pub fn validate_choices(election: &Election, choices: &[VoteChoice]) -> Result<(), VoteError> {
    if election.enabled_positions().next().is_none() {
        return Err(VoteError::InvalidChoices(
            "This election has no positions open for voting.".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for choice in choices {
        let position = election.position(&choice.position_id).ok_or_else(|| {
            VoteError::InvalidChoices(format!("Unknown position: {}", choice.position_id))
        })?;
        if !position.enabled {
            return Err(VoteError::InvalidChoices(format!(
                "{} is not open for voting.",
                position.title
            )));
        }
        if !seen.insert(position.id.as_str()) {
            return Err(VoteError::InvalidChoices(format!(
                "{} was submitted more than once.",
                position.title
            )));
        }
        if let Some(candidate_id) = choice.candidate_id {
            if !position.candidates.iter().any(|c| c.id == candidate_id) {
                warn!("Candidate {} is not running for position {}", candidate_id, position.id);
                return Err(VoteError::InvalidChoices(format!(
                    "The selected candidate is not running for {}.",
                    position.title
                )));
            }
        }
    }

    if let Some(missing) = election.enabled_positions().find(|p| !seen.contains(p.id.as_str())) {
        return Err(VoteError::InvalidChoices(format!(
            "Please make a choice for {} (or choose No Vote).",
            missing.title
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{Candidate, ElectionStatus, Position, Student};
    use crate::voting::token::verify_token;
    use std::sync::Arc;

    fn position(id: &str, enabled: bool, candidate_ids: &[i64]) -> Position {
        Position {
            id: id.to_string(),
            title: id.to_uppercase(),
            enabled,
            candidates: candidate_ids
                .iter()
                .map(|&cid| Candidate { id: cid, name: format!("Candidate {}", cid), number: cid as i32 })
                .collect(),
        }
    }

    fn setup(student_ids: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        let mut election = Election::new(
            "Student Council 2567".to_string(),
            vec![
                position("president", true, &[1, 2]),
                position("secretary", true, &[3, 4]),
                position("treasurer", false, &[5]),
            ],
            None,
        );
        election.id = "e1".to_string();
        store.insert_election(election).unwrap();
        for id in student_ids {
            store
                .insert_student(Student {
                    student_id: id.to_string(),
                    name: "Somchai".to_string(),
                    surname: "Jaidee".to_string(),
                    classroom: Some("3/1".to_string()),
                    no: None,
                    national_id: None,
                })
                .unwrap();
        }
        store
    }

    fn voter(id: &str) -> Voter {
        Voter { student_id: id.to_string() }
    }

    fn full_ballot() -> Vec<VoteChoice> {
        vec![VoteChoice::candidate("president", 1), VoteChoice::abstain("secretary")]
    }

    #[tokio::test]
    async fn test_successful_cast_issues_token() {
        let store = setup(&["1001"]);
        let outcome = cast_vote(&store, Some(&voter("1001")), "e1", &full_ballot(), Some("10.0.0.7")).await;

        assert!(outcome.success);
        let token = outcome.token.expect("token issued");
        assert!(VerificationToken::is_well_formed(&token));

        let verification = verify_token(&store, &token).await.unwrap().unwrap();
        assert_eq!(verification.election_id, "e1");
        assert_eq!(store.get_election("e1").await.unwrap().total_votes, 1);
        assert_eq!(store.ballots().unwrap().len(), 2);
        assert_eq!(store.history().unwrap()[0].ip_address.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_second_cast_is_rejected_explicitly() {
        let store = setup(&["1001"]);
        let first = cast_vote(&store, Some(&voter("1001")), "e1", &full_ballot(), None).await;
        let second = cast_vote(&store, Some(&voter("1001")), "e1", &full_ballot(), None).await;

        assert!(first.success);
        assert!(!second.success);
        assert_eq!(second.rejection, Some(Rejection::AlreadyVoted));
        assert_eq!(second.message, "You have already voted in this election.");
        assert_eq!(store.ballots().unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_casts_by_one_voter_succeed_once() {
        let store = Arc::new(setup(&["1001"]));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                cast_vote(&*store, Some(&voter("1001")), "e1", &full_ballot(), None).await
            }));
        }

        let mut successes = 0;
        let mut already_voted = 0;
        for handle in handles {
            let outcome = handle.await.unwrap();
            if outcome.success {
                successes += 1;
            } else if outcome.rejection == Some(Rejection::AlreadyVoted) {
                already_voted += 1;
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(already_voted, 15);
        assert_eq!(store.ballots().unwrap().len(), 2);
        assert_eq!(store.get_election("e1").await.unwrap().total_votes, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_voters_all_succeed() {
        let ids: Vec<String> = (0..8).map(|i| format!("20{:02}", i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let store = Arc::new(setup(&id_refs));

        let mut handles = Vec::new();
        for id in ids.clone() {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                cast_vote(&*store, Some(&voter(&id)), "e1", &full_ballot(), None).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert_eq!(store.count_voters("e1").await.unwrap(), 8);
        assert_eq!(store.get_election("e1").await.unwrap().total_votes, 8);
    }

    #[tokio::test]
    async fn test_ballots_carry_no_voter_identifier() {
        let store = setup(&["stu-anon-77"]);
        let outcome = cast_vote(&store, Some(&voter("stu-anon-77")), "e1", &full_ballot(), None).await;
        assert!(outcome.success);

        let ballots = serde_json::to_string(&store.ballots().unwrap()).unwrap();
        assert!(!ballots.contains("stu-anon-77"));
        assert!(!ballots.contains("voted_at"));
    }

    #[tokio::test]
    async fn test_not_authenticated_rejected_before_store() {
        let store = setup(&[]);
        let outcome = cast_vote(&store, None, "e1", &full_ballot(), None).await;
        assert_eq!(outcome.rejection, Some(Rejection::NotAuthenticated));
        assert!(store.history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_position_is_validation_error() {
        let store = setup(&["1001"]);
        let choices = vec![VoteChoice::candidate("president", 2)];
        let outcome = cast_vote(&store, Some(&voter("1001")), "e1", &choices, None).await;

        assert_eq!(outcome.rejection, Some(Rejection::InvalidChoices));
        assert!(outcome.message.contains("SECRETARY"));
        assert!(store.ballots().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_choices() {
        let store = setup(&["1001"]);
        let cases = vec![
            vec![VoteChoice::candidate("president", 3), VoteChoice::abstain("secretary")],
            vec![
                VoteChoice::candidate("president", 1),
                VoteChoice::candidate("president", 2),
                VoteChoice::abstain("secretary"),
            ],
            vec![
                VoteChoice::candidate("president", 1),
                VoteChoice::abstain("secretary"),
                VoteChoice::candidate("treasurer", 5),
            ],
            vec![VoteChoice::candidate("mascot", 1), VoteChoice::abstain("secretary")],
        ];
        for choices in cases {
            let outcome = cast_vote(&store, Some(&voter("1001")), "e1", &choices, None).await;
            assert_eq!(outcome.rejection, Some(Rejection::InvalidChoices), "{:?}", choices);
        }
        assert!(store.history().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closed_election_rejected() {
        let store = setup(&["1001"]);
        let mut election = store.get_election("e1").await.unwrap();
        election.status = ElectionStatus::Closed;
        store.insert_election(election).unwrap();

        let outcome = cast_vote(&store, Some(&voter("1001")), "e1", &full_ballot(), None).await;
        assert_eq!(outcome.rejection, Some(Rejection::ElectionClosed));
    }

    #[tokio::test]
    async fn test_storage_failure_is_generic_and_retry_safe() {
        let store = setup(&["1001"]);
        store.fail_next_commit();

        let failed = cast_vote(&store, Some(&voter("1001")), "e1", &full_ballot(), None).await;
        assert_eq!(failed.rejection, Some(Rejection::StorageFailure));
        assert!(!failed.message.contains("connection"));
        assert!(store.ballots().unwrap().is_empty());
        assert!(store.history().unwrap().is_empty());

        let retried = cast_vote(&store, Some(&voter("1001")), "e1", &full_ballot(), None).await;
        assert!(retried.success);
    }

    #[tokio::test]
    async fn test_unregistered_voter_not_eligible() {
        let store = setup(&[]);
        let outcome = cast_vote(&store, Some(&voter("4040")), "e1", &full_ballot(), None).await;
        assert_eq!(outcome.rejection, Some(Rejection::NotEligible));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub surname: String,
    pub classroom: Option<String>,
    pub no: Option<i32>,
    pub national_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Election {
    pub id: String,
    pub title: String,
    pub status: ElectionStatus,
    pub ends_at: Option<DateTime<Utc>>,
    pub total_votes: i64,
    pub positions: Vec<Position>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionStatus {
    Open,
    Closed,
}

impl ElectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionStatus::Open => "open",
            ElectionStatus::Closed => "closed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(ElectionStatus::Open),
            "closed" => Some(ElectionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub title: String,
    pub enabled: bool,
    pub candidates: Vec<Candidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    pub name: String,
    /// Ballot number printed on the poster, not the database id.
    pub number: i32,
}

/// One selection on a submitted ballot. `candidate_id: None` is an explicit
/// "No Vote" for the position, which is different from leaving it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteChoice {
    pub position_id: String,
    pub candidate_id: Option<i64>,
}

impl VoteChoice {
    pub fn candidate(position_id: &str, candidate_id: i64) -> Self {
        Self {
            position_id: position_id.to_string(),
            candidate_id: Some(candidate_id),
        }
    }

    pub fn abstain(position_id: &str) -> Self {
        Self {
            position_id: position_id.to_string(),
            candidate_id: None,
        }
    }
}

/// Proof that a student used their right to vote in an election.
/// Never updated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteHistoryEntry {
    pub student_id: String,
    pub election_id: String,
    pub voted_at: DateTime<Utc>,
    pub ip_address: Option<String>,
}

/// An anonymous ballot for a single position. There is deliberately no
/// voter field and no timestamp here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub id: Uuid,
    pub election_id: String,
    pub position_id: String,
    pub candidate_id: Option<i64>,
}

impl Ballot {
    pub fn new(election_id: &str, choice: &VoteChoice) -> Self {
        Self {
            id: Uuid::new_v4(),
            election_id: election_id.to_string(),
            position_id: choice.position_id.clone(),
            candidate_id: choice.candidate_id,
        }
    }

    pub fn is_no_vote(&self) -> bool {
        self.candidate_id.is_none()
    }
}

/// The authenticated voter as resolved by the session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Voter {
    pub student_id: String,
}

impl Election {
    pub fn new(title: String, positions: Vec<Position>, ends_at: Option<DateTime<Utc>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            status: ElectionStatus::Open,
            ends_at,
            total_votes: 0,
            positions,
        }
    }

    pub fn enabled_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.enabled)
    }

    pub fn position(&self, position_id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.id == position_id)
    }

    /// Open and not past its end time.
    pub fn accepts_votes(&self, now: DateTime<Utc>) -> bool {
        self.status == ElectionStatus::Open && self.ends_at.is_none_or(|ends| now < ends)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_election_accepts_votes() {
        let now = Utc::now();
        let mut election = Election::new("Council".to_string(), Vec::new(), Some(now + Duration::minutes(5)));
        assert!(election.accepts_votes(now));
        assert!(!election.accepts_votes(now + Duration::minutes(6)));

        election.status = ElectionStatus::Closed;
        assert!(!election.accepts_votes(now));
    }

    #[test]
    fn test_ballot_from_abstention() {
        let ballot = Ballot::new("e1", &VoteChoice::abstain("president"));
        assert!(ballot.is_no_vote());
        assert_eq!(ballot.position_id, "president");
    }

    #[test]
    fn test_status_round_trip_names() {
        assert_eq!(ElectionStatus::parse(ElectionStatus::Open.as_str()), Some(ElectionStatus::Open));
        assert_eq!(ElectionStatus::parse("locked"), None);
    }
}

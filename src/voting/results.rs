use log::warn;
use serde::Serialize;

use crate::db::{BallotCounts, StoreError, VoteStore};
use crate::models::{Candidate, ElectionStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateTally {
    pub candidate_id: i64,
    pub name: String,
    pub number: i32,
    pub votes: u64,
    pub percentage: u32,
}

/// Tally for one position. Always recomputed from the ballot store.
///
/// `total_votes` counts abstentions, and
/// `candidates.votes` summed plus `abstain_count` equals `total_votes`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionResult {
    pub position_id: String,
    pub position_title: String,
    pub total_votes: u64,
    /// Highest first. Candidates with equal votes keep the order they were passed in.
    pub candidates: Vec<CandidateTally>,
    pub abstain_count: u64,
    pub abstain_percentage: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Turnout {
    pub total_eligible: u64,
    pub total_voted: u64,
    pub not_voted: u64,
    /// Not capped at 100: a stale eligible count shows up as >100%.
    pub percentage: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WinnerDetermination {
    Winner { winner: CandidateTally },
    AbstainWins { abstain_count: u64 },
    Tie { tied_candidates: Vec<CandidateTally> },
    NoCandidates,
    NoVotes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PositionOutcome {
    pub result: PositionResult,
    pub winner: WinnerDetermination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectionResults {
    pub election_id: String,
    pub title: String,
    pub status: ElectionStatus,
    pub turnout: Turnout,
    pub positions: Vec<PositionOutcome>,
}

fn percentage(part: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    (part as f64 / total as f64 * 100.0).round() as u32
}

pub fn tally_position(
    position_id: &str,
    position_title: &str,
    candidates: &[Candidate],
    counts: &BallotCounts,
) -> PositionResult {
    let mut tallies: Vec<CandidateTally> = candidates
        .iter()
        .map(|candidate| CandidateTally {
            candidate_id: candidate.id,
            name: candidate.name.clone(),
            number: candidate.number,
            votes: counts.candidate_votes.get(&candidate.id).copied().unwrap_or(0),
            percentage: 0,
        })
        .collect();

    let orphaned: u64 = counts
        .candidate_votes
        .iter()
        .filter(|(id, _)| !candidates.iter().any(|c| c.id == **id))
        .map(|(_, votes)| *votes)
        .sum();
    if orphaned > 0 {
        warn!(
            "Ignoring {} ballot(s) for candidates no longer listed in position {}",
            orphaned, position_id
        );
    }

    let total_votes = tallies.iter().map(|t| t.votes).sum::<u64>() + counts.abstentions;
    for tally in &mut tallies {
        tally.percentage = percentage(tally.votes, total_votes);
    }
    // sort_by is stable, which keeps tied candidates in input order.
    tallies.sort_by(|a, b| b.votes.cmp(&a.votes));

    PositionResult {
        position_id: position_id.to_string(),
        position_title: position_title.to_string(),
        total_votes,
        candidates: tallies,
        abstain_count: counts.abstentions,
        abstain_percentage: percentage(counts.abstentions, total_votes),
    }
}

pub async fn get_position_results(
    store: &dyn VoteStore,
    election_id: &str,
    position_id: &str,
    position_title: &str,
    candidates: &[Candidate],
) -> Result<PositionResult, StoreError> {
    let counts = store.position_counts(election_id, position_id).await?;
    Ok(tally_position(position_id, position_title, candidates, &counts))
}

pub fn compute_turnout(total_eligible: u64, total_voted: u64) -> Turnout {
    if total_eligible == 0 {
        return Turnout {
            total_eligible,
            total_voted,
            not_voted: 0,
            percentage: 0,
        };
    }
    Turnout {
        total_eligible,
        total_voted,
        not_voted: total_eligible.saturating_sub(total_voted),
        percentage: percentage(total_voted, total_eligible),
    }
}

pub async fn get_voter_turnout(
    store: &dyn VoteStore,
    election_id: &str,
    total_eligible: u64,
) -> Result<Turnout, StoreError> {
    let total_voted = store.count_voters(election_id).await?;
    Ok(compute_turnout(total_eligible, total_voted))
}

pub fn determine_winner(result: &PositionResult) -> WinnerDetermination {
    if result.candidates.is_empty() {
        return WinnerDetermination::NoCandidates;
    }
    if result.total_votes == 0 {
        return WinnerDetermination::NoVotes;
    }

    let top_votes = result.candidates.iter().map(|c| c.votes).max().unwrap_or(0);
    if result.abstain_count > top_votes {
        return WinnerDetermination::AbstainWins {
            abstain_count: result.abstain_count,
        };
    }

    let mut leaders: Vec<CandidateTally> = result
        .candidates
        .iter()
        .filter(|c| c.votes == top_votes)
        .cloned()
        .collect();
    if leaders.len() == 1 {
        WinnerDetermination::Winner {
            winner: leaders.remove(0),
        }
    } else {
        WinnerDetermination::Tie {
            tied_candidates: leaders,
        }
    }
}

/// Every enabled position of an election with its winner, plus turnout.
pub async fn get_election_results(
    store: &dyn VoteStore,
    election_id: &str,
    total_eligible: u64,
) -> Result<ElectionResults, StoreError> {
    let election = store.get_election(election_id).await?;

    let mut positions = Vec::new();
    for position in election.enabled_positions() {
        let result =
            get_position_results(store, &election.id, &position.id, &position.title, &position.candidates).await?;
        let winner = determine_winner(&result);
        positions.push(PositionOutcome { result, winner });
    }

    Ok(ElectionResults {
        turnout: get_voter_turnout(store, &election.id, total_eligible).await?,
        election_id: election.id,
        title: election.title,
        status: election.status,
        positions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{Election, Position, Student, VoteChoice, Voter};
    use crate::voting::cast::cast_vote;

    fn candidates() -> Vec<Candidate> {
        vec![
            Candidate { id: 1, name: "A".to_string(), number: 1 },
            Candidate { id: 2, name: "B".to_string(), number: 2 },
        ]
    }

    fn counts(a: u64, b: u64, abstain: u64) -> BallotCounts {
        let mut counts = BallotCounts::default();
        counts.candidate_votes.insert(1, a);
        counts.candidate_votes.insert(2, b);
        counts.abstentions = abstain;
        counts
    }

    fn names(tallies: &[CandidateTally]) -> Vec<&str> {
        tallies.iter().map(|t| t.name.as_str()).collect()
    }

    #[test]
    fn test_winner_tie_and_abstain_boundaries() {
        let tied = tally_position("p", "President", &candidates(), &counts(100, 100, 50));
        assert_eq!(tied.total_votes, 250);
        match determine_winner(&tied) {
            WinnerDetermination::Tie { tied_candidates } => assert_eq!(names(&tied_candidates), vec!["A", "B"]),
            other => panic!("expected tie, got {:?}", other),
        }

        let won = tally_position("p", "President", &candidates(), &counts(100, 99, 50));
        match determine_winner(&won) {
            WinnerDetermination::Winner { winner } => {
                assert_eq!(winner.name, "A");
                assert_eq!(winner.votes, 100);
            }
            other => panic!("expected winner, got {:?}", other),
        }

        let abstained = tally_position("p", "President", &candidates(), &counts(100, 99, 150));
        assert_eq!(
            determine_winner(&abstained),
            WinnerDetermination::AbstainWins { abstain_count: 150 }
        );
    }

    #[test]
    fn test_abstain_equal_to_leader_still_elects() {
        let result = tally_position("p", "President", &candidates(), &counts(40, 10, 40));
        assert!(matches!(determine_winner(&result), WinnerDetermination::Winner { .. }));
    }

    #[test]
    fn test_no_candidates_and_no_votes() {
        let empty = tally_position("p", "President", &[], &counts(0, 0, 3));
        assert_eq!(determine_winner(&empty), WinnerDetermination::NoCandidates);

        let silent = tally_position("p", "President", &candidates(), &BallotCounts::default());
        assert_eq!(determine_winner(&silent), WinnerDetermination::NoVotes);
        assert_eq!(silent.abstain_percentage, 0);
    }

    #[test]
    fn test_tally_conservation_and_percentages() {
        let mut raw = counts(3, 5, 2);
        raw.candidate_votes.insert(99, 7);
        let result = tally_position("p", "President", &candidates(), &raw);

        let candidate_sum: u64 = result.candidates.iter().map(|c| c.votes).sum();
        assert_eq!(candidate_sum + result.abstain_count, result.total_votes);
        assert_eq!(result.total_votes, 10);
        assert_eq!(names(&result.candidates), vec!["B", "A"]);
        assert_eq!(result.candidates[0].percentage, 50);
        assert_eq!(result.candidates[1].percentage, 30);
        assert_eq!(result.abstain_percentage, 20);
    }

    #[test]
    fn test_equal_votes_keep_input_order() {
        let reversed: Vec<Candidate> = candidates().into_iter().rev().collect();
        let result = tally_position("p", "President", &reversed, &counts(4, 4, 0));
        assert_eq!(names(&result.candidates), vec!["B", "A"]);
    }

    #[test]
    fn test_turnout_edges() {
        let none_eligible = compute_turnout(0, 0);
        assert_eq!(none_eligible.percentage, 0);
        assert_eq!(none_eligible.not_voted, 0);

        let stale = compute_turnout(100, 120);
        assert_eq!(stale.percentage, 120);
        assert_eq!(stale.not_voted, 0);

        let normal = compute_turnout(3, 2);
        assert_eq!(normal.percentage, 67);
        assert_eq!(normal.not_voted, 1);
    }

    #[test]
    fn test_winner_serializes_with_status_tag() {
        let json = serde_json::to_value(WinnerDetermination::AbstainWins { abstain_count: 9 }).unwrap();
        assert_eq!(json["status"], "abstain_wins");
        assert_eq!(json["abstain_count"], 9);

        let json = serde_json::to_value(WinnerDetermination::NoVotes).unwrap();
        assert_eq!(json["status"], "no_votes");
    }

    async fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        let mut election = Election::new(
            "Council".to_string(),
            vec![Position {
                id: "president".to_string(),
                title: "President".to_string(),
                enabled: true,
                candidates: candidates(),
            }],
            None,
        );
        election.id = "e1".to_string();
        store.insert_election(election).unwrap();

        let picks = [Some(1), Some(2), Some(1), None];
        for (i, pick) in picks.iter().enumerate() {
            let student_id = format!("30{:02}", i);
            store
                .insert_student(Student {
                    student_id: student_id.clone(),
                    name: "N".to_string(),
                    surname: "S".to_string(),
                    classroom: None,
                    no: None,
                    national_id: None,
                })
                .unwrap();
            let choice = VoteChoice {
                position_id: "president".to_string(),
                candidate_id: *pick,
            };
            let outcome = cast_vote(&store, Some(&Voter { student_id }), "e1", &[choice], None).await;
            assert!(outcome.success);
        }
        store
    }

    #[tokio::test]
    async fn test_results_are_idempotent() {
        let store = seeded_store().await;
        let first = get_position_results(&store, "e1", "president", "President", &candidates())
            .await
            .unwrap();
        let second = get_position_results(&store, "e1", "president", "President", &candidates())
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total_votes, 4);
        assert_eq!(first.abstain_count, 1);
    }

    #[tokio::test]
    async fn test_election_results() {
        let store = seeded_store().await;
        let results = get_election_results(&store, "e1", 10).await.unwrap();

        assert_eq!(results.turnout.total_voted, 4);
        assert_eq!(results.turnout.percentage, 40);
        assert_eq!(results.positions.len(), 1);
        match &results.positions[0].winner {
            WinnerDetermination::Winner { winner } => assert_eq!(winner.candidate_id, 1),
            other => panic!("expected winner, got {:?}", other),
        }
    }
}

pub mod cast;
pub mod results;
pub mod token;

pub use cast::{cast_vote, Rejection, VoteError, VoteOutcome};
pub use results::{
    compute_turnout, determine_winner, get_election_results, get_position_results, get_voter_turnout,
    tally_position, CandidateTally, ElectionResults, PositionOutcome, PositionResult, Turnout,
    WinnerDetermination,
};
pub use token::{verify_token, TokenVerification, VerificationToken};

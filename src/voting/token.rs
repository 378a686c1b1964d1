use serde::Serialize;
use uuid::Uuid;

use crate::db::{StoreError, VoteStore};

const TOKEN_PREFIX: &str = "VT-";

/// Receipt handed to the voter after a successful cast.
///
/// The value comes from the OS random source and nothing about the voter or
/// the time of the vote goes into it, so it cannot be recomputed or inverted.
/// The store keeps it next to the election id only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationToken(String);

impl VerificationToken {
    pub fn generate() -> Self {
        Self(format!("{}{}", TOKEN_PREFIX, Uuid::new_v4().simple().to_string().to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Shape check done before any lookup.
    pub fn is_well_formed(candidate: &str) -> bool {
        candidate
            .strip_prefix(TOKEN_PREFIX)
            .is_some_and(|hex| hex.len() == 32 && hex.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenVerification {
    pub token: String,
    pub election_id: String,
}

/// Looks a receipt up. Only the election it belongs to is revealed.
pub async fn verify_token(store: &dyn VoteStore, token: &str) -> Result<Option<TokenVerification>, StoreError> {
    let token = token.trim().to_uppercase();
    if !VerificationToken::is_well_formed(&token) {
        return Ok(None);
    }
    Ok(store
        .find_token(&token)
        .await?
        .map(|election_id| TokenVerification { token, election_id }))
}

// 🚫 Vote outcomes that are not a success
//
// Every variant except `Storage` is an expected, caller-visible outcome of a
// single attempt. `Storage` wraps ledger / entity store failures and aborts
// the attempt with nothing written.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("{score} is not a valid choice for {field}")]
    InvalidRating { field: String, score: i64 },

    #[error("anonymous votes are not allowed for {field}")]
    AuthRequired { field: String },

    #[error("votes for {field} cannot be changed")]
    CannotChangeVote { field: String },

    #[error("cannot delete vote for {field}: {reason}")]
    CannotDeleteVote { field: String, reason: String },

    #[error("too many votes from {ip}")]
    IpLimitReached { ip: String },

    #[error("entity type {entity_type} has no rating field named {field}")]
    UnknownField { entity_type: i64, field: String },

    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl VoteError {
    /// Only storage failures abort the caller's unit of work
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoteError::Storage(_))
    }

    /// Numeric code understood by HTTP clients (0 is success)
    pub fn status_code(&self) -> u8 {
        match self {
            VoteError::AuthRequired { .. } => 1,
            VoteError::CannotChangeVote { .. } => 2,
            VoteError::CannotDeleteVote { .. } => 3,
            VoteError::UnknownField { .. } => 5,
            VoteError::InvalidRating { .. } => 8,
            VoteError::IpLimitReached { .. } => 10,
            VoteError::Storage(_) => 100,
        }
    }

    /// Message safe to show to the voter
    pub fn public_message(&self) -> &'static str {
        match self {
            VoteError::AuthRequired { .. } => "You must be logged in to vote.",
            VoteError::CannotChangeVote { .. } => "You have already voted.",
            VoteError::CannotDeleteVote { .. } => "You can't delete this vote.",
            VoteError::UnknownField { .. } => "Invalid field name.",
            VoteError::InvalidRating { .. } => "Invalid rating value.",
            VoteError::IpLimitReached { .. } => "Too many votes from this IP address.",
            VoteError::Storage(_) => "Internal error.",
        }
    }
}

/// Status code for a vetoed vote
pub const ABORTED_STATUS: u8 = 11;
pub const ABORTED_MESSAGE: &str = "Vote aborted by 'will rate' hook.";

/// Status code for a request the HTTP layer could not parse
pub const INVALID_PARAMS_STATUS: u8 = 4;
pub const INVALID_PARAMS_MESSAGE: &str = "Invalid params provided.";

/// Rejected rating field or engine configuration
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("rating field {field} needs at least one score in its range")]
    EmptyRange { field: String },

    #[error("rating field {field} lists score {score} more than once")]
    DuplicateScore { field: String, score: i64 },

    #[error("entity type {entity_type} declares rating field {field} twice")]
    DuplicateField { entity_type: i64, field: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_storage_is_fatal() {
        let rejected = VoteError::CannotChangeVote {
            field: "quality".to_string(),
        };
        let broken = VoteError::from(anyhow::anyhow!("disk I/O error"));

        assert!(!rejected.is_fatal());
        assert!(broken.is_fatal());
        assert_eq!(rejected.status_code(), 2);
        assert_eq!(broken.to_string(), "storage failure: disk I/O error");
    }

    #[test]
    fn test_messages() {
        let err = VoteError::InvalidRating {
            field: "quality".to_string(),
            score: 7,
        };

        assert_eq!(err.to_string(), "7 is not a valid choice for quality");
        assert_eq!(err.public_message(), "Invalid rating value.");
        assert_eq!(err.status_code(), 8);
    }
}

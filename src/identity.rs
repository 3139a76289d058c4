// 🪪 Vote Identity Resolver
// Who is voting? An authenticated user, or an anonymous (IP, cookie?) pair.
// Also home of the per-IP rate limit for first-time anonymous votes.

use crate::entity::EntityRef;
use crate::error::VoteError;
use crate::field::RatingField;
use crate::ledger::VoteLedger;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use tracing::debug;

// ============================================================================
// CREDENTIALS (what the identity provider hands us)
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Voter {
    /// Authenticated user id, None for anonymous visitors
    pub user: Option<String>,
    pub ip: IpAddr,
    /// Cookies the client sent along
    pub cookies: HashMap<String, String>,
}

impl Voter {
    pub fn user(id: impl Into<String>, ip: IpAddr) -> Self {
        Voter {
            user: Some(id.into()),
            ip,
            cookies: HashMap::new(),
        }
    }

    pub fn anonymous(ip: IpAddr) -> Self {
        Voter {
            user: None,
            ip,
            cookies: HashMap::new(),
        }
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.user.as_deref().map_or(true, str::is_empty)
    }
}

// ============================================================================
// CANONICAL IDENTITY (what the ledger is keyed on)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VoterIdentity {
    User { id: String },
    Anonymous { ip: IpAddr, cookie: Option<String> },
}

impl VoterIdentity {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, VoterIdentity::Anonymous { .. })
    }
}

impl fmt::Display for VoterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoterIdentity::User { id } => write!(f, "user:{}", id),
            VoterIdentity::Anonymous { ip, cookie: None } => write!(f, "anon:{}", ip),
            VoterIdentity::Anonymous {
                ip,
                cookie: Some(cookie),
            } => write!(f, "anon:{}#{}", ip, cookie),
        }
    }
}

/// Outcome of identity resolution for one field on one entity
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedVoter {
    pub identity: VoterIdentity,
    pub ip: IpAddr,
    /// Cookie namespace when the field runs in cookie mode
    pub cookie_name: Option<String>,
}

impl ResolvedVoter {
    pub fn cookie_mode(&self) -> bool {
        self.cookie_name.is_some()
    }
}

/// Compute the ledger identity for `voter` and check they may vote on `field` at all
pub fn resolve(
    field: &RatingField,
    entity: &EntityRef,
    voter: &Voter,
) -> Result<ResolvedVoter, VoteError> {
    if !voter.is_anonymous() {
        let id = voter.user.clone().unwrap_or_default();
        return Ok(ResolvedVoter {
            identity: VoterIdentity::User { id },
            ip: voter.ip,
            cookie_name: None,
        });
    }

    if !field.allows_anonymous() {
        debug!(field = field.name(), ip = %voter.ip, "anonymous vote refused");
        return Err(VoteError::AuthRequired {
            field: field.name().to_string(),
        });
    }

    if !field.uses_cookies() {
        return Ok(ResolvedVoter {
            identity: VoterIdentity::Anonymous {
                ip: voter.ip,
                cookie: None,
            },
            ip: voter.ip,
            cookie_name: None,
        });
    }

    let cookie_name = field.cookie_name(entity);
    let cookie = voter
        .cookies
        .get(&cookie_name)
        .filter(|token| !token.is_empty())
        .cloned();

    Ok(ResolvedVoter {
        identity: VoterIdentity::Anonymous {
            ip: voter.ip,
            cookie,
        },
        ip: voter.ip,
        cookie_name: Some(cookie_name),
    })
}

/// Fresh opaque cookie token (32 hex chars, unguessable)
pub fn mint_cookie_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ============================================================================
// RATE LIMIT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimit {
    /// 0 disables the limit
    pub max_votes: u32,
    pub window: Duration,
}

impl RateLimit {
    pub fn new(max_votes: u32, window: Duration) -> Self {
        RateLimit { max_votes, window }
    }

    pub fn is_enabled(&self) -> bool {
        self.max_votes > 0
    }

    /// Start of the sliding window ending at `now`
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.window
    }

    /// Refuse another first-time vote from `ip` once the window is full
    pub fn enforce<L: VoteLedger + ?Sized>(
        &self,
        ledger: &L,
        ip: IpAddr,
        now: DateTime<Utc>,
    ) -> Result<(), VoteError> {
        if !self.is_enabled() {
            return Ok(());
        }

        let recent = ledger.count_by_ip(ip, self.window_start(now))?;
        if recent >= u64::from(self.max_votes) {
            debug!(%ip, recent, limit = self.max_votes, "ip vote limit reached");
            return Err(VoteError::IpLimitReached { ip: ip.to_string() });
        }

        Ok(())
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        RateLimit::new(3, Duration::days(1))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formula::Formula;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    fn field() -> RatingField {
        RatingField::new("quality", vec![1, 2, 3, 4, 5], Formula::weighted_average()).unwrap()
    }

    #[test]
    fn test_user_identity_ignores_cookies() {
        let field = field().allow_anonymous(true).use_cookies(true);
        let entity = EntityRef::new(1, 1);
        let voter = Voter::user("alice", ip(1)).with_cookie(field.cookie_name(&entity), "t");

        let resolved = resolve(&field, &entity, &voter).unwrap();
        assert_eq!(
            resolved.identity,
            VoterIdentity::User {
                id: "alice".to_string()
            }
        );
        assert!(!resolved.cookie_mode());
    }

    #[test]
    fn test_anonymous_requires_permission() {
        let entity = EntityRef::new(1, 1);
        let err = resolve(&field(), &entity, &Voter::anonymous(ip(1))).unwrap_err();
        assert!(matches!(err, VoteError::AuthRequired { .. }));

        // Empty user id counts as anonymous
        let voter = Voter::user("", ip(1));
        assert!(voter.is_anonymous());
        assert!(resolve(&field(), &entity, &voter).is_err());
    }

    #[test]
    fn test_anonymous_without_cookies() {
        let field = field().allow_anonymous(true);
        let entity = EntityRef::new(1, 1);

        let resolved = resolve(&field, &entity, &Voter::anonymous(ip(9))).unwrap();
        assert_eq!(
            resolved.identity,
            VoterIdentity::Anonymous {
                ip: ip(9),
                cookie: None
            }
        );
        assert_eq!(resolved.cookie_name, None);
    }

    #[test]
    fn test_anonymous_cookie_lookup() {
        let field = field().allow_anonymous(true).use_cookies(true);
        let entity = EntityRef::new(3, 44);
        let name = field.cookie_name(&entity);

        let fresh = resolve(&field, &entity, &Voter::anonymous(ip(2))).unwrap();
        assert_eq!(fresh.cookie_name.as_deref(), Some(name.as_str()));
        assert_eq!(
            fresh.identity,
            VoterIdentity::Anonymous {
                ip: ip(2),
                cookie: None
            }
        );

        let returning = Voter::anonymous(ip(2))
            .with_cookie(name.clone(), "abc123")
            .with_cookie("vote-3.45.other", "zzz");
        let resolved = resolve(&field, &entity, &returning).unwrap();
        assert_eq!(
            resolved.identity,
            VoterIdentity::Anonymous {
                ip: ip(2),
                cookie: Some("abc123".to_string())
            }
        );
    }

    #[test]
    fn test_cookie_tokens_are_unique() {
        let a = mint_cookie_token();
        let b = mint_cookie_token();

        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_identity_display() {
        let user = VoterIdentity::User {
            id: "bob".to_string(),
        };
        let anon = VoterIdentity::Anonymous {
            ip: ip(7),
            cookie: Some("tok".to_string()),
        };

        assert_eq!(user.to_string(), "user:bob");
        assert_eq!(anon.to_string(), "anon:10.0.0.7#tok");
        assert!(anon.is_anonymous());
    }

    #[test]
    fn test_rate_limit_window() {
        let limit = RateLimit::default();
        let now = Utc::now();

        assert!(limit.is_enabled());
        assert_eq!(limit.window_start(now), now - Duration::days(1));
        assert!(!RateLimit::new(0, Duration::days(1)).is_enabled());
    }
}

//! Audience expression parsing
//!
//! Turns the free-form `to` field of a publish request into an [`Audience`]
//! once, at the boundary. Everything downstream works on the typed value.
//!
//! Recognized forms, checked in order:
//!
//! - empty → public
//! - `@public` / `public` → public
//! - `@server` / `server` / `@<local domain>` → server
//! - whitespace separated `circle:<id>@<domain>` / `group:<id>@<domain>`
//!   tokens; only tokens on the local domain count, and circles win over
//!   groups when both appear
//! - anything else → public (see [`UnrecognizedAudiencePolicy`])

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{FanoutError, Result};

const CIRCLE_PREFIX: &str = "circle:";
const GROUP_PREFIX: &str = "group:";

const PUBLIC_ALIASES: [&str; 2] = ["@public", "public"];
const SERVER_ALIASES: [&str; 2] = ["@server", "server"];

/// Parsed audience of a content item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "ids", rename_all = "lowercase")]
pub enum Audience {
    Public,
    Server,
    Circle(Vec<String>),
    Group(Vec<String>),
}

impl Audience {
    /// Short label used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Server => "server",
            Self::Circle(_) => "circle",
            Self::Group(_) => "group",
        }
    }
}

impl fmt::Display for Audience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public | Self::Server => f.write_str(self.kind()),
            Self::Circle(ids) | Self::Group(ids) => {
                write!(f, "{}({})", self.kind(), ids.join(" "))
            }
        }
    }
}

/// What to do with a non-empty audience that matches no form
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnrecognizedAudiencePolicy {
    /// Treat it as public (fail open)
    #[default]
    Public,
    /// Refuse the publish request (fail closed)
    Reject,
}

/// Visibility a group declares for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupVisibility {
    Public,
    Server,
    Private,
}

/// Classifies audience expressions against one local domain
#[derive(Debug, Clone)]
pub struct AudienceResolver {
    /// Lower-cased local domain
    local_domain: String,
    /// `@<local domain>`, lower-cased
    domain_alias: String,
}

impl AudienceResolver {
    pub fn new(local_domain: &str) -> Self {
        let local_domain = local_domain.trim().to_lowercase();
        let domain_alias = format!("@{}", local_domain);
        Self {
            local_domain,
            domain_alias,
        }
    }

    /// Classify an audience expression, falling back to public
    pub fn classify(&self, to: Option<&str>) -> Audience {
        self.parse(to).unwrap_or(Audience::Public)
    }

    /// Classify an audience expression under an explicit policy
    pub fn resolve(&self, to: Option<&str>, policy: UnrecognizedAudiencePolicy) -> Result<Audience> {
        match (self.parse(to), policy) {
            (Some(audience), _) => Ok(audience),
            (None, UnrecognizedAudiencePolicy::Public) => Ok(Audience::Public),
            (None, UnrecognizedAudiencePolicy::Reject) => Err(FanoutError::UnrecognizedAudience(
                to.unwrap_or_default().trim().to_string(),
            )),
        }
    }

    /// Classify the `to` field of a group document
    pub fn group_visibility(&self, to: Option<&str>) -> GroupVisibility {
        let lower = to.unwrap_or_default().trim().to_lowercase();
        if lower.is_empty() || self.is_public_alias(&lower) {
            GroupVisibility::Public
        } else if self.is_server_alias(&lower) {
            GroupVisibility::Server
        } else {
            GroupVisibility::Private
        }
    }

    /// Whether an actor id lives on the local domain
    pub fn is_local_actor(&self, actor_id: &str) -> bool {
        actor_id.to_lowercase().ends_with(&self.domain_alias)
    }

    /// `None` means the input was non-empty and matched nothing
    fn parse(&self, to: Option<&str>) -> Option<Audience> {
        let raw = to.unwrap_or_default().trim();
        if raw.is_empty() {
            return Some(Audience::Public);
        }

        let lower = raw.to_lowercase();
        if self.is_public_alias(&lower) {
            return Some(Audience::Public);
        }
        if self.is_server_alias(&lower) {
            return Some(Audience::Server);
        }

        let mut circle_ids: Vec<String> = Vec::new();
        let mut group_ids: Vec<String> = Vec::new();

        for token in raw.split_whitespace() {
            let Some(head) = self.local_head(token) else {
                continue;
            };
            if let Some(id) = strip_prefix_ignore_case(head, CIRCLE_PREFIX) {
                push_unique(&mut circle_ids, self.local_id(CIRCLE_PREFIX, id));
            } else if let Some(id) = strip_prefix_ignore_case(head, GROUP_PREFIX) {
                push_unique(&mut group_ids, self.local_id(GROUP_PREFIX, id));
            }
        }

        if !circle_ids.is_empty() {
            Some(Audience::Circle(circle_ids))
        } else if !group_ids.is_empty() {
            Some(Audience::Group(group_ids))
        } else {
            None
        }
    }

    fn is_public_alias(&self, lower: &str) -> bool {
        PUBLIC_ALIASES.contains(&lower)
    }

    fn is_server_alias(&self, lower: &str) -> bool {
        SERVER_ALIASES.contains(&lower) || lower == self.domain_alias
    }

    /// Token without its `@<domain>` suffix, when the domain is ours
    fn local_head<'a>(&self, token: &'a str) -> Option<&'a str> {
        let (head, domain) = token.rsplit_once('@')?;
        domain.eq_ignore_ascii_case(&self.local_domain).then_some(head)
    }

    /// Canonical stored id: lower-case prefix and domain, local part as given
    fn local_id(&self, prefix: &str, id: &str) -> String {
        format!("{}{}@{}", prefix, id, self.local_domain)
    }
}

/// Classify `to` for `local_domain` without keeping a resolver around
pub fn classify(to: Option<&str>, local_domain: &str) -> Audience {
    AudienceResolver::new(local_domain).classify(to)
}

fn strip_prefix_ignore_case<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    let head = token.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&token[prefix.len()..])
    } else {
        None
    }
}

fn push_unique(ids: &mut Vec<String>, id: String) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &str = "kwln.org";

    fn resolver() -> AudienceResolver {
        AudienceResolver::new(DOMAIN)
    }

    #[test]
    fn test_empty_is_public() {
        assert_eq!(resolver().classify(None), Audience::Public);
        assert_eq!(resolver().classify(Some("")), Audience::Public);
        assert_eq!(resolver().classify(Some("   \t ")), Audience::Public);
    }

    #[test]
    fn test_public_aliases_any_case() {
        for to in ["@public", "public", "@PUBLIC", "Public", "  @Public  ", "\tpublic\n"] {
            assert_eq!(resolver().classify(Some(to)), Audience::Public, "{:?}", to);
        }
    }

    #[test]
    fn test_server_aliases() {
        for to in ["@server", "SERVER", " server ", "@kwln.org", "@KWLN.org"] {
            assert_eq!(resolver().classify(Some(to)), Audience::Server, "{:?}", to);
        }
        // Some other server's domain is not our server
        assert_eq!(resolver().classify(Some("@other.org")), Audience::Public);
    }

    #[test]
    fn test_circle_tokens() {
        let audience = resolver().classify(Some("circle:c1@kwln.org circle:c2@kwln.org"));
        assert_eq!(
            audience,
            Audience::Circle(vec!["circle:c1@kwln.org".into(), "circle:c2@kwln.org".into()])
        );
    }

    #[test]
    fn test_group_tokens() {
        let audience = resolver().classify(Some("group:g1@kwln.org"));
        assert_eq!(audience, Audience::Group(vec!["group:g1@kwln.org".into()]));
    }

    #[test]
    fn test_circles_win_over_groups() {
        let audience = resolver().classify(Some("group:g1@kwln.org circle:c1@kwln.org"));
        assert_eq!(audience, Audience::Circle(vec!["circle:c1@kwln.org".into()]));
    }

    #[test]
    fn test_cross_domain_tokens_ignored() {
        assert_eq!(
            resolver().classify(Some("circle:x@otherdomain")),
            Audience::Public
        );
        assert_eq!(
            resolver().classify(Some("circle:x@otherdomain group:g@kwln.org")),
            Audience::Group(vec!["group:g@kwln.org".into()])
        );
    }

    #[test]
    fn test_tokens_without_domain_ignored() {
        assert_eq!(resolver().classify(Some("circle:abc")), Audience::Public);
    }

    #[test]
    fn test_prefix_case_normalized_and_duplicates_collapsed() {
        let audience = resolver().classify(Some("CIRCLE:c1@KWLN.ORG  circle:c1@KWLN.ORG\ncircle:c2@kwln.org"));
        assert_eq!(
            audience,
            Audience::Circle(vec!["circle:c1@kwln.org".into(), "circle:c2@kwln.org".into()])
        );
    }

    #[test]
    fn test_mixed_case_domain_matches_plain_token() {
        let r = resolver();
        assert_eq!(
            r.classify(Some("group:g1@Kwln.Org")),
            r.classify(Some("group:g1@kwln.org"))
        );
        assert_eq!(
            r.classify(Some("circle:c1@KWLN.ORG circle:c1@kwln.org")),
            Audience::Circle(vec!["circle:c1@kwln.org".into()])
        );
    }

    #[test]
    fn test_garbage_falls_back_to_public() {
        assert_eq!(resolver().classify(Some("friends and family")), Audience::Public);
    }

    #[test]
    fn test_reject_policy_fails_closed() {
        let err = resolver()
            .resolve(Some("friends and family"), UnrecognizedAudiencePolicy::Reject)
            .unwrap_err();
        assert!(matches!(err, FanoutError::UnrecognizedAudience(ref s) if s == "friends and family"));

        // Empty and recognized input is unaffected by the policy
        assert_eq!(
            resolver().resolve(None, UnrecognizedAudiencePolicy::Reject).unwrap(),
            Audience::Public
        );
        assert_eq!(
            resolver()
                .resolve(Some("@server"), UnrecognizedAudiencePolicy::Reject)
                .unwrap(),
            Audience::Server
        );
    }

    #[test]
    fn test_free_function_matches_resolver() {
        assert_eq!(classify(Some("@kwln.org"), "KWLN.org"), Audience::Server);
        assert_eq!(classify(Some("@kwln.org"), "other.org"), Audience::Public);
    }

    #[test]
    fn test_group_visibility() {
        let r = resolver();
        assert_eq!(r.group_visibility(None), GroupVisibility::Public);
        assert_eq!(r.group_visibility(Some("@Public")), GroupVisibility::Public);
        assert_eq!(r.group_visibility(Some("@server")), GroupVisibility::Server);
        assert_eq!(r.group_visibility(Some("@kwln.org")), GroupVisibility::Server);
        assert_eq!(r.group_visibility(Some("group:g2@kwln.org")), GroupVisibility::Private);
    }

    #[test]
    fn test_local_actor() {
        let r = resolver();
        assert!(r.is_local_actor("@alice@kwln.org"));
        assert!(r.is_local_actor("@Alice@KWLN.ORG"));
        assert!(!r.is_local_actor("@alice@other.org"));
        assert!(!r.is_local_actor("@alice@notkwln.org"));
    }

    #[test]
    fn test_audience_serializes_tagged() {
        let json = serde_json::to_value(Audience::Circle(vec!["circle:c1@kwln.org".into()])).unwrap();
        assert_eq!(json["type"], "circle");
        assert_eq!(json["ids"][0], "circle:c1@kwln.org");
    }
}

//! Session gate: decides, per navigation, whether a request proceeds or is redirected.
//!
//! The decision is split in two: `decide` is a pure function of the path, whether the
//! caller is authenticated, and the outcome of the role lookup; `authorize` performs
//! the single profile lookup (only when the decision depends on it) and calls `decide`.
//! A failed or empty lookup fails closed on protected areas.

use tracing::{debug, warn};

use super::{Role, Session};
use crate::backend::DataBackend;

pub const LOGIN_PATH: &str = "/";
pub const ADMIN_HOME: &str = "/admin";
pub const USER_HOME: &str = "/user";

const STATIC_PREFIXES: &[&str] = &["/static/", "/favicon.ico"];
const STATIC_SUFFIXES: &[&str] = &[".svg", ".png", ".jpg", ".jpeg", ".gif", ".webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Redirect(&'static str),
}

/// Outcome of resolving the caller's profile role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleLookup {
    Found(Role),
    Missing,
    Failed,
}

impl RoleLookup {
    pub fn role(self) -> Option<Role> {
        match self {
            RoleLookup::Found(r) => Some(r),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Admin,
    User,
    Login,
    Public,
}

fn under(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl Area {
    pub fn of(path: &str) -> Area {
        if path == LOGIN_PATH { return Area::Login; }
        if under(path, ADMIN_HOME) { return Area::Admin; }
        if under(path, USER_HOME) { return Area::User; }
        Area::Public
    }

    pub fn is_protected(self) -> bool { matches!(self, Area::Admin | Area::User) }
}

/// Static assets bypass the gate entirely. Nothing under `/admin` or `/user` is a static
/// asset, whatever its suffix.
pub fn is_gated_path(path: &str) -> bool {
    if Area::of(path).is_protected() { return true; }
    if STATIC_PREFIXES.iter().any(|p| path.starts_with(p)) { return false; }
    let lower = path.to_ascii_lowercase();
    !STATIC_SUFFIXES.iter().any(|s| lower.ends_with(s))
}

/// Pure gate decision. `lookup` is `None` when no lookup was performed.
pub fn decide(path: &str, authenticated: bool, lookup: Option<RoleLookup>) -> Decision {
    let area = Area::of(path);
    if !authenticated {
        return if area.is_protected() { Decision::Redirect(LOGIN_PATH) } else { Decision::Allow };
    }
    match area {
        Area::Admin | Area::User => match lookup {
            Some(RoleLookup::Found(Role::Admin)) if area == Area::User => Decision::Redirect(ADMIN_HOME),
            Some(RoleLookup::Found(Role::User)) if area == Area::Admin => Decision::Redirect(USER_HOME),
            Some(RoleLookup::Found(_)) => Decision::Allow,
            Some(RoleLookup::Missing) | Some(RoleLookup::Failed) | None => Decision::Redirect(LOGIN_PATH),
        },
        // Staying on the login surface when the role is unknown avoids a redirect loop.
        Area::Login => match lookup.and_then(RoleLookup::role) {
            Some(role) => Decision::Redirect(role.home()),
            None => Decision::Allow,
        },
        Area::Public => Decision::Allow,
    }
}

/// Evaluate the gate for one navigation. Returns the decision and the role, when resolved.
pub async fn authorize(path: &str, session: Option<&Session>, data: &dyn DataBackend) -> (Decision, Option<Role>) {
    let needs_role = session.is_some() && Area::of(path) != Area::Public;
    let lookup = match session {
        Some(s) if needs_role => {
            let lookup = match data.profile_role(&s.token, &s.principal.id).await {
                Ok(Some(role)) => RoleLookup::Found(role),
                Ok(None) => RoleLookup::Missing,
                Err(e) => {
                    warn!(target: "gate", user_id = %s.principal.id, "role lookup failed: {}", e);
                    RoleLookup::Failed
                }
            };
            Some(lookup)
        }
        _ => None,
    };
    let decision = decide(path, session.is_some(), lookup);
    debug!(target: "gate", path, authenticated = session.is_some(), ?lookup, ?decision, "gate decision");
    (decision, lookup.and_then(RoleLookup::role))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTECTED: &[&str] = &["/admin", "/admin/users", "/admin/upload", "/user", "/user/upload", "/user/a/b"];

    #[test]
    fn anonymous_is_sent_to_login_from_every_protected_path() {
        for p in PROTECTED {
            assert_eq!(decide(p, false, None), Decision::Redirect(LOGIN_PATH), "path {}", p);
        }
        assert_eq!(decide("/", false, None), Decision::Allow);
        assert_eq!(decide("/about", false, None), Decision::Allow);
    }

    #[test]
    fn admin_is_bounced_out_of_user_area() {
        let admin = Some(RoleLookup::Found(Role::Admin));
        assert_eq!(decide("/user", true, admin), Decision::Redirect(ADMIN_HOME));
        assert_eq!(decide("/user/anything", true, admin), Decision::Redirect(ADMIN_HOME));
        assert_eq!(decide("/admin/users", true, admin), Decision::Allow);
    }

    #[test]
    fn non_admin_is_bounced_out_of_admin_area() {
        let user = Some(RoleLookup::Found(Role::User));
        assert_eq!(decide("/admin", true, user), Decision::Redirect(USER_HOME));
        assert_eq!(decide("/admin/anything", true, user), Decision::Redirect(USER_HOME));
        assert_eq!(decide("/user/upload", true, user), Decision::Allow);
    }

    #[test]
    fn failed_or_missing_lookup_fails_closed() {
        for lookup in [RoleLookup::Failed, RoleLookup::Missing] {
            for p in PROTECTED {
                assert_eq!(decide(p, true, Some(lookup)), Decision::Redirect(LOGIN_PATH));
            }
            // the login page itself still renders
            assert_eq!(decide("/", true, Some(lookup)), Decision::Allow);
        }
    }

    #[test]
    fn signed_in_caller_leaves_login_for_role_home() {
        assert_eq!(decide("/", true, Some(RoleLookup::Found(Role::Admin))), Decision::Redirect("/admin"));
        assert_eq!(decide("/", true, Some(RoleLookup::Found(Role::User))), Decision::Redirect("/user"));
    }

    #[test]
    fn prefix_match_is_segment_aware() {
        assert_eq!(Area::of("/administrator"), Area::Public);
        assert_eq!(Area::of("/users"), Area::Public);
        assert_eq!(Area::of("/admin/"), Area::Admin);
        assert_eq!(decide("/administrator", false, None), Decision::Allow);
    }

    #[test]
    fn decision_is_deterministic() {
        for p in PROTECTED.iter().chain(["/", "/x"].iter()) {
            for auth in [true, false] {
                for l in [None, Some(RoleLookup::Found(Role::Admin)), Some(RoleLookup::Found(Role::User)), Some(RoleLookup::Failed)] {
                    assert_eq!(decide(p, auth, l), decide(p, auth, l));
                }
            }
        }
    }

    #[test]
    fn static_assets_bypass_gate() {
        assert!(!is_gated_path("/static/app.css"));
        assert!(!is_gated_path("/favicon.ico"));
        assert!(!is_gated_path("/logo.PNG"));
        assert!(is_gated_path("/admin/users"));
        assert!(is_gated_path("/"));
    }

    #[test]
    fn image_suffix_never_unlocks_protected_areas() {
        for p in ["/admin/users/x.png", "/admin/logo.PNG", "/user/avatar.jpg", "/user/files/a.webp"] {
            assert!(is_gated_path(p), "path {}", p);
            assert_eq!(decide(p, false, None), Decision::Redirect(LOGIN_PATH), "path {}", p);
        }
    }
}

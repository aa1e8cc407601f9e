//! Identity, roles and the session gate that decides every navigation.
//! Keep the public surface thin and split implementation across sub-modules.

mod principal;
mod profile;
mod session;
mod request_context;
mod gate;

pub use principal::Principal;
pub use profile::{Profile, Role, UserRow, EMAIL_UNAVAILABLE};
pub use session::{Session, parse_cookie, session_cookie, clear_session_cookie, SESSION_COOKIE};
pub use request_context::RequestContext;
pub use gate::{authorize, decide, is_gated_path, Decision, RoleLookup, Area, LOGIN_PATH, ADMIN_HOME, USER_HOME};

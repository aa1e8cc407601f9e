use axum::http::{HeaderMap, HeaderValue};

use super::Principal;

/// Cookie carrying the backend access token for the browser session.
pub const SESSION_COOKIE: &str = "adminpanel_session";

/// A resolved credential: the access token and the principal it belongs to.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub principal: Principal,
}

pub fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    for cookie in headers.get_all("cookie").iter() {
        let Ok(s) = cookie.to_str() else { continue; };
        for part in s.split(';') {
            let p = part.trim();
            if let Some((k, v)) = p.split_once('=') {
                if k == name && !v.is_empty() { return Some(v.to_string()); }
            }
        }
    }
    None
}

/// HttpOnly cookie scoped to path / with SameSite=Lax so the gate sees it on top-level navigations.
pub fn session_cookie(token: &str, secure: bool) -> Option<HeaderValue> {
    let secure = if secure { "; Secure" } else { "" };
    HeaderValue::from_str(&format!("{}={}; HttpOnly; SameSite=Lax; Path=/{}", SESSION_COOKIE, token, secure)).ok()
}

pub fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_static("adminpanel_session=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; SameSite=Lax; Path=/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_named_cookie_among_others() {
        let mut h = HeaderMap::new();
        h.insert("cookie", HeaderValue::from_static("theme=dark; adminpanel_session=tok123; lang=es"));
        assert_eq!(parse_cookie(&h, SESSION_COOKIE).as_deref(), Some("tok123"));
        assert_eq!(parse_cookie(&h, "missing"), None);
    }

    #[test]
    fn empty_cookie_value_is_absent() {
        let mut h = HeaderMap::new();
        h.insert("cookie", HeaderValue::from_static("adminpanel_session="));
        assert_eq!(parse_cookie(&h, SESSION_COOKIE), None);
    }

    #[test]
    fn secure_flag_is_optional() {
        let c = session_cookie("abc", true).unwrap();
        assert!(c.to_str().unwrap().ends_with("; Secure"));
        let c = session_cookie("abc", false).unwrap();
        assert!(!c.to_str().unwrap().contains("Secure"));
        assert!(session_cookie("bad\nvalue", false).is_none());
    }
}

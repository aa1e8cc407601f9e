use super::{Principal, Role};

/// Attached to a request by the gate once it has decided to let it through.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub principal: Option<Principal>,
    pub role: Option<Role>,
    pub token: Option<String>,
}

impl RequestContext {
    pub fn anonymous() -> Self { Self::default() }

    pub fn is_admin(&self) -> bool { self.role.map(Role::is_admin).unwrap_or(false) }
}

//! Role checks shared by the administrative and worker operations.

use scanmark_shared::{Caller, Result, Role, ScanmarkError};

/// Fail with [`ScanmarkError::PermissionDenied`] unless `caller` has one of `roles`.
pub fn require_role(caller: &Caller, roles: &[Role], action: &'static str) -> Result<()> {
    if roles.contains(&caller.role) {
        return Ok(());
    }
    Err(ScanmarkError::PermissionDenied {
        user: caller.username.clone(),
        action,
    })
}

pub fn require_manager(caller: &Caller, action: &'static str) -> Result<()> {
    require_role(caller, &[Role::Manager], action)
}

/// Markers and managers.
pub fn require_worker(caller: &Caller, action: &'static str) -> Result<()> {
    require_role(caller, &[Role::Marker, Role::Manager], action)
}

/// Scanners and managers.
pub fn require_scanner(caller: &Caller, action: &'static str) -> Result<()> {
    require_role(caller, &[Role::Scanner, Role::Manager], action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_gate_actions() {
        let marker = Caller::new("ann", Role::Marker);
        assert!(require_worker(&marker, "claim").is_ok());
        let err = require_manager(&marker, "reassign tasks").unwrap_err();
        assert_eq!(err.to_string(), "user ann may not reassign tasks");
        assert!(require_scanner(&Caller::new("sam", Role::Scanner), "upload").is_ok());
    }
}

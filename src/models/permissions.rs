use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resource name under which room capabilities are granted.
pub const ROOMS_RESOURCE: &str = "yjs";

/// Capabilities granted to a caller, keyed by resource.
///
/// `None` means authorization is disabled and every capability is granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permissions(Option<HashMap<String, Vec<String>>>);

impl Permissions {
    pub fn unrestricted() -> Self {
        Self(None)
    }

    pub fn granted(grants: HashMap<String, Vec<String>>) -> Self {
        Self(Some(grants))
    }

    pub fn allows(&self, resource: &str, capability: &str) -> bool {
        match &self.0 {
            None => true,
            Some(grants) => grants
                .get(resource)
                .is_some_and(|caps| caps.iter().any(|c| c == capability)),
        }
    }

    pub fn can_write_rooms(&self) -> bool {
        self.allows(ROOMS_RESOURCE, "write")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrestricted_allows_everything() {
        assert!(Permissions::unrestricted().can_write_rooms());
        assert!(Permissions::unrestricted().allows("diagnostics", "read"));
    }

    #[test]
    fn read_only_cannot_write() {
        let perms = Permissions::granted(HashMap::from([(
            ROOMS_RESOURCE.to_string(),
            vec!["read".to_string()],
        )]));
        assert!(perms.allows(ROOMS_RESOURCE, "read"));
        assert!(!perms.can_write_rooms());
        assert!(!perms.allows("diagnostics", "read"));
    }
}

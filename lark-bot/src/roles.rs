//! Role catalog: the personas a user can select from the role card.
//!
//! Built once at startup from the built-in list plus any configured extras,
//! then treated as read-only. A role's prompt becomes the system message of
//! every completion request made while the role is selected.

use lark_common::config::RoleConfig;

/// A named persona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub name: String,
    /// System prompt applied to completion requests.
    pub prompt: String,
}

/// Ordered, read-only set of roles. Order is preserved for card rendering.
#[derive(Debug, Clone)]
pub struct RoleCatalog {
    roles: Vec<Role>,
}

impl RoleCatalog {
    /// The catalog of built-in roles.
    pub fn builtin() -> Self {
        let roles = vec![
            Role {
                name: "default".into(),
                prompt: "You are a helpful assistant. Answer concisely and accurately.".into(),
            },
            Role {
                name: "poet".into(),
                prompt: "You are a poet. Respond to every message with an original short poem \
                         that addresses the user's intent."
                    .into(),
            },
            Role {
                name: "translator".into(),
                prompt: "You are a translator. Translate the user's message between Chinese and \
                         English; if it is already bilingual, polish both sides."
                    .into(),
            },
            Role {
                name: "coder".into(),
                prompt: "You are an experienced software engineer. Answer with working code \
                         first, then a brief explanation."
                    .into(),
            },
        ];
        Self { roles }
    }

    /// Merge configured extras in. An extra with an existing name replaces
    /// it (prompt override); new names are appended in config order.
    pub fn with_extra(mut self, extra: &[RoleConfig]) -> Self {
        for entry in extra {
            let role = Role {
                name: entry.name.clone(),
                prompt: entry.prompt.clone(),
            };
            match self.roles.iter_mut().find(|r| r.name == entry.name) {
                Some(existing) => *existing = role,
                None => self.roles.push(role),
            }
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<&str> {
        self.roles.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.roles.iter()
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_catalog_has_default_and_poet() {
        let catalog = RoleCatalog::builtin();
        assert!(catalog.contains("default"));
        assert!(catalog.contains("poet"));
        assert!(!catalog.contains("astronaut"));
    }

    #[test]
    fn lookup_returns_prompt() {
        let catalog = RoleCatalog::builtin();
        let poet = catalog.get("poet").unwrap();
        assert!(poet.prompt.contains("poem"));
    }

    #[test]
    fn extra_roles_append() {
        let extra = vec![RoleConfig {
            name: "pirate".into(),
            prompt: "Answer as a pirate.".into(),
        }];
        let catalog = RoleCatalog::builtin().with_extra(&extra);
        assert!(catalog.contains("pirate"));
        assert_eq!(catalog.len(), RoleCatalog::builtin().len() + 1);
        // Appended last, so card ordering stays stable
        assert_eq!(catalog.names().last(), Some(&"pirate"));
    }

    #[test]
    fn extra_role_overrides_builtin_prompt() {
        let extra = vec![RoleConfig {
            name: "default".into(),
            prompt: "Custom default prompt.".into(),
        }];
        let catalog = RoleCatalog::builtin().with_extra(&extra);
        assert_eq!(catalog.len(), RoleCatalog::builtin().len());
        assert_eq!(catalog.get("default").unwrap().prompt, "Custom default prompt.");
    }
}

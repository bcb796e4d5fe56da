use std::collections::{BTreeMap, BTreeSet};

use odb_types::OpObject;

/// Field of `sys.role` objects listing the roles above this one.
pub const F_SUPER_ROLES: &str = "super_roles";

/// Transitive role closure.
///
/// `covered(r)` is the set of roles a holder of `r` may act as: `r`
/// itself and every role that lists `r` as a super role, directly or
/// through intermediate roles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleClosure {
    roles: BTreeMap<String, BTreeSet<String>>,
}

impl RoleClosure {
    /// Build the closure from `sys.role` objects. The role name is the
    /// first id part.
    pub fn from_roles<'a>(roles: impl IntoIterator<Item = &'a OpObject>) -> Self {
        let edges = roles.into_iter().filter_map(|o| {
            let id = o.id();
            let name = id.into_iter().next()?;
            Some((name, o.get_string_list(F_SUPER_ROLES)))
        });
        Self::from_edges(edges)
    }

    /// Build the closure from `(role, super_roles)` pairs. Super roles
    /// that are not defined themselves are ignored.
    pub fn from_edges(edges: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        let edges: Vec<(String, Vec<String>)> = edges.into_iter().collect();
        let mut roles: BTreeMap<String, BTreeSet<String>> = edges
            .iter()
            .map(|(role, _)| (role.clone(), BTreeSet::from([role.clone()])))
            .collect();
        for (role, supers) in &edges {
            for s in supers {
                if let Some(set) = roles.get_mut(s) {
                    set.insert(role.clone());
                }
            }
        }
        loop {
            let mut changed = false;
            let names: Vec<String> = roles.keys().cloned().collect();
            for name in names {
                let absorbed: BTreeSet<String> = roles[&name]
                    .iter()
                    .filter(|child| **child != name)
                    .filter_map(|child| roles.get(child))
                    .flatten()
                    .cloned()
                    .collect();
                if let Some(set) = roles.get_mut(&name) {
                    let before = set.len();
                    set.extend(absorbed);
                    changed |= set.len() != before;
                }
            }
            if !changed {
                break;
            }
        }
        Self { roles }
    }

    pub fn contains_role(&self, role: &str) -> bool {
        self.roles.contains_key(role)
    }

    /// Roles a holder of `role` may act as.
    pub fn covered(&self, role: &str) -> Option<&BTreeSet<String>> {
        self.roles.get(role)
    }

    /// Whether a holder of `granted` may act as `role`.
    pub fn covers(&self, granted: &str, role: &str) -> bool {
        self.roles.get(granted).is_some_and(|s| s.contains(role))
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

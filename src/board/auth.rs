//! Server-side authorization: bearer tokens resolve to configured users,
//! whose role grants a permission set per module.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::{AuthSection, RoleGrants};
use crate::errors::BoardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Manager,
    Member,
    Viewer,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Admin, Role::Manager, Role::Member, Role::Viewer];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Member => "member",
            Role::Viewer => "viewer",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "member" => Ok(Role::Member),
            "viewer" => Ok(Role::Viewer),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Module {
    Boards,
    Tickets,
    Fields,
}

impl Module {
    pub fn as_str(&self) -> &'static str {
        match self {
            Module::Boards => "boards",
            Module::Tickets => "tickets",
            Module::Fields => "fields",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
        }
    }
}

/// The authenticated caller of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub name: String,
    pub role: Role,
}

type Grants = HashMap<(Role, Module), BTreeSet<Permission>>;

fn default_grants() -> Grants {
    use Permission::*;
    let table: [(Role, [&[Permission]; 3]); 4] = [
        (Role::Admin, [&[Read, Write, Delete], &[Read, Write, Delete], &[Read, Write, Delete]]),
        (Role::Manager, [&[Read, Write, Delete], &[Read, Write, Delete], &[Read, Write]]),
        (Role::Member, [&[Read], &[Read, Write], &[Read]]),
        (Role::Viewer, [&[Read], &[Read], &[Read]]),
    ];
    let mut grants = HashMap::new();
    for (role, [boards, tickets, fields]) in table {
        grants.insert((role, Module::Boards), boards.iter().copied().collect());
        grants.insert((role, Module::Tickets), tickets.iter().copied().collect());
        grants.insert((role, Module::Fields), fields.iter().copied().collect());
    }
    grants
}

/// Resolves tokens to actors and decides whether an actor may act on a module.
#[derive(Debug, Clone)]
pub struct Authorizer {
    tokens: HashMap<String, Actor>,
    grants: Grants,
}

impl Authorizer {
    /// Build from configuration. Users with a blank token or an unknown
    /// role, and tables for unknown roles, are skipped with a warning.
    pub fn new(auth: &AuthSection) -> Self {
        let mut tokens = HashMap::new();
        for user in &auth.users {
            let token = user.token.trim();
            if token.is_empty() {
                tracing::warn!(user = %user.name, "skipping user: empty token");
                continue;
            }
            match Role::from_str(&user.role) {
                Ok(role) => {
                    tokens.insert(
                        token.to_string(),
                        Actor {
                            name: user.name.clone(),
                            role,
                        },
                    );
                }
                Err(e) => tracing::warn!(user = %user.name, "skipping user: {}", e),
            }
        }

        let mut grants = default_grants();
        for (name, overrides) in &auth.roles {
            match Role::from_str(name) {
                Ok(role) => apply_overrides(&mut grants, role, overrides),
                Err(e) => tracing::warn!("ignoring permission table: {}", e),
            }
        }
        Self { tokens, grants }
    }

    /// Resolve an `Authorization` header value (`Bearer <token>`).
    pub fn authenticate(&self, header: Option<&str>) -> Result<Actor, BoardError> {
        let token = header
            .and_then(|h| h.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(BoardError::Unauthorized)?;
        self.authenticate_token(token)
    }

    pub fn authenticate_token(&self, token: &str) -> Result<Actor, BoardError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(BoardError::Unauthorized);
        }
        self.tokens.get(token).cloned().ok_or(BoardError::Unauthorized)
    }

    pub fn can(&self, role: Role, module: Module, permission: Permission) -> bool {
        self.grants
            .get(&(role, module))
            .is_some_and(|set| set.contains(&permission))
    }

    pub fn authorize(&self, actor: &Actor, module: Module, permission: Permission) -> Result<(), BoardError> {
        if self.can(actor.role, module, permission) {
            Ok(())
        } else {
            tracing::warn!(actor = %actor.name, role = %actor.role, module = module.as_str(),
                permission = permission.as_str(), "permission denied");
            Err(BoardError::Forbidden(format!(
                "{} lacks {} permission on {}",
                actor.name,
                permission.as_str(),
                module.as_str()
            )))
        }
    }
}

fn apply_overrides(grants: &mut Grants, role: Role, overrides: &RoleGrants) {
    let modules = [
        (Module::Boards, &overrides.boards),
        (Module::Tickets, &overrides.tickets),
        (Module::Fields, &overrides.fields),
    ];
    for (module, permissions) in modules {
        if let Some(permissions) = permissions {
            grants.insert((role, module), permissions.iter().copied().collect());
        }
    }
}

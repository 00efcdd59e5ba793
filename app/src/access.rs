use std::fmt;
use std::str::FromStr;

use err_derive::Error;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::users::User;
use infra::ids::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Admin,
    Manager,
    Cook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    ManageInventory,
    ManageMeals,
    ServeMeals,
    ViewKitchen,
    CheckStock,
    GenerateReports,
    ManageUsers,
}

/// Who is acting. Callers establish this before invoking any kitchen
/// operation; the operations themselves trust it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user: Id<User>,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(display = "Not authorized: {} may not {}", role, permission)]
pub struct AuthorizationError {
    pub role: Role,
    pub permission: Permission,
}

impl Permission {
    pub fn roles(self) -> &'static [Role] {
        match self {
            Permission::ManageInventory => &[Role::Admin, Role::Manager],
            Permission::ManageMeals => &[Role::Admin],
            Permission::ServeMeals => &[Role::Admin, Role::Cook],
            Permission::ViewKitchen => &[Role::Admin, Role::Manager],
            Permission::CheckStock => &[Role::Admin, Role::Manager],
            Permission::GenerateReports => &[Role::Admin],
            Permission::ManageUsers => &[Role::Admin],
        }
    }
}

pub fn require(actor: &Actor, permission: Permission) -> Result<(), AuthorizationError> {
    if permission.roles().contains(&actor.role) {
        Ok(())
    } else {
        Err(AuthorizationError {
            role: actor.role,
            permission,
        })
    }
}

impl fmt::Display for Role {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Role::Admin => "admin",
            Role::Manager => "manager",
            Role::Cook => "cook",
        };
        fmt.write_str(name)
    }
}

impl FromStr for Role {
    type Err = ValidationError;
    fn from_str(src: &str) -> Result<Self, Self::Err> {
        match src.to_ascii_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "manager" => Ok(Role::Manager),
            "cook" => Ok(Role::Cook),
            other => Err(ValidationError::new(format!("unknown role {:?}", other))),
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let what = match self {
            Permission::ManageInventory => "manage inventory",
            Permission::ManageMeals => "manage meals",
            Permission::ServeMeals => "serve meals",
            Permission::ViewKitchen => "view kitchen records",
            Permission::CheckStock => "check stock",
            Permission::GenerateReports => "generate reports",
            Permission::ManageUsers => "manage users",
        };
        fmt.write_str(what)
    }
}

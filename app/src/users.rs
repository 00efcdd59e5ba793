use anyhow::Result;
use chrono::{DateTime, Utc};
use log::*;
use r2d2::{self, Pool};
use serde::{Deserialize, Serialize};

use infra::documents::{DocMeta, HasMeta};
use infra::ids::{Entity, Id};
use infra::persistence::{Storage, StorageExt};

use crate::access::{Actor, Role};
use crate::error::ValidationError;
use crate::services::{Commandable, Queryable, Request};
use crate::Context;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(flatten)]
    pub(crate) meta: DocMeta<User>,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AddUser {
    pub full_name: String,
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct FindUser {
    pub email: String,
}

#[derive(Debug, Clone)]
pub struct ListUsers;

#[derive(Debug)]
pub struct Users<M: r2d2::ManageConnection> {
    db: Pool<M>,
    ctx: Context,
}

impl User {
    pub fn id(&self) -> Id<User> {
        self.meta.id
    }

    pub fn actor(&self) -> Actor {
        Actor {
            user: self.meta.id,
            role: self.role,
        }
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static> Users<M> {
    pub fn new(db: Pool<M>, ctx: Context) -> Self {
        Users { db, ctx }
    }
}

impl Request for AddUser {
    type Resp = Id<User>;
}

impl Request for FindUser {
    type Resp = Option<User>;
}

impl Request for ListUsers {
    type Resp = Vec<User>;
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Commandable<AddUser> for Users<M>
{
    fn execute(&self, req: AddUser) -> Result<Id<User>> {
        let AddUser {
            full_name,
            email,
            role,
        } = req;
        let email = email.trim().to_string();
        if full_name.trim().is_empty() || !email.contains('@') {
            return Err(ValidationError::new("a user needs a name and an email address").into());
        }

        let conn = self.db.get()?;
        let id = conn.atomically(|tx| {
            let existing = tx.load_all::<User>()?;
            if existing.iter().any(|u| u.email.eq_ignore_ascii_case(&email)) {
                return Err(ValidationError::new(format!("email {} already registered", email)).into());
            }
            let mut user = User {
                meta: DocMeta::new_with_id(self.ctx.idgen.generate()),
                full_name: full_name.clone(),
                email: email.clone(),
                role,
                created_at: self.ctx.clock.now(),
            };
            tx.save(&mut user)?;
            Ok(user.meta.id)
        })?;
        info!("Registered {} ({}) as {}", full_name, email, role);
        Ok(id)
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<FindUser> for Users<M>
{
    fn query(&self, req: FindUser) -> Result<Option<User>> {
        let users = self.db.get()?.load_all::<User>()?;
        Ok(users
            .into_iter()
            .find(|u| u.email.eq_ignore_ascii_case(req.email.trim())))
    }
}

impl<M: r2d2::ManageConnection<Connection = D>, D: Storage + Send + 'static>
    Queryable<ListUsers> for Users<M>
{
    fn query(&self, _: ListUsers) -> Result<Vec<User>> {
        self.db.get()?.load_all::<User>()
    }
}

impl Entity for User {
    const PREFIX: &'static str = "user";
}

impl HasMeta for User {
    fn meta(&self) -> &DocMeta<User> {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut DocMeta<User> {
        &mut self.meta
    }
}

//! Role reconciler.

use std::sync::Arc;

use cqlop_core::{
    ConnectionDetails, Managed, Role, RoleObservation, RoleParameters, RolePrivilege, CONNECTION_PASSWORD_KEY,
    CONNECTION_USERNAME_KEY,
};
use cqlop_db::{quote_identifier, quote_literal, Database};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::exec::{exec, query};
use crate::{
    external_name, late_init_field, Error, ExternalClient, ExternalCreation, ExternalObservation, ExternalUpdate,
    Observation, PasswordGenerator, Reconcilable, Result,
};

pub const SELECT_ROLE: &str = "SELECT is_superuser, can_login FROM system_auth.roles WHERE role = ?";

const ERR_SELECT: &str = "cannot select role";
const ERR_CREATE: &str = "cannot create role";
const ERR_UPDATE: &str = "cannot update role";
const ERR_DROP: &str = "cannot drop role";

pub fn late_init(observed: &RoleParameters, desired: &RoleParameters) -> (RoleParameters, bool) {
    let mut filled = desired.clone();
    let mut changed = late_init_field(&mut filled.privileges.super_user, &observed.privileges.super_user);
    changed |= late_init_field(&mut filled.privileges.login, &observed.privileges.login);
    (filled, changed)
}

pub fn up_to_date(observed: &RoleParameters, desired: &RoleParameters) -> bool {
    observed.privileges.super_user == desired.privileges.super_user && observed.privileges.login == desired.privileges.login
}

fn flags(p: &RolePrivilege) -> (bool, bool) {
    (p.super_user.unwrap_or(false), p.login.unwrap_or(false))
}

pub fn create_statement(name: &str, p: &RoleParameters, password: &str) -> String {
    let (superuser, login) = flags(&p.privileges);
    format!(
        "CREATE ROLE IF NOT EXISTS {} WITH SUPERUSER = {} AND LOGIN = {} AND PASSWORD = {}",
        quote_identifier(name),
        superuser,
        login,
        quote_literal(password)
    )
}

pub fn alter_statement(name: &str, p: &RoleParameters) -> String {
    let (superuser, login) = flags(&p.privileges);
    format!("ALTER ROLE {} WITH SUPERUSER = {} AND LOGIN = {}", quote_identifier(name), superuser, login)
}

pub fn drop_statement(name: &str) -> String {
    format!("DROP ROLE IF EXISTS {}", quote_identifier(name))
}

pub struct RoleClient {
    db: Arc<dyn Database>,
    passwords: Arc<dyn PasswordGenerator>,
}

impl RoleClient {
    pub fn new(db: Arc<dyn Database>, passwords: Arc<dyn PasswordGenerator>) -> Self {
        Self { db, passwords }
    }
}

impl Reconcilable for Role {
    fn new_client(db: Arc<dyn Database>, passwords: Arc<dyn PasswordGenerator>) -> Box<dyn ExternalClient<Self>> {
        Box::new(RoleClient::new(db, passwords))
    }
}

#[async_trait::async_trait]
impl ExternalClient<Role> for RoleClient {
    async fn observe(&self, ctx: &CancellationToken, cr: &Role) -> Result<Observation<Role>> {
        let name = external_name(cr)?;
        let mut rows = query(ctx, &*self.db, ERR_SELECT, SELECT_ROLE, &[name.into()]).await?;
        let row = rows.scan::<(bool, bool)>().map_err(Error::statement(ERR_SELECT))?;
        rows.close().map_err(Error::statement(ERR_SELECT))?;
        let Some((is_superuser, can_login)) = row else {
            return Ok(ExternalObservation::absent());
        };

        let observed = RoleParameters { privileges: RolePrivilege { super_user: Some(is_superuser), login: Some(can_login) } };
        let (filled, changed) = late_init(&observed, cr.for_provider());
        let up = up_to_date(&observed, &filled);
        debug!(role = name, up_to_date = up, late_initialized = changed, "observed role");
        Ok(ExternalObservation {
            resource_exists: true,
            resource_up_to_date: up,
            late_initialized: changed.then_some(filled),
            at_provider: None,
        })
    }

    async fn create(&self, ctx: &CancellationToken, cr: &Role) -> Result<ExternalCreation> {
        let name = external_name(cr)?;
        let password = self.passwords.generate().map_err(Error::Password)?;
        exec(ctx, &*self.db, ERR_CREATE, &create_statement(name, cr.for_provider(), &password)).await?;
        let mut details = ConnectionDetails::new();
        details.insert(CONNECTION_USERNAME_KEY.to_string(), name.as_bytes().to_vec());
        details.insert(CONNECTION_PASSWORD_KEY.to_string(), password.into_bytes());
        Ok(ExternalCreation { connection_details: details })
    }

    async fn update(&self, ctx: &CancellationToken, cr: &Role) -> Result<ExternalUpdate<RoleObservation>> {
        let name = external_name(cr)?;
        exec(ctx, &*self.db, ERR_UPDATE, &alter_statement(name, cr.for_provider())).await?;
        Ok(ExternalUpdate::default())
    }

    async fn delete(&self, ctx: &CancellationToken, cr: &Role) -> Result<()> {
        let name = external_name(cr)?;
        exec(ctx, &*self.db, ERR_DROP, &drop_statement(name)).await
    }
}

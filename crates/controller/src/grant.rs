//! Grant reconciler.
//!
//! A grant is the set of permissions one role holds on one keyspace. The
//! controller only touches the permissions it manages: it grants every
//! desired permission and revokes those it applied earlier (recorded in
//! `status.atProvider.privileges`) that are no longer desired. Permissions
//! granted by someone else are left alone.
//!
//! Multi-statement operations are not atomic. A failure stops the loop and
//! the next reconciliation picks up from whatever was applied.

use std::collections::BTreeSet;
use std::sync::Arc;

use cqlop_core::{Grant, GrantObservation, GrantPrivilege, Managed};
use cqlop_db::{quote_identifier, quote_literal, Database};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::exec::{exec, query};
use crate::{
    Error, ExternalClient, ExternalCreation, ExternalObservation, ExternalUpdate, Observation, PasswordGenerator,
    Reconcilable, Result,
};

const ERR_CREATE: &str = "cannot create grant";
const ERR_REVOKE: &str = "cannot delete grant";
const ERR_OBSERVE: &str = "cannot observe grant";

/// Granted as a shorthand; the cluster stores the expanded permissions instead.
pub const ALL_PERMISSIONS: &str = "ALL PERMISSIONS";

/// Database tokens for `privileges`, first occurrence order, duplicates dropped.
pub fn normalize(privileges: &[GrantPrivilege]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    privileges
        .iter()
        .map(|p| p.as_str().replace('_', " "))
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

pub fn observe_statement(keyspace: &str) -> String {
    format!(
        "SELECT permissions FROM system_auth.role_permissions WHERE role = ? AND resource = {}",
        quote_literal(&format!("data/{}", keyspace))
    )
}

pub fn grant_statement(privilege: &str, keyspace: &str, role: &str) -> String {
    format!("GRANT {} ON KEYSPACE {} TO {}", privilege, quote_identifier(keyspace), quote_identifier(role))
}

pub fn revoke_statement(privilege: &str, keyspace: &str, role: &str) -> String {
    format!("REVOKE {} ON KEYSPACE {} FROM {}", privilege, quote_identifier(keyspace), quote_identifier(role))
}

/// Drift verdict for a grant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantDiff {
    pub exists: bool,
    pub up_to_date: bool,
}

/// `exists` when any desired permission is held; `up_to_date` when all of them
/// are held and nothing previously applied has since been dropped from desired.
pub fn diff(desired: &[String], observed: &BTreeSet<String>, status: &[String]) -> GrantDiff {
    let exists = desired.iter().any(|p| observed.contains(p));
    let up_to_date = desired.iter().all(|p| observed.contains(p)) && status.iter().all(|p| desired.contains(p));
    GrantDiff { exists, up_to_date }
}

/// Desired permissions the cluster never reports back, so they stay drifted.
pub fn unobservable(desired: &[String]) -> impl Iterator<Item = &str> {
    desired.iter().map(String::as_str).filter(|p| *p == ALL_PERMISSIONS)
}

/// Applied permissions that are no longer desired, in status order.
pub fn to_revoke<'a>(status: &'a [String], desired: &[String]) -> Vec<&'a str> {
    status.iter().filter(|p| !desired.contains(p)).map(String::as_str).collect()
}

fn target(cr: &Grant) -> Result<(&str, &str)> {
    let p = cr.for_provider();
    let role = p.role.as_deref().filter(|r| !r.is_empty()).ok_or(Error::MissingField("role"))?;
    let keyspace = p.keyspace.as_deref().filter(|k| !k.is_empty()).ok_or(Error::MissingField("keyspace"))?;
    Ok((role, keyspace))
}

pub struct GrantClient {
    db: Arc<dyn Database>,
}

impl GrantClient {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    async fn grant_all(&self, ctx: &CancellationToken, desired: &[String], keyspace: &str, role: &str) -> Result<()> {
        for p in desired {
            exec(ctx, &*self.db, ERR_CREATE, &grant_statement(p, keyspace, role)).await?;
        }
        Ok(())
    }

    async fn revoke_all<S: AsRef<str>>(&self, ctx: &CancellationToken, privileges: &[S], keyspace: &str, role: &str) -> Result<()> {
        for p in privileges {
            exec(ctx, &*self.db, ERR_REVOKE, &revoke_statement(p.as_ref(), keyspace, role)).await?;
        }
        Ok(())
    }
}

impl Reconcilable for Grant {
    fn new_client(db: Arc<dyn Database>, _passwords: Arc<dyn PasswordGenerator>) -> Box<dyn ExternalClient<Self>> {
        Box::new(GrantClient::new(db))
    }
}

#[async_trait::async_trait]
impl ExternalClient<Grant> for GrantClient {
    async fn observe(&self, ctx: &CancellationToken, cr: &Grant) -> Result<Observation<Grant>> {
        let (role, keyspace) = target(cr)?;
        let mut rows = query(ctx, &*self.db, ERR_OBSERVE, &observe_statement(keyspace), &[role.into()]).await?;
        let mut observed = BTreeSet::new();
        while let Some((permissions,)) = rows.scan::<(BTreeSet<String>,)>().map_err(Error::statement(ERR_OBSERVE))? {
            observed.extend(permissions);
        }
        rows.close().map_err(Error::statement(ERR_OBSERVE))?;

        let desired = normalize(&cr.for_provider().privileges);
        let status = &cr.at_provider().privileges;
        if desired.is_empty() && !observed.is_empty() {
            warn!(role, keyspace, observed = ?observed, "grant declares no privileges but the role holds some");
        }
        if unobservable(&desired).next().is_some() && !observed.contains(ALL_PERMISSIONS) {
            warn!(
                role,
                keyspace,
                observed = ?observed,
                "grant declares ALL_PERMISSIONS, which the cluster stores expanded; it never reports up to date"
            );
        }
        let verdict = diff(&desired, &observed, status);
        debug!(role, keyspace, exists = verdict.exists, up_to_date = verdict.up_to_date, "observed grant");
        Ok(ExternalObservation {
            resource_exists: verdict.exists,
            resource_up_to_date: verdict.up_to_date,
            late_initialized: None,
            at_provider: verdict.up_to_date.then(|| GrantObservation { privileges: desired }),
        })
    }

    async fn create(&self, ctx: &CancellationToken, cr: &Grant) -> Result<ExternalCreation> {
        let (role, keyspace) = target(cr)?;
        let desired = normalize(&cr.for_provider().privileges);
        self.grant_all(ctx, &desired, keyspace, role).await?;
        Ok(ExternalCreation::default())
    }

    async fn update(&self, ctx: &CancellationToken, cr: &Grant) -> Result<ExternalUpdate<GrantObservation>> {
        let (role, keyspace) = target(cr)?;
        let desired = normalize(&cr.for_provider().privileges);
        self.grant_all(ctx, &desired, keyspace, role).await?;
        let stale = to_revoke(&cr.at_provider().privileges, &desired);
        self.revoke_all(ctx, &stale, keyspace, role).await?;
        Ok(ExternalUpdate {
            connection_details: Default::default(),
            at_provider: Some(GrantObservation { privileges: desired }),
        })
    }

    async fn delete(&self, ctx: &CancellationToken, cr: &Grant) -> Result<()> {
        let (role, keyspace) = target(cr)?;
        let desired = normalize(&cr.for_provider().privileges);
        self.revoke_all(ctx, &desired, keyspace, role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cqlop_core::GrantParameters;
    use cqlop_db::{CqlValue, DbError, MockDb, Row};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn grant(privileges: Vec<GrantPrivilege>, status: &[&str]) -> Grant {
        let mut g = Grant::with_external_name(
            "g",
            "g",
            GrantParameters {
                privileges,
                role: Some("example_role".into()),
                keyspace: Some("example_ks".into()),
                ..Default::default()
            },
        );
        g.status.at_provider.privileges = status.iter().map(|s| s.to_string()).collect();
        g
    }

    fn holding(perms: &[&str]) -> MockDb {
        let row = Row::new(vec![CqlValue::text_set(perms.iter().copied())]);
        MockDb::new().with_rows(vec![row])
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalization() {
        use GrantPrivilege::*;
        assert_eq!(normalize(&[AllPermissions, Select, Select, Modify]), vec!["ALL PERMISSIONS", "SELECT", "MODIFY"]);
        assert!(normalize(&[]).is_empty());
    }

    #[test]
    fn statements_are_exact() {
        assert_eq!(
            observe_statement("example_ks"),
            "SELECT permissions FROM system_auth.role_permissions WHERE role = ? AND resource = 'data/example_ks'"
        );
        assert_eq!(grant_statement("SELECT", "ks", "r"), "GRANT SELECT ON KEYSPACE \"ks\" TO \"r\"");
        assert_eq!(revoke_statement("ALL PERMISSIONS", "ks", "r"), "REVOKE ALL PERMISSIONS ON KEYSPACE \"ks\" FROM \"r\"");
    }

    #[test]
    fn diff_rules() {
        let d = |desired: &[&str], observed: &[&str], status: &[&str]| {
            let desired: Vec<String> = desired.iter().map(|s| s.to_string()).collect();
            let status: Vec<String> = status.iter().map(|s| s.to_string()).collect();
            diff(&desired, &set(observed), &status)
        };
        assert_eq!(d(&["SELECT"], &["SELECT", "MODIFY"], &[]), GrantDiff { exists: true, up_to_date: true });
        assert_eq!(d(&["SELECT", "ALTER"], &["SELECT"], &[]), GrantDiff { exists: true, up_to_date: false });
        assert_eq!(d(&["SELECT"], &["MODIFY"], &["MODIFY"]), GrantDiff { exists: false, up_to_date: false });
        assert_eq!(d(&["SELECT"], &["SELECT", "MODIFY"], &["MODIFY"]), GrantDiff { exists: true, up_to_date: false });
        assert_eq!(d(&[], &[], &[]), GrantDiff { exists: false, up_to_date: true });
        assert_eq!(d(&[], &["SELECT"], &[]), GrantDiff { exists: false, up_to_date: true });
    }

    #[tokio::test]
    async fn observe_unions_rows_and_records_status() {
        let db = Arc::new(MockDb::new().with_rows(vec![
            Row::new(vec![CqlValue::text_set(["SELECT"])]),
            Row::new(vec![CqlValue::text_set(["MODIFY"])]),
        ]));
        let client = GrantClient::new(db.clone());
        let obs = client
            .observe(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select, GrantPrivilege::Modify], &[]))
            .await
            .unwrap();
        assert!(obs.resource_exists && obs.resource_up_to_date);
        assert!(!obs.resource_late_initialized());
        assert_eq!(obs.at_provider.unwrap().privileges, vec!["SELECT", "MODIFY"]);
        assert_eq!(db.queried()[0].1, vec![CqlValue::Text("example_role".into())]);
        assert_eq!(db.closed_cursors(), 1);
    }

    #[tokio::test]
    async fn observe_drift_leaves_status() {
        let client = GrantClient::new(Arc::new(holding(&["SELECT"])));
        let obs = client
            .observe(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select, GrantPrivilege::Alter], &[]))
            .await
            .unwrap();
        assert!(obs.resource_exists && !obs.resource_up_to_date);
        assert_eq!(obs.at_provider, None);
    }

    #[tokio::test]
    async fn observe_requires_role_and_keyspace() {
        let client = GrantClient::new(Arc::new(MockDb::new()));
        let mut g = grant(vec![GrantPrivilege::Select], &[]);
        g.spec.for_provider.role = None;
        let err = client.observe(&CancellationToken::new(), &g).await.unwrap_err();
        assert_eq!(err.to_string(), "role is not set");
        let mut g = grant(vec![GrantPrivilege::Select], &[]);
        g.spec.for_provider.keyspace = Some(String::new());
        let err = client.observe(&CancellationToken::new(), &g).await.unwrap_err();
        assert_eq!(err.to_string(), "keyspace is not set");
    }

    #[tokio::test]
    async fn observe_failure_is_labelled() {
        let db = MockDb::new().with_query(|_, _| Err(DbError::Query("no host".into())));
        let err = GrantClient::new(Arc::new(db))
            .observe(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select], &[]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot observe grant: no host");
    }

    #[tokio::test]
    async fn create_grants_each_privilege() {
        let db = Arc::new(MockDb::new());
        GrantClient::new(db.clone())
            .create(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select, GrantPrivilege::AllPermissions], &[]))
            .await
            .unwrap();
        assert_eq!(
            db.executed(),
            vec![
                "GRANT SELECT ON KEYSPACE \"example_ks\" TO \"example_role\"".to_string(),
                "GRANT ALL PERMISSIONS ON KEYSPACE \"example_ks\" TO \"example_role\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn update_grants_then_revokes_stale() {
        let db = Arc::new(MockDb::new());
        let upd = GrantClient::new(db.clone())
            .update(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select], &["MODIFY"]))
            .await
            .unwrap();
        assert_eq!(
            db.executed(),
            vec![
                "GRANT SELECT ON KEYSPACE \"example_ks\" TO \"example_role\"".to_string(),
                "REVOKE MODIFY ON KEYSPACE \"example_ks\" FROM \"example_role\"".to_string(),
            ]
        );
        assert_eq!(upd.at_provider.unwrap().privileges, vec!["SELECT"]);
    }

    #[tokio::test]
    async fn update_grant_failure_aborts_before_revoke() {
        let db = Arc::new(MockDb::new().with_exec(|s| {
            if s.starts_with("GRANT ALTER") {
                Err(DbError::Exec("denied".into()))
            } else {
                Ok(())
            }
        }));
        let err = GrantClient::new(db.clone())
            .update(
                &CancellationToken::new(),
                &grant(vec![GrantPrivilege::Select, GrantPrivilege::Alter, GrantPrivilege::Drop], &["MODIFY"]),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot create grant: denied");
        assert_eq!(db.executed().len(), 2);
        assert!(db.executed().iter().all(|s| !s.starts_with("REVOKE")));
    }

    #[tokio::test]
    async fn revoke_failure_is_labelled() {
        let db = Arc::new(MockDb::new().with_exec(|s| {
            if s.starts_with("REVOKE") {
                Err(DbError::Exec("denied".into()))
            } else {
                Ok(())
            }
        }));
        let client = GrantClient::new(db);
        let ctx = CancellationToken::new();
        let g = grant(vec![GrantPrivilege::Select], &["MODIFY"]);
        assert_eq!(client.update(&ctx, &g).await.unwrap_err().to_string(), "cannot delete grant: denied");
        assert_eq!(client.delete(&ctx, &g).await.unwrap_err().to_string(), "cannot delete grant: denied");
    }

    #[tokio::test]
    async fn revoke_failure_aborts_remaining_revokes() {
        let db = Arc::new(MockDb::new().with_exec(|s| {
            if s.starts_with("REVOKE MODIFY") {
                Err(DbError::Exec("denied".into()))
            } else {
                Ok(())
            }
        }));
        let err = GrantClient::new(db.clone())
            .update(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select], &["MODIFY", "DROP"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot delete grant: denied");
        assert_eq!(
            db.executed(),
            vec![
                "GRANT SELECT ON KEYSPACE \"example_ks\" TO \"example_role\"".to_string(),
                "REVOKE MODIFY ON KEYSPACE \"example_ks\" FROM \"example_role\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn delete_failure_aborts_remaining_revokes() {
        let db = Arc::new(MockDb::new().with_exec(|s| {
            if s.starts_with("REVOKE SELECT") {
                Err(DbError::Exec("denied".into()))
            } else {
                Ok(())
            }
        }));
        let err = GrantClient::new(db.clone())
            .delete(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select, GrantPrivilege::Modify], &[]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot delete grant: denied");
        assert_eq!(db.executed(), vec!["REVOKE SELECT ON KEYSPACE \"example_ks\" FROM \"example_role\"".to_string()]);
    }

    #[tokio::test]
    async fn all_permissions_stays_drifted() {
        let expanded = ["CREATE", "ALTER", "DROP", "SELECT", "MODIFY", "AUTHORIZE"];
        let client = GrantClient::new(Arc::new(holding(&expanded)));
        let g = grant(vec![GrantPrivilege::AllPermissions], &[]);
        let desired = normalize(&g.spec.for_provider.privileges);
        assert_eq!(unobservable(&desired).collect::<Vec<_>>(), vec![ALL_PERMISSIONS]);

        let obs = client.observe(&CancellationToken::new(), &g).await.unwrap();
        assert!(!obs.resource_exists && !obs.resource_up_to_date);
        assert_eq!(obs.at_provider, None);
        assert_eq!(unobservable(&normalize(&[GrantPrivilege::Select])).count(), 0);
    }

    #[tokio::test]
    async fn delete_revokes_desired() {
        let db = Arc::new(MockDb::new());
        GrantClient::new(db.clone())
            .delete(&CancellationToken::new(), &grant(vec![GrantPrivilege::Select, GrantPrivilege::Modify], &[]))
            .await
            .unwrap();
        assert_eq!(
            db.executed(),
            vec![
                "REVOKE SELECT ON KEYSPACE \"example_ks\" FROM \"example_role\"".to_string(),
                "REVOKE MODIFY ON KEYSPACE \"example_ks\" FROM \"example_role\"".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn cancellation_stops_remaining_statements() {
        let ctx = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (token, counter) = (ctx.clone(), Arc::clone(&calls));
        let db = Arc::new(MockDb::new().with_exec(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                token.cancel();
            }
            Ok(())
        }));
        let err = GrantClient::new(db.clone())
            .create(&ctx, &grant(vec![GrantPrivilege::Select, GrantPrivilege::Modify, GrantPrivilege::Drop], &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(db.executed().len(), 1);
    }
}

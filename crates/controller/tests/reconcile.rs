mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use common::Harness;
use cqlop_controller::{narrow, Error, ObjectIndex, RandomPassword, ReconcileOutcome, StaticPassword};
use cqlop_core::{
    AnyManaged, ConditionReason, ConditionType, DeletionPolicy, Grant, GrantParameters, GrantPrivilege, Keyspace,
    KeyspaceParameters, Managed, Role, RoleParameters, RolePrivilege, SecretReference,
};
use cqlop_db::Database;
use tokio_util::sync::CancellationToken;

fn ks_params(class: Option<&str>, factor: Option<i32>, durable: Option<bool>) -> KeyspaceParameters {
    KeyspaceParameters { replication_class: class.map(str::to_string), replication_factor: factor, durable_writes: durable }
}

fn grant(privileges: Vec<GrantPrivilege>) -> Grant {
    Grant::with_external_name(
        "reader",
        "reader",
        GrantParameters { privileges, role: Some("app".into()), keyspace: Some("shop".into()), ..Default::default() },
    )
}

async fn seed_role_and_keyspace(h: &Harness) {
    let ctx = CancellationToken::new();
    let ks: AnyManaged = Keyspace::with_external_name("shop", "shop", ks_params(None, None, None)).into();
    h.connector.connect::<Keyspace>(&ks).await.unwrap().create(&ctx, narrow(&ks).unwrap()).await.unwrap();
    let role: AnyManaged = Role::with_external_name("app", "app", RoleParameters::default()).into();
    h.connector.connect::<Role>(&role).await.unwrap().create(&ctx, narrow(&role).unwrap()).await.unwrap();
    h.cluster.take_statements();
}

#[tokio::test]
async fn fully_set_keyspace_round_trips() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let ks: AnyManaged = Keyspace::with_external_name("shop", "shop", ks_params(Some("SimpleStrategy"), Some(2), Some(true))).into();
    let client = h.connector.connect::<Keyspace>(&ks).await.unwrap();
    let cr = narrow::<Keyspace>(&ks).unwrap();

    client.create(&ctx, cr).await.unwrap();
    let obs = client.observe(&ctx, cr).await.unwrap();
    assert!(obs.resource_exists);
    assert!(obs.resource_up_to_date);
    assert!(!obs.resource_late_initialized());
    assert_eq!(
        h.cluster.statements(),
        vec!["CREATE KEYSPACE IF NOT EXISTS \"shop\" WITH replication = {'class': 'SimpleStrategy', 'replication_factor': 2} AND durable_writes = true".to_string()]
    );
}

#[tokio::test]
async fn unset_attributes_are_late_initialized() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let ks: AnyManaged = Keyspace::with_external_name("shop", "shop", ks_params(None, Some(3), None)).into();
    let client = h.connector.connect::<Keyspace>(&ks).await.unwrap();
    let cr = narrow::<Keyspace>(&ks).unwrap();
    client.create(&ctx, cr).await.unwrap();

    let obs = client.observe(&ctx, cr).await.unwrap();
    assert!(obs.resource_exists && obs.resource_up_to_date);
    assert_eq!(obs.late_initialized, Some(ks_params(Some("SimpleStrategy"), Some(3), Some(true))));
}

#[tokio::test]
async fn drifted_factor_is_not_up_to_date() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let live: AnyManaged = Keyspace::with_external_name("shop", "shop", ks_params(Some("SimpleStrategy"), Some(3), Some(true))).into();
    let client = h.connector.connect::<Keyspace>(&live).await.unwrap();
    client.create(&ctx, narrow(&live).unwrap()).await.unwrap();

    let desired = Keyspace::with_external_name("shop", "shop", ks_params(Some("SimpleStrategy"), Some(2), Some(true)));
    let obs = client.observe(&ctx, &desired).await.unwrap();
    assert!(obs.resource_exists);
    assert!(!obs.resource_up_to_date);

    client.update(&ctx, &desired).await.unwrap();
    assert!(client.observe(&ctx, &desired).await.unwrap().resource_up_to_date);
}

#[tokio::test]
async fn create_twice_is_not_an_error() {
    let h = Harness::new().with_passwords(Arc::new(RandomPassword));
    let ctx = CancellationToken::new();
    let ks: AnyManaged = Keyspace::with_external_name("shop", "shop", ks_params(None, None, None)).into();
    let client = h.connector.connect::<Keyspace>(&ks).await.unwrap();
    client.create(&ctx, narrow(&ks).unwrap()).await.unwrap();
    client.create(&ctx, narrow(&ks).unwrap()).await.unwrap();

    let role: AnyManaged = Role::with_external_name("app", "app", RoleParameters::default()).into();
    let client = h.connector.connect::<Role>(&role).await.unwrap();
    let first = client.create(&ctx, narrow(&role).unwrap()).await.unwrap();
    let second = client.create(&ctx, narrow(&role).unwrap()).await.unwrap();
    assert_ne!(first.connection_details["password"], second.connection_details["password"]);
    assert_eq!(first.connection_details["username"], b"app".to_vec());
}

#[tokio::test]
async fn role_flags_default_to_false_and_late_init() {
    let h = Harness::new();
    let ctx = CancellationToken::new();
    let role: AnyManaged = Role::with_external_name("app", "app", RoleParameters::default()).into();
    let client = h.connector.connect::<Role>(&role).await.unwrap();
    let cr = narrow::<Role>(&role).unwrap();
    client.create(&ctx, cr).await.unwrap();
    let obs = client.observe(&ctx, cr).await.unwrap();
    assert!(obs.resource_up_to_date);
    assert_eq!(
        obs.late_initialized,
        Some(RoleParameters { privileges: RolePrivilege { super_user: Some(false), login: Some(false) } })
    );
}

#[tokio::test]
async fn grant_update_converges_status() {
    let h = Harness::new();
    seed_role_and_keyspace(&h).await;
    let ctx = CancellationToken::new();
    h.cluster.exec("GRANT MODIFY ON KEYSPACE \"shop\" TO \"app\"").await.unwrap();
    h.cluster.take_statements();

    let mut g = grant(vec![GrantPrivilege::Select]);
    g.status.at_provider.privileges = vec!["MODIFY".into()];
    let any: AnyManaged = g.clone().into();
    let client = h.connector.connect::<Grant>(&any).await.unwrap();

    let obs = client.observe(&ctx, &g).await.unwrap();
    assert!(!obs.resource_exists);
    assert!(!obs.resource_up_to_date);

    let upd = client.update(&ctx, &g).await.unwrap();
    assert_eq!(
        h.cluster.statements(),
        vec![
            "GRANT SELECT ON KEYSPACE \"shop\" TO \"app\"".to_string(),
            "REVOKE MODIFY ON KEYSPACE \"shop\" FROM \"app\"".to_string(),
        ]
    );
    assert_eq!(upd.at_provider.unwrap().privileges, vec!["SELECT".to_string()]);
    assert_eq!(h.cluster.snapshot().granted("app", "shop"), BTreeSet::from(["SELECT".to_string()]));
}

#[tokio::test]
async fn wrong_kind_issues_nothing() {
    let h = Harness::new();
    let role: AnyManaged = Role::with_external_name("app", "app", RoleParameters::default()).into();
    let err = h.connector.connect::<Grant>(&role).await.err().unwrap();
    assert!(matches!(err, Error::WrongKind(cqlop_core::ResourceKind::Grant)));
    assert!(h.cluster.statements().is_empty());
}

#[tokio::test]
async fn partial_grant_failure_converges_next_cycle() {
    let h = Harness::new();
    seed_role_and_keyspace(&h).await;
    let reconciler = h.reconciler();
    let ctx = CancellationToken::new();
    let refs = ObjectIndex::default();
    let mut obj: AnyManaged = grant(vec![GrantPrivilege::Select, GrantPrivilege::Modify, GrantPrivilege::Drop]).into();

    h.cluster.fail_on("GRANT MODIFY");
    let err = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap_err();
    assert!(err.to_string().starts_with("cannot create grant: injected failure"));
    assert_eq!(h.cluster.snapshot().granted("app", "shop"), BTreeSet::from(["SELECT".to_string()]));
    let synced = obj.resource_status().condition(ConditionType::Synced).unwrap();
    assert_eq!(synced.reason, ConditionReason::ReconcileError);
    assert!(synced.message.as_deref().unwrap_or("").starts_with("cannot create grant"));

    h.cluster.clear_failures();
    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Updated);
    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::UpToDate);
    assert_eq!(h.cluster.snapshot().granted("app", "shop").len(), 3);
    let g = narrow::<Grant>(&obj).unwrap();
    assert_eq!(g.status.at_provider.privileges, vec!["SELECT", "MODIFY", "DROP"]);
    assert!(obj.resource_status().is_ready());
}

#[tokio::test]
async fn cancelled_reconcile_issues_nothing() {
    let h = Harness::new();
    seed_role_and_keyspace(&h).await;
    let ctx = CancellationToken::new();
    ctx.cancel();
    let mut obj: AnyManaged = grant(vec![GrantPrivilege::Select, GrantPrivilege::Modify]).into();
    let err = h.reconciler().reconcile(&ctx, &mut obj, &ObjectIndex::default()).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(h.cluster.statements().is_empty());
}

#[tokio::test]
async fn driver_lifecycle_with_conditions_and_secrets() {
    let h = Harness::new().with_passwords(Arc::new(StaticPassword("generated".into())));
    let reconciler = h.reconciler();
    let ctx = CancellationToken::new();
    let refs = ObjectIndex::default();

    let mut role = Role::new("app", RoleParameters { privileges: RolePrivilege { super_user: None, login: Some(true) } });
    role.spec.resource.write_connection_secret_to_ref = Some(SecretReference { namespace: "apps".into(), name: "app-db".into() });
    let mut obj: AnyManaged = role.into();

    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Created);
    assert_eq!(obj.external_name(), Some("app"));
    assert_eq!(obj.resource_status().condition(ConditionType::Ready).unwrap().reason, ConditionReason::Creating);
    let secret = h.secrets.get("apps", "app-db").unwrap();
    assert_eq!(secret["password"], b"generated".to_vec());

    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::UpToDate);
    assert!(report.late_initialized);
    assert_eq!(narrow::<Role>(&obj).unwrap().spec.for_provider.privileges.super_user, Some(false));
    assert!(obj.resource_status().is_ready());

    // the new role can log in with the published password
    let cfg = cqlop_db::ConnectionConfig {
        username: "app".into(),
        password: "generated".into(),
        endpoint: "127.0.0.1".into(),
        port: 9042,
        keyspace: None,
    };
    assert!(h.cluster.connect(&cfg).is_ok());

    obj.mark_deleting();
    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Deleted);
    assert_eq!(obj.resource_status().condition(ConditionType::Ready).unwrap().reason, ConditionReason::Deleting);
    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Absent);
    assert!(!h.cluster.snapshot().roles.contains_key("app"));
}

#[tokio::test]
async fn orphan_policy_leaves_external_object() {
    let h = Harness::new();
    let reconciler = h.reconciler();
    let ctx = CancellationToken::new();
    let refs = ObjectIndex::default();
    let mut ks = Keyspace::new("shop", ks_params(None, None, None));
    ks.spec.resource.deletion_policy = DeletionPolicy::Orphan;
    let mut obj: AnyManaged = ks.into();
    reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    h.cluster.take_statements();

    obj.mark_deleting();
    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Orphaned);
    assert!(h.cluster.statements().is_empty());
    assert!(h.cluster.snapshot().keyspaces.contains_key("shop"));
}

#[tokio::test]
async fn grant_references_resolve_through_the_driver() {
    let h = Harness::new();
    seed_role_and_keyspace(&h).await;
    let reconciler = h.reconciler();
    let ctx = CancellationToken::new();
    let role: AnyManaged = Role::with_external_name("app-role", "app", RoleParameters::default()).into();
    let ks: AnyManaged = Keyspace::with_external_name("shop-ks", "shop", KeyspaceParameters::default()).into();
    let refs = ObjectIndex::new([&role, &ks]);

    let mut obj: AnyManaged = Grant::new(
        "reader",
        GrantParameters {
            privileges: vec![GrantPrivilege::Select],
            role_ref: Some(cqlop_core::Reference { name: "app-role".into() }),
            keyspace_ref: Some(cqlop_core::Reference { name: "shop-ks".into() }),
            ..Default::default()
        },
    )
    .into();
    let report = reconciler.reconcile(&ctx, &mut obj, &refs).await.unwrap();
    assert_eq!(report.outcome, ReconcileOutcome::Created);
    let g = narrow::<Grant>(&obj).unwrap();
    assert_eq!(g.spec.for_provider.role.as_deref(), Some("app"));
    assert_eq!(g.spec.for_provider.keyspace.as_deref(), Some("shop"));
    assert_eq!(h.cluster.statements(), vec!["GRANT SELECT ON KEYSPACE \"shop\" TO \"app\"".to_string()]);
    assert_eq!(g.name(), "reader");
}

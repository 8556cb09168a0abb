//! In-memory CQL cluster.
//!
//! Holds the three system tables the controller reads (`system_schema.keyspaces`,
//! `system_auth.roles`, `system_auth.role_permissions`) and executes the
//! keyspace, role and permission statements it writes. Statements are split
//! into tokens by `sqlparser`'s generic dialect; anything outside that grammar
//! is rejected with `DbError::Unsupported`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use metrics::counter;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::GenericDialect;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use tracing::{debug, trace};

use crate::{statement_verb, ConnectionConfig, CqlValue, Database, DbError, Row, Rows};

const LOCATOR_PREFIX: &str = "org.apache.cassandra.locator.";
const SUPERUSER_NAME: &str = "cassandra";

/// Permissions applicable to a keyspace resource, in the order `ALL PERMISSIONS` expands to.
pub const KEYSPACE_PERMISSIONS: [&str; 6] = ["CREATE", "ALTER", "DROP", "SELECT", "MODIFY", "AUTHORIZE"];
const OTHER_PERMISSIONS: [&str; 2] = ["DESCRIBE", "EXECUTE"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyspaceRow {
    /// Replication options; `class` is stored fully qualified.
    pub replication: BTreeMap<String, String>,
    pub durable_writes: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRow {
    pub is_superuser: bool,
    pub can_login: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Table contents; serializable so the cluster can be persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub keyspaces: BTreeMap<String, KeyspaceRow>,
    #[serde(default)]
    pub roles: BTreeMap<String, RoleRow>,
    /// role -> resource (`data/<keyspace>`) -> permissions
    #[serde(default)]
    pub permissions: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl ClusterState {
    /// Fresh cluster with the stock `cassandra`/`cassandra` superuser.
    pub fn seeded() -> Self {
        let mut s = Self::default();
        s.roles.insert(
            SUPERUSER_NAME.to_string(),
            RoleRow { is_superuser: true, can_login: true, password: Some(SUPERUSER_NAME.to_string()) },
        );
        s
    }

    pub fn granted(&self, role: &str, keyspace: &str) -> BTreeSet<String> {
        self.permissions
            .get(role)
            .and_then(|r| r.get(&data_resource(keyspace)))
            .cloned()
            .unwrap_or_default()
    }
}

fn data_resource(keyspace: &str) -> String {
    format!("data/{}", keyspace)
}

struct Inner {
    state: Mutex<ClusterState>,
    log: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
}

/// Shared handle; clones see the same tables.
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::from_state(ClusterState::seeded())
    }

    pub fn from_state(state: ClusterState) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                log: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn snapshot(&self) -> ClusterState {
        lock(&self.inner.state).clone()
    }

    /// Statements executed so far, in order, including rejected ones.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.inner.log).clone()
    }

    pub fn take_statements(&self) -> Vec<String> {
        std::mem::take(&mut *lock(&self.inner.log))
    }

    /// Fail every statement containing `pattern` until cleared.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        lock(&self.inner.failures).push(pattern.into());
    }

    pub fn clear_failures(&self) {
        lock(&self.inner.failures).clear();
    }

    /// Open a session authenticated as `cfg.username`.
    pub fn connect(&self, cfg: &ConnectionConfig) -> Result<MemorySession, DbError> {
        let state = lock(&self.inner.state);
        let authenticated = state
            .roles
            .get(&cfg.username)
            .is_some_and(|r| r.can_login && r.password.as_deref() == Some(cfg.password.as_str()));
        if !authenticated {
            return Err(DbError::Auth(cfg.username.clone()));
        }
        if let Some(ks) = cfg.keyspace.as_deref() {
            if !state.keyspaces.contains_key(ks) {
                return Err(DbError::Config(format!("Keyspace '{}' does not exist", ks)));
            }
        }
        debug!(user = %cfg.username, address = %cfg.address(), "session opened");
        Ok(MemorySession { cluster: self.clone(), user: cfg.username.clone() })
    }

    fn execute(&self, statement: &str, user: Option<&str>) -> Result<(), DbError> {
        lock(&self.inner.log).push(statement.to_string());
        counter!("cql_statements_total", 1u64, "verb" => statement_verb(statement));
        if lock(&self.inner.failures).iter().any(|p| statement.contains(p.as_str())) {
            return Err(DbError::Exec(format!("injected failure: {}", statement)));
        }
        let stmt = parse_statement(statement)?;
        let mut state = lock(&self.inner.state);
        if let Some(user) = user {
            if !state.roles.get(user).is_some_and(|r| r.is_superuser) {
                return Err(DbError::Exec(format!("Unauthorized: User {} has no permission to run {}", user, stmt.verb())));
            }
        }
        trace!(statement, "executing");
        apply(&mut state, stmt)
    }

    fn run_query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError> {
        counter!("cql_statements_total", 1u64, "verb" => "select");
        let select = parse_select(statement, args)?;
        let state = lock(&self.inner.state);
        let rows = select_rows(&state, &select)?;
        Ok(Rows::buffered(rows))
    }
}

#[async_trait::async_trait]
impl Database for MemoryCluster {
    async fn exec(&self, statement: &str) -> Result<(), DbError> {
        self.execute(statement, None)
    }

    async fn query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError> {
        self.run_query(statement, args)
    }
}

/// Session bound to an authenticated role. Statements require superuser.
#[derive(Clone)]
pub struct MemorySession {
    cluster: MemoryCluster,
    user: String,
}

impl MemorySession {
    pub fn user(&self) -> &str {
        &self.user
    }
}

#[async_trait::async_trait]
impl Database for MemorySession {
    async fn exec(&self, statement: &str) -> Result<(), DbError> {
        self.cluster.execute(statement, Some(&self.user))
    }

    async fn query(&self, statement: &str, args: &[CqlValue]) -> Result<Rows, DbError> {
        self.cluster.run_query(statement, args)
    }
}

// ---------------- statements ----------------

fn syntax(msg: impl std::fmt::Display) -> DbError {
    DbError::Exec(format!("SyntaxException: {}", msg))
}

fn invalid(msg: impl std::fmt::Display) -> DbError {
    DbError::Exec(format!("InvalidRequest: {}", msg))
}

/// Significant tokens of `input`: whitespace and comments dropped.
fn tokenize(input: &str) -> Result<Vec<Token>, DbError> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, input).tokenize().map_err(syntax)?;
    Ok(tokens.into_iter().filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF)).collect())
}

fn is_bare_word(w: &Word, kw: &str) -> bool {
    w.quote_style.is_none() && w.value.eq_ignore_ascii_case(kw)
}

#[derive(Debug, Clone, PartialEq)]
enum Lit {
    Str(String),
    Num(String),
    Bool(bool),
    Map(Vec<(String, Lit)>),
    Param,
}

impl Lit {
    fn as_option_string(&self) -> Option<String> {
        match self {
            Lit::Str(s) | Lit::Num(s) => Some(s.clone()),
            Lit::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Cursor over the token stream of one statement.
struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Result<Self, DbError> {
        Ok(Self { toks: tokenize(input)?, pos: 0 })
    }

    fn peek(&self) -> Option<&Token> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.toks.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn keyword(&mut self, kw: &str) -> bool {
        let hit = matches!(self.peek(), Some(Token::Word(w)) if is_bare_word(w, kw));
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), DbError> {
        if self.keyword(kw) {
            Ok(())
        } else {
            Err(syntax(format!("expected {} at {:?}", kw, self.peek())))
        }
    }

    fn keywords(&mut self, kws: &[&str]) -> bool {
        let save = self.pos;
        if kws.iter().all(|kw| self.keyword(kw)) {
            true
        } else {
            self.pos = save;
            false
        }
    }

    fn token(&mut self, expected: &Token) -> bool {
        let hit = self.peek() == Some(expected);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn expect_token(&mut self, expected: &Token) -> Result<(), DbError> {
        if self.token(expected) {
            Ok(())
        } else {
            Err(syntax(format!("expected '{}' at {:?}", expected, self.peek())))
        }
    }

    /// Double-quoted identifiers keep their case; bare ones fold to lower case.
    fn ident(&mut self) -> Result<String, DbError> {
        match self.next() {
            Some(Token::Word(Word { value, quote_style: Some('"'), .. })) => Ok(value),
            Some(Token::Word(Word { value, quote_style: None, .. })) => Ok(value.to_ascii_lowercase()),
            other => Err(syntax(format!("expected identifier at {:?}", other))),
        }
    }

    fn literal(&mut self) -> Result<Lit, DbError> {
        match self.next() {
            Some(Token::SingleQuotedString(s)) => Ok(Lit::Str(s)),
            Some(Token::Number(n, _)) => Ok(Lit::Num(n)),
            Some(Token::Minus) => match self.next() {
                Some(Token::Number(n, _)) => Ok(Lit::Num(format!("-{}", n))),
                other => Err(syntax(format!("expected number at {:?}", other))),
            },
            Some(Token::Placeholder(p)) if p == "?" => Ok(Lit::Param),
            Some(Token::Word(w)) if is_bare_word(&w, "true") => Ok(Lit::Bool(true)),
            Some(Token::Word(w)) if is_bare_word(&w, "false") => Ok(Lit::Bool(false)),
            Some(Token::LBrace) => {
                let mut entries = Vec::new();
                if self.token(&Token::RBrace) {
                    return Ok(Lit::Map(entries));
                }
                loop {
                    let key = self
                        .literal()?
                        .as_option_string()
                        .ok_or_else(|| syntax("map keys must be literals"))?;
                    self.expect_token(&Token::Colon)?;
                    entries.push((key, self.literal()?));
                    if self.token(&Token::RBrace) {
                        return Ok(Lit::Map(entries));
                    }
                    self.expect_token(&Token::Comma)?;
                }
            }
            other => Err(syntax(format!("expected literal at {:?}", other))),
        }
    }

    fn bool_literal(&mut self) -> Result<bool, DbError> {
        match self.literal()? {
            Lit::Bool(b) => Ok(b),
            other => Err(syntax(format!("expected boolean, got {:?}", other))),
        }
    }

    fn finish(&mut self) -> Result<(), DbError> {
        self.token(&Token::SemiColon);
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(syntax(format!("unexpected trailing input at {:?}", t))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct RoleOptions {
    superuser: Option<bool>,
    login: Option<bool>,
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum Stmt {
    CreateKeyspace { if_not_exists: bool, name: String, replication: Option<BTreeMap<String, String>>, durable_writes: Option<bool> },
    AlterKeyspace { name: String, replication: Option<BTreeMap<String, String>>, durable_writes: Option<bool> },
    DropKeyspace { if_exists: bool, name: String },
    CreateRole { if_not_exists: bool, name: String, opts: RoleOptions },
    AlterRole { name: String, opts: RoleOptions },
    DropRole { if_exists: bool, name: String },
    Grant { permissions: Vec<String>, keyspace: String, role: String },
    Revoke { permissions: Vec<String>, keyspace: String, role: String },
}

impl Stmt {
    fn verb(&self) -> &'static str {
        match self {
            Stmt::CreateKeyspace { .. } => "CREATE KEYSPACE",
            Stmt::AlterKeyspace { .. } => "ALTER KEYSPACE",
            Stmt::DropKeyspace { .. } => "DROP KEYSPACE",
            Stmt::CreateRole { .. } => "CREATE ROLE",
            Stmt::AlterRole { .. } => "ALTER ROLE",
            Stmt::DropRole { .. } => "DROP ROLE",
            Stmt::Grant { .. } => "GRANT",
            Stmt::Revoke { .. } => "REVOKE",
        }
    }
}

fn parse_statement(input: &str) -> Result<Stmt, DbError> {
    let mut p = Parser::new(input)?;
    let stmt = if p.keyword("CREATE") {
        if p.keyword("KEYSPACE") {
            let if_not_exists = p.keywords(&["IF", "NOT", "EXISTS"]);
            let name = p.ident()?;
            let (replication, durable_writes) = keyspace_properties(&mut p)?;
            Stmt::CreateKeyspace { if_not_exists, name, replication, durable_writes }
        } else if p.keyword("ROLE") {
            let if_not_exists = p.keywords(&["IF", "NOT", "EXISTS"]);
            let name = p.ident()?;
            Stmt::CreateRole { if_not_exists, name, opts: role_options(&mut p)? }
        } else {
            return Err(DbError::Unsupported(input.to_string()));
        }
    } else if p.keyword("ALTER") {
        if p.keyword("KEYSPACE") {
            let name = p.ident()?;
            let (replication, durable_writes) = keyspace_properties(&mut p)?;
            Stmt::AlterKeyspace { name, replication, durable_writes }
        } else if p.keyword("ROLE") {
            let name = p.ident()?;
            Stmt::AlterRole { name, opts: role_options(&mut p)? }
        } else {
            return Err(DbError::Unsupported(input.to_string()));
        }
    } else if p.keyword("DROP") {
        let is_keyspace = if p.keyword("KEYSPACE") {
            true
        } else if p.keyword("ROLE") {
            false
        } else {
            return Err(DbError::Unsupported(input.to_string()));
        };
        let if_exists = p.keywords(&["IF", "EXISTS"]);
        let name = p.ident()?;
        if is_keyspace {
            Stmt::DropKeyspace { if_exists, name }
        } else {
            Stmt::DropRole { if_exists, name }
        }
    } else if p.keyword("GRANT") {
        let permissions = permission_list(&mut p)?;
        let keyspace = keyspace_resource(&mut p)?;
        p.expect_keyword("TO")?;
        Stmt::Grant { permissions, keyspace, role: p.ident()? }
    } else if p.keyword("REVOKE") {
        let permissions = permission_list(&mut p)?;
        let keyspace = keyspace_resource(&mut p)?;
        p.expect_keyword("FROM")?;
        Stmt::Revoke { permissions, keyspace, role: p.ident()? }
    } else {
        return Err(DbError::Unsupported(input.to_string()));
    };
    p.finish()?;
    Ok(stmt)
}

type KeyspaceProps = (Option<BTreeMap<String, String>>, Option<bool>);

fn keyspace_properties(p: &mut Parser) -> Result<KeyspaceProps, DbError> {
    let mut replication = None;
    let mut durable_writes = None;
    if !p.keyword("WITH") {
        return Ok((None, None));
    }
    loop {
        let prop = p.ident()?;
        p.expect_token(&Token::Eq)?;
        match prop.as_str() {
            "replication" => match p.literal()? {
                Lit::Map(entries) => {
                    let mut m = BTreeMap::new();
                    for (k, v) in entries {
                        let v = v.as_option_string().ok_or_else(|| syntax("replication values must be literals"))?;
                        m.insert(k, v);
                    }
                    replication = Some(m);
                }
                other => return Err(syntax(format!("replication must be a map, got {:?}", other))),
            },
            "durable_writes" => durable_writes = Some(p.bool_literal()?),
            other => return Err(syntax(format!("unknown property '{}'", other))),
        }
        if !p.keyword("AND") {
            break;
        }
    }
    Ok((replication, durable_writes))
}

fn role_options(p: &mut Parser) -> Result<RoleOptions, DbError> {
    let mut opts = RoleOptions::default();
    if !p.keyword("WITH") {
        return Ok(opts);
    }
    loop {
        let opt = p.ident()?;
        p.expect_token(&Token::Eq)?;
        match opt.as_str() {
            "superuser" => opts.superuser = Some(p.bool_literal()?),
            "login" => opts.login = Some(p.bool_literal()?),
            "password" => match p.literal()? {
                Lit::Str(s) => opts.password = Some(s),
                other => return Err(syntax(format!("password must be a string, got {:?}", other))),
            },
            other => return Err(syntax(format!("unknown role option '{}'", other))),
        }
        if !p.keyword("AND") {
            break;
        }
    }
    Ok(opts)
}

fn permission_list(p: &mut Parser) -> Result<Vec<String>, DbError> {
    if p.keyword("ALL") {
        p.keyword("PERMISSIONS");
        return Ok(KEYSPACE_PERMISSIONS.iter().map(|s| s.to_string()).collect());
    }
    match p.next() {
        Some(Token::Word(Word { value: w, quote_style: None, .. })) => {
            let upper = w.to_ascii_uppercase();
            p.keyword("PERMISSION");
            if KEYSPACE_PERMISSIONS.contains(&upper.as_str()) {
                Ok(vec![upper])
            } else if OTHER_PERMISSIONS.contains(&upper.as_str()) {
                Err(invalid(format!("Resource type DataResource does not support any of the requested permissions: {}", upper)))
            } else {
                Err(syntax(format!("unknown permission {}", w)))
            }
        }
        other => Err(syntax(format!("expected permission at {:?}", other))),
    }
}

fn keyspace_resource(p: &mut Parser) -> Result<String, DbError> {
    p.expect_keyword("ON")?;
    p.expect_keyword("KEYSPACE")?;
    p.ident()
}

fn normalize_replication(mut m: BTreeMap<String, String>) -> Result<BTreeMap<String, String>, DbError> {
    let class = m.remove("class").ok_or_else(|| invalid("Missing replication strategy class"))?;
    let short = class.strip_prefix(LOCATOR_PREFIX).unwrap_or(&class);
    match short {
        "SimpleStrategy" => {
            let rf = m.get("replication_factor").ok_or_else(|| {
                invalid("SimpleStrategy requires a replication_factor strategy option.")
            })?;
            if rf.parse::<u32>().is_err() {
                return Err(invalid(format!("Replication factor must be non-negative integer; found {}", rf)));
            }
            if let Some(extra) = m.keys().find(|k| k.as_str() != "replication_factor") {
                return Err(invalid(format!("Unrecognized strategy option {{{}}} passed to SimpleStrategy", extra)));
            }
        }
        "NetworkTopologyStrategy" => {
            if let Some((k, v)) = m.iter().find(|(_, v)| v.parse::<u32>().is_err()) {
                return Err(invalid(format!("Replication factor must be non-negative integer; found {} for {}", v, k)));
            }
        }
        other => return Err(invalid(format!("Unable to find replication strategy class '{}'", other))),
    }
    m.insert("class".to_string(), format!("{}{}", LOCATOR_PREFIX, short));
    Ok(m)
}

fn apply(state: &mut ClusterState, stmt: Stmt) -> Result<(), DbError> {
    match stmt {
        Stmt::CreateKeyspace { if_not_exists, name, replication, durable_writes } => {
            if state.keyspaces.contains_key(&name) {
                return if if_not_exists {
                    Ok(())
                } else {
                    Err(DbError::Exec(format!("AlreadyExists: Keyspace {} already exists", name)))
                };
            }
            let replication = replication.ok_or_else(|| syntax("CREATE KEYSPACE requires replication"))?;
            let row = KeyspaceRow { replication: normalize_replication(replication)?, durable_writes: durable_writes.unwrap_or(true) };
            state.keyspaces.insert(name, row);
        }
        Stmt::AlterKeyspace { name, replication, durable_writes } => {
            let row = state
                .keyspaces
                .get_mut(&name)
                .ok_or_else(|| invalid(format!("Keyspace '{}' does not exist", name)))?;
            if let Some(r) = replication {
                row.replication = normalize_replication(r)?;
            }
            if let Some(d) = durable_writes {
                row.durable_writes = d;
            }
        }
        Stmt::DropKeyspace { if_exists, name } => {
            if state.keyspaces.remove(&name).is_none() && !if_exists {
                return Err(invalid(format!("Cannot drop non existing keyspace '{}'.", name)));
            }
            let resource = data_resource(&name);
            for perms in state.permissions.values_mut() {
                perms.remove(&resource);
            }
            state.permissions.retain(|_, perms| !perms.is_empty());
        }
        Stmt::CreateRole { if_not_exists, name, opts } => {
            if state.roles.contains_key(&name) {
                return if if_not_exists {
                    Ok(())
                } else {
                    Err(invalid(format!("{} already exists", name)))
                };
            }
            let row = RoleRow {
                is_superuser: opts.superuser.unwrap_or(false),
                can_login: opts.login.unwrap_or(false),
                password: opts.password,
            };
            state.roles.insert(name, row);
        }
        Stmt::AlterRole { name, opts } => {
            let row = state.roles.get_mut(&name).ok_or_else(|| invalid(format!("{} doesn't exist", name)))?;
            if let Some(s) = opts.superuser {
                row.is_superuser = s;
            }
            if let Some(l) = opts.login {
                row.can_login = l;
            }
            if opts.password.is_some() {
                row.password = opts.password;
            }
        }
        Stmt::DropRole { if_exists, name } => {
            if state.roles.remove(&name).is_none() && !if_exists {
                return Err(invalid(format!("{} doesn't exist", name)));
            }
            state.permissions.remove(&name);
        }
        Stmt::Grant { permissions, keyspace, role } => {
            check_grantee(state, &keyspace, &role)?;
            state
                .permissions
                .entry(role)
                .or_default()
                .entry(data_resource(&keyspace))
                .or_default()
                .extend(permissions);
        }
        Stmt::Revoke { permissions, keyspace, role } => {
            check_grantee(state, &keyspace, &role)?;
            let resource = data_resource(&keyspace);
            if let Some(by_resource) = state.permissions.get_mut(&role) {
                if let Some(set) = by_resource.get_mut(&resource) {
                    for p in &permissions {
                        set.remove(p);
                    }
                    if set.is_empty() {
                        by_resource.remove(&resource);
                    }
                }
                if by_resource.is_empty() {
                    state.permissions.remove(&role);
                }
            }
        }
    }
    Ok(())
}

fn check_grantee(state: &ClusterState, keyspace: &str, role: &str) -> Result<(), DbError> {
    if !state.roles.contains_key(role) {
        return Err(invalid(format!("Role {} doesn't exist", role)));
    }
    if !state.keyspaces.contains_key(keyspace) {
        return Err(invalid(format!("Resource <keyspace {}> doesn't exist", keyspace)));
    }
    Ok(())
}

// ---------------- queries ----------------

#[derive(Debug)]
struct Select {
    columns: Vec<String>,
    table: String,
    filters: Vec<(String, CqlValue)>,
}

fn parse_select(input: &str, args: &[CqlValue]) -> Result<Select, DbError> {
    let query_err = |e: DbError| match e {
        DbError::Exec(m) => DbError::Query(m),
        other => other,
    };
    let mut p = Parser::new(input).map_err(query_err)?;
    if !p.keyword("SELECT") {
        return Err(DbError::Unsupported(input.to_string()));
    }
    let mut columns = vec![p.ident().map_err(query_err)?];
    while p.token(&Token::Comma) {
        columns.push(p.ident().map_err(query_err)?);
    }
    p.expect_keyword("FROM").map_err(query_err)?;
    let ks = p.ident().map_err(query_err)?;
    p.expect_token(&Token::Period).map_err(query_err)?;
    let table = format!("{}.{}", ks, p.ident().map_err(query_err)?);

    let mut filters = Vec::new();
    let mut next_arg = 0usize;
    if p.keyword("WHERE") {
        loop {
            let column = p.ident().map_err(query_err)?;
            p.expect_token(&Token::Eq).map_err(query_err)?;
            let value = match p.literal().map_err(query_err)? {
                Lit::Param => {
                    let v = args
                        .get(next_arg)
                        .cloned()
                        .ok_or_else(|| DbError::Query(format!("missing bind value {}", next_arg)))?;
                    next_arg += 1;
                    v
                }
                Lit::Str(s) => CqlValue::Text(s),
                Lit::Bool(b) => CqlValue::Boolean(b),
                Lit::Num(n) => CqlValue::Int(n.parse().map_err(|_| DbError::Query(format!("bad number {}", n)))?),
                Lit::Map(_) => return Err(DbError::Query("map literals are not supported in WHERE".into())),
            };
            filters.push((column, value));
            if !p.keyword("AND") {
                break;
            }
        }
    }
    p.finish().map_err(query_err)?;
    if next_arg != args.len() {
        return Err(DbError::Query(format!("expected {} bind values, got {}", next_arg, args.len())));
    }
    Ok(Select { columns, table, filters })
}

type Record = BTreeMap<&'static str, CqlValue>;

fn table_rows(state: &ClusterState, table: &str) -> Result<Vec<Record>, DbError> {
    let rows = match table {
        "system_schema.keyspaces" => state
            .keyspaces
            .iter()
            .map(|(name, row)| {
                Record::from([
                    ("keyspace_name", CqlValue::Text(name.clone())),
                    ("replication", CqlValue::text_map(row.replication.clone())),
                    ("durable_writes", CqlValue::Boolean(row.durable_writes)),
                ])
            })
            .collect(),
        "system_auth.roles" => state
            .roles
            .iter()
            .map(|(name, row)| {
                Record::from([
                    ("role", CqlValue::Text(name.clone())),
                    ("is_superuser", CqlValue::Boolean(row.is_superuser)),
                    ("can_login", CqlValue::Boolean(row.can_login)),
                ])
            })
            .collect(),
        "system_auth.role_permissions" => state
            .permissions
            .iter()
            .flat_map(|(role, by_resource)| {
                by_resource.iter().map(move |(resource, perms)| {
                    Record::from([
                        ("role", CqlValue::Text(role.clone())),
                        ("resource", CqlValue::Text(resource.clone())),
                        ("permissions", CqlValue::text_set(perms.iter().cloned())),
                    ])
                })
            })
            .collect(),
        other => return Err(DbError::Query(format!("InvalidRequest: table {} does not exist", other))),
    };
    Ok(rows)
}

fn select_rows(state: &ClusterState, select: &Select) -> Result<Vec<Row>, DbError> {
    let records = table_rows(state, &select.table)?;
    if let Some(bad) =
        select.columns.iter().chain(select.filters.iter().map(|(c, _)| c)).find(|c| !known_column(&select.table, c))
    {
        return Err(DbError::Query(format!("InvalidRequest: Undefined column name {}", bad)));
    }
    Ok(records
        .into_iter()
        .filter(|r| select.filters.iter().all(|(c, v)| r.get(c.as_str()) == Some(v)))
        .map(|r| Row::new(select.columns.iter().map(|c| r.get(c.as_str()).cloned().unwrap_or(CqlValue::Null)).collect()))
        .collect())
}

fn known_column(table: &str, column: &str) -> bool {
    let cols: &[&str] = match table {
        "system_schema.keyspaces" => &["keyspace_name", "replication", "durable_writes"],
        "system_auth.roles" => &["role", "is_superuser", "can_login"],
        "system_auth.role_permissions" => &["role", "resource", "permissions"],
        _ => &[],
    };
    cols.contains(&column)
}

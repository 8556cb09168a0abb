use cqlop_core::ResourceKind;
use cqlop_db::DbError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("managed resource is not a {0} custom resource")]
    WrongKind(ResourceKind),
    /// A Connect-step collaborator failed.
    #[error("{context}: {source:#}")]
    Upstream {
        context: &'static str,
        #[source]
        source: anyhow::Error,
    },
    /// The database rejected a statement or query.
    #[error("{label}: {source}")]
    Statement {
        label: &'static str,
        #[source]
        source: DbError,
    },
    /// Live state could not be interpreted.
    #[error("{0}")]
    Malformed(String),
    #[error("external name is not set")]
    MissingExternalName,
    #[error("{0} is not set")]
    MissingField(&'static str),
    #[error("cannot resolve {field} reference {name:?}")]
    UnresolvedReference { field: &'static str, name: String },
    #[error("cannot generate password: {0:#}")]
    Password(#[source] anyhow::Error),
    #[error("cannot publish connection details: {0:#}")]
    Publish(#[source] anyhow::Error),
    #[error("reconciliation cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn statement(label: &'static str) -> impl FnOnce(DbError) -> Error {
        move |source| Error::Statement { label, source }
    }

    pub(crate) fn upstream<E: Into<anyhow::Error>>(context: &'static str) -> impl FnOnce(E) -> Error {
        move |e| Error::Upstream { context, source: e.into() }
    }
}

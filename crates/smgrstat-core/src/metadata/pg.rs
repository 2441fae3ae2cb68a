//! PostgreSQL-backed catalog lookup.

use postgres::{Client, NoTls};
use tracing::{debug, warn};

use super::catalog::{CatalogError, CatalogLookup};
use crate::store::{EntryMetadata, INVALID_OID, Oid, RelKind};

/// Identity of the relation behind a (tablespace, filenode) pair. The
/// parent is the indexed table for indexes and the owning table for toast
/// relations.
const RELATION_QUERY: &str = "\
SELECT c.oid, c.relkind::text, c.relname::text, n.nspname::text,
       COALESCE(i.indrelid, t.oid, 0::oid)
FROM pg_class c
JOIN pg_namespace n ON n.oid = c.relnamespace
LEFT JOIN pg_index i ON i.indexrelid = c.oid
LEFT JOIN pg_class t ON t.reltoastrelid = c.oid
WHERE c.oid = pg_filenode_relation($1, $2)";

const NAMESPACE_QUERY: &str = "SELECT nspname::text FROM pg_namespace WHERE oid = $1";

pub struct PgCatalog {
    connection_string: String,
    client: Option<Client>,
}

impl PgCatalog {
    /// Builds a connection string from the standard libpq environment
    /// variables, connecting to `database`.
    pub fn from_env(database: &str) -> Result<Self, CatalogError> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .map_err(|_| CatalogError::EnvNotSet("PGUSER or USER".to_string()))?;
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string());
        let password = std::env::var("PGPASSWORD").unwrap_or_default();

        let connection_string = if password.is_empty() {
            format!(
                "host={} port={} user={} dbname={}",
                host, port, user, database
            )
        } else {
            format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, database
            )
        };
        Ok(Self::with_connection_string(connection_string))
    }

    pub fn with_connection_string(connection_string: String) -> Self {
        Self {
            connection_string,
            client: None,
        }
    }

    fn client(&mut self) -> Result<&mut Client, CatalogError> {
        if self.client.is_none() {
            let client = Client::connect(&self.connection_string, NoTls)
                .map_err(|e| CatalogError::ConnectionError(format_postgres_error(&e)))?;
            debug!("catalog connection established");
            self.client = Some(client);
        }
        self.client
            .as_mut()
            .ok_or_else(|| CatalogError::ConnectionError("not connected".to_string()))
    }

    /// Drops the connection after an error so the next call reconnects.
    fn on_error(&mut self, e: &postgres::Error) -> CatalogError {
        if e.is_closed() {
            warn!("catalog connection lost");
            self.client = None;
        }
        CatalogError::QueryError(format_postgres_error(e))
    }
}

impl CatalogLookup for PgCatalog {
    fn lookup_relation(
        &mut self,
        spc_oid: Oid,
        rel_number: Oid,
    ) -> Result<Option<EntryMetadata>, CatalogError> {
        let client = self.client()?;
        let result = client.query(RELATION_QUERY, &[&spc_oid, &rel_number]);
        let rows = match result {
            Ok(rows) => rows,
            Err(e) => return Err(self.on_error(&e)),
        };
        let Some(row) = rows.first() else {
            return Ok(None);
        };

        let reloid: Oid = row.get(0);
        let relkind: String = row.get(1);
        let main_reloid: Oid = row.get(4);
        Ok(Some(EntryMetadata {
            reloid,
            main_reloid: if main_reloid == reloid {
                INVALID_OID
            } else {
                main_reloid
            },
            relkind: relkind.chars().next().and_then(RelKind::from_code),
            relname: row.get(2),
            nspname: row.get(3),
            valid: true,
        }))
    }

    fn namespace_name(&mut self, nsp_oid: Oid) -> Result<Option<String>, CatalogError> {
        let client = self.client()?;
        let result = client.query_opt(NAMESPACE_QUERY, &[&nsp_oid]);
        match result {
            Ok(row) => Ok(row.map(|r| r.get(0))),
            Err(e) => Err(self.on_error(&e)),
        }
    }
}

pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}

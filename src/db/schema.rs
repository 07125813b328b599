//! Table metadata and DDL generation for the managed schemas.
//! SQLite-first; the dialect only changes the column type names emitted.

use std::fmt;

/// SQL dialect declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    H2,
    Postgres,
    MySql,
    Other(String),
}

impl Dialect {
    /// Recognises short names (`H2`) and fully qualified dialect class names
    /// (`org.hibernate.dialect.PostgreSQLDialect`).
    pub fn parse(name: &str) -> Self {
        let lower = name.trim().to_ascii_lowercase();
        if lower.contains("sqlite") {
            Dialect::Sqlite
        } else if lower == "h2" || lower.contains(".h2") || lower.contains("h2dialect") {
            Dialect::H2
        } else if lower.contains("postgre") {
            Dialect::Postgres
        } else if lower.contains("mysql") || lower.contains("mariadb") {
            Dialect::MySql
        } else {
            Dialect::Other(name.trim().to_string())
        }
    }

    fn type_name(&self, ty: ColumnType) -> &'static str {
        match (self, ty) {
            (_, ColumnType::Identity) => "INTEGER PRIMARY KEY AUTOINCREMENT",
            (_, ColumnType::Integer) => "INTEGER",
            (_, ColumnType::BigInt) => "BIGINT",
            (Dialect::Sqlite, ColumnType::Text) => "TEXT",
            (_, ColumnType::Text) => "VARCHAR(255)",
            (Dialect::Sqlite, ColumnType::Timestamp) => "TEXT",
            (_, ColumnType::Timestamp) => "VARCHAR(64)",
            (Dialect::Postgres, ColumnType::Lob) => "BYTEA",
            (Dialect::MySql, ColumnType::Lob) => "LONGBLOB",
            (_, ColumnType::Lob) => "BLOB",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Sqlite => f.write_str("SQLite"),
            Dialect::H2 => f.write_str("H2"),
            Dialect::Postgres => f.write_str("PostgreSQL"),
            Dialect::MySql => f.write_str("MySQL"),
            Dialect::Other(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// Auto-incrementing integer primary key.
    Identity,
    Integer,
    BigInt,
    Text,
    Timestamp,
    /// Large object; subject to the persistence unit's large-object mode.
    Lob,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub const fn required(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
        }
    }

    pub const fn optional(name: &'static str, ty: ColumnType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
        }
    }

    fn definition(&self, dialect: &Dialect) -> String {
        let mut def = format!("{} {}", self.name, dialect.type_name(self.ty));
        if !self.nullable && self.ty != ColumnType::Identity {
            def.push_str(" NOT NULL");
        }
        def
    }
}

#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// Empty when the table has an identity column.
    pub primary_key: &'static [&'static str],
    pub unique: &'static [&'static [&'static str]],
}

impl Table {
    /// Columns identifying a row: the identity column or the primary key.
    pub fn key_columns(&self) -> Vec<&'static str> {
        match self.columns.iter().find(|c| c.ty == ColumnType::Identity) {
            Some(identity) => vec![identity.name],
            None => self.primary_key.to_vec(),
        }
    }

    /// Columns written on insert, in declaration order (identity excluded).
    pub fn insertable_columns(&self) -> impl Iterator<Item = &'static Column> + '_ {
        self.columns.iter().filter(|c| c.ty != ColumnType::Identity)
    }

    pub fn has_lob(&self) -> bool {
        self.columns.iter().any(|c| c.ty == ColumnType::Lob)
    }

    pub fn column(&self, name: &str) -> Option<&'static Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn create_sql(&self, dialect: &Dialect, if_not_exists: bool) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(|c| c.definition(dialect)).collect();
        if !self.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", self.primary_key.join(", ")));
        }
        for unique in self.unique {
            parts.push(format!("UNIQUE ({})", unique.join(", ")));
        }
        format!(
            "CREATE TABLE {}{} ({})",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            self.name,
            parts.join(", ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.name)
    }

    pub fn add_column_sql(&self, column: &Column, dialect: &Dialect) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {}",
            self.name,
            column.definition(dialect)
        )
    }
}

/// A named group of tables managed by a persistence unit.
#[derive(Debug)]
pub struct ManagedSchema {
    pub name: &'static str,
    pub tables: &'static [&'static Table],
}

pub static DOMAIN_EVENT_ENTRY: Table = Table {
    name: "domain_event_entry",
    columns: &[
        Column::required("global_index", ColumnType::Identity),
        Column::required("event_identifier", ColumnType::Text),
        Column::required("aggregate_identifier", ColumnType::Text),
        Column::required("sequence_number", ColumnType::BigInt),
        Column::optional("type", ColumnType::Text),
        Column::required("payload_type", ColumnType::Text),
        Column::optional("payload_revision", ColumnType::Text),
        Column::required("payload", ColumnType::Lob),
        Column::optional("meta_data", ColumnType::Lob),
        Column::required("time_stamp", ColumnType::Timestamp),
    ],
    primary_key: &[],
    unique: &[
        &["event_identifier"],
        &["aggregate_identifier", "sequence_number"],
    ],
};

pub static SNAPSHOT_EVENT_ENTRY: Table = Table {
    name: "snapshot_event_entry",
    columns: &[
        Column::required("aggregate_identifier", ColumnType::Text),
        Column::required("sequence_number", ColumnType::BigInt),
        Column::required("type", ColumnType::Text),
        Column::required("event_identifier", ColumnType::Text),
        Column::required("payload_type", ColumnType::Text),
        Column::required("payload", ColumnType::Lob),
        Column::required("time_stamp", ColumnType::Timestamp),
    ],
    primary_key: &["aggregate_identifier", "sequence_number", "type"],
    unique: &[&["event_identifier"]],
};

pub static TOKEN_ENTRY: Table = Table {
    name: "token_entry",
    columns: &[
        Column::required("processor_name", ColumnType::Text),
        Column::required("segment", ColumnType::Integer),
        Column::optional("token", ColumnType::Lob),
        Column::optional("token_type", ColumnType::Text),
        Column::required("timestamp", ColumnType::Timestamp),
        Column::optional("owner", ColumnType::Text),
    ],
    primary_key: &["processor_name", "segment"],
    unique: &[],
};

pub static SAGA_ENTRY: Table = Table {
    name: "saga_entry",
    columns: &[
        Column::required("saga_id", ColumnType::Text),
        Column::optional("revision", ColumnType::Text),
        Column::required("saga_type", ColumnType::Text),
        Column::required("serialized_saga", ColumnType::Lob),
    ],
    primary_key: &["saga_id"],
    unique: &[],
};

pub static ASSOCIATION_VALUE_ENTRY: Table = Table {
    name: "association_value_entry",
    columns: &[
        Column::required("id", ColumnType::Identity),
        Column::required("association_key", ColumnType::Text),
        Column::optional("association_value", ColumnType::Text),
        Column::required("saga_id", ColumnType::Text),
        Column::required("saga_type", ColumnType::Text),
    ],
    primary_key: &[],
    unique: &[],
};

pub static EVENT_STORE_SCHEMA: ManagedSchema = ManagedSchema {
    name: "event-store",
    tables: &[&DOMAIN_EVENT_ENTRY, &SNAPSHOT_EVENT_ENTRY],
};

pub static TOKEN_STORE_SCHEMA: ManagedSchema = ManagedSchema {
    name: "token-store",
    tables: &[&TOKEN_ENTRY],
};

pub static SAGA_STORE_SCHEMA: ManagedSchema = ManagedSchema {
    name: "saga-store",
    tables: &[&SAGA_ENTRY, &ASSOCIATION_VALUE_ENTRY],
};

/// Schemas every infrastructure build manages.
pub fn default_schemas() -> Vec<&'static ManagedSchema> {
    vec![&EVENT_STORE_SCHEMA, &TOKEN_STORE_SCHEMA, &SAGA_STORE_SCHEMA]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_names() {
        assert_eq!(Dialect::parse("H2"), Dialect::H2);
        assert_eq!(Dialect::parse("org.hibernate.dialect.H2Dialect"), Dialect::H2);
        assert_eq!(
            Dialect::parse("org.hibernate.dialect.PostgreSQL95Dialect"),
            Dialect::Postgres
        );
        assert_eq!(Dialect::parse("sqlite"), Dialect::Sqlite);
        assert_eq!(Dialect::parse("MariaDB103"), Dialect::MySql);
        assert_eq!(
            Dialect::parse("Oracle12c"),
            Dialect::Other("Oracle12c".to_string())
        );
    }

    #[test]
    fn token_entry_ddl() {
        let sql = TOKEN_ENTRY.create_sql(&Dialect::Postgres, true);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS token_entry (processor_name VARCHAR(255) NOT NULL, \
             segment INTEGER NOT NULL, token BYTEA, token_type VARCHAR(255), \
             timestamp VARCHAR(64) NOT NULL, owner VARCHAR(255), \
             PRIMARY KEY (processor_name, segment))"
        );
    }

    #[test]
    fn identity_tables_key_on_identity_column() {
        assert_eq!(ASSOCIATION_VALUE_ENTRY.key_columns(), vec!["id"]);
        assert_eq!(TOKEN_ENTRY.key_columns(), vec!["processor_name", "segment"]);
        assert!(
            DOMAIN_EVENT_ENTRY
                .create_sql(&Dialect::Sqlite, false)
                .starts_with("CREATE TABLE domain_event_entry (global_index INTEGER PRIMARY KEY AUTOINCREMENT, ")
        );
        assert_eq!(DOMAIN_EVENT_ENTRY.insertable_columns().count(), 9);
    }
}

//! Relational store for materialized provenance entities.
//!
//! The indexer only needs existence checks by natural key, inserts, and the
//! price update used by the refresh task. [`SqliteStore`] is the shipped
//! implementation.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::OffsetDateTime;

use crate::error::StoreError;

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS producer (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        region TEXT NOT NULL,
        verified INTEGER NOT NULL DEFAULT 0,
        added_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS product (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        producer_id TEXT NOT NULL REFERENCES producer(id),
        region TEXT NOT NULL,
        harvested_at INTEGER NOT NULL,
        organic INTEGER NOT NULL,
        market_price REAL
    );

    CREATE TABLE IF NOT EXISTS stage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        product_id TEXT NOT NULL REFERENCES product(id),
        date INTEGER NOT NULL,
        operation TEXT NOT NULL,
        operator TEXT NOT NULL,
        place TEXT NOT NULL,
        UNIQUE (product_id, operation, operator, place, date)
    );

    CREATE INDEX IF NOT EXISTS idx_product_producer ON product(producer_id);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Producer,
    Product,
    Stage,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Producer => "producer",
            Self::Product => "product",
            Self::Stage => "stage",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Producer {
    pub id: String,
    pub name: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub producer_id: String,
    pub region: String,
    /// Unix seconds.
    pub harvested_at: i64,
    pub organic: bool,
    pub market_price: Option<f64>,
}

/// Structural identity of a stage; stages carry no external id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageKey {
    pub product_id: String,
    pub operation: String,
    pub operator: String,
    pub place: String,
    /// Unix seconds.
    pub date: i64,
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}@{}",
            self.product_id, self.operation, self.operator, self.place, self.date
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Producer(Producer),
    Product(Product),
    Stage(StageKey),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Producer(_) => EntityKind::Producer,
            Self::Product(_) => EntityKind::Product,
            Self::Stage(_) => EntityKind::Stage,
        }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Self::Producer(p) => EntityKey::Producer(p.id.clone()),
            Self::Product(p) => EntityKey::Product(p.id.clone()),
            Self::Stage(s) => EntityKey::Stage(s.clone()),
        }
    }
}

/// Natural key used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    Producer(String),
    Product(String),
    Stage(StageKey),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Producer(id) | Self::Product(id) => f.write_str(id),
            Self::Stage(key) => write!(f, "{key}"),
        }
    }
}

/// Row counts per entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub producers: u64,
    pub products: u64,
    pub stages: u64,
}

impl EntityCounts {
    pub fn bump(&mut self, kind: EntityKind) {
        match kind {
            EntityKind::Producer => self.producers += 1,
            EntityKind::Product => self.products += 1,
            EntityKind::Stage => self.stages += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.producers + self.products + self.stages
    }
}

/// Storage the indexer materializes entities into.
pub trait RelationalStore: Send + Sync {
    fn exists(&self, key: &EntityKey) -> Result<bool, StoreError>;

    /// Insert a new entity. Duplicate keys and dangling references are
    /// [`StoreError::ConstraintViolation`]s.
    fn insert(&self, entity: &Entity) -> Result<(), StoreError>;

    /// Set the market price of a product; `false` if no such product.
    fn update_price(&self, product_id: &str, price: f64) -> Result<bool, StoreError>;

    fn product_ids(&self) -> Result<Vec<String>, StoreError>;

    fn counts(&self) -> Result<EntityCounts, StoreError>;
}

/// `SQLite`-backed [`RelationalStore`]. Each call commits on its own.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current market price of a product, if materialized and priced.
    pub fn market_price(&self, product_id: &str) -> Result<Option<f64>, StoreError> {
        let price = self
            .conn()
            .query_row(
                "SELECT market_price FROM product WHERE id = ?1",
                params![product_id],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?;
        Ok(price.flatten())
    }
}

impl RelationalStore for SqliteStore {
    fn exists(&self, key: &EntityKey) -> Result<bool, StoreError> {
        let conn = self.conn();
        let found = match key {
            EntityKey::Producer(id) => conn
                .query_row("SELECT 1 FROM producer WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?,
            EntityKey::Product(id) => conn
                .query_row("SELECT 1 FROM product WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?,
            EntityKey::Stage(s) => conn
                .query_row(
                    "SELECT 1 FROM stage
                     WHERE product_id = ?1 AND operation = ?2 AND operator = ?3
                       AND place = ?4 AND date = ?5",
                    params![s.product_id, s.operation, s.operator, s.place, s.date],
                    |_| Ok(()),
                )
                .optional()?,
        };
        Ok(found.is_some())
    }

    fn insert(&self, entity: &Entity) -> Result<(), StoreError> {
        let conn = self.conn();
        match entity {
            Entity::Producer(p) => {
                let now = OffsetDateTime::now_utc().unix_timestamp();
                conn.execute(
                    "INSERT INTO producer (id, name, region, verified, added_at)
                     VALUES (?1, ?2, ?3, 0, ?4)",
                    params![p.id, p.name, p.region, now],
                )?;
            }
            Entity::Product(p) => {
                conn.execute(
                    "INSERT INTO product
                     (id, name, producer_id, region, harvested_at, organic, market_price)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        p.id,
                        p.name,
                        p.producer_id,
                        p.region,
                        p.harvested_at,
                        p.organic,
                        p.market_price
                    ],
                )?;
            }
            Entity::Stage(s) => {
                conn.execute(
                    "INSERT INTO stage (product_id, date, operation, operator, place)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![s.product_id, s.date, s.operation, s.operator, s.place],
                )?;
            }
        }
        Ok(())
    }

    fn update_price(&self, product_id: &str, price: f64) -> Result<bool, StoreError> {
        let changed = self.conn().execute(
            "UPDATE product SET market_price = ?1 WHERE id = ?2",
            params![price, product_id],
        )?;
        Ok(changed > 0)
    }

    fn product_ids(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id FROM product ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    #[allow(clippy::cast_sign_loss)]
    fn counts(&self) -> Result<EntityCounts, StoreError> {
        let conn = self.conn();
        let count = |table: &str| -> Result<u64, StoreError> {
            let n: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as u64)
        };
        Ok(EntityCounts {
            producers: count("producer")?,
            products: count("product")?,
            stages: count("stage")?,
        })
    }
}

//! Document store for products and menu events, with in-memory and
//! sqlite backends behind one method surface.

use chrono::{DateTime, Utc};
use forno_contracts::{EventPayload, MenuEvent, Pagination, Product};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewProduct {
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub category: String,
    pub stock: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ProductPatch {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub category: Option<String>,
    pub stock: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ProductQuery {
    pub page: u64,
    pub limit: u64,
    pub category: Option<String>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEvent {
    pub title: String,
    pub description: Option<String>,
    pub kind: String,
    pub store_id: String,
    pub data: Option<EventPayload>,
}

#[derive(Debug, Clone, Default)]
pub struct EventPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub kind: Option<String>,
    pub data: Option<EventPayload>,
}

#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub store_id: Option<String>,
    pub kind: Option<String>,
    pub limit: Option<usize>,
}

pub enum StoreBackend {
    Memory(MemoryStore),
    Sqlite(SqliteStore),
}

impl StoreBackend {
    pub fn create_product(&mut self, input: NewProduct) -> Result<Product, StoreError> {
        let now = Utc::now();
        let product = Product {
            id: format!("prod_{}", Uuid::new_v4().as_simple()),
            name: input.name,
            description: input.description,
            price: input.price,
            category: input.category,
            stock: input.stock,
            is_active: input.is_active,
            created_at: now,
            updated_at: now,
        };
        match self {
            StoreBackend::Memory(store) => {
                store.products.push(product.clone());
                Ok(product)
            }
            StoreBackend::Sqlite(store) => {
                store.insert_product(&product)?;
                Ok(product)
            }
        }
    }

    pub fn list_products(
        &self,
        query: &ProductQuery,
    ) -> Result<(Vec<Product>, Pagination), StoreError> {
        let matches = match self {
            StoreBackend::Memory(store) => store.filtered_products(query),
            StoreBackend::Sqlite(store) => store.filtered_products(query)?,
        };

        let total = matches.len() as u64;
        let total_pages = total.div_ceil(query.limit.max(1));
        let offset = usize::try_from(query.page.saturating_sub(1).saturating_mul(query.limit))
            .unwrap_or(usize::MAX);
        let page: Vec<Product> = matches
            .into_iter()
            .skip(offset)
            .take(query.limit as usize)
            .collect();

        Ok((
            page,
            Pagination {
                page: query.page,
                limit: query.limit,
                total,
                total_pages,
            },
        ))
    }

    pub fn get_product(&self, id: &str) -> Result<Product, StoreError> {
        match self {
            StoreBackend::Memory(store) => store
                .products
                .iter()
                .find(|p| p.id == id)
                .cloned()
                .ok_or(StoreError::NotFound("Product")),
            StoreBackend::Sqlite(store) => store
                .get_product(id)?
                .ok_or(StoreError::NotFound("Product")),
        }
    }

    pub fn update_product(&mut self, id: &str, patch: ProductPatch) -> Result<Product, StoreError> {
        let mut product = self.get_product(id)?;
        if let Some(name) = patch.name {
            product.name = name;
        }
        if let Some(description) = patch.description {
            product.description = Some(description);
        }
        if let Some(price) = patch.price {
            product.price = price;
        }
        if let Some(category) = patch.category {
            product.category = category;
        }
        if let Some(stock) = patch.stock {
            product.stock = stock;
        }
        if let Some(is_active) = patch.is_active {
            product.is_active = is_active;
        }
        product.updated_at = Utc::now();
        self.replace_product(&product)?;
        Ok(product)
    }

    /// Soft delete keeps the document retrievable with `isActive=false`.
    pub fn soft_delete_product(&mut self, id: &str) -> Result<(), StoreError> {
        let mut product = self.get_product(id)?;
        product.is_active = false;
        product.updated_at = Utc::now();
        self.replace_product(&product)
    }

    pub fn hard_delete_product(&mut self, id: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let before = store.products.len();
                store.products.retain(|p| p.id != id);
                if store.products.len() == before {
                    return Err(StoreError::NotFound("Product"));
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => {
                if store.delete_product(id)? == 0 {
                    return Err(StoreError::NotFound("Product"));
                }
                Ok(())
            }
        }
    }

    fn replace_product(&mut self, product: &Product) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                if let Some(slot) = store.products.iter_mut().find(|p| p.id == product.id) {
                    *slot = product.clone();
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => store.replace_product(product),
        }
    }

    pub fn create_event(&mut self, input: NewEvent) -> Result<MenuEvent, StoreError> {
        let now = Utc::now();
        let event = MenuEvent {
            id: format!("evt_{}", Uuid::new_v4().as_simple()),
            title: input.title,
            description: input.description,
            kind: input.kind,
            store_id: input.store_id,
            data: input.data,
            created_at: now,
            updated_at: now,
        };
        match self {
            StoreBackend::Memory(store) => {
                store.events.push(event.clone());
                Ok(event)
            }
            StoreBackend::Sqlite(store) => {
                store.insert_event(&event)?;
                Ok(event)
            }
        }
    }

    pub fn list_events(&self, query: &EventQuery) -> Result<Vec<MenuEvent>, StoreError> {
        let mut matches = match self {
            StoreBackend::Memory(store) => store.filtered_events(query),
            StoreBackend::Sqlite(store) => store.filtered_events(query)?,
        };
        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        Ok(matches)
    }

    pub fn get_event(&self, id: &str) -> Result<MenuEvent, StoreError> {
        match self {
            StoreBackend::Memory(store) => store
                .events
                .iter()
                .find(|e| e.id == id)
                .cloned()
                .ok_or(StoreError::NotFound("Event")),
            StoreBackend::Sqlite(store) => {
                store.get_event(id)?.ok_or(StoreError::NotFound("Event"))
            }
        }
    }

    pub fn update_event(&mut self, id: &str, patch: EventPatch) -> Result<MenuEvent, StoreError> {
        let mut event = self.get_event(id)?;
        if let Some(title) = patch.title {
            event.title = title;
        }
        if let Some(description) = patch.description {
            event.description = Some(description);
        }
        if let Some(kind) = patch.kind {
            event.kind = kind;
        }
        if let Some(data) = patch.data {
            event.data = Some(data);
        }
        event.updated_at = Utc::now();
        match self {
            StoreBackend::Memory(store) => {
                if let Some(slot) = store.events.iter_mut().find(|e| e.id == id) {
                    *slot = event.clone();
                }
                Ok(event)
            }
            StoreBackend::Sqlite(store) => {
                store.replace_event(&event)?;
                Ok(event)
            }
        }
    }

    pub fn delete_event(&mut self, id: &str) -> Result<(), StoreError> {
        match self {
            StoreBackend::Memory(store) => {
                let before = store.events.len();
                store.events.retain(|e| e.id != id);
                if store.events.len() == before {
                    return Err(StoreError::NotFound("Event"));
                }
                Ok(())
            }
            StoreBackend::Sqlite(store) => {
                if store.delete_event(id)? == 0 {
                    return Err(StoreError::NotFound("Event"));
                }
                Ok(())
            }
        }
    }
}

/// Records kept in insertion order; listings reverse it so equal
/// timestamps still come out newest-first.
#[derive(Default)]
pub struct MemoryStore {
    products: Vec<Product>,
    events: Vec<MenuEvent>,
}

impl MemoryStore {
    fn filtered_products(&self, query: &ProductQuery) -> Vec<Product> {
        let mut matches: Vec<Product> = self
            .products
            .iter()
            .rev()
            .filter(|p| {
                query
                    .category
                    .as_ref()
                    .map(|c| &p.category == c)
                    .unwrap_or(true)
                    && query.is_active.map(|a| p.is_active == a).unwrap_or(true)
                    && query
                        .search
                        .as_ref()
                        .map(|s| p.name.starts_with(s.as_str()))
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        if query.search.is_some() {
            matches.sort_by(|a, b| a.name.cmp(&b.name));
        } else {
            matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        }
        matches
    }

    fn filtered_events(&self, query: &EventQuery) -> Vec<MenuEvent> {
        let mut matches: Vec<MenuEvent> = self
            .events
            .iter()
            .rev()
            .filter(|e| {
                query
                    .store_id
                    .as_ref()
                    .map(|s| &e.store_id == s)
                    .unwrap_or(true)
                    && query.kind.as_ref().map(|k| &e.kind == k).unwrap_or(true)
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS products (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT,
                price REAL NOT NULL,
                category TEXT NOT NULL,
                stock INTEGER NOT NULL,
                is_active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS menu_events (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT,
                kind TEXT NOT NULL,
                store_id TEXT NOT NULL,
                data_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(Self { conn })
    }

    fn insert_product(&mut self, product: &Product) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO products
            (id, name, description, price, category, stock, is_active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                product.id,
                product.name,
                product.description,
                product.price,
                product.category,
                product.stock,
                product.is_active as i64,
                product.created_at.to_rfc3339(),
                product.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn replace_product(&mut self, product: &Product) -> Result<(), StoreError> {
        self.conn.execute(
            "
            UPDATE products SET
                name = ?2, description = ?3, price = ?4, category = ?5,
                stock = ?6, is_active = ?7, updated_at = ?8
            WHERE id = ?1
            ",
            params![
                product.id,
                product.name,
                product.description,
                product.price,
                product.category,
                product.stock,
                product.is_active as i64,
                product.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_product(&self, id: &str) -> Result<Option<Product>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name, description, price, category, stock, is_active,
                        created_at, updated_at
                 FROM products WHERE id = ?1",
                params![id],
                product_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    fn delete_product(&mut self, id: &str) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM products WHERE id = ?1", params![id])?)
    }

    fn filtered_products(&self, query: &ProductQuery) -> Result<Vec<Product>, StoreError> {
        let mut sql = String::from(
            "SELECT id, name, description, price, category, stock, is_active,
                    created_at, updated_at
             FROM products WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(category) = &query.category {
            sql.push_str(&format!(" AND category = ?{}", args.len() + 1));
            args.push(Box::new(category.clone()));
        }
        if let Some(is_active) = query.is_active {
            sql.push_str(&format!(" AND is_active = ?{}", args.len() + 1));
            args.push(Box::new(is_active as i64));
        }
        if let Some(search) = &query.search {
            sql.push_str(&format!(" AND name LIKE ?{}", args.len() + 1));
            args.push(Box::new(format!("{search}%")));
            sql.push_str(" ORDER BY name ASC");
        } else {
            sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), product_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn insert_event(&mut self, event: &MenuEvent) -> Result<(), StoreError> {
        self.conn.execute(
            "
            INSERT INTO menu_events
            (id, title, description, kind, store_id, data_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ",
            params![
                event.id,
                event.title,
                event.description,
                event.kind,
                event.store_id,
                encode_payload(&event.data)?,
                event.created_at.to_rfc3339(),
                event.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn replace_event(&mut self, event: &MenuEvent) -> Result<(), StoreError> {
        self.conn.execute(
            "
            UPDATE menu_events SET
                title = ?2, description = ?3, kind = ?4, data_json = ?5, updated_at = ?6
            WHERE id = ?1
            ",
            params![
                event.id,
                event.title,
                event.description,
                event.kind,
                encode_payload(&event.data)?,
                event.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_event(&self, id: &str) -> Result<Option<MenuEvent>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, title, description, kind, store_id, data_json,
                        created_at, updated_at
                 FROM menu_events WHERE id = ?1",
                params![id],
                event_from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    fn delete_event(&mut self, id: &str) -> Result<usize, StoreError> {
        Ok(self
            .conn
            .execute("DELETE FROM menu_events WHERE id = ?1", params![id])?)
    }

    fn filtered_events(&self, query: &EventQuery) -> Result<Vec<MenuEvent>, StoreError> {
        let mut sql = String::from(
            "SELECT id, title, description, kind, store_id, data_json,
                    created_at, updated_at
             FROM menu_events WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        if let Some(store_id) = &query.store_id {
            sql.push_str(&format!(" AND store_id = ?{}", args.len() + 1));
            args.push(Box::new(store_id.clone()));
        }
        if let Some(kind) = &query.kind {
            sql.push_str(&format!(" AND kind = ?{}", args.len() + 1));
            args.push(Box::new(kind.clone()));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");

        let mut stmt = self.conn.prepare(&sql)?;
        let arg_refs: Vec<&dyn rusqlite::types::ToSql> = args.iter().map(|v| v.as_ref()).collect();
        let rows = stmt.query_map(arg_refs.as_slice(), event_from_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }
}

fn product_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        price: row.get(3)?,
        category: row.get(4)?,
        stock: row.get(5)?,
        is_active: row.get::<_, i64>(6)? != 0,
        created_at: parse_ts(row, 7)?,
        updated_at: parse_ts(row, 8)?,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MenuEvent> {
    let data_json: Option<String> = row.get(5)?;
    let data = match data_json {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                5,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?),
        None => None,
    };
    Ok(MenuEvent {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        kind: row.get(3)?,
        store_id: row.get(4)?,
        data,
        created_at: parse_ts(row, 6)?,
        updated_at: parse_ts(row, 7)?,
    })
}

fn parse_ts(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    chrono::DateTime::parse_from_rfc3339(&text)
        .map(|v| v.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn encode_payload(data: &Option<EventPayload>) -> Result<Option<String>, StoreError> {
    data.as_ref()
        .map(|v| serde_json::to_string(v).map_err(|e| StoreError::Backend(e.to_string())))
        .transpose()
}

//! Where committed rows go.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::NaiveDateTime;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, params};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::entities::{Bus, Entity, Fare, Line, NewsMessage, Route, RouteId, RouteStop, Stop};
use super::rows::{Change, Row, RowKey};
use super::tables::Tables;
use crate::error::StoreError;

/// Durable backing for an [`super::EntityStore`]. `save` receives the rows
/// one commit changed and must either persist all of them or fail.
pub trait Persistence: Send + Sync {
    fn load(&self) -> Result<Tables, StoreError>;
    fn save(&self, changes: &[Change]) -> Result<(), StoreError>;
}

/// Keeps nothing; the store starts empty and forgets on exit.
pub struct MemoryPersistence;

impl Persistence for MemoryPersistence {
    fn load(&self) -> Result<Tables, StoreError> {
        Ok(Tables::default())
    }

    fn save(&self, _changes: &[Change]) -> Result<(), StoreError> {
        Ok(())
    }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stops (
    id INTEGER PRIMARY KEY,
    name TEXT,
    lat REAL,
    long REAL,
    connections TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS lines (
    id INTEGER PRIMARY KEY,
    name TEXT,
    origin INTEGER,
    destination INTEGER,
    color TEXT,
    routes TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS routes (
    id INTEGER PRIMARY KEY,
    origin INTEGER,
    destination INTEGER,
    line INTEGER
);
CREATE TABLE IF NOT EXISTS route_stops (
    route_id INTEGER NOT NULL,
    stop_id INTEGER NOT NULL,
    position INTEGER NOT NULL,
    PRIMARY KEY (route_id, stop_id)
);
CREATE TABLE IF NOT EXISTS buses (
    id INTEGER PRIMARY KEY,
    line INTEGER,
    route INTEGER
);
CREATE TABLE IF NOT EXISTS news (
    id INTEGER PRIMARY KEY,
    date TEXT NOT NULL,
    version TEXT NOT NULL,
    title TEXT NOT NULL,
    text TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS fares (
    name TEXT PRIMARY KEY,
    price TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sync_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    body TEXT NOT NULL
);
";

const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// One SQLite database per store, one table per entity. Each commit becomes
/// one SQLite transaction touching only the changed rows.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        debug!(path = %path.display(), "Opening store database");
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl Persistence for SqlitePersistence {
    fn load(&self) -> Result<Tables, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut tables = Tables::default();

        load_table(&conn, &mut tables, "SELECT id, name, lat, long, connections FROM stops", |r| {
            Ok(Stop {
                id: r.get(0)?,
                name: r.get(1)?,
                lat: r.get(2)?,
                long: r.get(3)?,
                connections: json_column(r, 4)?,
            })
        })?;
        load_table(
            &conn,
            &mut tables,
            "SELECT id, name, origin, destination, color, routes FROM lines",
            |r| {
                Ok(Line {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    origin: r.get(2)?,
                    destination: r.get(3)?,
                    color: r.get(4)?,
                    routes: json_column(r, 5)?,
                })
            },
        )?;
        load_table(&conn, &mut tables, "SELECT id, origin, destination, line FROM routes", |r| {
            Ok(Route {
                id: route_column(r, 0)?,
                origin: r.get(1)?,
                destination: r.get(2)?,
                line: r.get(3)?,
            })
        })?;
        load_table(&conn, &mut tables, "SELECT route_id, stop_id, position FROM route_stops", |r| {
            Ok(RouteStop {
                route_id: route_column(r, 0)?,
                stop_id: r.get(1)?,
                position: r.get(2)?,
            })
        })?;
        load_table(&conn, &mut tables, "SELECT id, line, route FROM buses", |r| {
            Ok(Bus {
                id: r.get(0)?,
                line: r.get(1)?,
                route: r.get::<_, Option<i64>>(2)?.map(|id| id as RouteId),
            })
        })?;
        load_table(&conn, &mut tables, "SELECT id, date, version, title, text FROM news", |r| {
            let date: String = r.get(1)?;
            Ok(NewsMessage {
                id: r.get(0)?,
                date: NaiveDateTime::parse_from_str(&date, DATE_FORMAT)
                    .map_err(|e| conversion_error(1, e))?,
                version: r.get(2)?,
                title: r.get(3)?,
                text: r.get(4)?,
            })
        })?;
        load_table(&conn, &mut tables, "SELECT name, price FROM fares", |r| {
            let price: String = r.get(1)?;
            Ok(Fare {
                name: r.get(0)?,
                price: FromStr::from_str(&price).map_err(|e| conversion_error(1, e))?,
            })
        })?;

        if let Some(meta) = conn
            .query_row("SELECT body FROM sync_meta WHERE id = 1", [], |r| json_column(r, 0))
            .optional()?
        {
            tables.put(Row::Meta(meta));
        }

        debug!(
            stops = tables.len::<Stop>(),
            lines = tables.len::<Line>(),
            routes = tables.len::<Route>(),
            buses = tables.len::<Bus>(),
            "Loaded store"
        );
        Ok(tables)
    }

    fn save(&self, changes: &[Change]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        for change in changes {
            match change {
                Change::Upsert(row) => upsert(&tx, row)?,
                Change::Delete(key) => delete(&tx, key)?,
            }
        }
        tx.commit()?;
        Ok(())
    }
}

fn load_table<E: Entity>(
    conn: &Connection,
    tables: &mut Tables,
    sql: &str,
    read: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<E>,
) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(sql)?;
    for entity in stmt.query_map([], read)? {
        let entity = entity?;
        E::table_mut(tables).insert(entity.key(), entity);
    }
    Ok(())
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn route_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<RouteId> {
    Ok(row.get::<_, i64>(idx)? as RouteId)
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn upsert(conn: &Connection, row: &Row) -> Result<(), StoreError> {
    match row {
        Row::Stop(stop) => {
            conn.prepare_cached(
                "INSERT INTO stops (id, name, lat, long, connections) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET name = excluded.name, lat = excluded.lat,
                 long = excluded.long, connections = excluded.connections",
            )?
            .execute(params![
                stop.id,
                stop.name,
                stop.lat,
                stop.long,
                serde_json::to_string(&stop.connections)?
            ])?;
        }
        Row::Line(line) => {
            conn.prepare_cached(
                "INSERT INTO lines (id, name, origin, destination, color, routes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (id) DO UPDATE SET name = excluded.name, origin = excluded.origin,
                 destination = excluded.destination, color = excluded.color, routes = excluded.routes",
            )?
            .execute(params![
                line.id,
                line.name,
                line.origin,
                line.destination,
                line.color,
                serde_json::to_string(&line.routes)?
            ])?;
        }
        Row::Route(route) => {
            conn.prepare_cached(
                "INSERT INTO routes (id, origin, destination, line) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (id) DO UPDATE SET origin = excluded.origin,
                 destination = excluded.destination, line = excluded.line",
            )?
            .execute(params![route.id as i64, route.origin, route.destination, route.line])?;
        }
        Row::RouteStop(rs) => {
            conn.prepare_cached(
                "INSERT INTO route_stops (route_id, stop_id, position) VALUES (?1, ?2, ?3)
                 ON CONFLICT (route_id, stop_id) DO UPDATE SET position = excluded.position",
            )?
            .execute(params![rs.route_id as i64, rs.stop_id, rs.position])?;
        }
        Row::Bus(bus) => {
            conn.prepare_cached(
                "INSERT INTO buses (id, line, route) VALUES (?1, ?2, ?3)
                 ON CONFLICT (id) DO UPDATE SET line = excluded.line, route = excluded.route",
            )?
            .execute(params![bus.id, bus.line, bus.route.map(|id| id as i64)])?;
        }
        Row::NewsMessage(news) => {
            conn.prepare_cached(
                "INSERT INTO news (id, date, version, title, text) VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (id) DO UPDATE SET date = excluded.date, version = excluded.version,
                 title = excluded.title, text = excluded.text",
            )?
            .execute(params![
                news.id,
                news.date.format(DATE_FORMAT).to_string(),
                news.version,
                news.title,
                news.text
            ])?;
        }
        Row::Fare(fare) => {
            conn.prepare_cached(
                "INSERT INTO fares (name, price) VALUES (?1, ?2)
                 ON CONFLICT (name) DO UPDATE SET price = excluded.price",
            )?
            .execute(params![fare.name, fare.price.to_string()])?;
        }
        Row::Meta(meta) => {
            conn.prepare_cached(
                "INSERT INTO sync_meta (id, body) VALUES (1, ?1)
                 ON CONFLICT (id) DO UPDATE SET body = excluded.body",
            )?
            .execute(params![serde_json::to_string(meta)?])?;
        }
    }
    Ok(())
}

fn delete(conn: &Connection, key: &RowKey) -> Result<(), StoreError> {
    match key {
        RowKey::Stop(id) => conn.execute("DELETE FROM stops WHERE id = ?1", params![id])?,
        RowKey::Line(id) => conn.execute("DELETE FROM lines WHERE id = ?1", params![id])?,
        RowKey::Route(id) => conn.execute("DELETE FROM routes WHERE id = ?1", params![*id as i64])?,
        RowKey::RouteStop(route, stop) => conn.execute(
            "DELETE FROM route_stops WHERE route_id = ?1 AND stop_id = ?2",
            params![*route as i64, stop],
        )?,
        RowKey::Bus(id) => conn.execute("DELETE FROM buses WHERE id = ?1", params![id])?,
        RowKey::NewsMessage(id) => conn.execute("DELETE FROM news WHERE id = ?1", params![id])?,
        RowKey::Fare(name) => conn.execute("DELETE FROM fares WHERE name = ?1", params![name])?,
        RowKey::Meta => conn.execute("DELETE FROM sync_meta", [])?,
    };
    Ok(())
}

//! Durable entities and their natural keys.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Tables;
use super::rows::RowKey;

pub type StopId = u32;
pub type LineId = u32;
pub type BusId = u32;
pub type NewsId = u32;
pub type RouteId = u64;
/// Direction of travel within a line. Usually 0 (outbound) or 1 (return), but
/// any small non-negative value is accepted.
pub type DirectionCode = u32;

const ROUTE_ID_FACTOR: u64 = 10_000;

/// Globally unique route id: `line * 10000 + direction`.
///
/// `None` when the direction does not fit in the low four digits, since the id
/// would then collide with another line's routes.
pub fn route_id(line: LineId, direction: DirectionCode) -> Option<RouteId> {
    let direction = u64::from(direction);
    (direction < ROUTE_ID_FACTOR).then(|| u64::from(line) * ROUTE_ID_FACTOR + direction)
}

/// A table row addressable by its natural key.
pub trait Entity: Clone + 'static {
    const NAME: &'static str;
    type Key: Ord + Clone + Debug + 'static;

    fn key(&self) -> Self::Key;
    fn row_key(key: &Self::Key) -> RowKey;
    fn table(tables: &Tables) -> &BTreeMap<Self::Key, Self>;
    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<Self::Key, Self>;
}

/// Entities that can be created from their key alone, with every other
/// attribute unset until a payload fills it in.
pub trait FromKey: Entity {
    fn from_key(key: Self::Key) -> Self;
}

macro_rules! entity {
    ($ty:ty, $key:ty, $table:ident, $name:literal, |$e:ident| $key_expr:expr, |$k:ident| $row_key:expr) => {
        impl Entity for $ty {
            const NAME: &'static str = $name;
            type Key = $key;

            fn key(&self) -> $key {
                let $e = self;
                $key_expr
            }

            fn row_key($k: &$key) -> RowKey {
                $row_key
            }

            fn table(tables: &Tables) -> &BTreeMap<$key, Self> {
                &tables.$table
            }

            fn table_mut(tables: &mut Tables) -> &mut BTreeMap<$key, Self> {
                &mut tables.$table
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stop {
    pub id: StopId,
    pub name: Option<String>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
    /// Lines serving this stop, exactly as last synced.
    pub connections: BTreeSet<LineId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Line {
    pub id: LineId,
    pub name: Option<String>,
    pub origin: Option<StopId>,
    pub destination: Option<StopId>,
    pub color: Option<String>,
    pub routes: BTreeSet<RouteId>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: RouteId,
    pub origin: Option<StopId>,
    pub destination: Option<StopId>,
    pub line: Option<LineId>,
}

impl Route {
    /// The direction code encoded in the low digits of the id.
    pub fn line_route_id(&self) -> DirectionCode {
        (self.id % ROUTE_ID_FACTOR) as DirectionCode
    }
}

/// Membership of a stop in a route. Positions within a route run 0..n.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteStop {
    pub route_id: RouteId,
    pub stop_id: StopId,
    pub position: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bus {
    pub id: BusId,
    pub line: Option<LineId>,
    pub route: Option<RouteId>,
}

/// Result of [`Bus::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineChange {
    Unchanged,
    /// First line ever recorded for the bus.
    Assigned,
    /// The bus moved between lines; its old route no longer applies.
    Moved {
        from: LineId,
        dropped_route: Option<RouteId>,
    },
}

impl Bus {
    /// Records that the bus was seen running `line`, optionally on `route`.
    ///
    /// A line different from the stored one clears the stored route before the
    /// new line is set, so the bus never keeps a route of its previous line.
    pub fn observe(&mut self, line: LineId, route: Option<RouteId>) -> LineChange {
        let change = match self.line {
            Some(current) if current == line => LineChange::Unchanged,
            Some(from) => LineChange::Moved {
                from,
                dropped_route: self.route.take(),
            },
            None => {
                self.route = None;
                LineChange::Assigned
            }
        };
        self.line = Some(line);
        if route.is_some() {
            self.route = route;
        }
        change
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsMessage {
    pub id: NewsId,
    pub date: NaiveDateTime,
    pub version: String,
    pub title: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fare {
    pub name: String,
    /// Euros, identical on every line.
    pub price: Decimal,
}

entity!(Stop, StopId, stops, "stop", |e| e.id, |k| RowKey::Stop(*k));
entity!(Line, LineId, lines, "line", |e| e.id, |k| RowKey::Line(*k));
entity!(Route, RouteId, routes, "route", |e| e.id, |k| RowKey::Route(*k));
entity!(
    RouteStop,
    (RouteId, StopId),
    route_stops,
    "route stop",
    |e| (e.route_id, e.stop_id),
    |k| RowKey::RouteStop(k.0, k.1)
);
entity!(Bus, BusId, buses, "bus", |e| e.id, |k| RowKey::Bus(*k));
entity!(NewsMessage, NewsId, news, "news message", |e| e.id, |k| RowKey::NewsMessage(*k));
entity!(Fare, String, fares, "fare", |e| e.name.clone(), |k| RowKey::Fare(k.clone()));

impl FromKey for Stop {
    fn from_key(id: StopId) -> Self {
        Self { id, ..Default::default() }
    }
}

impl FromKey for Line {
    fn from_key(id: LineId) -> Self {
        Self { id, ..Default::default() }
    }
}

impl FromKey for Route {
    fn from_key(id: RouteId) -> Self {
        Self { id, ..Default::default() }
    }
}

impl FromKey for Bus {
    fn from_key(id: BusId) -> Self {
        Self { id, ..Default::default() }
    }
}

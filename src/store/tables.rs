use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::entities::{
    Bus, BusId, Entity, Fare, Line, LineId, NewsId, NewsMessage, Route, RouteId, RouteStop, Stop,
    StopId,
};
use super::rows::{Row, RowKey};
use crate::sync::Watermark;

/// Bookkeeping carried between static syncs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub watermark: Option<Watermark>,
    /// Pricing notes (transfers, child fares) from the last topology update.
    pub fare_observations: Vec<String>,
}

/// All entity tables, as committed plus whatever the open transaction has
/// written so far.
#[derive(Debug, Default)]
pub struct Tables {
    pub(crate) stops: BTreeMap<StopId, Stop>,
    pub(crate) lines: BTreeMap<LineId, Line>,
    pub(crate) routes: BTreeMap<RouteId, Route>,
    pub(crate) route_stops: BTreeMap<(RouteId, StopId), RouteStop>,
    pub(crate) buses: BTreeMap<BusId, Bus>,
    pub(crate) news: BTreeMap<NewsId, NewsMessage>,
    pub(crate) fares: BTreeMap<String, Fare>,
    pub(crate) meta: SyncMeta,
}

impl Tables {
    pub fn get<E: Entity>(&self, key: &E::Key) -> Option<&E> {
        E::table(self).get(key)
    }

    /// Every entity of one type in key order.
    pub fn all<'a, E: Entity>(&'a self) -> impl Iterator<Item = &'a E> + 'a {
        E::table(self).values()
    }

    pub fn len<E: Entity>(&self) -> usize {
        E::table(self).len()
    }

    pub fn line_ids(&self) -> Vec<LineId> {
        self.lines.keys().copied().collect()
    }

    /// The stops of `route` ordered by position.
    pub fn route_sequence(&self, route: RouteId) -> Vec<&RouteStop> {
        let mut sequence: Vec<&RouteStop> = self
            .route_stops
            .range((route, StopId::MIN)..=(route, StopId::MAX))
            .map(|(_, rs)| rs)
            .collect();
        sequence.sort_by_key(|rs| rs.position);
        sequence
    }

    /// Routes passing through `stop`.
    pub fn stop_routes(&self, stop: StopId) -> Vec<&RouteStop> {
        self.route_stops
            .values()
            .filter(|rs| rs.stop_id == stop)
            .collect()
    }

    /// Stops reachable through any route of `line`.
    pub fn line_stops(&self, line: LineId) -> BTreeSet<StopId> {
        let Some(line) = self.lines.get(&line) else {
            return BTreeSet::new();
        };
        line.routes
            .iter()
            .flat_map(|route| self.route_sequence(*route))
            .map(|rs| rs.stop_id)
            .collect()
    }

    /// First stop (by id) carrying exactly this name.
    pub fn stop_by_name(&self, name: &str) -> Option<&Stop> {
        self.stops
            .values()
            .find(|stop| stop.name.as_deref() == Some(name))
    }

    pub fn meta(&self) -> &SyncMeta {
        &self.meta
    }

    /// Current content of one row, `None` when absent.
    pub(crate) fn row(&self, key: &RowKey) -> Option<Row> {
        match key {
            RowKey::Stop(id) => self.stops.get(id).cloned().map(Row::Stop),
            RowKey::Line(id) => self.lines.get(id).cloned().map(Row::Line),
            RowKey::Route(id) => self.routes.get(id).cloned().map(Row::Route),
            RowKey::RouteStop(route, stop) => self
                .route_stops
                .get(&(*route, *stop))
                .cloned()
                .map(Row::RouteStop),
            RowKey::Bus(id) => self.buses.get(id).cloned().map(Row::Bus),
            RowKey::NewsMessage(id) => self.news.get(id).cloned().map(Row::NewsMessage),
            RowKey::Fare(name) => self.fares.get(name).cloned().map(Row::Fare),
            RowKey::Meta => Some(Row::Meta(self.meta.clone())),
        }
    }

    /// Puts a row back to `row`, removing it when `None`.
    pub(crate) fn restore(&mut self, key: RowKey, row: Option<Row>) {
        match row {
            Some(row) => self.put(row),
            None => self.remove(&key),
        }
    }

    pub(crate) fn put(&mut self, row: Row) {
        match row {
            Row::Stop(e) => put(&mut self.stops, e),
            Row::Line(e) => put(&mut self.lines, e),
            Row::Route(e) => put(&mut self.routes, e),
            Row::RouteStop(e) => put(&mut self.route_stops, e),
            Row::Bus(e) => put(&mut self.buses, e),
            Row::NewsMessage(e) => put(&mut self.news, e),
            Row::Fare(e) => put(&mut self.fares, e),
            Row::Meta(meta) => self.meta = meta,
        }
    }

    fn remove(&mut self, key: &RowKey) {
        match key {
            RowKey::Stop(id) => {
                self.stops.remove(id);
            }
            RowKey::Line(id) => {
                self.lines.remove(id);
            }
            RowKey::Route(id) => {
                self.routes.remove(id);
            }
            RowKey::RouteStop(route, stop) => {
                self.route_stops.remove(&(*route, *stop));
            }
            RowKey::Bus(id) => {
                self.buses.remove(id);
            }
            RowKey::NewsMessage(id) => {
                self.news.remove(id);
            }
            RowKey::Fare(name) => {
                self.fares.remove(name);
            }
            RowKey::Meta => self.meta = SyncMeta::default(),
        }
    }
}

fn put<E: Entity>(table: &mut BTreeMap<E::Key, E>, entity: E) {
    table.insert(entity.key(), entity);
}

//! Turns live responses into snapshots while resolving every referenced id
//! against the store, so two responses naming the same bus, line, or stop
//! land on the same entity.
//!
//! The mapper only creates and updates. Stale associations (a bus's route
//! after it changed line) are cleared; entities are never removed.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::{Error, Result};
use crate::snapshot::{BusSnapshot, BusState, LineBuses, RouteBuses, StopBuses};
use crate::store::{
    Bus, BusId, DirectionCode, Line, LineChange, LineId, Route, RouteId, Stop, Transaction,
    route_id,
};
use crate::upstream::FunctionCode;
use crate::upstream::payload::{LinePayload, StopPayload};

/// Maps a per-stop response to line id → approaching buses, in response order.
pub fn apply_stop_payload(
    tx: &mut Transaction<'_>,
    payload: &StopPayload,
) -> BTreeMap<LineId, Vec<BusSnapshot>> {
    let mut lines: BTreeMap<LineId, Vec<BusSnapshot>> = BTreeMap::new();

    for entry in &payload.buses.lines {
        tx.get_or_create::<Line>(entry.line);
        let buses = lines.entry(entry.line).or_default();

        for raw in &entry.buses {
            tx.get_or_create::<Stop>(raw.last_stop);
            let bus = observe_bus(tx, raw.bus, entry.line, None);

            let mut snapshot = BusSnapshot::of(&bus, BusState::from(raw.state));
            snapshot.time = Some(raw.time);
            snapshot.distance = Some(raw.distance);
            snapshot.last_stop = Some(raw.last_stop);
            buses.push(snapshot);
        }
    }

    lines
}

/// Maps a per-line response to direction → route with its stops in order,
/// each stop's buses split into those standing at it and those moving.
/// `observed` keeps every snapshot in response order.
pub fn apply_line_payload(
    tx: &mut Transaction<'_>,
    line_id: LineId,
    payload: &LinePayload,
) -> Result<LineBuses> {
    tx.get_or_create::<Line>(line_id);
    let mut line = LineBuses::default();

    for entry in &payload.directions {
        let route = attach_route(tx, line_id, entry.direction)?;
        let mut stops = Vec::with_capacity(entry.stops.len());

        for stop_entry in &entry.stops {
            tx.get_or_create::<Stop>(stop_entry.stop);
            let mut group = StopBuses {
                stop: stop_entry.stop,
                ..Default::default()
            };

            for raw in &stop_entry.buses {
                let bus = observe_bus(tx, raw.bus, line_id, Some(route.id));
                let mut snapshot = BusSnapshot::of(&bus, BusState::from(raw.state));
                snapshot.route_progress = Some(raw.route_progress);
                snapshot.last_stop = Some(stop_entry.stop);
                line.observed.push(snapshot.clone());

                if snapshot.at_stop() {
                    group.at_stop.push(snapshot);
                } else {
                    group.moving.push(snapshot);
                }
            }
            stops.push(group);
        }

        line.directions
            .entry(entry.direction)
            .or_insert_with(|| RouteBuses {
                direction: entry.direction,
                route,
                stops: Vec::new(),
            })
            .stops
            .extend(stops);
    }

    Ok(line)
}

/// Resolves the route for one direction of `line_id` and ties it to the line.
fn attach_route(
    tx: &mut Transaction<'_>,
    line_id: LineId,
    direction: DirectionCode,
) -> Result<Route> {
    let id: RouteId = route_id(line_id, direction).ok_or_else(|| {
        Error::malformed(
            FunctionCode::LineBuses,
            format!("direction {direction} of line {line_id} does not fit a route id"),
        )
    })?;

    let (route, _) = tx.get_or_create::<Route>(id);
    route.line = Some(line_id);
    let route = route.clone();

    tx.require_mut::<Line>(&line_id)?.routes.insert(id);
    Ok(route)
}

fn observe_bus(
    tx: &mut Transaction<'_>,
    bus_id: BusId,
    line: LineId,
    route: Option<RouteId>,
) -> Bus {
    let (bus, _) = tx.get_or_create::<Bus>(bus_id);
    if let LineChange::Moved { from, dropped_route } = bus.observe(line, route) {
        debug!(bus = bus_id, from, to = line, ?dropped_route, "Bus changed line");
    }
    bus.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Eta;
    use crate::store::EntityStore;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn line_payload() -> LinePayload {
        serde_json::from_value(json!({
            "paradas": [
                {"sentido": 0, "paradas": [
                    {"parada": 1, "buses": [{"bus": 100, "distancia": 0.1, "estado": 0}]},
                    {"parada": 2, "buses": [{"bus": 101, "distancia": 0.4, "estado": 1}]}
                ]},
                {"sentido": 1, "paradas": [
                    {"parada": 3, "buses": [{"bus": 102, "distancia": 0.9, "estado": 17}]}
                ]}
            ]
        }))
        .unwrap()
    }

    fn stop_payload(line: u32, bus: u32) -> StopPayload {
        serde_json::from_value(json!({
            "buses": {"lineas": [{"linea": line, "buses": [
                {"bus": bus, "tiempo": "<1", "distancia": 120, "estado": 1, "ult_parada": 7}
            ]}]}
        }))
        .unwrap()
    }

    #[test]
    fn test_line_payload_partitions_by_state() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        let line = apply_line_payload(&mut tx, 42, &line_payload()).unwrap();

        let outbound = &line.directions[&0];
        assert_eq!(outbound.route.id, 420000);
        assert_eq!(outbound.stops[0].stop, 1);
        assert_eq!(outbound.stops[0].at_stop[0].id, 100);
        assert!(outbound.stops[0].moving.is_empty());
        assert_eq!(outbound.stops[1].moving[0].id, 101);
        assert!(outbound.stops[1].at_stop.is_empty());

        let inbound = &line.directions[&1];
        assert_eq!(inbound.route.id, 420001);
        assert_eq!(inbound.stops[0].moving[0].state, BusState::Incorporating);

        let observed: Vec<BusId> = line.observed.iter().map(|b| b.id).collect();
        assert_eq!(observed, vec![100, 101, 102]);
    }

    #[test]
    fn test_observed_follows_response_order() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        let payload: LinePayload = serde_json::from_value(json!({
            "paradas": [
                {"sentido": 1, "paradas": [
                    {"parada": 3, "buses": [{"bus": 5, "distancia": 0.2, "estado": 0}]}
                ]},
                {"sentido": 0, "paradas": [
                    {"parada": 1, "buses": [{"bus": 5, "distancia": 0.7, "estado": 1}]}
                ]}
            ]
        }))
        .unwrap();

        let line = apply_line_payload(&mut tx, 42, &payload).unwrap();
        let first = &line.observed[0];
        assert_eq!(first.route, Some(420001));
        assert_eq!(first.state, BusState::AtStop);
        assert_eq!(line.observed[1].route, Some(420000));
    }

    #[test]
    fn test_line_payload_links_buses_and_routes() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        apply_line_payload(&mut tx, 42, &line_payload()).unwrap();

        let bus = tx.get::<Bus>(&102).unwrap();
        assert_eq!(bus.line, Some(42));
        assert_eq!(bus.route, Some(420001));
        assert_eq!(tx.get::<Route>(&420001).unwrap().line, Some(42));
        assert_eq!(
            tx.get::<Line>(&42).unwrap().routes,
            BTreeSet::from([420000, 420001])
        );
    }

    #[test]
    fn test_line_payload_is_idempotent() {
        let store = EntityStore::in_memory();
        for _ in 0..2 {
            let mut tx = store.begin().unwrap();
            apply_line_payload(&mut tx, 42, &line_payload()).unwrap();
            tx.commit().unwrap();
        }
        store
            .read(|t| {
                assert_eq!(t.len::<Bus>(), 3);
                assert_eq!(t.len::<Line>(), 1);
                assert_eq!(t.len::<Route>(), 2);
                assert_eq!(t.len::<Stop>(), 3);
            })
            .unwrap();
    }

    #[test]
    fn test_line_payload_rejects_oversized_direction() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        let payload: LinePayload =
            serde_json::from_value(json!({"paradas": [{"sentido": 10000, "paradas": []}]})).unwrap();
        let err = apply_line_payload(&mut tx, 42, &payload).unwrap_err();
        assert!(matches!(err, Error::Malformed { .. }));
    }

    #[test]
    fn test_stop_payload_snapshot_fields() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        let lines = apply_stop_payload(&mut tx, &stop_payload(1800, 3425));

        let snapshot = &lines[&1800][0];
        assert_eq!(snapshot.id, 3425);
        assert_eq!(snapshot.line, Some(1800));
        assert_eq!(snapshot.time, Some(Eta::LessThanOneMinute));
        assert_eq!(snapshot.distance, Some(120));
        assert_eq!(snapshot.last_stop, Some(7));
        assert!(tx.get::<Stop>(&7).is_some());
    }

    #[test]
    fn test_bus_changing_line_loses_route() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        apply_line_payload(&mut tx, 42, &line_payload()).unwrap();
        assert_eq!(tx.get::<Bus>(&100).unwrap().route, Some(420000));

        let lines = apply_stop_payload(&mut tx, &stop_payload(7, 100));
        let bus = tx.get::<Bus>(&100).unwrap();
        assert_eq!(bus.line, Some(7));
        assert_eq!(bus.route, None);
        assert_eq!(lines[&7][0].route, None);
    }

    #[test]
    fn test_same_line_keeps_route() {
        let store = EntityStore::in_memory();
        let mut tx = store.begin().unwrap();
        apply_line_payload(&mut tx, 42, &line_payload()).unwrap();

        apply_stop_payload(&mut tx, &stop_payload(42, 100));
        assert_eq!(tx.get::<Bus>(&100).unwrap().route, Some(420000));
    }
}

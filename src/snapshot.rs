//! Real-time read model. Built fresh from every live response and handed to
//! the caller; nothing here is written back to the entity store.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::store::{Bus, BusId, DirectionCode, LineId, Route, RouteId, StopId};

/// Minutes until a bus reaches the queried stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Eta {
    /// The upstream's `"<1"`.
    LessThanOneMinute,
    Minutes(u32),
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::LessThanOneMinute => f.write_str("<1"),
            Eta::Minutes(m) => write!(f, "{m}"),
        }
    }
}

impl Serialize for Eta {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Eta {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Minutes(u32),
            Text(String),
        }

        match Raw::deserialize(d)? {
            Raw::Minutes(m) => Ok(Eta::Minutes(m)),
            Raw::Text(t) if t.trim() == "<1" => Ok(Eta::LessThanOneMinute),
            Raw::Text(t) => t
                .trim()
                .parse()
                .map(Eta::Minutes)
                .map_err(|_| de::Error::custom(format!("unexpected arrival time '{t}'"))),
        }
    }
}

/// Operational state reported for a bus. Unknown codes are kept verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusState {
    AtStop,
    Moving,
    /// Joining the route, on an extension, or off the normal round trip.
    Incorporating,
    Other(i64),
}

impl BusState {
    pub fn code(self) -> i64 {
        match self {
            BusState::AtStop => 0,
            BusState::Moving => 1,
            BusState::Incorporating => 17,
            BusState::Other(code) => code,
        }
    }
}

impl From<i64> for BusState {
    fn from(code: i64) -> Self {
        match code {
            0 => BusState::AtStop,
            1 => BusState::Moving,
            17 => BusState::Incorporating,
            other => BusState::Other(other),
        }
    }
}

impl Serialize for BusState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(self.code())
    }
}

/// A bus as seen by one live response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BusSnapshot {
    pub id: BusId,
    pub line: Option<LineId>,
    pub route: Option<RouteId>,
    pub time: Option<Eta>,
    /// Meters to the queried stop (per-stop responses only).
    pub distance: Option<u32>,
    /// Completed fraction of the route (per-line responses only).
    pub route_progress: Option<f64>,
    pub state: BusState,
    pub last_stop: Option<StopId>,
    pub lat: Option<f64>,
    pub long: Option<f64>,
}

impl BusSnapshot {
    /// Starts a snapshot from the bus's stored identity.
    pub fn of(bus: &Bus, state: BusState) -> Self {
        Self {
            id: bus.id,
            line: bus.line,
            route: bus.route,
            time: None,
            distance: None,
            route_progress: None,
            state,
            last_stop: None,
            lat: None,
            long: None,
        }
    }

    pub fn at_stop(&self) -> bool {
        self.state == BusState::AtStop
    }
}

/// Buses grouped at one stop of a route.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StopBuses {
    pub stop: StopId,
    pub at_stop: Vec<BusSnapshot>,
    pub moving: Vec<BusSnapshot>,
}

/// One direction of a per-line response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteBuses {
    pub direction: DirectionCode,
    pub route: Route,
    /// In route order.
    pub stops: Vec<StopBuses>,
}

/// A whole per-line response: each direction's stop groups, plus every bus in
/// the order the response listed it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LineBuses {
    pub directions: BTreeMap<DirectionCode, RouteBuses>,
    #[serde(skip)]
    pub observed: Vec<BusSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_eta_parsing() {
        let parse = |v| serde_json::from_value::<Eta>(v).unwrap();
        assert_eq!(parse(json!("<1")), Eta::LessThanOneMinute);
        assert_eq!(parse(json!(4)), Eta::Minutes(4));
        assert_eq!(parse(json!("12")), Eta::Minutes(12));
        assert!(serde_json::from_value::<Eta>(json!("soon")).is_err());
    }

    #[test]
    fn test_eta_display() {
        assert_eq!(Eta::LessThanOneMinute.to_string(), "<1");
        assert_eq!(Eta::Minutes(3).to_string(), "3");
    }

    #[test]
    fn test_unknown_state_is_preserved() {
        let state = BusState::from(23);
        assert_eq!(state, BusState::Other(23));
        assert_eq!(state.code(), 23);
        assert_eq!(BusState::from(17), BusState::Incorporating);
        assert_eq!(serde_json::to_value(BusState::Moving).unwrap(), json!(1));
    }
}

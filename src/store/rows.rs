//! Row-level addressing across every table, used to roll back uncommitted
//! writes and to hand committed ones to the persistence backend.

use super::entities::{
    Bus, BusId, Fare, Line, LineId, NewsId, NewsMessage, Route, RouteId, RouteStop, Stop, StopId,
};
use super::tables::SyncMeta;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RowKey {
    Stop(StopId),
    Line(LineId),
    Route(RouteId),
    RouteStop(RouteId, StopId),
    Bus(BusId),
    NewsMessage(NewsId),
    Fare(String),
    Meta,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Stop(Stop),
    Line(Line),
    Route(Route),
    RouteStop(RouteStop),
    Bus(Bus),
    NewsMessage(NewsMessage),
    Fare(Fare),
    Meta(SyncMeta),
}

/// One row-level effect of a committed transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Upsert(Row),
    Delete(RowKey),
}

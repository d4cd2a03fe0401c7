//! Single live lookups: one request, mapped and committed as one transaction.

use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Result;
use crate::mapper;
use crate::snapshot::{BusSnapshot, LineBuses};
use crate::store::{EntityStore, LineId, Stop, StopId};
use crate::upstream::payload::{LinePayload, StopPayload};
use crate::upstream::{FunctionCode, Transport, query_as};

/// Buses heading to `stop_id`, keyed by the line they run.
#[tracing::instrument(skip(transport, store))]
pub async fn stop_arrivals<T: Transport + ?Sized>(
    transport: &T,
    store: &EntityStore,
    stop_id: StopId,
) -> Result<BTreeMap<LineId, Vec<BusSnapshot>>> {
    let payload: StopPayload =
        query_as(transport, FunctionCode::StopArrivals, &stop_id.to_string()).await?;

    let mut tx = store.begin()?;
    tx.get_or_create::<Stop>(stop_id);
    let lines = mapper::apply_stop_payload(&mut tx, &payload);
    tx.commit()?;

    debug!(lines = lines.len(), "Stop arrivals merged");
    Ok(lines)
}

/// Buses along every direction of `line_id`, keyed by direction code.
#[tracing::instrument(skip(transport, store))]
pub async fn line_buses<T: Transport + ?Sized>(
    transport: &T,
    store: &EntityStore,
    line_id: LineId,
) -> Result<LineBuses> {
    let payload: LinePayload =
        query_as(transport, FunctionCode::LineBuses, &line_id.to_string()).await?;

    let mut tx = store.begin()?;
    let line = mapper::apply_line_payload(&mut tx, line_id, &payload)?;
    tx.commit()?;

    debug!(
        directions = line.directions.len(),
        buses = line.observed.len(),
        "Line buses merged"
    );
    Ok(line)
}

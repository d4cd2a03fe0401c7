//! Static sync: news, stops, lines with their routes, and fares, fetched as
//! a delta since a watermark.
//!
//! The payload is applied in stages (news, stops, one transaction per line,
//! then fares together with the advanced watermark). Each stage commits on
//! its own. A run that dies halfway leaves earlier stages applied, and the
//! next run with the same watermark overwrites them with identical data.

use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Pacing;
use crate::error::{Error, Result};
use crate::poller::pause;
use crate::store::{
    EntityStore, Fare, Line, LineId, NewsId, NewsMessage, Route, RouteId, Stop, StopId, route_id,
};
use crate::upstream::payload::{
    GeneralInfo, GeneralInfoPayload, LineEntry, RouteEntry, TopologyUpdate, itr_date,
};
use crate::upstream::{FunctionCode, Transport, query_as};

/// "Last seen" markers sent with every sync so the upstream only returns what
/// changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    /// When topology (stops, lines, fares) was last fetched.
    pub last_request: NaiveDateTime,
    pub language: String,
    pub last_message_id: NewsId,
    pub last_message_date: NaiveDateTime,
}

impl Default for Watermark {
    fn default() -> Self {
        let start = NaiveDate::from_ymd_opt(2016, 1, 1)
            .unwrap_or_default()
            .and_time(NaiveTime::MIN);
        Self {
            last_request: start,
            language: "en".to_string(),
            last_message_id: 0,
            last_message_date: start,
        }
    }
}

impl Watermark {
    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// The single `dato` string the upstream expects for a general-info query.
    pub fn to_parameter(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            itr_date::format(&self.last_request),
            self.language,
            self.last_message_id,
            itr_date::format(&self.last_message_date)
        )
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// The topology payload's route ids carry the direction in their last two
    /// digits. When set, that direction is re-encoded into the route id used
    /// everywhere else; when unset the payload id is stored verbatim.
    pub fix_route_ids: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self { fix_route_ids: true }
    }
}

/// What one sync saw.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Every message returned, whether or not it was already stored.
    pub news: Vec<NewsMessage>,
    pub news_created: usize,
    /// Upstream's topology timestamp; `None` when nothing changed.
    pub last_update: Option<NaiveDateTime>,
    pub lines: Vec<LineId>,
    pub stops: Vec<StopId>,
    pub fares: Vec<Fare>,
    pub observations: Vec<String>,
}

impl SyncReport {
    pub fn next_watermark(&self, previous: &Watermark) -> Watermark {
        let newest = self.news.iter().max_by_key(|m| (m.date, m.id));
        Watermark {
            last_request: self.last_update.unwrap_or(previous.last_request),
            language: previous.language.clone(),
            last_message_id: self
                .news
                .iter()
                .map(|m| m.id)
                .fold(previous.last_message_id, NewsId::max),
            last_message_date: newest
                .map(|m| m.date.max(previous.last_message_date))
                .unwrap_or(previous.last_message_date),
        }
    }
}

pub struct StaticSync<'a, T: ?Sized> {
    transport: &'a T,
    store: &'a EntityStore,
    options: SyncOptions,
}

impl<'a, T: Transport + ?Sized> StaticSync<'a, T> {
    pub fn new(transport: &'a T, store: &'a EntityStore) -> Self {
        Self {
            transport,
            store,
            options: SyncOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SyncOptions) -> Self {
        self.options = options;
        self
    }

    /// One attempt. Transient upstream errors are returned to the caller.
    #[tracing::instrument(skip(self), fields(watermark = %watermark.to_parameter()))]
    pub async fn run(&self, watermark: &Watermark) -> Result<SyncReport> {
        let payload: GeneralInfoPayload =
            query_as(self.transport, FunctionCode::GeneralInfo, &watermark.to_parameter()).await?;
        let report = apply_general_info(self.store, &payload.info, watermark, &self.options)?;

        info!(
            news = report.news.len(),
            news_created = report.news_created,
            stops = report.stops.len(),
            lines = report.lines.len(),
            fares = report.fares.len(),
            topology_changed = report.last_update.is_some(),
            "Static sync applied"
        );
        Ok(report)
    }

    /// Repeats [`StaticSync::run`] until it gets through, waiting out transient
    /// failures. Returns [`Error::Cancelled`] if `cancel` fires first.
    pub async fn run_with_retry(
        &self,
        watermark: &Watermark,
        pacing: &Pacing,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        loop {
            let attempt = tokio::select! {
                result = self.run(watermark) => result,
                _ = cancel.cancelled() => return Err(Error::Cancelled),
            };

            match attempt {
                Err(e) if e.is_transient() => {
                    let wait = if e.is_rate_limit() { pacing.cooldown } else { pacing.backoff };
                    warn!(error = %e, wait_ms = wait.as_millis() as u64, "Static sync failed, retrying");
                    if !pause(wait, cancel).await {
                        return Err(Error::Cancelled);
                    }
                }
                other => return other,
            }
        }
    }
}

/// Applies a general-info payload to the store.
pub fn apply_general_info(
    store: &EntityStore,
    info: &GeneralInfo,
    watermark: &Watermark,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    let mut tx = store.begin()?;
    for entry in &info.news {
        let message = match tx.get::<NewsMessage>(&entry.id) {
            Some(existing) => existing.clone(),
            None => {
                report.news_created += 1;
                tx.insert(NewsMessage {
                    id: entry.id,
                    date: entry.date,
                    version: entry.version.clone(),
                    title: entry.title.clone(),
                    text: entry.text.clone(),
                })?
                .clone()
            }
        };
        report.news.push(message);
    }
    tx.commit()?;

    if let Some(update) = &info.update {
        report.last_update = Some(update.date);
        apply_stops(store, update, &mut report)?;
        for line in &update.lines {
            apply_line(store, line, options)?;
            report.lines.push(line.id);
        }
    }

    let mut tx = store.begin()?;
    if let Some(update) = &info.update {
        for entry in &update.prices.fares {
            let (fare, _) = tx.get_or_create_with(entry.name.clone(), || Fare {
                name: entry.name.clone(),
                price: entry.price,
            });
            fare.price = entry.price;
            report.fares.push(fare.clone());
        }
        report.observations = update.prices.observations.clone();
        tx.meta_mut().fare_observations = report.observations.clone();
    }
    tx.meta_mut().watermark = Some(report.next_watermark(watermark));
    tx.commit()?;

    Ok(report)
}

fn apply_stops(store: &EntityStore, update: &TopologyUpdate, report: &mut SyncReport) -> Result<()> {
    let mut tx = store.begin()?;
    for entry in &update.stops {
        for line in &entry.connections {
            tx.get_or_create::<Line>(*line);
        }
        let (stop, _) = tx.get_or_create::<Stop>(entry.id);
        stop.name = Some(entry.name.clone());
        stop.lat = Some(entry.posy);
        stop.long = Some(entry.posx);
        stop.connections = entry.connections.iter().copied().collect();
        report.stops.push(entry.id);
    }
    tx.commit()?;
    Ok(())
}

fn apply_line(store: &EntityStore, entry: &LineEntry, options: &SyncOptions) -> Result<()> {
    let mut tx = store.begin()?;
    let mut routes = BTreeSet::new();

    for route_entry in &entry.routes {
        let id = canonical_route_id(entry.id, route_entry, options)?;
        let origin = stop_named(&tx, route_entry.origin_name.as_deref());
        let destination = stop_named(&tx, route_entry.destination_name.as_deref());

        let (route, _) = tx.get_or_create::<Route>(id);
        route.line = Some(entry.id);
        route.origin = origin;
        route.destination = destination;

        let sequence = tx.replace_route_stops(id, &route_entry.stops)?;
        debug!(line = entry.id, route = id, stops = sequence.len(), "Route synced");
        routes.insert(id);
    }

    let origin = stop_named(&tx, entry.origin_name.as_deref());
    let destination = stop_named(&tx, entry.destination_name.as_deref());
    let (line, _) = tx.get_or_create::<Line>(entry.id);
    line.name = Some(entry.name.clone());
    line.color = entry.color.clone();
    line.origin = origin;
    line.destination = destination;
    line.routes = routes;

    tx.commit()?;
    Ok(())
}

fn canonical_route_id(line: LineId, entry: &RouteEntry, options: &SyncOptions) -> Result<RouteId> {
    if !options.fix_route_ids {
        return Ok(entry.route);
    }
    let direction = (entry.route % 100) as u32;
    route_id(line, direction).ok_or_else(|| {
        Error::malformed(
            FunctionCode::GeneralInfo,
            format!("route {} of line {line} has no usable direction", entry.route),
        )
    })
}

fn stop_named(tables: &crate::store::Tables, name: Option<&str>) -> Option<StopId> {
    name.and_then(|n| tables.stop_by_name(n)).map(|s| s.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RouteStop;
    use serde_json::{Value, json};

    fn info(value: Value) -> GeneralInfo {
        serde_json::from_value::<GeneralInfoPayload>(value).unwrap().info
    }

    fn topology(route_stops: Value) -> GeneralInfo {
        info(json!({"iTranvias": {
            "novedades": [],
            "actualizacion": {
                "fecha": "20240301T080000",
                "paradas": [
                    {"id": 1, "nombre": "Abente y Lago", "posx": -8.40, "posy": 43.36, "enlaces": [42]},
                    {"id": 2, "nombre": "Porto", "posx": -8.41, "posy": 43.37, "enlaces": [42, 7]},
                    {"id": 3, "nombre": "Marineda", "posx": -8.42, "posy": 43.35, "enlaces": [42]}
                ],
                "lineas": [{
                    "id": 42, "lin_comer": "42", "nombre_orig": "Abente y Lago",
                    "nombre_dest": "Marineda", "color": "ff0000",
                    "rutas": [{"ruta": 4201, "nombre_orig": "Marineda", "nombre_dest": "Abente y Lago",
                               "paradas": route_stops}]
                }],
                "precios": {"tarifas": [{"tarifa": "Ordinaria", "precio": 1.30}],
                            "observaciones": ["Transbordo gratuito"]}
            }
        }}))
    }

    #[test]
    fn test_watermark_parameter_format() {
        let watermark = Watermark::default();
        assert_eq!(watermark.to_parameter(), "20160101T000000_en_0_20160101T000000");

        let watermark = Watermark {
            last_message_id: 17,
            ..Watermark::default().with_language("gl")
        };
        assert_eq!(watermark.to_parameter(), "20160101T000000_gl_17_20160101T000000");
    }

    #[test]
    fn test_topology_is_applied() {
        let store = EntityStore::in_memory();
        let report = apply_general_info(
            &store,
            &topology(json!([1, 2, 3])),
            &Watermark::default(),
            &SyncOptions::default(),
        )
        .unwrap();
        assert_eq!(report.stops, vec![1, 2, 3]);
        assert_eq!(report.lines, vec![42]);

        store
            .read(|t| {
                let stop = t.get::<Stop>(&2).unwrap();
                assert_eq!(stop.lat, Some(43.37));
                assert_eq!(stop.long, Some(-8.41));
                assert_eq!(stop.connections, BTreeSet::from([7, 42]));
                assert!(t.get::<Line>(&7).is_some());

                let line = t.get::<Line>(&42).unwrap();
                assert_eq!(line.origin, Some(1));
                assert_eq!(line.destination, Some(3));
                assert_eq!(line.routes, BTreeSet::from([420001]));

                let route = t.get::<Route>(&420001).unwrap();
                assert_eq!(route.origin, Some(3));
                assert_eq!(route.destination, Some(1));
                assert_eq!(route.line, Some(42));

                let positions: Vec<_> = t
                    .route_sequence(420001)
                    .iter()
                    .map(|rs| (rs.stop_id, rs.position))
                    .collect();
                assert_eq!(positions, vec![(1, 0), (2, 1), (3, 2)]);
            })
            .unwrap();
    }

    #[test]
    fn test_resync_replaces_route_sequence() {
        let store = EntityStore::in_memory();
        let options = SyncOptions::default();
        apply_general_info(&store, &topology(json!([1, 2, 3])), &Watermark::default(), &options)
            .unwrap();
        apply_general_info(&store, &topology(json!([1, 3])), &Watermark::default(), &options)
            .unwrap();

        store
            .read(|t| {
                let positions: Vec<_> = t
                    .route_sequence(420001)
                    .iter()
                    .map(|rs| (rs.stop_id, rs.position))
                    .collect();
                assert_eq!(positions, vec![(1, 0), (3, 1)]);
                assert!(t.get::<RouteStop>(&(420001, 2)).is_none());
            })
            .unwrap();
    }

    #[test]
    fn test_resync_replaces_stop_connections() {
        let store = EntityStore::in_memory();
        let options = SyncOptions::default();
        apply_general_info(&store, &topology(json!([1, 2, 3])), &Watermark::default(), &options)
            .unwrap();

        let mut narrowed = topology(json!([1, 2, 3]));
        if let Some(update) = narrowed.update.as_mut() {
            update.stops[1].connections = vec![42];
        }
        apply_general_info(&store, &narrowed, &Watermark::default(), &options).unwrap();

        let stop = store.get::<Stop>(&2).unwrap().unwrap();
        assert_eq!(stop.connections, BTreeSet::from([42]));
        // The line itself is not removed by losing a stop.
        assert!(store.get::<Line>(&7).unwrap().is_some());
    }

    #[test]
    fn test_route_referencing_unknown_stop_is_fatal() {
        let store = EntityStore::in_memory();
        let err = apply_general_info(
            &store,
            &topology(json!([1, 99])),
            &Watermark::default(),
            &SyncOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn test_verbatim_route_ids() {
        let store = EntityStore::in_memory();
        let options = SyncOptions { fix_route_ids: false };
        apply_general_info(&store, &topology(json!([1])), &Watermark::default(), &options).unwrap();
        assert!(store.get::<Route>(&4201).unwrap().is_some());
    }

    #[test]
    fn test_fares_update_in_place() {
        let store = EntityStore::in_memory();
        let options = SyncOptions::default();
        apply_general_info(&store, &topology(json!([1])), &Watermark::default(), &options).unwrap();

        let mut raised = topology(json!([1]));
        if let Some(update) = raised.update.as_mut() {
            update.prices.fares[0].price = "1.45".parse().unwrap();
        }
        let report =
            apply_general_info(&store, &raised, &Watermark::default(), &options).unwrap();

        assert_eq!(report.fares.len(), 1);
        assert_eq!(report.observations, vec!["Transbordo gratuito".to_string()]);
        store
            .read(|t| {
                assert_eq!(t.len::<Fare>(), 1);
                assert_eq!(t.get::<Fare>(&"Ordinaria".to_string()).unwrap().price.to_string(), "1.45");
                assert_eq!(t.meta().fare_observations.len(), 1);
            })
            .unwrap();
    }

    #[test]
    fn test_news_not_recreated_and_watermark_advances() {
        let store = EntityStore::in_memory();
        let payload = info(json!({"iTranvias": {"novedades": [
            {"id": 5, "fecha": "20240102T100000", "version": "1", "titulo": "Obras", "texto": "a"},
            {"id": 6, "fecha": "20240103T100000", "version": "1", "titulo": "Huelga", "texto": "b"}
        ]}}));
        let options = SyncOptions::default();

        let first = apply_general_info(&store, &payload, &Watermark::default(), &options).unwrap();
        assert_eq!(first.news_created, 2);
        assert!(first.last_update.is_none());

        let second = apply_general_info(&store, &payload, &Watermark::default(), &options).unwrap();
        assert_eq!(second.news_created, 0);
        assert_eq!(second.news.len(), 2);

        let watermark = store.read(|t| t.meta().watermark.clone()).unwrap().unwrap();
        assert_eq!(watermark.last_message_id, 6);
        assert_eq!(itr_date::format(&watermark.last_message_date), "20240103T100000");
        assert_eq!(watermark.last_request, Watermark::default().last_request);
        assert_eq!(store.read(|t| t.len::<NewsMessage>()).unwrap(), 2);
    }
}

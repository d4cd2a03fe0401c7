//! Typed shapes of the three upstream responses.
//!
//! Field names follow the upstream's Spanish keys through `serde(rename)`.
//! Anything missing that the mapper cannot do without is a deserialization
//! error, which callers surface as [`crate::Error::Malformed`].

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::snapshot::Eta;

// ---------------------------------------------------------------------------
// func=0: buses approaching a stop
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct StopPayload {
    #[serde(default)]
    pub buses: StopLines,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StopLines {
    #[serde(rename = "lineas", default)]
    pub lines: Vec<StopLineEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopLineEntry {
    #[serde(rename = "linea", deserialize_with = "lenient::u32")]
    pub line: u32,
    #[serde(default)]
    pub buses: Vec<ApproachingBus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApproachingBus {
    #[serde(deserialize_with = "lenient::u32")]
    pub bus: u32,
    #[serde(rename = "tiempo")]
    pub time: Eta,
    /// Meters to the queried stop.
    #[serde(rename = "distancia", deserialize_with = "lenient::meters")]
    pub distance: u32,
    #[serde(rename = "estado")]
    pub state: i64,
    #[serde(rename = "ult_parada", deserialize_with = "lenient::u32")]
    pub last_stop: u32,
}

// ---------------------------------------------------------------------------
// func=2: buses along a line
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LinePayload {
    #[serde(rename = "paradas")]
    pub directions: Vec<DirectionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectionEntry {
    #[serde(rename = "sentido", deserialize_with = "lenient::u32")]
    pub direction: u32,
    #[serde(rename = "paradas", default)]
    pub stops: Vec<LineStopEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineStopEntry {
    #[serde(rename = "parada", deserialize_with = "lenient::u32")]
    pub stop: u32,
    #[serde(default)]
    pub buses: Vec<LineBus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineBus {
    #[serde(deserialize_with = "lenient::u32")]
    pub bus: u32,
    /// On this endpoint `distancia` is the completed fraction of the route.
    #[serde(rename = "distancia")]
    pub route_progress: f64,
    #[serde(rename = "estado")]
    pub state: i64,
}

// ---------------------------------------------------------------------------
// func=7: news and topology delta
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralInfoPayload {
    #[serde(rename = "iTranvias")]
    pub info: GeneralInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralInfo {
    #[serde(rename = "novedades", default)]
    pub news: Vec<NewsEntry>,
    /// Absent when nothing changed since the watermark.
    #[serde(rename = "actualizacion", default)]
    pub update: Option<TopologyUpdate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewsEntry {
    #[serde(deserialize_with = "lenient::u32")]
    pub id: u32,
    #[serde(rename = "fecha", deserialize_with = "itr_date::deserialize")]
    pub date: NaiveDateTime,
    #[serde(deserialize_with = "lenient::string")]
    pub version: String,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "texto")]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyUpdate {
    #[serde(rename = "fecha", deserialize_with = "itr_date::deserialize")]
    pub date: NaiveDateTime,
    #[serde(rename = "paradas", default)]
    pub stops: Vec<StopEntry>,
    #[serde(rename = "lineas", default)]
    pub lines: Vec<LineEntry>,
    #[serde(rename = "precios", default)]
    pub prices: Prices,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopEntry {
    #[serde(deserialize_with = "lenient::u32")]
    pub id: u32,
    #[serde(rename = "nombre")]
    pub name: String,
    /// Longitude.
    pub posx: f64,
    /// Latitude.
    pub posy: f64,
    #[serde(rename = "enlaces", default)]
    pub connections: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LineEntry {
    #[serde(deserialize_with = "lenient::u32")]
    pub id: u32,
    #[serde(rename = "lin_comer")]
    pub name: String,
    #[serde(rename = "nombre_orig", default)]
    pub origin_name: Option<String>,
    #[serde(rename = "nombre_dest", default)]
    pub destination_name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(rename = "rutas", default)]
    pub routes: Vec<RouteEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteEntry {
    #[serde(rename = "ruta")]
    pub route: u64,
    #[serde(rename = "nombre_orig", default)]
    pub origin_name: Option<String>,
    #[serde(rename = "nombre_dest", default)]
    pub destination_name: Option<String>,
    #[serde(rename = "paradas", default)]
    pub stops: Vec<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Prices {
    #[serde(rename = "tarifas", default)]
    pub fares: Vec<FareEntry>,
    #[serde(rename = "observaciones", default)]
    pub observations: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FareEntry {
    #[serde(rename = "tarifa")]
    pub name: String,
    #[serde(rename = "precio")]
    pub price: Decimal,
}

/// Compact timestamps used both in payloads and in the watermark parameter.
pub mod itr_date {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, de};

    pub const FORMAT: &str = "%Y%m%dT%H%M%S";

    pub fn format(date: &NaiveDateTime) -> String {
        date.format(FORMAT).to_string()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(de::Error::custom)
    }
}

/// The upstream is loose about quoting numbers.
mod lenient {
    use super::*;
    use serde::de;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Int(u64),
        Float(f64),
        Str(String),
    }

    pub fn u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        let value = match Scalar::deserialize(d)? {
            Scalar::Int(n) => n,
            Scalar::Float(f) if f >= 0.0 && f.fract() == 0.0 => f as u64,
            Scalar::Float(f) => return Err(de::Error::custom(format!("expected an id, got {f}"))),
            Scalar::Str(s) => s.trim().parse().map_err(de::Error::custom)?,
        };
        u32::try_from(value).map_err(de::Error::custom)
    }

    /// Distances may come with decimals; they are rounded to whole meters.
    pub fn meters<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
        match Scalar::deserialize(d)? {
            Scalar::Int(n) => u32::try_from(n).map_err(de::Error::custom),
            Scalar::Float(f) if f >= 0.0 => Ok(f.round() as u32),
            Scalar::Float(f) => Err(de::Error::custom(format!("negative distance {f}"))),
            Scalar::Str(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| f.max(0.0).round() as u32)
                .map_err(de::Error::custom),
        }
    }

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Scalar::deserialize(d)? {
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Str(s) => s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_stop_payload_accepts_missing_sections() {
        let payload: StopPayload = serde_json::from_value(json!({})).unwrap();
        assert!(payload.buses.lines.is_empty());

        let payload: StopPayload =
            serde_json::from_value(json!({"buses": {"lineas": [{"linea": 1800}]}})).unwrap();
        assert_eq!(payload.buses.lines[0].line, 1800);
        assert!(payload.buses.lines[0].buses.is_empty());
    }

    #[test]
    fn test_line_payload_quoted_direction() {
        let payload: LinePayload = serde_json::from_value(json!({
            "paradas": [{"sentido": "1", "paradas": [
                {"parada": 523, "buses": [{"bus": 3425, "distancia": 0.287, "estado": 0}]}
            ]}]
        }))
        .unwrap();
        let direction = &payload.directions[0];
        assert_eq!(direction.direction, 1);
        assert_eq!(direction.stops[0].buses[0].route_progress, 0.287);
    }

    #[test]
    fn test_line_payload_missing_directions_is_error() {
        assert!(serde_json::from_value::<LinePayload>(json!({"lineas": []})).is_err());
    }

    #[test]
    fn test_general_info_without_update() {
        let payload: GeneralInfoPayload = serde_json::from_value(json!({
            "iTranvias": {"novedades": [
                {"id": 12, "fecha": "20240315T093000", "version": 3, "titulo": "t", "texto": "x"}
            ]}
        }))
        .unwrap();
        assert!(payload.info.update.is_none());
        assert_eq!(payload.info.news[0].version, "3");
        assert_eq!(itr_date::format(&payload.info.news[0].date), "20240315T093000");
    }

    #[test]
    fn test_fractional_id_is_rejected() {
        let entry = |stop| json!({"parada": stop, "buses": []});
        assert_eq!(serde_json::from_value::<LineStopEntry>(entry(json!(523.0))).unwrap().stop, 523);
        assert!(serde_json::from_value::<LineStopEntry>(entry(json!(523.7))).is_err());
        assert!(serde_json::from_value::<LineStopEntry>(entry(json!(-1))).is_err());
        assert!(serde_json::from_value::<LineStopEntry>(entry(json!("523.7"))).is_err());
    }

    #[test]
    fn test_bad_date_is_rejected() {
        let result = serde_json::from_value::<NewsEntry>(json!({
            "id": 1, "fecha": "2024-03-15", "version": "1", "titulo": "", "texto": ""
        }));
        assert!(result.is_err());
    }
}

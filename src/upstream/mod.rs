//! The upstream query API: one endpoint, addressed by a function code and an
//! opaque parameter string.

mod http;
pub mod payload;

pub use http::HttpTransport;

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    /// Buses approaching one stop, grouped by line. Parameter: stop id.
    StopArrivals,
    /// Buses along every direction of one line. Parameter: line id.
    LineBuses,
    /// News plus the topology delta since a watermark. Parameter: watermark.
    GeneralInfo,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::StopArrivals => 0,
            FunctionCode::LineBuses => 2,
            FunctionCode::GeneralInfo => 7,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "func={}", self.code())
    }
}

/// Request/response access to the upstream.
///
/// Implementations must report throttling and temporary outages as
/// [`Error::Transient`]; every other error is treated as fatal by callers.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn query(&self, function: FunctionCode, parameter: &str) -> Result<Value>;
}

/// Queries `function` and decodes the response into its typed payload.
pub async fn query_as<T, P>(transport: &T, function: FunctionCode, parameter: &str) -> Result<P>
where
    T: Transport + ?Sized,
    P: DeserializeOwned,
{
    let value = transport.query(function, parameter).await?;
    serde_json::from_value(value).map_err(|e| Error::malformed(function, e))
}

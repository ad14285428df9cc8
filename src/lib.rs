#![forbid(unsafe_code)]

//! Locate, subset and cache GRIB2 model output from public mirrors.
//!
//! A [`Request`] names a model run (model, cycle, lead time, product) and
//! optionally a search pattern over the file's index. The [`Client`] tries
//! the model's providers in priority order, reads the `.idx`/`.index`
//! sidecar of the first one holding the file, and downloads only the
//! matching messages with HTTP range requests. Results are kept in a local
//! cache keyed by provider, URL and the selected messages.
//!
//! **Quick start**
//! ```no_run
//! use std::sync::Arc;
//! use grib_fetch::{Client, ClientOptions, Registry, Request};
//!
//! # async fn run() -> grib_fetch::Result<()> {
//! let client = Client::new(ClientOptions::default(), Arc::new(Registry::builtin()?))?;
//!
//! // 2 m temperature from the 12z HRRR run, 6 hour forecast
//! let request = Request::parse("hrrr", "2024-03-01 12:00")?
//!     .lead(6)
//!     .product("sfc")
//!     .search(":TMP:2 m above ground");
//! let got = client.retrieve(&request).await?;
//! println!("{} bytes from {} at {}", got.bytes, got.provider, got.path.display());
//! # Ok(())
//! # }
//! ```
//!
//! **Latest run**
//! ```no_run
//! # async fn run(client: grib_fetch::Client) -> grib_fetch::Result<()> {
//! let cycle = client.latest("gfs", None).await?;
//! println!("latest gfs cycle: {cycle}");
//! # Ok(())
//! # }
//! ```
//!
//! Notes:
//! - Data is subject to each provider's terms of use.
//! - NOMADS only serves recent cycles; older runs come from the cloud archives.

mod cache;
mod client;
mod config;
mod date;
mod error;
mod fetch;
mod inventory;
mod models;
mod probe;
mod registry;
mod request;
mod subset;
mod template;
mod transport;

#[cfg(test)]
mod test_support;

pub use crate::cache::{Cache, CacheKey, CacheOutcome, CacheRecord, Provenance};
pub use crate::client::{Client, Located, Retrieval, Stage};
pub use crate::config::{ClientOptions, ModelSettings, ProviderSettings, Settings};
pub use crate::date::{cycle_candidates, floor_to_cycle, parse_cycle};
pub use crate::error::{Error, ProviderFailure, Result};
pub use crate::fetch::{FetchResult, Fetcher, RetryPolicy};
pub use crate::inventory::{
    IndexGrammar, Inventory, InventoryEntry, MalformedInventoryLine, fetch_inventory, parse_index,
};
pub use crate::probe::{ProbeHit, ProbeOutcome, ProbeTarget, Prober};
pub use crate::registry::{Availability, Candidates, ModelDef, Provider, RangeStrategy, Registry};
pub use crate::request::{Request, expand_lead_list};
pub use crate::subset::{ByteRange, SearchPattern, Selection, merge, resolve};
pub use crate::template::{PathTemplate, RenderedUrls, TemplateError, TemplateVars, Value, render};
pub use crate::transport::{BodyStream, HttpTransport, Transport, TransportError, TransportResponse};

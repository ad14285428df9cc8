//! Client options and YAML settings files.
//!
//! A settings file carries the same knobs as [`ClientOptions`] plus a
//! `models:` list that adds models to the built-in catalogue or overrides
//! parts of existing ones:
//!
//! ```yaml
//! cache_root: /data/grib
//! priority: [aws, google]
//! request_timeout_secs: 120
//! models:
//!   - id: hrrr
//!     providers:
//!       - name: mirror
//!         data: "https://mirror.example/hrrr.{yyyymmdd}/hrrr.t{HH}z.wrf{product}f{fxx:02}.grib2"
//!         index: "{data_url}.idx"
//!         rank: 0
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Duration as Age;
use serde::{Deserialize, Serialize};

use crate::date::parse_cycle;
use crate::error::{Error, Result};
use crate::fetch::RetryPolicy;
use crate::inventory::IndexGrammar;
use crate::registry::{Availability, ModelDef, Provider, RangeStrategy, Registry};
use crate::template::PathTemplate;

pub const DEFAULT_USER_AGENT: &str = concat!("grib-fetch/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Downloaded files and cache records live below this directory.
    pub cache_root: PathBuf,
    /// Provider order used when a request has no override; `None` means
    /// provider rank.
    pub priority: Option<Vec<String>>,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryPolicy,
    /// Range requests in flight per retrieval.
    pub range_concurrency: usize,
    /// Retrievals in flight for [`crate::Client::retrieve_many`].
    pub batch_concurrency: usize,
    /// Download the whole file when no provider has a usable index.
    pub subset_fallback_to_full: bool,
    /// Keep downloaded index files next to the data.
    pub cache_index: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            cache_root: std::env::temp_dir().join("grib-fetch"),
            priority: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            range_concurrency: 4,
            batch_concurrency: 4,
            subset_fallback_to_full: true,
            cache_index: false,
        }
    }
}

/// Contents of a settings file. Every field is optional; missing ones keep
/// the [`ClientOptions`] defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub cache_root: Option<PathBuf>,
    pub priority: Option<Vec<String>>,
    pub user_agent: Option<String>,
    pub request_timeout_secs: Option<u64>,
    pub connect_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub range_concurrency: Option<usize>,
    pub batch_concurrency: Option<usize>,
    pub subset_fallback_to_full: Option<bool>,
    pub cache_index: Option<bool>,
    #[serde(default)]
    pub models: Vec<ModelSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelSettings {
    pub id: String,
    pub description: Option<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub interval_hours: Option<u32>,
    /// Product name to description; new products are appended after the
    /// existing ones.
    #[serde(default)]
    pub products: BTreeMap<String, String>,
    #[serde(default)]
    pub product_vars: BTreeMap<String, BTreeMap<String, String>>,
    pub local_name: Option<PathTemplate>,
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderSettings {
    pub name: String,
    pub data: PathTemplate,
    pub index: Option<PathTemplate>,
    #[serde(default)]
    pub grammar: IndexGrammar,
    #[serde(default)]
    pub rank: u32,
    #[serde(default)]
    pub ranges: RangeStrategy,
    /// Rolling archive keeping this many days.
    pub max_age_days: Option<i64>,
    /// First cycle held, any format accepted for request cycles.
    pub since: Option<String>,
    /// Cycles from this one on use another layout.
    pub until: Option<String>,
    /// Files announced smaller than this are treated as missing.
    pub min_size_bytes: Option<u64>,
}

impl ProviderSettings {
    fn availability(&self) -> Result<Availability> {
        let set = [self.max_age_days.is_some(), self.since.is_some(), self.until.is_some()];
        if set.iter().filter(|s| **s).count() > 1 {
            return Err(Error::Config(format!(
                "provider {}: only one of max_age_days, since, until may be set",
                self.name
            )));
        }
        let window = |s: &str| {
            parse_cycle(s).map_err(|e| Error::Config(format!("provider {}: {e}", self.name)))
        };
        Ok(match (&self.max_age_days, &self.since, &self.until) {
            (Some(days), _, _) => Availability::Recent {
                max_age: Age::days(*days),
            },
            (_, Some(since), _) => Availability::Since(window(since)?),
            (_, _, Some(until)) => Availability::Until(window(until)?),
            _ => Availability::Always,
        })
    }

    fn to_provider(&self) -> Result<Provider> {
        let mut p = Provider::new(&self.name, self.data.clone())
            .rank(self.rank)
            .ranges(self.ranges)
            .availability(self.availability()?);
        if let Some(index) = &self.index {
            p = p.with_index(index.clone(), self.grammar);
        }
        if let Some(bytes) = self.min_size_bytes {
            p = p.min_size(bytes);
        }
        Ok(p)
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn options(&self) -> ClientOptions {
        let d = ClientOptions::default();
        let retry = RetryPolicy {
            max_retries: self.max_retries.unwrap_or(d.retry.max_retries),
            initial_backoff: self
                .initial_backoff_ms
                .map_or(d.retry.initial_backoff, Duration::from_millis),
            max_backoff: self.max_backoff_secs.map_or(d.retry.max_backoff, Duration::from_secs),
            ..d.retry
        };
        ClientOptions {
            cache_root: self.cache_root.clone().unwrap_or(d.cache_root),
            priority: self.priority.clone().or(d.priority),
            user_agent: self.user_agent.clone().unwrap_or(d.user_agent),
            request_timeout: self
                .request_timeout_secs
                .map_or(d.request_timeout, Duration::from_secs),
            connect_timeout: self
                .connect_timeout_secs
                .map_or(d.connect_timeout, Duration::from_secs),
            retry,
            range_concurrency: self.range_concurrency.unwrap_or(d.range_concurrency),
            batch_concurrency: self.batch_concurrency.unwrap_or(d.batch_concurrency),
            subset_fallback_to_full: self
                .subset_fallback_to_full
                .unwrap_or(d.subset_fallback_to_full),
            cache_index: self.cache_index.unwrap_or(d.cache_index),
        }
    }

    /// The built-in catalogue with this file's models applied on top.
    pub fn registry(&self) -> Result<Registry> {
        let mut registry = Registry::builtin()?;
        for m in &self.models {
            apply_model(&mut registry, m)?;
        }
        Ok(registry)
    }
}

fn apply_model(registry: &mut Registry, settings: &ModelSettings) -> Result<()> {
    if let Some(model) = registry.model_mut(&settings.id) {
        merge_into(model, settings)?;
        return Ok(());
    }

    let mut model = ModelDef::new(&settings.id, settings.description.clone().unwrap_or_default());
    merge_into(&mut model, settings)?;
    if model.products.is_empty() {
        return Err(Error::Config(format!("new model {} declares no products", model.id)));
    }
    if model.providers.is_empty() {
        return Err(Error::Config(format!("new model {} declares no providers", model.id)));
    }
    registry.register(model);
    Ok(())
}

fn merge_into(model: &mut ModelDef, settings: &ModelSettings) -> Result<()> {
    if let Some(d) = &settings.description {
        model.description = d.clone();
    }
    for alias in &settings.aliases {
        let alias = alias.to_lowercase();
        if !model.aliases.contains(&alias) {
            model.aliases.push(alias);
        }
    }
    if let Some(hours) = settings.interval_hours {
        if hours == 0 || hours > 24 {
            return Err(Error::Config(format!("model {}: interval_hours must be 1-24", model.id)));
        }
        model.cycle_interval_hours = hours;
    }
    for (name, description) in &settings.products {
        match model.products.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = description.clone(),
            None => model.products.push((name.clone(), description.clone())),
        }
    }
    for (product, vars) in &settings.product_vars {
        let slot = model.product_vars.entry(product.clone()).or_default();
        for (name, value) in vars {
            PathTemplate::parse(value)?;
            slot.insert(name.clone(), value.clone());
        }
    }
    if let Some(local) = &settings.local_name {
        model.local_name = Some(local.clone());
    }
    for p in &settings.providers {
        model.upsert_provider(p.to_provider()?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
cache_root: /tmp/grib-test
priority: [google, aws]
request_timeout_secs: 42
max_retries: 5
initial_backoff_ms: 10
models:
  - id: hrrr
    interval_hours: 1
    providers:
      - name: mirror
        data: "https://mirror.example/hrrr.{yyyymmdd}/hrrr.t{HH}z.wrf{product}f{fxx:02}.grib2"
        index: "{data_url}.idx"
        rank: 0
        ranges: multi_range
  - id: toy
    description: toy model
    products:
      sfc: surface
    providers:
      - name: local
        data: "https://toy.example/{yyyymmddHH}/f{fxx:03}.grib2"
        index: "{data_stem}.index"
        grammar: eccodes
        max_age_days: 3
        min_size_bytes: 1000000
"#;

    #[test]
    fn options_overlay_defaults() {
        let s = Settings::from_yaml_str(YAML).unwrap();
        let o = s.options();
        assert_eq!(o.cache_root, PathBuf::from("/tmp/grib-test"));
        assert_eq!(o.priority.as_deref(), Some(&["google".to_string(), "aws".to_string()][..]));
        assert_eq!(o.request_timeout, Duration::from_secs(42));
        assert_eq!(o.retry.max_retries, 5);
        assert_eq!(o.retry.initial_backoff, Duration::from_millis(10));
        assert_eq!(o.retry.max_backoff, RetryPolicy::default().max_backoff);
        assert!(o.subset_fallback_to_full);
        assert!(!o.cache_index);
    }

    #[test]
    fn empty_file_is_defaults() {
        let o = Settings::from_yaml_str("{}").unwrap().options();
        assert_eq!(o.range_concurrency, ClientOptions::default().range_concurrency);
        assert!(o.priority.is_none());
    }

    #[test]
    fn registry_overrides_and_additions() {
        let r = Settings::from_yaml_str(YAML).unwrap().registry().unwrap();

        let hrrr = r.model("hrrr").unwrap();
        let first = hrrr.ranked_providers()[0];
        assert_eq!(first.name, "mirror");
        assert_eq!(first.ranges, RangeStrategy::MultiRange);
        assert!(hrrr.find_provider("aws").is_some());

        let toy = r.model("toy").unwrap();
        assert_eq!(toy.default_product(), Some("sfc"));
        let p = toy.find_provider("local").unwrap();
        assert_eq!(p.grammar, IndexGrammar::Eccodes);
        assert_eq!(p.availability, Availability::Recent { max_age: Age::days(3) });
        assert_eq!(p.min_size, Some(1_000_000));
        assert_eq!(first.min_size, None);
    }

    #[test]
    fn rejects_bad_settings() {
        assert!(matches!(
            Settings::from_yaml_str("cache_rot: /x").unwrap_err(),
            Error::Yaml(_)
        ));
        let bad_template =
            "models:\n  - id: x\n    providers:\n      - name: a\n        data: \"https://a/{nope\"\n";
        assert!(matches!(Settings::from_yaml_str(bad_template).unwrap_err(), Error::Yaml(_)));

        let no_products = Settings::from_yaml_str(
            "models:\n  - id: fresh\n    providers:\n      - name: a\n        data: \"https://a.example/{fxx}\"\n",
        )
        .unwrap();
        assert!(matches!(no_products.registry().unwrap_err(), Error::Config(_)));

        let two_windows = Settings::from_yaml_str(
            "models:\n  - id: hrrr\n    providers:\n      - name: a\n        data: \"https://a.example/{fxx}\"\n        since: \"2020-01-01\"\n        max_age_days: 2\n",
        )
        .unwrap();
        assert!(matches!(two_windows.registry().unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "batch_concurrency: 9\n").unwrap();
        assert_eq!(Settings::load(&path).unwrap().options().batch_concurrency, 9);
        let missing = Settings::load(dir.path().join("missing.yaml")).unwrap_err();
        assert!(matches!(missing, Error::Config(_)));
    }
}

//! Models and the providers that host them.
//!
//! A [`Registry`] is built once at startup (usually [`Registry::builtin`],
//! optionally extended from a settings file) and shared read-only by every
//! retrieval.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ProviderFailure, Result};
use crate::inventory::IndexGrammar;
use crate::request::Request;
use crate::template::PathTemplate;

/// When a provider can be expected to hold a given cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Always,
    /// Rolling archive keeping only recent cycles (NOMADS keeps ~14 days).
    Recent { max_age: Duration },
    /// Archive starts at this cycle.
    Since(DateTime<Utc>),
    /// Layout only used for cycles before this one.
    Until(DateTime<Utc>),
}

impl Availability {
    pub fn admits(&self, cycle: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            Availability::Always => true,
            Availability::Recent { max_age } => now - cycle <= *max_age,
            Availability::Since(start) => cycle >= *start,
            Availability::Until(end) => cycle < *end,
        }
    }

    fn describe(&self) -> String {
        match self {
            Availability::Always => "always".to_string(),
            Availability::Recent { max_age } => {
                format!("only keeps the last {} days", max_age.num_days())
            }
            Availability::Since(start) => {
                format!("archive starts {}", start.format("%Y-%m-%d %H:%M UTC"))
            }
            Availability::Until(end) => format!("layout ends {}", end.format("%Y-%m-%d %H:%M UTC")),
        }
    }
}

/// How a provider serves byte ranges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeStrategy {
    /// One `Range` request per merged range.
    #[default]
    Sequential,
    /// A single `multipart/byteranges` request for all ranges.
    MultiRange,
    /// No range support; subsets are not possible, always fetch whole files.
    None,
}

#[derive(Debug, Clone)]
pub struct Provider {
    pub name: String,
    pub data_template: PathTemplate,
    pub index_template: Option<PathTemplate>,
    pub grammar: IndexGrammar,
    pub priority_rank: u32,
    pub availability: Availability,
    pub ranges: RangeStrategy,
    /// Files announced smaller than this are treated as missing.
    pub min_size: Option<u64>,
}

impl Provider {
    pub fn new(name: impl Into<String>, data_template: PathTemplate) -> Self {
        Self {
            name: name.into().to_lowercase(),
            data_template,
            index_template: None,
            grammar: IndexGrammar::Wgrib2,
            priority_rank: 0,
            availability: Availability::Always,
            ranges: RangeStrategy::Sequential,
            min_size: None,
        }
    }

    pub fn with_index(mut self, template: PathTemplate, grammar: IndexGrammar) -> Self {
        self.index_template = Some(template);
        self.grammar = grammar;
        self
    }

    pub fn rank(mut self, rank: u32) -> Self {
        self.priority_rank = rank;
        self
    }

    pub fn availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn min_size(mut self, bytes: u64) -> Self {
        self.min_size = Some(bytes);
        self
    }

    pub fn ranges(mut self, strategy: RangeStrategy) -> Self {
        self.ranges = strategy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ModelDef {
    pub id: String,
    pub description: String,
    pub aliases: Vec<String>,
    /// `(name, description)`, first entry is the default product.
    pub products: Vec<(String, String)>,
    pub providers: Vec<Provider>,
    /// Hours between cycles, used when searching for the latest run.
    pub cycle_interval_hours: u32,
    /// Extra template variables for individual products.
    pub product_vars: BTreeMap<String, BTreeMap<String, String>>,
    /// Local file name, defaults to the last segment of the data URL.
    pub local_name: Option<PathTemplate>,
}

impl ModelDef {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into().to_lowercase(),
            description: description.into(),
            aliases: Vec::new(),
            products: Vec::new(),
            providers: Vec::new(),
            cycle_interval_hours: 6,
            product_vars: BTreeMap::new(),
            local_name: None,
        }
    }

    pub fn product(mut self, name: &str, description: &str) -> Self {
        self.products.push((name.to_string(), description.to_string()));
        self
    }

    /// Set a template variable that only applies to `product`.
    pub fn product_var(mut self, product: &str, name: &str, value: &str) -> Self {
        self.product_vars
            .entry(product.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.aliases.push(alias.to_lowercase());
        self
    }

    pub fn provider(mut self, provider: Provider) -> Self {
        self.upsert_provider(provider);
        self
    }

    pub fn interval(mut self, hours: u32) -> Self {
        self.cycle_interval_hours = hours;
        self
    }

    pub fn vars_for(&self, product: &str) -> impl Iterator<Item = (&str, &str)> {
        self.product_vars
            .get(product)
            .into_iter()
            .flat_map(|vars| vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    pub fn default_product(&self) -> Option<&str> {
        self.products.first().map(|(name, _)| name.as_str())
    }

    pub fn has_product(&self, product: &str) -> bool {
        self.products.iter().any(|(name, _)| name == product)
    }

    /// Providers in fallback order: ascending rank, declaration order on ties.
    pub fn ranked_providers(&self) -> Vec<&Provider> {
        let mut out: Vec<&Provider> = self.providers.iter().collect();
        out.sort_by_key(|p| p.priority_rank);
        out
    }

    pub fn find_provider(&self, name: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.name == name)
    }

    /// Insert or replace a provider by name.
    pub fn upsert_provider(&mut self, provider: Provider) {
        match self.providers.iter_mut().find(|p| p.name == provider.name) {
            Some(slot) => *slot = provider,
            None => self.providers.push(provider),
        }
    }
}

/// Providers that may be tried for one request, plus the ones ruled out
/// before any network traffic.
#[derive(Debug)]
pub struct Candidates<'a> {
    pub providers: Vec<&'a Provider>,
    pub skipped: Vec<ProviderFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    models: BTreeMap<String, ModelDef>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a model.
    pub fn register(&mut self, model: ModelDef) {
        self.models.insert(model.id.clone(), model);
    }

    pub fn model_ids(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    /// Look a model up by id or alias (case-insensitive).
    pub fn model(&self, id: &str) -> Result<&ModelDef> {
        let id = id.to_lowercase();
        if let Some(m) = self.models.get(&id) {
            return Ok(m);
        }
        self.models
            .values()
            .find(|m| m.aliases.iter().any(|a| *a == id))
            .ok_or_else(|| Error::UnknownModel {
                model: id,
                known: self.model_ids(),
            })
    }

    pub fn model_mut(&mut self, id: &str) -> Option<&mut ModelDef> {
        self.models.get_mut(&id.to_lowercase())
    }

    /// Providers of `model_id` in priority order.
    pub fn providers_for(&self, model_id: &str) -> Result<Vec<&Provider>> {
        Ok(self.model(model_id)?.ranked_providers())
    }

    /// Providers to try for `request`, honouring its priority override (only
    /// listed providers, in listed order) and each provider's availability.
    ///
    /// `default_priority` applies when the request has no override.
    pub fn candidates<'a>(
        &'a self,
        request: &Request,
        default_priority: Option<&[String]>,
        now: DateTime<Utc>,
    ) -> Result<Candidates<'a>> {
        let model = self.model(request.model_id())?;
        let ranked = model.ranked_providers();

        let ordered: Vec<&Provider> = match request.priority_override().or(default_priority) {
            Some(priority) => priority
                .iter()
                .filter_map(|name| ranked.iter().copied().find(|p| p.name == *name))
                .collect(),
            None => ranked,
        };

        let mut providers = Vec::new();
        let mut skipped = Vec::new();
        for p in ordered {
            if p.availability.admits(request.cycle(), now) {
                providers.push(p);
            } else {
                skipped.push(ProviderFailure::new(
                    &p.name,
                    format!("cycle outside availability window ({})", p.availability.describe()),
                ));
            }
        }

        Ok(Candidates { providers, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(s: &str) -> PathTemplate {
        PathTemplate::parse(s).unwrap()
    }

    fn registry() -> Registry {
        let mut m = ModelDef::new("X", "test model");
        m.aliases.push("ex".into());
        m.products.push(("sfc".into(), "surface".into()));
        m.providers.push(Provider::new("b", t("https://b.example/{fxx}")).rank(2));
        m.providers.push(Provider::new("a", t("https://a.example/{fxx}")).rank(1));
        m.providers.push(
            Provider::new("nomads", t("https://n.example/{fxx}"))
                .rank(3)
                .availability(Availability::Recent { max_age: Duration::days(14) }),
        );
        let mut r = Registry::new();
        r.register(m);
        r
    }

    #[test]
    fn providers_ordered_by_rank() {
        let r = registry();
        let names: Vec<_> = r.providers_for("x").unwrap().iter().map(|p| p.name.clone()).collect();
        assert_eq!(names, vec!["a", "b", "nomads"]);
        assert_eq!(r.providers_for("EX").unwrap().len(), 3);
    }

    #[test]
    fn unknown_model() {
        let err = registry().providers_for("nope").unwrap_err();
        assert!(matches!(err, Error::UnknownModel { ref known, .. } if known == &["x"]));
    }

    #[test]
    fn candidates_apply_priority_and_availability() {
        let r = registry();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let old = Request::new("x", Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());

        let c = r.candidates(&old, None, now).unwrap();
        let names: Vec<_> = c.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(c.skipped.len(), 1);
        assert_eq!(c.skipped[0].provider, "nomads");

        let overridden = old.clone().priority(["nomads", "B", "missing"]);
        let c = r.candidates(&overridden, None, now).unwrap();
        let names: Vec<_> = c.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);

        let default_priority = vec!["b".to_string(), "a".to_string()];
        let c = r.candidates(&old, Some(&default_priority), now).unwrap();
        let names: Vec<_> = c.providers.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn since_availability() {
        let start = Utc.with_ymd_and_hms(2018, 9, 17, 0, 0, 0).unwrap();
        let a = Availability::Since(start);
        let now = Utc::now();
        assert!(a.admits(start, now));
        assert!(!a.admits(start - Duration::hours(1), now));
    }
}

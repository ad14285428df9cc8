use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cache::{Cache, CacheKey, CacheOutcome, Provenance};
use crate::config::{ClientOptions, Settings};
use crate::date::cycle_candidates;
use crate::error::{Error, ProviderFailure, Result};
use crate::fetch::Fetcher;
use crate::inventory::{Inventory, fetch_inventory};
use crate::probe::{ProbeTarget, Prober};
use crate::registry::{ModelDef, Provider, RangeStrategy, Registry};
use crate::request::Request;
use crate::subset::{SearchPattern, resolve};
use crate::template::{RenderedUrls, TemplateVars, file_name_from_url, render};
use crate::transport::{HttpTransport, Transport};

/// How far back [`Client::latest`] looks for a published cycle.
const LATEST_LOOKBACK_DAYS: i64 = 5;

/// Pipeline stage of one retrieval, as reported in `stage` log fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Probing,
    Templating,
    Indexing,
    Resolving,
    Fetching,
    Cached,
    Failed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Probing => "probing",
            Stage::Templating => "templating",
            Stage::Indexing => "indexing",
            Stage::Resolving => "resolving",
            Stage::Fetching => "fetching",
            Stage::Cached => "cached",
            Stage::Failed => "failed",
        })
    }
}

/// A file (or subset of one) available on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retrieval {
    pub path: PathBuf,
    pub provider: String,
    pub url: String,
    /// Selected message indices, `None` for a whole file.
    pub messages: Option<Vec<usize>>,
    pub bytes: u64,
    pub cache_hit: bool,
    pub key: CacheKey,
}

impl Retrieval {
    fn from_outcome(outcome: CacheOutcome) -> Self {
        let r = outcome.record;
        Self {
            path: r.path,
            provider: r.provider,
            url: r.url,
            messages: r.messages,
            bytes: r.size_bytes,
            cache_hit: outcome.hit,
            key: r.key,
        }
    }
}

/// Where a request's file was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub provider: String,
    pub data_url: String,
    pub index_url: Option<String>,
    pub content_length: Option<u64>,
}

/// One candidate provider with its URLs for the current request.
struct Target<'a> {
    provider: &'a Provider,
    urls: RenderedUrls,
}

/// Everything derived from a request before any network traffic.
struct Plan<'a> {
    model: &'a ModelDef,
    targets: Vec<Target<'a>>,
    skipped: Vec<ProviderFailure>,
    pattern: SearchPattern,
    file_name: Option<String>,
}

impl Plan<'_> {
    fn probe_targets(&self) -> Vec<ProbeTarget> {
        self.targets
            .iter()
            .map(|t| ProbeTarget {
                provider: t.provider.name.clone(),
                url: t.urls.data_url.clone(),
                min_size: t.provider.min_size,
            })
            .collect()
    }
}

#[derive(Clone)]
pub struct Client {
    options: ClientOptions,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    prober: Prober,
    fetcher: Fetcher,
    cache: Arc<Cache>,
}

impl Client {
    pub fn new(options: ClientOptions, registry: Arc<Registry>) -> Result<Self> {
        let transport = HttpTransport::new(
            &options.user_agent,
            options.request_timeout,
            options.connect_timeout,
        )?;
        Ok(Self::with_transport(options, registry, Arc::new(transport)))
    }

    /// Client over an arbitrary [`Transport`].
    pub fn with_transport(
        options: ClientOptions,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let fetcher = Fetcher::new(
            Arc::clone(&transport),
            options.retry.clone(),
            options.range_concurrency,
        );
        Self {
            prober: Prober::new(Arc::clone(&transport)),
            cache: Arc::new(Cache::new(options.cache_root.clone())),
            fetcher,
            transport,
            registry,
            options,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.options(), Arc::new(settings.registry()?))
    }

    /// Built-in catalogue with default options.
    pub fn default_client() -> Result<Self> {
        Self::new(ClientOptions::default(), Arc::new(Registry::builtin()?))
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub async fn retrieve(&self, request: &Request) -> Result<Retrieval> {
        self.retrieve_with_cancel(request, &CancellationToken::new()).await
    }

    /// Retrieve the file (or the messages matching the request's search)
    /// from the first provider that can supply it.
    ///
    /// Providers are tried in priority order. A provider that does not have
    /// the file, or whose download keeps failing, is recorded and the next
    /// one is tried; when all are exhausted the error lists every attempt.
    #[instrument(
        skip(self, request, cancel),
        fields(model = request.model_id(), cycle = %request.cycle(), lead = request.lead_hours())
    )]
    pub async fn retrieve_with_cancel(
        &self,
        request: &Request,
        cancel: &CancellationToken,
    ) -> Result<Retrieval> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let plan = self.plan(request)?;
        let mut attempts = plan.skipped.clone();

        if plan.pattern.is_all() && !request.overwrites() {
            if let Some(found) = self.cached_full(&plan).await? {
                debug!(
                    stage = %Stage::Cached,
                    provider = %found.provider,
                    path = %found.path.display()
                );
                return Ok(found);
            }
        }

        let probes = plan.probe_targets();
        let mut start = 0;
        while start < probes.len() {
            debug!(stage = %Stage::Probing, candidates = probes.len() - start);
            let found = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                found = self.prober.first_available(&probes[start..]) => found,
            };
            let hit = match found {
                Ok(hit) => hit,
                Err(Error::NoProviderAvailable { attempts: misses }) => {
                    attempts.extend(misses);
                    break;
                }
                Err(e) => return Err(e),
            };
            attempts.extend(hit.misses);
            let position = start + hit.position;
            start = position + 1;

            let provider = &plan.targets[position].provider.name;
            let content_length = hit.outcome.content_length();
            match self.try_target(request, &plan, position, content_length, cancel).await {
                Ok(retrieval) => {
                    debug!(
                        stage = %Stage::Cached,
                        provider = %provider,
                        path = %retrieval.path.display(),
                        hit = retrieval.cache_hit
                    );
                    return Ok(retrieval);
                }
                Err(e) if e.is_provider_scoped() => {
                    debug!(
                        stage = %Stage::Failed,
                        provider = %provider,
                        reason = %e,
                        "trying next provider"
                    );
                    attempts.push(ProviderFailure::new(provider, e.to_string()));
                }
                Err(e) => {
                    debug!(
                        stage = %Stage::Failed,
                        provider = %provider,
                        kind = e.kind(),
                        error = %e
                    );
                    return Err(e);
                }
            }
        }

        warn!(
            model = %plan.model.id,
            attempts = attempts.len(),
            "no provider could supply the file"
        );
        Err(Error::NoProviderAvailable { attempts })
    }

    /// Retrieve many requests, at most `concurrency` at a time (the
    /// configured batch concurrency when `None`). Results are in input
    /// order.
    pub async fn retrieve_many(
        &self,
        requests: &[Request],
        concurrency: Option<usize>,
    ) -> Vec<Result<Retrieval>> {
        let concurrency = concurrency.unwrap_or(self.options.batch_concurrency).max(1);
        let cancel = CancellationToken::new();
        let mut results: Vec<(usize, Result<Retrieval>)> = stream::iter(requests.iter().enumerate())
            .map(|(i, r)| {
                let cancel = &cancel;
                async move { (i, self.retrieve_with_cancel(r, cancel).await) }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        results.sort_by_key(|(i, _)| *i);
        results.into_iter().map(|(_, r)| r).collect()
    }

    /// Find the first provider holding the request's data file.
    pub async fn locate(&self, request: &Request) -> Result<Located> {
        let plan = self.plan(request)?;
        debug!(stage = %Stage::Probing, model = %plan.model.id, candidates = plan.targets.len());
        match self.prober.first_available(&plan.probe_targets()).await {
            Ok(hit) => {
                let target = &plan.targets[hit.position];
                Ok(Located {
                    provider: target.provider.name.clone(),
                    data_url: target.urls.data_url.clone(),
                    index_url: target.urls.index_url.clone(),
                    content_length: hit.outcome.content_length(),
                })
            }
            Err(Error::NoProviderAvailable { attempts }) => {
                let mut all = plan.skipped;
                all.extend(attempts);
                Err(Error::NoProviderAvailable { attempts: all })
            }
            Err(e) => Err(e),
        }
    }

    /// The parsed index of the request's file, from the first provider that
    /// serves one.
    pub async fn inventory(&self, request: &Request) -> Result<Inventory> {
        let plan = self.plan(request)?;
        let cancel = CancellationToken::new();
        let mut attempts = plan.skipped.clone();
        for (position, target) in plan.targets.iter().enumerate() {
            if target.urls.index_url.is_none() {
                attempts.push(ProviderFailure::new(&target.provider.name, "provider has no index"));
                continue;
            }
            match self.load_inventory(&plan, position, &cancel).await {
                Ok((inventory, _)) => return Ok(inventory),
                Err(e @ Error::InventoryUnavailable { .. }) => {
                    attempts.push(ProviderFailure::new(&target.provider.name, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoProviderAvailable { attempts })
    }

    /// Most recent cycle of `model` that some provider already serves.
    pub async fn latest(&self, model: &str, product: Option<&str>) -> Result<DateTime<Utc>> {
        self.latest_as_of(model, product, Utc::now()).await
    }

    /// Like [`Client::latest`], searching backwards from `now`.
    pub async fn latest_as_of(
        &self,
        model: &str,
        product: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let def = self.registry.model(model)?;
        let product = resolve_product(def, product)?;

        let lookback = Duration::days(LATEST_LOOKBACK_DAYS);
        for cycle in cycle_candidates(now, def.cycle_interval_hours, lookback) {
            let request = Request::new(def.id.clone(), cycle).product(product);
            match self.locate(&request).await {
                Ok(found) => {
                    info!(model = %def.id, %cycle, provider = %found.provider, "latest cycle");
                    return Ok(cycle);
                }
                Err(Error::NoProviderAvailable { .. }) => {
                    debug!(model = %def.id, %cycle, "cycle not published")
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::CannotEstablishLatest(format!(
            "{} (nothing published in the last {LATEST_LOOKBACK_DAYS} days)",
            def.id
        )))
    }

    /// Remove every cache record, returns how many were removed.
    pub async fn clear_cache(&self) -> Result<usize> {
        self.cache.clear().await
    }

    fn plan(&self, request: &Request) -> Result<Plan<'_>> {
        let model = self.registry.model(request.model_id())?;
        let product = resolve_product(model, request.product_name())?;
        let pattern = match request.search_pattern() {
            Some(p) => SearchPattern::regex(p)?,
            None => SearchPattern::All,
        };

        debug!(stage = %Stage::Templating, model = %model.id, product);
        let vars = TemplateVars::for_model(
            model,
            product,
            request.cycle(),
            request.lead_hours(),
            request.member_number(),
        )?;
        let file_name = match &model.local_name {
            Some(t) => Some(t.render(&vars)?),
            None => None,
        };

        let candidates = self
            .registry
            .candidates(request, self.options.priority.as_deref(), Utc::now())?;
        let mut targets = Vec::with_capacity(candidates.providers.len());
        for provider in candidates.providers {
            targets.push(Target {
                provider,
                urls: render(provider, &vars)?,
            });
        }

        Ok(Plan {
            model,
            targets,
            skipped: candidates.skipped,
            pattern,
            file_name,
        })
    }

    /// Retrieve from `plan.targets[position]`, already known to hold the
    /// file.
    async fn try_target(
        &self,
        request: &Request,
        plan: &Plan<'_>,
        position: usize,
        content_length: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<Retrieval> {
        let target = &plan.targets[position];
        let provider = target.provider;
        let url = &target.urls.data_url;
        let full_path = self.full_path(request, plan, target)?;

        if plan.pattern.is_all() {
            return self.fetch_full(request, provider, url, &full_path, cancel).await;
        }
        if provider.ranges == RangeStrategy::None {
            debug!(
                provider = %provider.name,
                %url,
                "provider serves no ranges, downloading the whole file"
            );
            return self.fetch_full(request, provider, url, &full_path, cancel).await;
        }

        let inventory = match self.load_inventory(plan, position, cancel).await {
            Ok((inventory, text)) => {
                if self.options.cache_index {
                    self.store_index(&full_path, provider, &text).await;
                }
                inventory
            }
            Err(e @ Error::InventoryUnavailable { .. }) if self.options.subset_fallback_to_full => {
                warn!(
                    provider = %provider.name,
                    %url,
                    reason = %e,
                    "no usable index, downloading the whole file"
                );
                return self.fetch_full(request, provider, url, &full_path, cancel).await;
            }
            Err(e) => return Err(e),
        };
        let inventory = match content_length {
            Some(len) => inventory.with_total_length(len),
            None => inventory,
        };

        debug!(
            stage = %Stage::Resolving,
            provider = %provider.name,
            entries = inventory.len(),
            pattern = %plan.pattern
        );
        let selection = resolve(&inventory.entries, &plan.pattern);
        if selection.is_empty() {
            return Err(Error::NoMatchingMessages(plan.pattern.to_string()));
        }

        let key = CacheKey::new(&provider.name, url, Some(&selection.messages));
        let path = Cache::subset_path(&full_path, &key);
        debug!(
            stage = %Stage::Fetching,
            provider = %provider.name,
            %url,
            messages = %selection.signature(),
            ranges = selection.ranges.len()
        );
        let provenance = Provenance {
            provider: provider.name.clone(),
            url: url.clone(),
            messages: Some(selection.messages.clone()),
        };
        let outcome = self
            .cached(request, &key, &path, provenance, || async {
                let fetched = self
                    .fetcher
                    .fetch(url, &selection.ranges, provider.ranges, &path, cancel)
                    .await?;
                if fetched.messages_included != selection.messages.len() {
                    debug!(
                        expected = selection.messages.len(),
                        found = fetched.messages_included,
                        "message count differs from the index (sub-messages share a range)"
                    );
                }
                Ok::<_, Error>(fetched.bytes_written)
            })
            .await?;
        Ok(Retrieval::from_outcome(outcome))
    }

    async fn fetch_full(
        &self,
        request: &Request,
        provider: &Provider,
        url: &str,
        path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Retrieval> {
        let key = CacheKey::full(&provider.name, url);
        debug!(stage = %Stage::Fetching, provider = %provider.name, url, "whole file");
        let provenance = Provenance {
            provider: provider.name.clone(),
            url: url.to_string(),
            messages: None,
        };
        let outcome = self
            .cached(request, &key, path, provenance, || async {
                let fetched = self.fetcher.fetch(url, &[], provider.ranges, path, cancel).await?;
                Ok::<_, Error>(fetched.bytes_written)
            })
            .await?;
        Ok(Retrieval::from_outcome(outcome))
    }

    /// Reuse the cached entry for `key` unless the request asks to
    /// overwrite it.
    async fn cached<F, Fut>(
        &self,
        request: &Request,
        key: &CacheKey,
        path: &Path,
        provenance: Provenance,
        fetch_fn: F,
    ) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<u64>>,
    {
        if request.overwrites() {
            self.cache.refresh(key, path, provenance, fetch_fn).await
        } else {
            self.cache.get_or_fetch(key, path, provenance, fetch_fn).await
        }
    }

    /// A whole file already cached from any candidate, in priority order.
    async fn cached_full(&self, plan: &Plan<'_>) -> Result<Option<Retrieval>> {
        for target in &plan.targets {
            let key = CacheKey::full(&target.provider.name, &target.urls.data_url);
            if let Some(record) = self.cache.lookup(&key).await? {
                return Ok(Some(Retrieval::from_outcome(CacheOutcome { record, hit: true })));
            }
        }
        Ok(None)
    }

    /// The index for the file at `plan.targets[position]`. When that
    /// provider has none, mirrors using the same index grammar are asked
    /// instead since they serve byte-identical files.
    async fn load_inventory(
        &self,
        plan: &Plan<'_>,
        position: usize,
        cancel: &CancellationToken,
    ) -> Result<(Inventory, String)> {
        let own = &plan.targets[position];
        let mirrors = plan
            .targets
            .iter()
            .enumerate()
            .filter(|(i, t)| *i != position && t.provider.grammar == own.provider.grammar)
            .map(|(_, t)| t);

        let mut last = None;
        for target in std::iter::once(own).chain(mirrors) {
            let Some(index_url) = &target.urls.index_url else {
                continue;
            };
            debug!(stage = %Stage::Indexing, provider = %target.provider.name, url = %index_url);
            let grammar = target.provider.grammar;
            match fetch_inventory(self.transport.as_ref(), index_url, grammar, cancel).await {
                Ok(found) => {
                    if target.provider.name != own.provider.name {
                        info!(
                            data = %own.provider.name,
                            index = %target.provider.name,
                            "using a mirror's index"
                        );
                    }
                    return Ok(found);
                }
                Err(e @ Error::InventoryUnavailable { .. }) => {
                    debug!(provider = %target.provider.name, error = %e, "index unavailable");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last.unwrap_or_else(|| Error::InventoryUnavailable {
            url: own.urls.data_url.clone(),
            reason: "no provider publishes an index for this file".into(),
        }))
    }

    async fn store_index(&self, full_path: &Path, provider: &Provider, text: &str) {
        let path = Cache::index_path(full_path, provider.grammar);
        let written = async {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&path, text).await
        };
        if let Err(e) = written.await {
            warn!(path = %path.display(), error = %e, "cannot cache index");
        }
    }

    fn full_path(
        &self,
        request: &Request,
        plan: &Plan<'_>,
        target: &Target<'_>,
    ) -> Result<PathBuf> {
        let url = &target.urls.data_url;
        let name = match &plan.file_name {
            Some(n) => n.clone(),
            None => file_name_from_url(url).ok_or_else(|| {
                Error::InvalidRequest(format!("cannot derive a file name from {url}"))
            })?,
        };
        Ok(self
            .cache
            .layout_path(&plan.model.id, request.cycle(), &target.provider.name, &name))
    }
}

fn resolve_product<'a>(model: &'a ModelDef, product: Option<&'a str>) -> Result<&'a str> {
    match product {
        Some(p) if model.has_product(p) => Ok(p),
        Some(p) => Err(Error::UnknownProduct {
            model: model.id.clone(),
            product: p.to_string(),
            known: model.products.iter().map(|(n, _)| n.clone()).collect(),
        }),
        None => model
            .default_product()
            .ok_or_else(|| {
                Error::InvalidRequest(format!("model {} declares no products", model.id))
            }),
    }
}

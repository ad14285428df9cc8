use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::{Error, ProviderFailure, Result};
use crate::subset::ByteRange;
use crate::transport::{Transport, TransportResponse};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Available {
        /// Size of the remote file when the server announced it.
        content_length: Option<u64>,
        accepts_ranges: bool,
    },
    Missing {
        status: u16,
    },
    Unreachable {
        reason: String,
    },
    /// Present but smaller than the provider's minimum, usually an error
    /// page served with status 200.
    TooSmall {
        size: u64,
        min: u64,
    },
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeOutcome::Available { .. })
    }

    pub fn reason(&self) -> String {
        match self {
            ProbeOutcome::Available { .. } => "available".to_string(),
            ProbeOutcome::Missing { status } => format!("HTTP {status}"),
            ProbeOutcome::Unreachable { reason } => reason.clone(),
            ProbeOutcome::TooSmall { size, min } => {
                format!("file is only {size} bytes, expected at least {min}")
            }
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        match self {
            ProbeOutcome::Available { content_length, .. } => *content_length,
            _ => None,
        }
    }

    fn at_least(self, min: Option<u64>) -> Self {
        match (self, min) {
            (
                ProbeOutcome::Available {
                    content_length: Some(size),
                    ..
                },
                Some(min),
            ) if size < min => ProbeOutcome::TooSmall { size, min },
            (outcome, _) => outcome,
        }
    }
}

/// A URL to check on behalf of a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub provider: String,
    pub url: String,
    /// Smallest announced size accepted as the real file.
    pub min_size: Option<u64>,
}

/// The first target that answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHit {
    /// Position in the target list.
    pub position: usize,
    pub outcome: ProbeOutcome,
    /// Targets before `position` that did not have the file.
    pub misses: Vec<ProviderFailure>,
}

#[derive(Clone)]
pub struct Prober {
    transport: Arc<dyn Transport>,
}

impl Prober {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Check whether `url` exists without downloading it.
    ///
    /// Some endpoints block HEAD or answer it with an error even though GET
    /// works; those get a one byte ranged GET instead.
    #[instrument(level = "debug", skip(self))]
    pub async fn probe(&self, url: &str) -> ProbeOutcome {
        match self.transport.head(url).await {
            Ok(resp) if resp.status == 200 => {
                return ProbeOutcome::Available {
                    content_length: resp.total_length.or(resp.content_length),
                    accepts_ranges: resp.accept_ranges,
                };
            }
            Ok(resp) if !head_is_unreliable(resp.status) => {
                return ProbeOutcome::Missing { status: resp.status };
            }
            Ok(resp) => debug!(status = resp.status, "HEAD inconclusive, trying ranged GET"),
            Err(e) => debug!(error = %e, "HEAD failed, trying ranged GET"),
        }

        match self.transport.get(url, &[ByteRange::closed(0, 0)]).await {
            Ok(resp) => ranged_get_outcome(resp),
            Err(e) => ProbeOutcome::Unreachable { reason: e.to_string() },
        }
    }

    pub async fn is_available(&self, url: &str) -> bool {
        self.probe(url).await.is_available()
    }

    /// Probe `targets` in order and stop at the first available one.
    /// Every miss is recorded; when none answers the error lists them all.
    pub async fn first_available(&self, targets: &[ProbeTarget]) -> Result<ProbeHit> {
        let mut attempts = Vec::new();
        for (position, target) in targets.iter().enumerate() {
            let outcome = self.probe(&target.url).await.at_least(target.min_size);
            if outcome.is_available() {
                debug!(provider = %target.provider, url = %target.url, "provider has the file");
                return Ok(ProbeHit {
                    position,
                    outcome,
                    misses: attempts,
                });
            }
            debug!(
                provider = %target.provider,
                url = %target.url,
                reason = %outcome.reason(),
                "provider miss"
            );
            attempts.push(ProviderFailure::new(&target.provider, outcome.reason()));
        }
        Err(Error::NoProviderAvailable { attempts })
    }
}

fn head_is_unreliable(status: u16) -> bool {
    matches!(status, 403 | 404 | 405 | 409 | 429) || (500..600).contains(&status)
}

fn ranged_get_outcome(resp: TransportResponse) -> ProbeOutcome {
    match resp.status {
        200 => ProbeOutcome::Available {
            content_length: resp.total_length.or(resp.content_length),
            accepts_ranges: resp.accept_ranges,
        },
        206 => ProbeOutcome::Available {
            content_length: resp.total_length,
            accepts_ranges: true,
        },
        status => ProbeOutcome::Missing { status },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockTransport;

    fn target(provider: &str, url: &str) -> ProbeTarget {
        ProbeTarget {
            provider: provider.into(),
            url: url.into(),
            min_size: None,
        }
    }

    #[tokio::test]
    async fn head_hit_reports_length() {
        let mock = Arc::new(MockTransport::new());
        mock.serve("https://a.test/f.grib2", vec![0u8; 1234]);
        let prober = Prober::new(mock.clone());

        let outcome = prober.probe("https://a.test/f.grib2").await;
        assert_eq!(
            outcome,
            ProbeOutcome::Available {
                content_length: Some(1234),
                accepts_ranges: true
            }
        );
        assert_eq!(mock.count("GET", "https://a.test/f.grib2"), 0);
    }

    #[tokio::test]
    async fn falls_back_to_ranged_get_when_head_is_refused() {
        let mock = Arc::new(MockTransport::new());
        mock.serve("https://a.test/f.grib2", vec![0u8; 10])
            .head_status("https://a.test/f.grib2", 405);
        let prober = Prober::new(mock.clone());

        assert!(prober.is_available("https://a.test/f.grib2").await);
        assert_eq!(
            mock.requests(),
            vec!["HEAD https://a.test/f.grib2", "GET https://a.test/f.grib2 0-0"]
        );
    }

    #[tokio::test]
    async fn head_error_falls_back_too() {
        let mock = Arc::new(MockTransport::new());
        mock.serve("https://a.test/f", vec![1u8; 4]).fail_next("https://a.test/f", 1);
        let prober = Prober::new(mock.clone());
        assert!(prober.is_available("https://a.test/f").await);
    }

    #[tokio::test]
    async fn missing_everywhere() {
        let mock = Arc::new(MockTransport::new());
        mock.status("https://b.test/f", 410);
        let prober = Prober::new(mock.clone());

        assert_eq!(prober.probe("https://b.test/f").await, ProbeOutcome::Missing { status: 410 });
        // 410 is conclusive, no GET
        assert_eq!(mock.count("GET", "https://b.test/f"), 0);

        let err = prober
            .first_available(&[target("a", "https://a.test/f"), target("b", "https://b.test/f")])
            .await
            .unwrap_err();
        match err {
            Error::NoProviderAvailable { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].provider, "a");
                assert_eq!(attempts[0].reason, "HTTP 404");
                assert_eq!(attempts[1].reason, "HTTP 410");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn first_hit_wins() {
        let mock = Arc::new(MockTransport::new());
        mock.serve("https://b.test/f", vec![0u8; 8]).serve("https://c.test/f", vec![0u8; 8]);
        let prober = Prober::new(mock.clone());

        let hit = prober
            .first_available(&[
                target("a", "https://a.test/f"),
                target("b", "https://b.test/f"),
                target("c", "https://c.test/f"),
            ])
            .await
            .unwrap();
        assert_eq!(hit.position, 1);
        assert_eq!(hit.misses, vec![ProviderFailure::new("a", "HTTP 404")]);
        assert_eq!(mock.count("HEAD", "https://c.test/f"), 0);
    }

    #[tokio::test]
    async fn undersized_file_counts_as_missing() {
        let mock = Arc::new(MockTransport::new());
        mock.serve("https://a.test/f", vec![0u8; 300]).serve("https://b.test/f", vec![0u8; 5000]);
        let prober = Prober::new(mock.clone());

        let stub = ProbeTarget {
            min_size: Some(1000),
            ..target("a", "https://a.test/f")
        };
        let real = ProbeTarget {
            min_size: Some(1000),
            ..target("b", "https://b.test/f")
        };
        let hit = prober.first_available(&[stub, real]).await.unwrap();
        assert_eq!(hit.position, 1);
        assert_eq!(hit.outcome.content_length(), Some(5000));
        assert_eq!(hit.misses.len(), 1);
        assert_eq!(hit.misses[0].reason, "file is only 300 bytes, expected at least 1000");
    }
}

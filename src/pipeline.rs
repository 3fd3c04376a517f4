//! Single-vehicle orchestrator.
//!
//! `idle → resolving → fetching → synthesizing → complete`, with `error`
//! reachable only from `resolving`; identity failure is the one fatal
//! failure. The three source fetches run concurrently and settle
//! individually; a failing branch degrades to its empty/default value and
//! never rejects the join.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::index::PricingIndex;
use crate::internal::InternalEngine;
use crate::llm::LlmClient;
use crate::portals::PortalAggregator;
use crate::registry::{normalize_plate, VehicleRegistry};
use crate::types::{ValuationReport, VehicleAttributes};

/// Everything a run needs, shared across runs and bulk rows.
pub struct Services {
    pub registry: Arc<dyn VehicleRegistry>,
    pub index: Arc<dyn PricingIndex>,
    pub llm: Arc<dyn LlmClient>,
    pub portals: PortalAggregator,
    pub internal: InternalEngine,
}

impl Services {
    /// Wire the live HTTP clients from config.
    pub fn from_config(cfg: &crate::config::Config, pool: sqlx::SqlitePool) -> Result<Arc<Self>> {
        let llm: Arc<dyn LlmClient> =
            Arc::new(crate::llm::HttpLlm::new(&cfg.llm_url, &cfg.llm_model, 300)?);
        Ok(Arc::new(Self {
            registry: Arc::new(crate::registry::HttpRegistry::new(&cfg.registry_url)?),
            index: Arc::new(crate::index::HttpPricingIndex::new(&cfg.pricing_index_url)?),
            portals: PortalAggregator::new(
                Arc::clone(&llm),
                Arc::new(crate::cache::SearchCache::new(cfg.search_cache_capacity)),
                &cfg.marketplace_url,
            ),
            internal: InternalEngine::new(crate::db::sales::SalesRepo::new(pool)),
            llm,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Resolving,
    Fetching,
    Synthesizing,
    Complete,
    Error,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Idle => "idle",
            RunState::Resolving => "resolving",
            RunState::Fetching => "fetching",
            RunState::Synthesizing => "synthesizing",
            RunState::Complete => "complete",
            RunState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// One valuation run. Re-entrant: starting again from complete/error
/// resets all downstream state. Per-run state is private; nothing shared
/// is mutated until the caller's explicit save step.
pub struct ValuationRun {
    services: Arc<Services>,
    state: RunState,
}

impl ValuationRun {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            state: RunState::Idle,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Full pipeline from a plate. `mileage_km` comes from the caller;
    /// registries don't know it.
    pub async fn run(&mut self, plate: &str, mileage_km: u32) -> Result<ValuationReport> {
        self.state = RunState::Resolving;
        let normalized = normalize_plate(plate);
        info!(plate = %normalized, "valuation run started");

        let mut attrs = match self.services.registry.resolve(plate).await {
            Ok(attrs) => attrs,
            Err(e) => {
                self.state = RunState::Error;
                error!(plate = %normalized, "identity resolution failed: {e}");
                return Err(e);
            }
        };
        if mileage_km > 0 {
            attrs.mileage_km = mileage_km;
        }

        Ok(self.fetch_and_synthesize(attrs, Some(normalized)).await)
    }

    /// Pipeline for pre-resolved attributes (bulk rows without a usable
    /// plate). Skips identity resolution; the pricing index needs a plate
    /// and yields nothing without one.
    pub async fn run_with_attributes(&mut self, attrs: VehicleAttributes) -> ValuationReport {
        self.state = RunState::Resolving;
        debug!(vehicle = %attrs.label(), "valuation run from parsed attributes");
        self.fetch_and_synthesize(attrs, None).await
    }

    async fn fetch_and_synthesize(
        &mut self,
        attrs: VehicleAttributes,
        plate: Option<String>,
    ) -> ValuationReport {
        self.state = RunState::Fetching;
        let services = &self.services;

        // Fan-out: each branch settles on its own (success, empty, or
        // degraded); no branch can reject the join.
        let (portal, index, internal) = tokio::join!(
            services.portals.search(&attrs),
            async {
                match &plate {
                    Some(p) => match services.index.lookup(p).await {
                        Ok(result) => result,
                        Err(e) => {
                            warn!("pricing index fetch failed: {e}; continuing without");
                            None
                        }
                    },
                    None => None,
                }
            },
            services.internal.compare(&attrs),
        );

        self.state = RunState::Synthesizing;
        let advice = crate::advice::synthesize(
            services.llm.as_ref(),
            &attrs,
            Some(&portal),
            index.as_ref(),
            &internal,
        )
        .await;

        self.state = RunState::Complete;
        info!(
            vehicle = %attrs.label(),
            recommendation = %advice.recommendation,
            primaries = advice.primary_listing_count,
            "valuation run complete"
        );

        let search_url = portal.search_url.clone();
        ValuationReport {
            plate,
            attributes: attrs,
            portal: Some(portal),
            index,
            internal,
            advice,
            search_url,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::cache::SearchCache;
    use crate::db::sales::{insert_sale, SalesRepo};
    use crate::error::AppError;
    use crate::llm::MockLlm;
    use crate::types::PricingIndexResult;

    pub struct MockRegistry {
        vehicles: HashMap<String, VehicleAttributes>,
    }

    impl MockRegistry {
        pub fn with(entries: Vec<(&str, VehicleAttributes)>) -> Self {
            Self {
                vehicles: entries
                    .into_iter()
                    .map(|(p, a)| (normalize_plate(p), a))
                    .collect(),
            }
        }
    }

    #[async_trait]
    impl VehicleRegistry for MockRegistry {
        async fn resolve(&self, plate: &str) -> Result<VehicleAttributes> {
            self.vehicles
                .get(&normalize_plate(plate))
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("plate {plate} not registered")))
        }
    }

    pub struct MockIndex {
        pub result: Option<PricingIndexResult>,
        pub fail: bool,
    }

    #[async_trait]
    impl PricingIndex for MockIndex {
        async fn lookup(&self, _plate: &str) -> Result<Option<PricingIndexResult>> {
            if self.fail {
                return Err(AppError::Upstream("index unreachable".into()));
            }
            Ok(self.result.clone())
        }
    }

    pub fn golf_attrs() -> VehicleAttributes {
        VehicleAttributes {
            brand: "Volkswagen".into(),
            model: "Golf".into(),
            build_year: Some(2020),
            ..Default::default()
        }
    }

    pub fn golf_index() -> PricingIndexResult {
        PricingIndexResult {
            base_value: 17_500.0,
            option_value: 1_000.0,
            total_value: 18_500.0,
            min_value: Some(17_200.0),
            max_value: Some(19_800.0),
            confidence: Some(0.85),
            apr: Some(0.6),
            etr_days: Some(14),
            liquidity: crate::types::LiquidityClass::High,
        }
    }

    /// Agent reply with 8 primary listings, median 19 200.
    pub fn eight_listing_reply() -> String {
        let prices = [18_600, 18_800, 19_000, 19_100, 19_300, 19_500, 19_700, 19_900];
        let listings: Vec<String> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| {
                format!("{{\"url\": \"https://x/{i}\", \"title\": \"Golf\", \"price\": {p}}}")
            })
            .collect();
        format!("{{\"listings\": [{}]}}", listings.join(", "))
    }

    /// Services wired to mocks plus an in-memory sale history.
    pub async fn mock_services(
        registry: MockRegistry,
        index: MockIndex,
        llm_replies: Vec<String>,
        seed_golf_sales: bool,
    ) -> Arc<Services> {
        let pool = crate::db::connect_memory().await.unwrap();
        if seed_golf_sales {
            let sold = (chrono::Utc::now().date_naive() - chrono::Duration::days(20))
                .format("%Y-%m-%d")
                .to_string();
            let bought = (chrono::Utc::now().date_naive() - chrono::Duration::days(50))
                .format("%Y-%m-%d")
                .to_string();
            for _ in 0..3 {
                // 16% margin
                insert_sale(&pool, "Volkswagen", "Golf", Some(15_000.0), Some(17_400.0),
                    Some(&bought), Some(&sold), "b2c").await;
            }
        }

        let llm: Arc<dyn LlmClient> = Arc::new(if llm_replies.is_empty() {
            MockLlm::unavailable()
        } else {
            MockLlm::with_replies(llm_replies)
        });
        Arc::new(Services {
            registry: Arc::new(registry),
            index: Arc::new(index),
            llm: Arc::clone(&llm),
            portals: PortalAggregator::new(
                Arc::clone(&llm),
                Arc::new(SearchCache::new(8)),
                "https://www.gaspedaal.nl",
            ),
            internal: InternalEngine::new(SalesRepo::new(pool)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::types::{MatchTier, Recommendation};

    #[tokio::test]
    async fn unknown_plate_fails_the_run_from_resolving() {
        let services = mock_services(
            MockRegistry::with(vec![]),
            MockIndex { result: None, fail: false },
            vec!["{}".into()],
            false,
        )
        .await;

        let mut run = ValuationRun::new(services);
        let result = run.run("ZZ-999-Z", 0).await;
        assert!(result.is_err());
        assert_eq!(run.state(), RunState::Error);
    }

    #[tokio::test]
    async fn golf_scenario_end_to_end() {
        let services = mock_services(
            MockRegistry::with(vec![("AB-123-C", golf_attrs())]),
            MockIndex { result: Some(golf_index()), fail: false },
            // first reply feeds the portal agent, second the synthesizer
            vec![eight_listing_reply(), "not json, use the baseline".into()],
            true,
        )
        .await;

        let mut run = ValuationRun::new(services);
        let report = run.run("AB-123-C", 60_000).await.unwrap();

        assert_eq!(run.state(), RunState::Complete);
        assert_eq!(report.plate.as_deref(), Some("AB123C"));
        assert_eq!(report.attributes.mileage_km, 60_000);

        let portal = report.portal.as_ref().unwrap();
        assert_eq!(portal.primary_count, 8);
        assert_eq!(portal.median_price, Some(19_200.0));

        assert_eq!(report.internal.match_tier, MatchTier::MatchedByModel);
        assert!((report.internal.avg_margin_pct - 16.0).abs() < 0.01);

        assert_eq!(report.advice.recommendation, Recommendation::Buy);
        let purchase = report.advice.recommended_purchase_price.unwrap();
        assert!(purchase < 18_500.0 * 0.9);
        assert_eq!(report.advice.primary_listing_count, 8);
    }

    #[tokio::test]
    async fn failing_parallel_sources_degrade_not_fail() {
        let services = mock_services(
            MockRegistry::with(vec![("AB-123-C", golf_attrs())]),
            MockIndex { result: None, fail: true },
            Vec::new(), // LLM down: portal empty, synthesis deterministic
            false,
        )
        .await;

        let mut run = ValuationRun::new(services);
        let report = run.run("AB-123-C", 60_000).await.unwrap();

        assert_eq!(run.state(), RunState::Complete);
        assert!(report.index.is_none());
        assert!(!report.portal.as_ref().unwrap().has_primaries());
        assert_eq!(report.advice.recommendation, Recommendation::Uncertain);
    }

    #[tokio::test]
    async fn run_is_reentrant_after_error() {
        let services = mock_services(
            MockRegistry::with(vec![("AB-123-C", golf_attrs())]),
            MockIndex { result: Some(golf_index()), fail: false },
            vec![eight_listing_reply(), "garbage".into()],
            true,
        )
        .await;

        let mut run = ValuationRun::new(services);
        assert!(run.run("ZZ-999-Z", 0).await.is_err());
        assert_eq!(run.state(), RunState::Error);

        let report = run.run("AB-123-C", 60_000).await.unwrap();
        assert_eq!(run.state(), RunState::Complete);
        assert_eq!(report.advice.recommendation, Recommendation::Buy);
    }

    #[tokio::test]
    async fn attribute_runs_skip_identity_and_index() {
        let services = mock_services(
            MockRegistry::with(vec![]),
            MockIndex { result: Some(golf_index()), fail: false },
            vec![eight_listing_reply(), "garbage".into()],
            true,
        )
        .await;

        let mut run = ValuationRun::new(services);
        let mut attrs = golf_attrs();
        attrs.mileage_km = 60_000;
        let report = run.run_with_attributes(attrs).await;

        assert_eq!(run.state(), RunState::Complete);
        assert!(report.plate.is_none());
        // no plate → the index is never consulted
        assert!(report.index.is_none());
        // portal + internal still count as two signals
        assert_eq!(report.advice.recommendation, Recommendation::Buy);
    }
}

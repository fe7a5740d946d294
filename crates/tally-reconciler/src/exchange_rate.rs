// Copyright (C) 2025 Tally Billing contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Exchange rate reconciliation.
//!
//! For the two periods before the current one and each target currency, the
//! controller inserts upstream rates whose source currency has no local row
//! yet. It never updates or deletes, so repeating a pass is a no-op.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tally_core::persistence::{NewExchangeRate, columns};
use tally_core::{Filter, Period, Store};
use tracing::{debug, error, info};

use crate::clients::{PeriodRate, RateSource};
use crate::error::Result;
use crate::worker::Activity;

/// Periods reconciled before the current one.
const LOOKBACK_PERIODS: usize = 2;

/// Currencies the controller reconciles.
#[derive(Debug, Clone)]
pub struct ExchangeRateConfig {
    /// Target currencies.
    pub target_currencies: Vec<String>,
    /// Optional allow-list of source currencies.
    pub source_currencies: Option<Vec<String>>,
}

impl Default for ExchangeRateConfig {
    fn default() -> Self {
        Self {
            target_currencies: vec!["CNY".to_string(), "USD".to_string()],
            source_currencies: None,
        }
    }
}

/// Diff-and-create reconciler for `exchange_rates`.
pub struct ExchangeRateController {
    store: Arc<dyn Store>,
    source: Arc<dyn RateSource>,
    config: ExchangeRateConfig,
}

impl ExchangeRateController {
    /// Create a controller. Currency codes are trimmed, upper-cased and
    /// deduplicated.
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn RateSource>,
        config: ExchangeRateConfig,
    ) -> Self {
        let config = ExchangeRateConfig {
            target_currencies: normalize_currencies(config.target_currencies),
            source_currencies: config.source_currencies.map(normalize_currencies),
        };
        Self {
            store,
            source,
            config,
        }
    }

    /// Reconcile relative to today. Returns the number of rows inserted.
    pub async fn reconcile(&self) -> Result<u64> {
        self.reconcile_at(Utc::now().date_naive()).await
    }

    /// Reconcile relative to `today`.
    ///
    /// A failure for one {period, target} is logged and the others still run.
    pub async fn reconcile_at(&self, today: NaiveDate) -> Result<u64> {
        let mut inserted = 0;
        for period in Period::containing(today).preceding(LOOKBACK_PERIODS) {
            for target in &self.config.target_currencies {
                match self.reconcile_target(period, target).await {
                    Ok(count) => inserted += count,
                    Err(e) => error!(
                        period = %period,
                        to_currency = %target,
                        error = %e,
                        "Failed to reconcile exchange rates"
                    ),
                }
            }
        }
        Ok(inserted)
    }

    async fn reconcile_target(&self, period: Period, target: &str) -> Result<u64> {
        let existing: HashSet<String> = self
            .store
            .list_exchange_rates(
                &Filter::new()
                    .eq(columns::PERIOD, period.to_string())
                    .eq(columns::TO_CURRENCY, target),
            )
            .await?
            .into_iter()
            .map(|rate| rate.from_currency)
            .collect();

        let mut seen = HashSet::new();
        let missing: Vec<NewExchangeRate> = self
            .fetch(period, target)
            .await?
            .into_iter()
            .map(|rate| PeriodRate {
                from_currency: rate.from_currency.trim().to_ascii_uppercase(),
                to_currency: rate.to_currency.trim().to_ascii_uppercase(),
                rate: rate.rate,
            })
            .filter(|rate| rate.to_currency == target && rate.from_currency != target)
            .filter(|rate| !existing.contains(&rate.from_currency))
            .filter(|rate| seen.insert(rate.from_currency.clone()))
            .map(|rate| NewExchangeRate {
                period,
                from_currency: rate.from_currency,
                to_currency: rate.to_currency,
                rate: rate.rate,
            })
            .collect();

        if missing.is_empty() {
            debug!(period = %period, to_currency = target, "Exchange rates up to date");
            return Ok(0);
        }

        let inserted = self.store.insert_exchange_rates(&missing).await?;
        info!(
            period = %period,
            to_currency = target,
            missing = missing.len(),
            inserted,
            "Inserted exchange rates"
        );
        Ok(inserted)
    }

    async fn fetch(&self, period: Period, target: &str) -> Result<Vec<PeriodRate>> {
        let Some(sources) = &self.config.source_currencies else {
            return Ok(self.source.list_period_rates(None, target, period).await?);
        };

        let mut rates = Vec::new();
        for from in sources.iter().filter(|from| from.as_str() != target) {
            rates.extend(
                self.source
                    .list_period_rates(Some(from), target, period)
                    .await?,
            );
        }
        Ok(rates)
    }
}

fn normalize_currencies(codes: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    codes
        .into_iter()
        .map(|code| code.trim().to_ascii_uppercase())
        .filter(|code| !code.is_empty())
        .filter(|code| seen.insert(code.clone()))
        .collect()
}

#[async_trait]
impl Activity for ExchangeRateController {
    fn name(&self) -> &'static str {
        "exchange_rate"
    }

    async fn tick(&self) -> Result<()> {
        let inserted = self.reconcile().await?;
        debug!(inserted, "Exchange rate pass finished");
        Ok(())
    }
}

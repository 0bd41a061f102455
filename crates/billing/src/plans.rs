//! Plan catalog: the pure mapping from Stripe price ids to internal tiers.
//!
//! Tier resolution is keyed strictly by price id. An unmapped price id is an
//! explicit `UnknownPlan` error, never a guessed fallback tier, and never an
//! amount-based heuristic.

use std::collections::HashMap;

use draftly_shared::SubscriptionTier;

use crate::error::{BillingError, BillingResult};

/// What a price id resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlan {
    pub tier: SubscriptionTier,
    pub amount_cents: i64,
    pub currency: &'static str,
    pub billing_interval: &'static str,
}

/// Side-effect-free price id lookup table.
///
/// Built once at startup; handlers receive a shared reference so tier
/// mapping stays deterministic and testable without any I/O.
#[derive(Debug, Clone, Default)]
pub struct PlanCatalog {
    plans: HashMap<String, ResolvedPlan>,
}

impl PlanCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard Draftly price table.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.insert(
            "price_starter",
            ResolvedPlan {
                tier: SubscriptionTier::Starter,
                amount_cents: 4700,
                currency: "usd",
                billing_interval: "month",
            },
        );
        catalog.insert(
            "price_pro",
            ResolvedPlan {
                tier: SubscriptionTier::Pro,
                amount_cents: 9700,
                currency: "usd",
                billing_interval: "month",
            },
        );
        catalog.insert(
            "price_vault",
            ResolvedPlan {
                tier: SubscriptionTier::Vault,
                amount_cents: 29700,
                currency: "usd",
                billing_interval: "month",
            },
        );
        catalog
    }

    /// Build the catalog from the environment.
    ///
    /// `STRIPE_PRICE_STARTER` / `STRIPE_PRICE_PRO` / `STRIPE_PRICE_VAULT`
    /// override the live price ids while keeping the builtin ids mapped, so
    /// test-mode and live-mode events both resolve.
    pub fn from_env() -> Self {
        let mut catalog = Self::builtin();
        for (var, builtin_id) in [
            ("STRIPE_PRICE_STARTER", "price_starter"),
            ("STRIPE_PRICE_PRO", "price_pro"),
            ("STRIPE_PRICE_VAULT", "price_vault"),
        ] {
            if let Ok(price_id) = std::env::var(var) {
                if !price_id.is_empty() {
                    if let Some(plan) = catalog.plans.get(builtin_id).cloned() {
                        catalog.insert(&price_id, plan);
                    }
                }
            }
        }
        catalog
    }

    pub fn insert(&mut self, price_id: &str, plan: ResolvedPlan) {
        self.plans.insert(price_id.to_string(), plan);
    }

    /// Resolve a price id to its plan.
    pub fn resolve(&self, price_id: &str) -> BillingResult<&ResolvedPlan> {
        self.plans
            .get(price_id)
            .ok_or_else(|| BillingError::UnknownPlan {
                price_id: price_id.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}

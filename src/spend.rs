//! Spend ceiling enforcement.
//!
//! Committed cost is the full-rate unit cost of every open resource the
//! identity owns (stopped ones included), every pending spot request, and
//! every launch reservation not yet reconciled. A request is approved when
//! `committed + proposed <= limit`.
//!
//! [`SpendGuard::authorize`] only answers the question;
//! [`SpendGuard::reserve`] answers it and holds the cost in the same ledger
//! transaction, which is what launches go through.

use tracing::{debug, info};

use crate::cost::CostModel;
use crate::error::{Error, Result};
use crate::ledger::{Reservation, UsageLedger};

/// Slack for float sums that land exactly on the ceiling.
const EPSILON: f64 = 1e-9;

/// What the caller wants to launch, as far as spending is concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    /// Resource class (instance type).
    pub resource_class: String,
    /// Number of resources.
    pub count: u32,
    /// Whether this is a spot request.
    pub uses_spot: bool,
    /// Launch credential (key pair) name; must belong to the identity.
    pub key_name: String,
}

/// A granted request with the amounts that were checked.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Approval {
    /// Cost already committed before this request.
    pub current: f64,
    /// Cost of this request.
    pub proposed: f64,
    /// Ceiling it was checked against.
    pub limit: f64,
}

/// Accepts or rejects resource requests against a per-identity ceiling.
#[derive(Debug, Clone)]
pub struct SpendGuard {
    ledger: UsageLedger,
    cost: CostModel,
    limit: f64,
}

impl SpendGuard {
    /// Guard backed by `ledger` with the given cost table and ceiling.
    pub fn new(ledger: UsageLedger, cost: CostModel, limit: f64) -> Self {
        Self {
            ledger,
            cost,
            limit,
        }
    }

    /// Ledger the committed cost is read from.
    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Cost model used for pricing.
    pub fn cost_model(&self) -> &CostModel {
        &self.cost
    }

    /// Configured ceiling.
    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Full-rate cost `identity` currently has committed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Database`] on storage failure.
    pub async fn committed_cost(&self, identity: &str) -> Result<f64> {
        Ok(self.sum(&self.ledger.committed_classes(identity).await?))
    }

    /// Check `request` for `identity` without holding anything.
    ///
    /// Spot requests are charged at the full rate; the discount only applies
    /// to reporting.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for a zero count
    /// - [`Error::IdentityMismatch`] if the key name does not parse to `identity`
    /// - [`Error::UnknownResourceClass`] if the class has no unit cost
    /// - [`Error::OverBudget`] if the ceiling would be exceeded
    pub async fn authorize(&self, identity: &str, request: &ResourceRequest) -> Result<Approval> {
        self.validate(identity, request)?;
        let committed = self.ledger.committed_classes(identity).await?;
        self.check(identity, request, &committed)
    }

    /// Check `request` and, if approved, reserve its cost in the ledger
    /// before returning. Concurrent callers serialize on the ledger's write
    /// lock, so each sees the reservations of the ones before it.
    ///
    /// # Errors
    ///
    /// Same as [`Self::authorize`]; nothing is reserved on error.
    pub async fn reserve(
        &self,
        identity: &str,
        request: &ResourceRequest,
    ) -> Result<(Approval, Reservation)> {
        self.validate(identity, request)?;
        self.ledger
            .reserve(identity, &request.resource_class, request.count, |committed| {
                self.check(identity, request, committed)
            })
            .await
    }

    fn validate(&self, identity: &str, request: &ResourceRequest) -> Result<()> {
        if request.count == 0 {
            return Err(Error::InvalidRequest("resource count must be positive".to_owned()));
        }
        if !self.ledger.naming().belongs_to(&request.key_name, identity) {
            return Err(Error::IdentityMismatch {
                identity: identity.to_owned(),
                credential: request.key_name.clone(),
            });
        }
        Ok(())
    }

    fn check(
        &self,
        identity: &str,
        request: &ResourceRequest,
        committed: &[String],
    ) -> Result<Approval> {
        let proposed = self
            .cost
            .authorization_cost(&request.resource_class, request.count)
            .ok_or_else(|| Error::UnknownResourceClass(request.resource_class.clone()))?;
        let current = self.sum(committed);

        debug!(identity, current, proposed, limit = self.limit, "checking spend");
        if current + proposed > self.limit + EPSILON {
            return Err(Error::OverBudget {
                identity: identity.to_owned(),
                current,
                proposed,
                limit: self.limit,
            });
        }

        info!(
            identity,
            class = %request.resource_class,
            count = request.count,
            spot = request.uses_spot,
            "spend approved"
        );
        Ok(Approval {
            current,
            proposed,
            limit: self.limit,
        })
    }

    fn sum(&self, classes: &[String]) -> f64 {
        classes
            .iter()
            .map(|class| self.cost.committed_unit_cost(class))
            .sum()
    }
}

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::common::errors::{Result, TraderError};
use crate::common::types::Holding;
use crate::config::types::TradingConfig;

/// Fills within this fraction of a cumulative target count as reaching it.
const TRANCHE_TOLERANCE: Decimal = dec!(0.95);

/// Weight schedule for sequential entries into one symbol
///
/// `cumulative_ratios()[i]` is the fraction of the symbol's ceiling that
/// should be deployed once tranche `i + 1` has executed; the last entry is
/// always exactly one.
#[derive(Debug, Clone, PartialEq)]
pub struct TranchePlan {
    weights: Vec<Decimal>,
    cumulative: Vec<Decimal>,
}

impl TranchePlan {
    /// Doubling schedule `1, 1, 2, 2, 4, 4, ...` of `split_count` tranches.
    pub fn geometric(split_count: usize) -> Result<Self> {
        let weights = (0..split_count)
            .map(|i| Decimal::from(1u64 << (i / 2).min(62)))
            .collect();
        Self::from_weights(weights)
    }

    pub fn from_weights(weights: Vec<Decimal>) -> Result<Self> {
        if weights.is_empty() {
            return Err(TraderError::Configuration(
                "tranche plan needs at least one weight".into(),
            ));
        }
        if weights.iter().any(|w| *w <= Decimal::ZERO) {
            return Err(TraderError::Configuration(
                "tranche weights must be positive".into(),
            ));
        }

        let total: Decimal = weights.iter().copied().sum();
        let mut running = Decimal::ZERO;
        let cumulative = weights
            .iter()
            .map(|w| {
                running += *w;
                running / total
            })
            .collect();

        Ok(Self {
            weights,
            cumulative,
        })
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> &[Decimal] {
        &self.weights
    }

    pub fn cumulative_ratios(&self) -> &[Decimal] {
        &self.cumulative
    }

    /// Deployed fraction once `tranche` tranches have executed.
    ///
    /// Tranche 0 is nothing deployed; anything past the plan is everything.
    pub fn cumulative_ratio(&self, tranche: usize) -> Decimal {
        match tranche {
            0 => Decimal::ZERO,
            t if t >= self.cumulative.len() => Decimal::ONE,
            t => self.cumulative[t - 1],
        }
    }
}

/// Capital available to one symbol this session
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub ceiling_per_symbol: Decimal,
    pub cumulative_ratios: Vec<Decimal>,
}

impl Allocation {
    /// A non-positive ceiling means nothing may be bought.
    pub fn can_enter(&self) -> bool {
        self.ceiling_per_symbol > Decimal::ZERO
    }

    /// Notional that should be deployed once `tranche` has executed.
    pub fn target_notional(&self, tranche: usize) -> Decimal {
        let ratio = match tranche {
            0 => Decimal::ZERO,
            t if t >= self.cumulative_ratios.len() => Decimal::ONE,
            t => self.cumulative_ratios[t - 1],
        };
        self.ceiling_per_symbol * ratio
    }
}

/// Turns account equity into per-symbol ceilings and tranche targets
///
/// Equity is measured on a cost basis (deposit plus purchase cost of open
/// positions) so that price swings never move the schedule.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    capital_ratio: Decimal,
    target_count: u32,
    plan: TranchePlan,
}

impl PositionSizer {
    /// `capital_ratio` is a fraction (0.7 for 70%).
    pub fn new(capital_ratio: Decimal, target_count: u32, plan: TranchePlan) -> Self {
        Self {
            capital_ratio,
            target_count: target_count.max(1),
            plan,
        }
    }

    pub fn from_config(config: &TradingConfig) -> Result<Self> {
        let plan = TranchePlan::geometric(config.split_count)?;
        Ok(Self::new(
            config.capital_ratio(),
            config.target_symbol_count,
            plan,
        ))
    }

    pub fn plan(&self) -> &TranchePlan {
        &self.plan
    }

    pub fn target_count(&self) -> u32 {
        self.target_count
    }

    /// Deposit plus what the open positions cost to buy.
    pub fn cost_basis_equity(deposit: Decimal, holdings: &[Holding]) -> Decimal {
        deposit + holdings.iter().map(Holding::cost_basis).sum::<Decimal>()
    }

    /// Ceiling and cumulative table for the given equity.
    pub fn allocate(&self, total_equity: Decimal) -> Allocation {
        allocate(total_equity, self.capital_ratio, self.target_count, &self.plan)
    }

    /// Tranche index implied by what is already deployed.
    ///
    /// A single share is always tranche 1; otherwise the index is the number
    /// of cumulative targets reached (within tolerance), never more than the
    /// share count.
    pub fn estimate_tranche(&self, quantity: u64, deployed: Decimal, ceiling: Decimal) -> usize {
        match quantity {
            0 => 0,
            1 => 1,
            _ if ceiling <= Decimal::ZERO => 1,
            _ => {
                let filled = deployed / ceiling;
                let reached = self
                    .plan
                    .cumulative_ratios()
                    .iter()
                    .take_while(|ratio| filled >= **ratio * TRANCHE_TOLERANCE)
                    .count();
                let by_quantity = usize::try_from(quantity).unwrap_or(usize::MAX);
                reached.max(1).min(by_quantity).min(self.plan.len())
            }
        }
    }

    /// Current tranche of an open position.
    ///
    /// Confirmed fill history wins over the cost-ratio estimate unless the
    /// position is a single share.
    pub fn current_tranche(&self, holding: &Holding, ceiling: Decimal) -> usize {
        if holding.quantity == 1 {
            return 1;
        }
        let estimated = self.estimate_tranche(holding.quantity, holding.cost_basis(), ceiling);
        holding.tranche_index.max(estimated).min(self.plan.len())
    }
}

/// Pure sizing function.
///
/// `target_count` below one is treated as one; a zero or negative result
/// yields an allocation on which [`Allocation::can_enter`] is false.
pub fn allocate(
    total_equity: Decimal,
    capital_ratio: Decimal,
    target_count: u32,
    plan: &TranchePlan,
) -> Allocation {
    let count = Decimal::from(target_count.max(1));
    let ceiling = total_equity * capital_ratio / count;
    Allocation {
        ceiling_per_symbol: ceiling.max(Decimal::ZERO),
        cumulative_ratios: plan.cumulative_ratios().to_vec(),
    }
}

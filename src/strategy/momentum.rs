//! RSI-based strength indicator

use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};

use super::traits::StrengthIndicator;

/// Relative strength index over the last `period` price changes.
///
/// Exhaustion means the index was at or above the overbought level one
/// sample ago and has now dropped below it.
#[derive(Debug, Clone)]
pub struct RsiGauge {
    period: usize,
    overbought: Decimal,
    samples: HashMap<String, VecDeque<Decimal>>,
}

impl RsiGauge {
    pub fn new(period: usize, overbought: Decimal) -> Self {
        Self {
            period: period.max(2),
            overbought,
            samples: HashMap::new(),
        }
    }

    /// Current RSI, if enough samples exist
    pub fn rsi(&self, symbol: &str) -> Option<Decimal> {
        let prices = self.samples.get(symbol)?;
        let n = prices.len();
        if n < self.period + 1 {
            return None;
        }
        Some(rsi_of(prices.iter().skip(n - self.period - 1)))
    }

    fn previous_rsi(&self, symbol: &str) -> Option<Decimal> {
        let prices = self.samples.get(symbol)?;
        let n = prices.len();
        if n < self.period + 2 {
            return None;
        }
        Some(rsi_of(
            prices.iter().skip(n - self.period - 2).take(self.period + 1),
        ))
    }
}

fn rsi_of<'a>(prices: impl Iterator<Item = &'a Decimal>) -> Decimal {
    let mut gains = Decimal::ZERO;
    let mut losses = Decimal::ZERO;
    let mut last: Option<Decimal> = None;
    for price in prices {
        if let Some(prev) = last {
            let change = *price - prev;
            if change > Decimal::ZERO {
                gains += change;
            } else {
                losses -= change;
            }
        }
        last = Some(*price);
    }

    if losses.is_zero() {
        return if gains.is_zero() {
            Decimal::from(50)
        } else {
            Decimal::ONE_HUNDRED
        };
    }
    let rs = gains / losses;
    Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs)
}

impl StrengthIndicator for RsiGauge {
    fn record(&mut self, symbol: &str, price: Decimal) {
        if price <= Decimal::ZERO {
            return;
        }
        let window = self.period + 2;
        let prices = self.samples.entry(symbol.to_string()).or_default();
        prices.push_back(price);
        while prices.len() > window {
            prices.pop_front();
        }
    }

    fn is_exhausted(&self, symbol: &str) -> bool {
        match (self.previous_rsi(symbol), self.rsi(symbol)) {
            (Some(prev), Some(now)) => prev >= self.overbought && now < self.overbought,
            _ => false,
        }
    }

    fn forget(&mut self, symbol: &str) {
        self.samples.remove(symbol);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rsi_extremes() {
        let mut gauge = RsiGauge::new(3, dec!(70));
        for p in [dec!(100), dec!(101), dec!(102), dec!(103)] {
            gauge.record("A", p);
        }
        assert_eq!(gauge.rsi("A"), Some(dec!(100)));

        for p in [dec!(100), dec!(100), dec!(100), dec!(100)] {
            gauge.record("B", p);
        }
        assert_eq!(gauge.rsi("B"), Some(dec!(50)));
        assert_eq!(gauge.rsi("C"), None);
    }

    #[test]
    fn test_exhaustion_after_overbought_rollover() {
        let mut gauge = RsiGauge::new(3, dec!(70));
        for p in [dec!(100), dec!(101), dec!(102), dec!(103)] {
            gauge.record("A", p);
        }
        assert!(!gauge.is_exhausted("A"));

        // window becomes 101,102,103,99: gains 2, losses 4
        gauge.record("A", dec!(99));
        assert!(gauge.is_exhausted("A"));
    }

    #[test]
    fn test_forget_clears_history() {
        let mut gauge = RsiGauge::new(2, dec!(70));
        for p in [dec!(10), dec!(11), dec!(12)] {
            gauge.record("A", p);
        }
        assert!(gauge.rsi("A").is_some());
        gauge.forget("A");
        assert!(gauge.rsi("A").is_none());
    }
}

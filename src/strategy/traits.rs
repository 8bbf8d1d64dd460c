use rust_decimal::Decimal;

/// Short-term strength indicator driving the momentum partial exit
///
/// Implementations own their price history. The exit engine feeds one
/// sample per symbol per cycle and asks whether the move is exhausted.
///
/// # Example
///
/// ```ignore
/// struct VolumeFade { /* ... */ }
///
/// impl StrengthIndicator for VolumeFade {
///     fn record(&mut self, symbol: &str, price: Decimal) { /* ... */ }
///     fn is_exhausted(&self, symbol: &str) -> bool { false }
///     fn forget(&mut self, symbol: &str) { /* ... */ }
/// }
/// ```
pub trait StrengthIndicator: Send + Sync {
    /// Add the latest price for `symbol`
    fn record(&mut self, symbol: &str, price: Decimal);

    /// Whether the recent move has run out of strength
    fn is_exhausted(&self, symbol: &str) -> bool;

    /// Drop all history for `symbol`
    fn forget(&mut self, symbol: &str);
}

/// Boxed indicator for dynamic dispatch
pub type BoxedIndicator = Box<dyn StrengthIndicator>;

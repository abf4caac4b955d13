//! Technical indicators over close-price series.
//!
//! Every series is ordered most-recent-first: `prices[0]` is the latest
//! close. All functions are pure and return `None` when the series is too
//! short for the requested period.

/// Default RSI look-back.
pub const RSI_PERIOD: usize = 14;

/// RSI above this is overbought.
pub const RSI_OVERBOUGHT: f64 = 70.0;

/// RSI below this is oversold.
pub const RSI_OVERSOLD: f64 = 30.0;

/// Mean of the `period` most recent prices.
pub fn simple_moving_average(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: f64 = prices.iter().take(period).sum();
    Some(sum / period as f64)
}

/// Relative Strength Index over the `period + 1` most recent prices.
///
/// Each delta is newer minus older. Gains and losses are plain sums (no
/// smoothing), and a window with no losses reads as 100.
pub fn relative_strength_index(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let (gains, losses) = prices[..=period]
        .windows(2)
        .map(|w| w[0] - w[1])
        .fold((0.0, 0.0), |(g, l), delta| {
            if delta > 0.0 {
                (g + delta, l)
            } else {
                (g, l - delta)
            }
        });

    if losses == 0.0 {
        return Some(100.0);
    }
    let rs = gains / losses;
    Some(100.0 - 100.0 / (1.0 + rs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma_basic() {
        let prices = [5.0, 4.0, 3.0, 2.0, 1.0];
        assert_eq!(simple_moving_average(&prices, 5), Some(3.0));
        // Only the most recent two count.
        assert_eq!(simple_moving_average(&prices, 2), Some(4.5));
    }

    #[test]
    fn test_sma_undefined() {
        assert_eq!(simple_moving_average(&[1.0, 2.0], 3), None);
        assert_eq!(simple_moving_average(&[1.0, 2.0], 0), None);
        assert_eq!(simple_moving_average(&[], 1), None);
    }

    #[test]
    fn test_rsi_needs_period_plus_one() {
        let prices = vec![10.0; 14];
        assert_eq!(relative_strength_index(&prices, 14), None);
        assert_eq!(relative_strength_index(&prices, 0), None);
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        // Newest first, strictly rising over time.
        let prices: Vec<f64> = (0..15).rev().map(|i| 100.0 + i as f64).collect();
        assert_eq!(relative_strength_index(&prices, 14), Some(100.0));
    }

    #[test]
    fn test_rsi_flat_is_100() {
        let prices = vec![50.0; 20];
        assert_eq!(relative_strength_index(&prices, 14), Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses_is_zero() {
        // Newest first, strictly falling over time.
        let prices: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        assert_eq!(relative_strength_index(&prices, 14), Some(0.0));
    }

    #[test]
    fn test_rsi_balanced_is_50() {
        let prices: Vec<f64> = (0..15)
            .map(|i| if i % 2 == 0 { 110.0 } else { 100.0 })
            .collect();
        let rsi = relative_strength_index(&prices, 14).unwrap();
        assert!((rsi - 50.0).abs() < 1e-9, "rsi = {rsi}");
    }

    #[test]
    fn test_rsi_ignores_older_samples() {
        let mut prices: Vec<f64> = (0..15).rev().map(|i| 100.0 + i as f64).collect();
        // A crash further back than the window does not count.
        prices.extend([1_000.0, 1.0, 1_000.0]);
        assert_eq!(relative_strength_index(&prices, 14), Some(100.0));
    }

    #[test]
    fn test_rsi_in_range() {
        let prices = [
            44.3, 44.1, 44.6, 43.9, 44.2, 45.1, 44.8, 45.4, 45.0, 44.7, 45.2, 45.9, 46.1, 45.6,
            46.3, 46.0,
        ];
        let rsi = relative_strength_index(&prices, 14).unwrap();
        assert!((0.0..=100.0).contains(&rsi));
    }
}

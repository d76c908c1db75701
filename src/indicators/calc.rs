/// Technical indicators implementation
///
/// Every function takes an ascending series whose last element is the bar
/// being evaluated, and returns `None` only when the series is too short.
use rust_decimal::prelude::ToPrimitive;

use crate::types::Bar;

/// Price fields of a bar as floats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ohlc {
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl From<&Bar> for Ohlc {
    fn from(bar: &Bar) -> Self {
        Ohlc {
            high: bar.high.to_f64().unwrap_or_default(),
            low: bar.low.to_f64().unwrap_or_default(),
            close: bar.close.to_f64().unwrap_or_default(),
        }
    }
}

fn true_range(current: &Ohlc, previous: &Ohlc) -> f64 {
    (current.high - current.low)
        .max(f64::abs(current.high - previous.close))
        .max(f64::abs(current.low - previous.close))
}

/// Wilder's smoothing (EMA-like with 1/period factor)
fn wilder_smooth(values: &[f64], period: usize) -> Option<f64> {
    wilder_series(values, period).last().copied()
}

/// Every smoothed value, the first one being the plain average of `period` values
fn wilder_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let mut smoothed: f64 = values.iter().take(period).sum::<f64>() / period as f64;
    let mut series = Vec::with_capacity(values.len() - period + 1);
    series.push(smoothed);

    for value in &values[period..] {
        smoothed = ((period - 1) as f64 * smoothed + value) / period as f64;
        series.push(smoothed);
    }

    series
}

/// Calculate RSI (Relative Strength Index) over the last `period` changes
pub fn calculate_rsi(bars: &[Ohlc], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut gain = 0.0;
    let mut loss = 0.0;

    for pair in bars[bars.len() - period - 1..].windows(2) {
        let change = pair[1].close - pair[0].close;
        if change > 0.0 {
            gain += change;
        } else {
            loss += change.abs();
        }
    }

    let avg_gain = gain / period as f64;
    let avg_loss = loss / period as f64;

    if avg_loss == 0.0 {
        // Flat series is neutral, a pure uptrend is maximal
        return Some(if avg_gain == 0.0 { 50.0 } else { 100.0 });
    }

    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Calculate EMA (Exponential Moving Average), seeded with the SMA of the first `period` closes
pub fn calculate_ema(bars: &[Ohlc], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let mut ema: f64 = bars[..period].iter().map(|b| b.close).sum::<f64>() / period as f64;
    let multiplier = 2.0 / (period as f64 + 1.0);

    for bar in &bars[period..] {
        ema = (bar.close - ema) * multiplier + ema;
    }

    Some(ema)
}

/// Calculate SMA (Simple Moving Average)
pub fn calculate_sma(bars: &[Ohlc], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period {
        return None;
    }

    let sum: f64 = bars.iter().rev().take(period).map(|b| b.close).sum();
    Some(sum / period as f64)
}

/// Calculate ATR (Average True Range)
pub fn calculate_atr(bars: &[Ohlc], period: usize) -> Option<f64> {
    if bars.len() < period + 1 {
        return None;
    }

    let tr_values: Vec<f64> = bars.windows(2).map(|w| true_range(&w[1], &w[0])).collect();
    wilder_smooth(&tr_values, period)
}

/// ADX with +DI and -DI
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adx {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

/// Calculate ADX (Average Directional Index). Needs `2 * period` bars: one
/// period to seed the directional smoothing and one to average DX.
pub fn calculate_adx(bars: &[Ohlc], period: usize) -> Option<Adx> {
    if period == 0 || bars.len() < 2 * period {
        return None;
    }

    let mut tr_values = Vec::with_capacity(bars.len() - 1);
    let mut plus_dm = Vec::with_capacity(bars.len() - 1);
    let mut minus_dm = Vec::with_capacity(bars.len() - 1);

    for w in bars.windows(2) {
        let (prev, current) = (&w[0], &w[1]);
        tr_values.push(true_range(current, prev));

        let up_move = current.high - prev.high;
        let down_move = prev.low - current.low;

        plus_dm.push(if up_move > down_move && up_move > 0.0 {
            up_move
        } else {
            0.0
        });
        minus_dm.push(if down_move > up_move && down_move > 0.0 {
            down_move
        } else {
            0.0
        });
    }

    let smoothed_tr = wilder_series(&tr_values, period);
    let smoothed_plus = wilder_series(&plus_dm, period);
    let smoothed_minus = wilder_series(&minus_dm, period);

    let mut dx_values = Vec::with_capacity(smoothed_tr.len());
    let mut plus_di = 0.0;
    let mut minus_di = 0.0;

    for ((tr, plus), minus) in smoothed_tr.iter().zip(&smoothed_plus).zip(&smoothed_minus) {
        (plus_di, minus_di) = if *tr == 0.0 {
            (0.0, 0.0)
        } else {
            ((plus / tr) * 100.0, (minus / tr) * 100.0)
        };

        let di_sum = plus_di + minus_di;
        let dx = if di_sum == 0.0 {
            0.0
        } else {
            (f64::abs(plus_di - minus_di) / di_sum) * 100.0
        };
        dx_values.push(dx);
    }

    let adx = wilder_smooth(&dx_values, period)?;

    Some(Adx {
        adx,
        plus_di,
        minus_di,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_series(count: usize) -> Vec<Ohlc> {
        (0..count)
            .map(|i| Ohlc {
                high: 1.1010 + i as f64 * 0.001,
                low: 1.0990 + i as f64 * 0.001,
                close: 1.1005 + i as f64 * 0.001,
            })
            .collect()
    }

    #[test]
    fn test_rsi() {
        let bars = create_test_series(15);
        let rsi = calculate_rsi(&bars, 14).unwrap();
        // Monotonic uptrend
        assert_eq!(rsi, 100.0);
        assert!(calculate_rsi(&bars[..14], 14).is_none());
    }

    #[test]
    fn test_rsi_bounds_on_mixed_series() {
        let closes = [1.0, 1.2, 1.1, 1.3, 1.2, 1.25, 1.15];
        let bars: Vec<Ohlc> = closes
            .iter()
            .map(|c| Ohlc {
                high: c + 0.05,
                low: c - 0.05,
                close: *c,
            })
            .collect();
        let rsi = calculate_rsi(&bars, 6).unwrap();
        assert!(rsi > 0.0 && rsi < 100.0);
    }

    #[test]
    fn test_ema_tracks_trend() {
        let bars = create_test_series(30);
        let ema = calculate_ema(&bars, 20).unwrap();
        let sma = calculate_sma(&bars, 20).unwrap();
        // EMA seeded from the oldest 20 lags the trailing SMA
        assert!(ema < bars[29].close);
        assert!(ema > bars[19].close - 0.01);
        assert!(sma > 0.0);
    }

    #[test]
    fn test_sma() {
        let bars = create_test_series(3);
        let sma = calculate_sma(&bars, 3).unwrap();
        assert!((sma - 1.1015).abs() < 1e-9);
    }

    #[test]
    fn test_atr_constant_range() {
        let bars = create_test_series(20);
        let atr = calculate_atr(&bars, 14).unwrap();
        // Each bar spans 0.002, wider than its distance from the previous close
        assert!((atr - 0.002).abs() < 1e-9);
    }

    #[test]
    fn test_adx_strong_trend() {
        let bars = create_test_series(28);
        let adx = calculate_adx(&bars, 14).unwrap();
        assert!(adx.plus_di > adx.minus_di);
        assert!(adx.adx > 90.0);
        assert!(calculate_adx(&bars[..27], 14).is_none());
    }

    #[test]
    fn test_adx_flat_series() {
        let bars = vec![
            Ohlc {
                high: 1.0,
                low: 1.0,
                close: 1.0,
            };
            30
        ];
        let adx = calculate_adx(&bars, 14).unwrap();
        assert_eq!(adx.adx, 0.0);
    }
}

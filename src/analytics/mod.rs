pub mod cache;

pub use cache::*;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{EventKind, EventRecord};

/// Win rate of the current epoch. `Undefined` when no trade has closed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum WinRate {
    Undefined,
    Defined(Decimal),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

/// Drawdown at one point of the equity curve; `None` when the running peak is not positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawdownPoint {
    pub timestamp: DateTime<Utc>,
    pub drawdown: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub range_start: Decimal,
    pub range_end: Option<Decimal>,
    pub count: u64,
    pub label: String,
}

/// Drawdown histogram in percent, bucketed `(lo, hi]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawdownHistogram {
    pub buckets: Vec<HistogramBucket>,
    /// Points sitting exactly at their running peak.
    pub at_peak: u64,
    /// Points excluded because the running peak was not positive.
    pub undefined: u64,
}

/// Derived per-base charts for the current epoch. Always reconstructible from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub base_id: String,
    pub epoch: u32,
    pub epoch_records: usize,
    pub win_rate: WinRate,
    pub closed_trades: u64,
    pub winning_trades: u64,
    pub equity_curve: Vec<EquityPoint>,
    pub drawdowns: Vec<DrawdownPoint>,
    pub drawdown_distribution: Vec<Decimal>,
    pub histogram: DrawdownHistogram,
    pub max_drawdown: Option<Decimal>,
    pub last_equity: Option<Decimal>,
}

/// Percent edges of the dashboard's drawdown histogram. The last bucket is open-ended.
const HISTOGRAM_EDGES: [Decimal; 7] = [
    dec!(0),
    dec!(2),
    dec!(5),
    dec!(10),
    dec!(15),
    dec!(20),
    dec!(25),
];

/// Fractional drawdown of `equity` below `peak`, clamped to `[0, 1]`.
/// `None` when the peak is not positive.
pub fn drawdown_from_peak(peak: Decimal, equity: Decimal) -> Option<Decimal> {
    if peak <= Decimal::ZERO {
        return None;
    }
    // A gap too large to represent is still more than the whole peak.
    let drawdown = peak
        .checked_sub(equity)
        .and_then(|gap| gap.checked_div(peak))
        .unwrap_or(Decimal::ONE);
    Some(drawdown.max(Decimal::ZERO).min(Decimal::ONE))
}

/// Records of one base id since its latest reset marker.
struct Epoch<'a> {
    number: u32,
    /// Timestamp of the marker that opened this epoch.
    started: Option<DateTime<Utc>>,
    records: Vec<&'a EventRecord>,
}

/// Pure chart computation over a slice of the log.
pub struct MetricsEngine;

impl MetricsEngine {
    /// Charts for one base id, or `None` if the log has no records for it.
    pub fn compute<'a>(
        base_id: &str,
        records: impl IntoIterator<Item = &'a EventRecord>,
    ) -> Option<ChartSeries> {
        let mut epoch: Option<Epoch<'a>> = None;
        for record in records.into_iter().filter(|r| r.base_id() == base_id) {
            Self::advance(&mut epoch, record);
        }
        epoch.map(|e| Self::series(base_id, e))
    }

    /// Charts for every base id in a single pass.
    pub fn compute_all(records: &[EventRecord]) -> BTreeMap<String, ChartSeries> {
        let mut epochs: BTreeMap<&str, Option<Epoch<'_>>> = BTreeMap::new();
        for record in records {
            Self::advance(epochs.entry(record.base_id()).or_default(), record);
        }

        epochs
            .into_iter()
            .filter_map(|(base_id, epoch)| {
                epoch.map(|e| (base_id.to_string(), Self::series(base_id, e)))
            })
            .collect()
    }

    fn advance<'a>(epoch: &mut Option<Epoch<'a>>, record: &'a EventRecord) {
        let current = epoch.get_or_insert_with(|| Epoch {
            number: 0,
            started: None,
            records: Vec::new(),
        });
        if record.is_reset() {
            current.number += 1;
            current.started = Some(record.timestamp);
            current.records.clear();
        } else if current.started.map_or(true, |start| record.timestamp >= start) {
            current.records.push(record);
        }
    }

    fn series(base_id: &str, epoch: Epoch<'_>) -> ChartSeries {
        let mut ordered = epoch.records;
        // Stable: equal timestamps keep append order.
        ordered.sort_by_key(|r| r.timestamp);

        let (closed_trades, winning_trades) = Self::trade_outcomes(&ordered);
        let win_rate = if closed_trades == 0 {
            WinRate::Undefined
        } else {
            WinRate::Defined(Decimal::from(winning_trades) / Decimal::from(closed_trades))
        };

        let equity_curve: Vec<EquityPoint> = ordered
            .iter()
            .filter(|r| r.event == EventKind::EquityUpdate)
            .filter_map(|r| {
                r.equity.map(|equity| EquityPoint {
                    timestamp: r.timestamp,
                    equity,
                })
            })
            .collect();

        let drawdowns = Self::drawdowns(&equity_curve);
        let drawdown_distribution: Vec<Decimal> =
            drawdowns.iter().filter_map(|p| p.drawdown).collect();
        let histogram = Self::histogram(&drawdowns);
        let max_drawdown = drawdown_distribution.iter().copied().max();
        let last_equity = equity_curve.last().map(|p| p.equity);

        ChartSeries {
            base_id: base_id.to_string(),
            epoch: epoch.number,
            epoch_records: ordered.len(),
            win_rate,
            closed_trades,
            winning_trades,
            equity_curve,
            drawdowns,
            drawdown_distribution,
            histogram,
            max_drawdown,
            last_equity,
        }
    }

    /// A fill closes a trade when an earlier equity update in the epoch gives it a reference.
    fn trade_outcomes(ordered: &[&EventRecord]) -> (u64, u64) {
        let mut reference: Option<Decimal> = None;
        let mut closed = 0u64;
        let mut wins = 0u64;

        for record in ordered {
            match record.event {
                EventKind::EquityUpdate => {
                    if record.equity.is_some() {
                        reference = record.equity;
                    }
                }
                EventKind::OrderFilled => {
                    if let (Some(prior), Some(equity)) = (reference, record.equity) {
                        closed += 1;
                        if equity > prior {
                            wins += 1;
                        }
                    }
                }
                _ => {}
            }
        }

        (closed, wins)
    }

    fn drawdowns(curve: &[EquityPoint]) -> Vec<DrawdownPoint> {
        let mut peak: Option<Decimal> = None;
        curve
            .iter()
            .map(|point| {
                let running = peak.map_or(point.equity, |p| p.max(point.equity));
                peak = Some(running);

                DrawdownPoint {
                    timestamp: point.timestamp,
                    drawdown: drawdown_from_peak(running, point.equity),
                }
            })
            .collect()
    }

    fn histogram(points: &[DrawdownPoint]) -> DrawdownHistogram {
        let mut buckets: Vec<HistogramBucket> = HISTOGRAM_EDGES
            .iter()
            .enumerate()
            .map(|(i, &start)| {
                let end = HISTOGRAM_EDGES.get(i + 1).copied();
                let label = match end {
                    Some(end) => format!("{}~{}", start, end),
                    None => format!(">{}", start),
                };
                HistogramBucket {
                    range_start: start,
                    range_end: end,
                    count: 0,
                    label,
                }
            })
            .collect();

        let mut at_peak = 0;
        let mut undefined = 0;
        for point in points {
            let Some(drawdown) = point.drawdown else {
                undefined += 1;
                continue;
            };
            if drawdown.is_zero() {
                at_peak += 1;
                continue;
            }

            let pct = drawdown * dec!(100);
            if let Some(bucket) = buckets.iter_mut().find(|b| {
                pct > b.range_start && b.range_end.map_or(true, |end| pct <= end)
            }) {
                bucket.count += 1;
            }
        }

        DrawdownHistogram {
            buckets,
            at_peak,
            undefined,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StrategyId;
    use chrono::{Duration, TimeZone};

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + Duration::minutes(minute)
    }

    fn rec(minute: i64, id: &str, kind: EventKind, equity: Option<Decimal>) -> EventRecord {
        let mut record = EventRecord::new(t(minute), StrategyId::parse(id).unwrap(), kind);
        record.equity = equity;
        record
    }

    fn reset(minute: i64, base: &str) -> EventRecord {
        EventRecord::reset_marker(t(minute), base).unwrap()
    }

    #[test]
    fn test_fill_then_drawdown_scenario() {
        let log = vec![
            rec(1, "strat_001_a", EventKind::OrderFilled, Some(dec!(100))),
            rec(2, "strat_001_a", EventKind::EquityUpdate, Some(dec!(110))),
            rec(3, "strat_001_a", EventKind::EquityUpdate, Some(dec!(90))),
        ];

        let series = MetricsEngine::compute("strat_001", &log).unwrap();
        assert_eq!(
            series.equity_curve,
            vec![
                EquityPoint { timestamp: t(2), equity: dec!(110) },
                EquityPoint { timestamp: t(3), equity: dec!(90) },
            ]
        );
        assert_eq!(
            series.drawdown_distribution,
            vec![Decimal::ZERO, (dec!(110) - dec!(90)) / dec!(110)]
        );
        assert!((series.drawdown_distribution[1] - dec!(0.1818)).abs() < dec!(0.0001));
        assert_eq!(series.win_rate, WinRate::Undefined);
        assert_eq!(series.last_equity, Some(dec!(90)));
    }

    #[test]
    fn test_win_rate_undefined_without_fills() {
        let log = vec![
            rec(1, "strat_002", EventKind::Signal, None),
            rec(2, "strat_002", EventKind::EquityUpdate, Some(dec!(50))),
            rec(3, "strat_002", EventKind::OrderRejected, None),
        ];
        let series = MetricsEngine::compute("strat_002", &log).unwrap();
        assert_eq!(series.win_rate, WinRate::Undefined);
        assert_eq!(series.closed_trades, 0);
    }

    #[test]
    fn test_win_rate_counts_positive_deltas() {
        let log = vec![
            rec(1, "strat_003_x", EventKind::EquityUpdate, Some(dec!(100))),
            rec(2, "strat_003_x", EventKind::OrderFilled, Some(dec!(104))),
            rec(3, "strat_003_y", EventKind::EquityUpdate, Some(dec!(104))),
            rec(4, "strat_003_x", EventKind::OrderFilled, Some(dec!(99))),
            rec(5, "strat_003_y", EventKind::EquityUpdate, Some(dec!(99))),
            rec(6, "strat_003_y", EventKind::OrderFilled, Some(dec!(99))),
            // No equity: not a closed trade.
            rec(7, "strat_003_y", EventKind::OrderFilled, None),
        ];
        let series = MetricsEngine::compute("strat_003", &log).unwrap();
        assert_eq!(series.closed_trades, 3);
        assert_eq!(series.winning_trades, 1);
        assert_eq!(series.win_rate, WinRate::Defined(dec!(1) / dec!(3)));
    }

    #[test]
    fn test_zero_and_negative_peaks_are_undefined() {
        let log = vec![
            rec(1, "strat_004", EventKind::EquityUpdate, Some(dec!(0))),
            rec(2, "strat_004", EventKind::EquityUpdate, Some(dec!(-10))),
            rec(3, "strat_004", EventKind::EquityUpdate, Some(dec!(20))),
            rec(4, "strat_004", EventKind::EquityUpdate, Some(dec!(-5))),
        ];
        let series = MetricsEngine::compute("strat_004", &log).unwrap();

        let raw: Vec<_> = series.drawdowns.iter().map(|p| p.drawdown).collect();
        assert_eq!(raw, vec![None, None, Some(Decimal::ZERO), Some(Decimal::ONE)]);
        assert_eq!(series.drawdown_distribution, vec![Decimal::ZERO, Decimal::ONE]);
        assert_eq!(series.histogram.undefined, 2);
        assert!(series
            .drawdown_distribution
            .iter()
            .all(|d| *d >= Decimal::ZERO && *d <= Decimal::ONE));
    }

    #[test]
    fn test_extreme_equity_does_not_overflow() {
        let log = vec![
            rec(1, "strat_009", EventKind::EquityUpdate, Some(Decimal::MAX)),
            rec(2, "strat_009", EventKind::EquityUpdate, Some(Decimal::MIN)),
            rec(3, "strat_009", EventKind::EquityUpdate, Some(Decimal::ZERO)),
        ];
        let series = MetricsEngine::compute("strat_009", &log).unwrap();

        let raw: Vec<_> = series.drawdowns.iter().map(|p| p.drawdown).collect();
        assert_eq!(raw, vec![Some(Decimal::ZERO), Some(Decimal::ONE), Some(Decimal::ONE)]);
        assert_eq!(series.max_drawdown, Some(Decimal::ONE));
        assert_eq!(series.histogram.buckets.last().unwrap().count, 2);
    }

    #[test]
    fn test_drawdown_from_peak() {
        assert_eq!(drawdown_from_peak(dec!(200), dec!(150)), Some(dec!(0.25)));
        assert_eq!(drawdown_from_peak(dec!(200), dec!(250)), Some(Decimal::ZERO));
        assert_eq!(drawdown_from_peak(dec!(1), Decimal::MIN), Some(Decimal::ONE));
        assert_eq!(drawdown_from_peak(Decimal::ZERO, dec!(-1)), None);
    }

    #[test]
    fn test_records_older_than_the_reset_stay_out_of_the_epoch() {
        let log = vec![
            rec(1, "strat_010", EventKind::EquityUpdate, Some(dec!(100))),
            reset(5, "strat_010"),
            // Appended after the marker but stamped before it.
            rec(4, "strat_010_a", EventKind::EquityUpdate, Some(dec!(50))),
            rec(5, "strat_010_a", EventKind::EquityUpdate, Some(dec!(80))),
        ];
        let series = MetricsEngine::compute("strat_010", &log).unwrap();
        assert_eq!(series.epoch_records, 1);
        assert_eq!(
            series.equity_curve,
            vec![EquityPoint { timestamp: t(5), equity: dec!(80) }]
        );
    }

    #[test]
    fn test_reset_isolates_epochs() {
        let log = vec![
            rec(1, "strat_005_a", EventKind::EquityUpdate, Some(dec!(200))),
            rec(2, "strat_005_a", EventKind::OrderFilled, Some(dec!(210))),
            rec(3, "strat_006", EventKind::EquityUpdate, Some(dec!(10))),
            reset(4, "strat_005"),
            rec(5, "strat_005_b", EventKind::EquityUpdate, Some(dec!(100))),
            rec(6, "strat_005_a", EventKind::EquityUpdate, Some(dec!(95))),
        ];

        let series = MetricsEngine::compute("strat_005", &log).unwrap();
        assert_eq!(series.epoch, 1);
        assert_eq!(series.epoch_records, 2);
        assert_eq!(
            series.equity_curve.iter().map(|p| p.equity).collect::<Vec<_>>(),
            vec![dec!(100), dec!(95)]
        );
        assert_eq!(series.max_drawdown, Some(dec!(0.05)));
        assert_eq!(series.win_rate, WinRate::Undefined);

        let all = MetricsEngine::compute_all(&log);
        assert_eq!(all.len(), 2);
        assert_eq!(all["strat_005"], series);
        assert_eq!(all["strat_006"].epoch, 0);
    }

    #[test]
    fn test_fresh_reset_yields_empty_series() {
        let log = vec![
            rec(1, "strat_007", EventKind::EquityUpdate, Some(dec!(100))),
            reset(2, "strat_007"),
        ];
        let series = MetricsEngine::compute("strat_007", &log).unwrap();
        assert!(series.equity_curve.is_empty());
        assert_eq!(series.max_drawdown, None);
        assert_eq!(series.last_equity, None);
        assert!(MetricsEngine::compute("strat_999", &log).is_none());
    }

    #[test]
    fn test_curve_is_sorted_by_timestamp() {
        let log = vec![
            rec(5, "strat_008", EventKind::EquityUpdate, Some(dec!(100))),
            rec(4, "strat_008", EventKind::EquityUpdate, Some(dec!(120))),
        ];
        let series = MetricsEngine::compute("strat_008", &log).unwrap();
        assert_eq!(series.equity_curve[0].timestamp, t(4));
        assert_eq!(series.equity_curve[1].equity, dec!(100));
    }

    #[test]
    fn test_histogram_buckets() {
        let equities = [dec!(100), dec!(98), dec!(97.5), dec!(93), dec!(70), dec!(100)];
        let log: Vec<_> = equities
            .iter()
            .enumerate()
            .map(|(i, e)| rec(i as i64, "strat_009", EventKind::EquityUpdate, Some(*e)))
            .collect();

        let histogram = MetricsEngine::compute("strat_009", &log).unwrap().histogram;
        let counts: Vec<_> = histogram.buckets.iter().map(|b| b.count).collect();
        // 2% -> 0~2, 2.5% -> 2~5, 7% -> 5~10, 30% -> >25
        assert_eq!(counts, vec![1, 1, 1, 0, 0, 0, 1]);
        assert_eq!(histogram.at_peak, 2);
        assert_eq!(histogram.undefined, 0);
        assert_eq!(histogram.buckets[0].label, "0~2");
        assert_eq!(histogram.buckets[6].label, ">25");
    }

    #[test]
    fn test_recompute_is_identical() {
        let log = vec![
            rec(1, "strat_010", EventKind::EquityUpdate, Some(dec!(3))),
            rec(2, "strat_010", EventKind::EquityUpdate, Some(dec!(1))),
        ];
        assert_eq!(MetricsEngine::compute_all(&log), MetricsEngine::compute_all(&log));
    }

    #[test]
    fn test_win_rate_serializes_with_status() {
        let undefined = serde_json::to_value(WinRate::Undefined).unwrap();
        assert_eq!(undefined, serde_json::json!({"status": "undefined"}));
        let defined = serde_json::to_value(WinRate::Defined(dec!(0.5))).unwrap();
        assert_eq!(defined["status"], "defined");
    }
}

//! Joins series sampled at different rates onto one timestamp axis.

use crate::core::quote::{Quantity, Quote, Series};
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// How observation timestamps map onto frame rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bucketing {
    /// Every distinct timestamp is its own row.
    Exact,
    /// One row per calendar day in the given time zone, keyed by local midnight.
    Daily(Tz),
}

impl Bucketing {
    pub fn bucket(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Bucketing::Exact => at,
            Bucketing::Daily(tz) => {
                let local_day = at.with_timezone(tz).date_naive();
                tz.from_local_datetime(&local_day.and_time(NaiveTime::MIN))
                    .earliest()
                    .map_or(at, |midnight| midnight.with_timezone(&Utc))
            }
        }
    }
}

/// One column of input: the history of a quantity plus an optional live quote.
#[derive(Debug, Clone, Copy)]
pub struct Track<'a> {
    pub symbol: Quantity,
    pub history: Option<&'a Series>,
    pub live: Option<&'a Quote>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Cell {
    pub value: f64,
    pub observed_at: DateTime<Utc>,
    /// Carried forward from an earlier row rather than observed in this one.
    pub filled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRow {
    pub at: DateTime<Utc>,
    /// One cell per frame symbol, in `AlignedFrame::symbols` order.
    pub cells: Vec<Cell>,
}

/// Rows where every symbol has a value, observed or forward-filled.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlignedFrame {
    pub symbols: Vec<Quantity>,
    pub rows: Vec<FrameRow>,
}

impl AlignedFrame {
    pub fn empty(symbols: Vec<Quantity>) -> Self {
        Self {
            symbols,
            rows: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn column_index(&self, symbol: Quantity) -> Option<usize> {
        self.symbols.iter().position(|s| *s == symbol)
    }

    pub fn cell(&self, row: &FrameRow, symbol: Quantity) -> Option<Cell> {
        self.column_index(symbol)
            .and_then(|index| row.cells.get(index).copied())
    }

    pub fn last(&self) -> Option<&FrameRow> {
        self.rows.last()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SeriesAligner {
    bucketing: Bucketing,
}

impl SeriesAligner {
    pub fn new(bucketing: Bucketing) -> Self {
        Self { bucketing }
    }

    /// Aligns the tracks with forward-fill. Never back-fills or interpolates; a row
    /// is dropped while any symbol has no observation at or before it.
    ///
    /// A live quote newer than its track's history overwrites that track's value
    /// in the bucket it falls in, which either updates the last row or adds a new one.
    pub fn align(&self, tracks: &[Track<'_>]) -> AlignedFrame {
        let symbols: Vec<Quantity> = tracks.iter().map(|t| t.symbol).collect();
        let observations: Vec<BTreeMap<DateTime<Utc>, (f64, DateTime<Utc>)>> =
            tracks.iter().map(|t| self.bucketed(t)).collect();

        let axis: BTreeSet<DateTime<Utc>> = observations
            .iter()
            .flat_map(|obs| obs.keys().copied())
            .collect();

        let mut carried: Vec<Option<(f64, DateTime<Utc>)>> = vec![None; tracks.len()];
        let mut rows = Vec::new();

        for at in axis {
            let mut cells = Vec::with_capacity(tracks.len());
            for (index, obs) in observations.iter().enumerate() {
                if let Some(&(value, observed_at)) = obs.get(&at) {
                    carried[index] = Some((value, observed_at));
                    cells.push(Cell {
                        value,
                        observed_at,
                        filled: false,
                    });
                } else if let Some((value, observed_at)) = carried[index] {
                    cells.push(Cell {
                        value,
                        observed_at,
                        filled: true,
                    });
                }
            }
            if cells.len() == tracks.len() {
                rows.push(FrameRow { at, cells });
            }
        }

        AlignedFrame { symbols, rows }
    }

    fn bucketed(&self, track: &Track<'_>) -> BTreeMap<DateTime<Utc>, (f64, DateTime<Utc>)> {
        let mut obs = BTreeMap::new();
        let mut last_seen = None;
        if let Some(series) = track.history {
            for (at, value) in series.points() {
                obs.insert(self.bucketing.bucket(at), (value, at));
                last_seen = Some(at);
            }
        }
        if let Some(quote) = track.live {
            if last_seen.is_none_or(|last| quote.observed_at > last) {
                obs.insert(
                    self.bucketing.bucket(quote.observed_at),
                    (quote.value, quote.observed_at),
                );
            }
        }
        obs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::quote::SourceId;
    use chrono_tz::Asia::Seoul;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, 0, 0).unwrap()
    }

    fn series(symbol: Quantity, points: &[(DateTime<Utc>, f64)]) -> Series {
        Series::from_points(symbol, SourceId::Yahoo, points.iter().copied())
    }

    fn live(symbol: Quantity, observed_at: DateTime<Utc>, value: f64) -> Quote {
        Quote {
            symbol,
            value,
            observed_at,
            source: SourceId::Yahoo,
        }
    }

    #[test]
    fn test_forward_fill_across_gaps() {
        let a = series(Quantity::GoldUsd, &[(at(1, 0), 10.0), (at(3, 0), 30.0)]);
        let b = series(
            Quantity::UsdKrw,
            &[(at(1, 0), 1.0), (at(2, 0), 2.0), (at(3, 0), 3.0)],
        );
        let frame = SeriesAligner::new(Bucketing::Exact).align(&[
            Track {
                symbol: Quantity::GoldUsd,
                history: Some(&a),
                live: None,
            },
            Track {
                symbol: Quantity::UsdKrw,
                history: Some(&b),
                live: None,
            },
        ]);

        assert_eq!(frame.len(), 3);
        let row = &frame.rows[1];
        assert_eq!(row.at, at(2, 0));
        assert_eq!(
            frame.cell(row, Quantity::GoldUsd),
            Some(Cell {
                value: 10.0,
                observed_at: at(1, 0),
                filled: true
            })
        );
        assert_eq!(
            frame.cell(row, Quantity::UsdKrw),
            Some(Cell {
                value: 2.0,
                observed_at: at(2, 0),
                filled: false
            })
        );
        assert!(
            frame
                .rows
                .iter()
                .all(|r| r.cells.iter().all(|c| c.value != 0.0))
        );
    }

    #[test]
    fn test_rows_before_first_observation_are_dropped() {
        let a = series(Quantity::GoldUsd, &[(at(2, 0), 20.0)]);
        let b = series(Quantity::UsdKrw, &[(at(1, 0), 1.0), (at(3, 0), 3.0)]);
        let frame = SeriesAligner::new(Bucketing::Exact).align(&[
            Track {
                symbol: Quantity::GoldUsd,
                history: Some(&a),
                live: None,
            },
            Track {
                symbol: Quantity::UsdKrw,
                history: Some(&b),
                live: None,
            },
        ]);

        let times: Vec<_> = frame.rows.iter().map(|r| r.at).collect();
        assert_eq!(times, vec![at(2, 0), at(3, 0)]);
    }

    #[test]
    fn test_missing_track_yields_empty_frame() {
        let a = series(Quantity::GoldUsd, &[(at(1, 0), 10.0)]);
        let frame = SeriesAligner::new(Bucketing::Exact).align(&[
            Track {
                symbol: Quantity::GoldUsd,
                history: Some(&a),
                live: None,
            },
            Track {
                symbol: Quantity::UsdKrw,
                history: None,
                live: None,
            },
        ]);
        assert!(frame.is_empty());
        assert_eq!(frame.symbols, vec![Quantity::GoldUsd, Quantity::UsdKrw]);
    }

    #[test]
    fn test_all_empty_inputs_give_empty_frame() {
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[]);
        assert!(frame.is_empty());

        let empty = Series::new(Quantity::GoldUsd, SourceId::NaverWorld);
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[Track {
            symbol: Quantity::GoldUsd,
            history: Some(&empty),
            live: None,
        }]);
        assert!(frame.is_empty());
    }

    #[test]
    fn test_live_quote_overwrites_same_day_bucket() {
        // 2024-01-02 00:00 KST is 2024-01-01 15:00 UTC.
        let history = series(Quantity::GoldUsd, &[(at(1, 15), 2000.0)]);
        let quote = live(Quantity::GoldUsd, at(2, 3), 2015.0);
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[Track {
            symbol: Quantity::GoldUsd,
            history: Some(&history),
            live: Some(&quote),
        }]);

        assert_eq!(frame.len(), 1);
        let last = frame.last().unwrap();
        assert_eq!(last.at, at(1, 15));
        assert_eq!(last.cells[0].value, 2015.0);
        assert_eq!(last.cells[0].observed_at, at(2, 3));
    }

    #[test]
    fn test_live_quote_in_new_day_appends_row() {
        let gold = series(Quantity::GoldUsd, &[(at(1, 15), 2000.0)]);
        let fx = series(Quantity::UsdKrw, &[(at(1, 15), 1300.0)]);
        let quote = live(Quantity::GoldUsd, at(3, 1), 2030.0);
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[
            Track {
                symbol: Quantity::GoldUsd,
                history: Some(&gold),
                live: Some(&quote),
            },
            Track {
                symbol: Quantity::UsdKrw,
                history: Some(&fx),
                live: None,
            },
        ]);

        assert_eq!(frame.len(), 2);
        let last = frame.last().unwrap();
        assert_eq!(last.at, at(2, 15));
        assert_eq!(frame.cell(last, Quantity::GoldUsd).unwrap().value, 2030.0);
        let fx_cell = frame.cell(last, Quantity::UsdKrw).unwrap();
        assert_eq!(fx_cell.value, 1300.0);
        assert!(fx_cell.filled);
    }

    #[test]
    fn test_live_quote_older_than_history_is_ignored() {
        let history = series(Quantity::GoldUsd, &[(at(2, 6), 2000.0)]);
        let quote = live(Quantity::GoldUsd, at(2, 5), 1990.0);
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[Track {
            symbol: Quantity::GoldUsd,
            history: Some(&history),
            live: Some(&quote),
        }]);
        assert_eq!(frame.last().unwrap().cells[0].value, 2000.0);
    }

    #[test]
    fn test_live_quote_without_history() {
        let quote = live(Quantity::UsdKrw, at(2, 5), 1310.0);
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[Track {
            symbol: Quantity::UsdKrw,
            history: None,
            live: Some(&quote),
        }]);
        assert_eq!(frame.len(), 1);
        assert_eq!(frame.rows[0].cells[0].value, 1310.0);
    }

    #[test]
    fn test_daily_bucketing_merges_sources_with_different_clocks() {
        // Settlement stamped at Seoul midnight, daily bar stamped mid-afternoon Seoul time.
        let settlement = series(Quantity::GoldUsd, &[(at(1, 15), 2000.0)]);
        let bars = series(Quantity::UsdKrw, &[(at(2, 5), 1300.0)]);
        let frame = SeriesAligner::new(Bucketing::Daily(Seoul)).align(&[
            Track {
                symbol: Quantity::GoldUsd,
                history: Some(&settlement),
                live: None,
            },
            Track {
                symbol: Quantity::UsdKrw,
                history: Some(&bars),
                live: None,
            },
        ]);
        assert_eq!(frame.len(), 1);
        assert!(frame.rows[0].cells.iter().all(|c| !c.filled));
    }
}

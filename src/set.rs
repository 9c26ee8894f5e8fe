use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Default cap on the number of distinct ranges honoured by
/// [`RangeSet::merge`] before it collapses the request to a single
/// covering span.
pub const DEFAULT_MAX_RANGE_COUNT: usize = 50;

/// The range unit this crate actually serves.
pub const BYTES_UNIT: &str = "bytes";

/// A single requested range out of a `Range` header (RFC 2616 sec 14.35.1).
///
/// Positions are kept as `i64` so that syntactically negative input can be
/// represented and rejected by [`RangeSet::is_valid`] rather than at
/// construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// Explicit closed interval `from-to`, both bounds inclusive.
    Bounded { from: i64, to: i64 },
    /// Open-ended `from-`: everything from `from` to the end of the resource.
    TailFrom { from: i64 },
    /// Suffix `-last`: the final `last` bytes of the resource.
    Suffix { last: i64 },
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            RangeSpec::Bounded { from, to } => write!(f, "{from}-{to}"),
            RangeSpec::TailFrom { from } => write!(f, "{from}-"),
            RangeSpec::Suffix { last } => write!(f, "-{last}"),
        }
    }
}

/// An absolute byte interval `[start, end]`, both bounds inclusive,
/// resolved against a concrete resource length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: i64,
    pub end: i64,
}

impl ResolvedRange {
    pub fn new(start: i64, end: i64) -> Self {
        ResolvedRange { start, end }
    }

    /// Number of bytes covered by the interval.
    pub fn len(&self) -> u64 {
        if self.is_empty() { 0 } else { (self.end - self.start + 1) as u64 }
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

impl fmt::Display for ResolvedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Error returned when constructing a [`RangeSet`] from an empty range list.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("at least one range required")]
pub struct EmptyRangeSet;

/// Errors from parsing a `Range` header value into a [`RangeSet`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseRangeSetError {
    #[error("missing '=' between unit and ranges")]
    MissingUnit,
    #[error("empty range list")]
    Empty,
    #[error("malformed range spec: {0:?}")]
    Malformed(String),
}

/// An immutable set of requested ranges, as carried by a `Range` header:
/// a unit token plus one or more [`RangeSpec`]s in request order.
///
/// The unit is opaque to this type; equality against `"bytes"` is left to
/// the predicate passed to [`is_valid_with`](RangeSet::is_valid_with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    unit: String,
    ranges: Vec<RangeSpec>,
}

impl RangeSet {
    /// Construct a range set with an explicit unit token. Fails if `ranges`
    /// is empty; no other validation happens here.
    pub fn new(unit: impl Into<String>, ranges: Vec<RangeSpec>) -> Result<Self, EmptyRangeSet> {
        if ranges.is_empty() {
            return Err(EmptyRangeSet);
        }
        Ok(RangeSet { unit: unit.into(), ranges })
    }

    /// Construct a byte-unit range set.
    pub fn bytes(ranges: Vec<RangeSpec>) -> Result<Self, EmptyRangeSet> {
        RangeSet::new(BYTES_UNIT, ranges)
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn ranges(&self) -> &[RangeSpec] {
        &self.ranges
    }

    /// Check the set for well-formedness under a caller-supplied unit
    /// predicate: every spec must be non-negative and every bounded spec
    /// properly ordered. Resource length plays no part here; a bounded
    /// range entirely past the end of the resource is still well-formed
    /// and only gets dropped at resolution time.
    pub fn is_valid_with(&self, unit_predicate: impl Fn(&str) -> bool) -> bool {
        unit_predicate(&self.unit)
            && self.ranges.iter().all(|spec| match *spec {
                RangeSpec::Bounded { from, to } => from >= 0 && to >= from,
                RangeSpec::TailFrom { from } => from >= 0,
                RangeSpec::Suffix { last } => last >= 0,
            })
    }

    /// [`is_valid_with`](Self::is_valid_with) accepting only the `bytes` unit.
    pub fn is_valid(&self) -> bool {
        self.is_valid_with(|unit| unit == BYTES_UNIT)
    }

    /// Map every spec to an absolute interval against a resource of
    /// `length` bytes, dropping the ones that resolve to nothing.
    ///
    /// Bounded ends are clamped to `length - 1`; a suffix longer than the
    /// resource covers the whole resource; a start at or past the end
    /// resolves to an empty interval and is dropped. Never panics.
    pub fn resolve(&self, length: i64) -> Vec<ResolvedRange> {
        self.ranges
            .iter()
            .map(|spec| match *spec {
                RangeSpec::Bounded { from, to } => {
                    ResolvedRange::new(from, to.min(length - 1))
                }
                RangeSpec::TailFrom { from } => ResolvedRange::new(from, length - 1),
                RangeSpec::Suffix { last } => {
                    ResolvedRange::new((length - last).max(0), length - 1)
                }
            })
            .filter(|range| !range.is_empty())
            .collect()
    }

    /// Resolve and merge all overlapping and touching ranges, capped at
    /// `max_range_count` distinct requested ranges.
    ///
    /// Past the cap the whole request degenerates to the single covering
    /// span of [`merge_to_single`], so a pathological many-range request
    /// never forces an expensive multipart response. An all-out-of-range
    /// set merges to an empty vec; the caller decides what that means
    /// (typically 416).
    pub fn merge(&self, length: i64, max_range_count: usize) -> Vec<ResolvedRange> {
        if self.ranges.len() > max_range_count {
            return self.merge_to_single(length).into_iter().collect();
        }

        // TODO merge ranges separated by a small gap, not only touching ones
        self.merge_all(length)
    }

    /// Uncapped merge: resolve, sort by start offset (ties by end), then a
    /// single sweep collapsing every pair that overlaps or sits exactly
    /// adjacent (`next.start <= current.end + 1`). Output intervals are
    /// disjoint, non-adjacent and ordered by start.
    pub fn merge_all(&self, length: i64) -> Vec<ResolvedRange> {
        let mut resolved = self.resolve(length);
        resolved.sort_by_key(|range| (range.start, range.end));

        let mut merged: Vec<ResolvedRange> = Vec::with_capacity(resolved.len());
        for range in resolved {
            match merged.last_mut() {
                Some(current) if range.start <= current.end + 1 => {
                    current.end = current.end.max(range.end);
                }
                _ => merged.push(range),
            }
        }
        merged
    }

    /// Collapse every requested range into one covering interval from the
    /// smallest resolved start to the largest resolved end, clamped to
    /// `length - 1`. Unlike [`merge_all`](Self::merge_all) the result may
    /// cover bytes the client never asked for. `None` when every spec
    /// resolved to nothing.
    pub fn merge_to_single(&self, length: i64) -> Option<ResolvedRange> {
        let resolved = self.resolve(length);

        let start = resolved.iter().map(|range| range.start).min()?;
        let end = resolved.iter().map(|range| range.end).max()?;

        Some(ResolvedRange::new(start, end.min(length - 1)))
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.unit)?;
        for (i, spec) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{spec}")?;
        }
        Ok(())
    }
}

impl FromStr for RangeSet {
    type Err = ParseRangeSetError;

    /// Parse a `Range` header value, e.g. `bytes=0-499,-100`.
    ///
    /// Parsing is purely syntactic; a set with negative or inverted bounds
    /// still parses and is left for [`RangeSet::is_valid`] to reject.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (unit, list) = s.split_once('=').ok_or(ParseRangeSetError::MissingUnit)?;

        if list.is_empty() {
            return Err(ParseRangeSetError::Empty);
        }

        let malformed = |spec: &str| ParseRangeSetError::Malformed(spec.to_string());

        let mut ranges = Vec::new();
        for spec in list.split(',') {
            let spec = spec.trim();
            let parsed = if let Some(last) = spec.strip_prefix('-') {
                RangeSpec::Suffix { last: last.parse().map_err(|_| malformed(spec))? }
            } else {
                let (from, to) = spec.split_once('-').ok_or_else(|| malformed(spec))?;
                let from = from.parse().map_err(|_| malformed(spec))?;
                if to.is_empty() {
                    RangeSpec::TailFrom { from }
                } else {
                    RangeSpec::Bounded { from, to: to.parse().map_err(|_| malformed(spec))? }
                }
            };
            ranges.push(parsed);
        }

        RangeSet::new(unit, ranges).map_err(|EmptyRangeSet| ParseRangeSetError::Empty)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn bounded(from: i64, to: i64) -> RangeSpec {
        RangeSpec::Bounded { from, to }
    }

    fn set(ranges: Vec<RangeSpec>) -> RangeSet {
        RangeSet::bytes(ranges).unwrap()
    }

    #[test]
    fn test_empty_construction_fails() {
        assert_matches!(RangeSet::bytes(vec![]), Err(EmptyRangeSet));
        assert_matches!(RangeSet::new("pages", vec![]), Err(EmptyRangeSet));
        assert!(RangeSet::bytes(vec![bounded(0, 0)]).is_ok());
    }

    #[test]
    fn test_validity() {
        assert!(set(vec![bounded(0, 499)]).is_valid());
        assert!(set(vec![RangeSpec::TailFrom { from: 0 }]).is_valid());
        assert!(set(vec![RangeSpec::Suffix { last: 0 }]).is_valid());

        assert!(!set(vec![bounded(-1, 10)]).is_valid());
        assert!(!set(vec![bounded(10, 9)]).is_valid());
        assert!(!set(vec![RangeSpec::TailFrom { from: -1 }]).is_valid());
        assert!(!set(vec![RangeSpec::Suffix { last: -1 }]).is_valid());

        // one bad spec poisons the whole set
        assert!(!set(vec![bounded(0, 10), bounded(30, 20)]).is_valid());

        // a bounded range past the end of any plausible resource is still valid
        assert!(set(vec![bounded(1_000_000, 2_000_000)]).is_valid());
    }

    #[test]
    fn test_unit_predicate() {
        let pages = RangeSet::new("pages", vec![bounded(0, 1)]).unwrap();
        assert!(!pages.is_valid());
        assert!(pages.is_valid_with(|unit| unit == "pages"));
    }

    #[test]
    fn test_display() {
        assert_eq!("bytes=0-499", set(vec![bounded(0, 499)]).to_string());
        assert_eq!(
            "bytes=0-0,500-,-100",
            set(vec![
                bounded(0, 0),
                RangeSpec::TailFrom { from: 500 },
                RangeSpec::Suffix { last: 100 },
            ])
            .to_string(),
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for header in ["bytes=0-499", "bytes=500-", "bytes=-100", "bytes=0-0,-1"] {
            let parsed: RangeSet = header.parse().unwrap();
            assert_eq!(header, parsed.to_string());
        }
    }

    #[test]
    fn test_parse_errors() {
        assert_matches!("".parse::<RangeSet>(), Err(ParseRangeSetError::MissingUnit));
        assert_matches!("0-499".parse::<RangeSet>(), Err(ParseRangeSetError::MissingUnit));
        assert_matches!("bytes=".parse::<RangeSet>(), Err(ParseRangeSetError::Empty));
        assert_matches!("bytes=abc-def".parse::<RangeSet>(), Err(ParseRangeSetError::Malformed(_)));
        assert_matches!("bytes=100".parse::<RangeSet>(), Err(ParseRangeSetError::Malformed(_)));
        assert_matches!("bytes=0-499,".parse::<RangeSet>(), Err(ParseRangeSetError::Malformed(_)));
    }

    #[test]
    fn test_parse_keeps_validation_separate() {
        let parsed: RangeSet = "bytes=30-20".parse().unwrap();
        assert_eq!(vec![bounded(30, 20)], parsed.ranges());
        assert!(!parsed.is_valid());
    }

    #[test]
    fn test_resolve_clamps_bounded_end() {
        assert_eq!(
            vec![ResolvedRange::new(500, 999)],
            set(vec![bounded(500, 5000)]).resolve(1000),
        );
    }

    #[test]
    fn test_single_bounded() {
        let merged = set(vec![bounded(0, 499)]).merge(1000, DEFAULT_MAX_RANGE_COUNT);
        assert_eq!(vec![ResolvedRange::new(0, 499)], merged);
    }

    #[test]
    fn test_adjacent_ranges_collapse() {
        let merged = set(vec![bounded(0, 49), bounded(50, 99)]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(0, 99)], merged);
    }

    #[test]
    fn test_overlapping_ranges_collapse() {
        let merged = set(vec![bounded(0, 60), bounded(50, 99)]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(0, 99)], merged);

        // contained range disappears entirely
        let merged = set(vec![bounded(0, 99), bounded(10, 20)]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(0, 99)], merged);
    }

    #[test]
    fn test_gap_is_preserved() {
        let merged = set(vec![bounded(0, 10), bounded(20, 30)]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(0, 10), ResolvedRange::new(20, 30)], merged);
    }

    #[test]
    fn test_out_of_order_input_sorts_by_start() {
        let merged = set(vec![bounded(40, 50), bounded(0, 10), bounded(20, 30)]).merge_all(1000);
        assert_eq!(
            vec![
                ResolvedRange::new(0, 10),
                ResolvedRange::new(20, 30),
                ResolvedRange::new(40, 50),
            ],
            merged,
        );
    }

    #[test]
    fn test_merge_is_idempotent_on_disjoint_sorted_input() {
        let specs = vec![bounded(0, 10), bounded(20, 30), bounded(40, 50)];
        let once = set(specs.clone()).merge_all(1000);
        let again = set(once.iter().map(|r| bounded(r.start, r.end)).collect()).merge_all(1000);
        assert_eq!(once, again);
    }

    #[test]
    fn test_merge_output_disjoint_and_non_adjacent() {
        let merged = set(vec![
            bounded(10, 20),
            bounded(0, 5),
            bounded(21, 40),
            bounded(90, 95),
            RangeSpec::Suffix { last: 10 },
        ])
        .merge_all(100);
        for pair in merged.windows(2) {
            assert!(pair[0].end + 1 < pair[1].start, "adjacent output: {pair:?}");
        }
    }

    #[test]
    fn test_suffix_resolution() {
        let merged = set(vec![RangeSpec::Suffix { last: 500 }]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(500, 999)], merged);

        // suffix longer than the resource covers the whole resource
        let merged = set(vec![RangeSpec::Suffix { last: 2000 }]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(0, 999)], merged);
    }

    #[test]
    fn test_tail_from_resolution() {
        let merged = set(vec![RangeSpec::TailFrom { from: 900 }]).merge_all(1000);
        assert_eq!(vec![ResolvedRange::new(900, 999)], merged);

        // start past the end of the resource resolves to nothing
        let merged = set(vec![RangeSpec::TailFrom { from: 1500 }]).merge_all(1000);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_all_out_of_range_merges_empty() {
        let specs = set(vec![bounded(2000, 3000), RangeSpec::TailFrom { from: 5000 }]);
        assert!(specs.merge(1000, DEFAULT_MAX_RANGE_COUNT).is_empty());
        assert_eq!(None, specs.merge_to_single(1000));
    }

    #[test]
    fn test_merge_to_single_spans_gaps() {
        let single = set(vec![bounded(0, 10), bounded(900, 910)]).merge_to_single(1000);
        assert_eq!(Some(ResolvedRange::new(0, 910)), single);
    }

    #[test]
    fn test_merge_to_single_clamps_to_length() {
        let single = set(vec![bounded(100, 5000)]).merge_to_single(1000);
        assert_eq!(Some(ResolvedRange::new(100, 999)), single);
    }

    #[test]
    fn test_cap_falls_back_to_single_span() {
        let specs: Vec<RangeSpec> = (0..60).map(|i| bounded(i * 100, i * 100 + 10)).collect();
        let ranges = set(specs);

        let merged = ranges.merge(10000, DEFAULT_MAX_RANGE_COUNT);
        assert_eq!(1, merged.len());
        assert_eq!(ranges.merge_to_single(10000), Some(merged[0]));
        assert_eq!(ResolvedRange::new(0, 5910), merged[0]);

        // under the cap the same set stays disjoint
        assert_eq!(60, ranges.merge(10000, 60).len());
    }

    #[test]
    fn test_cap_triggers_only_past_the_limit() {
        let specs: Vec<RangeSpec> = (0..=DEFAULT_MAX_RANGE_COUNT as i64)
            .map(|i| bounded(i * 100, i * 100 + 10))
            .collect();

        // a count equal to the cap still merges disjointly; the fallback
        // fires on strictly more
        let at_cap = set(specs[..DEFAULT_MAX_RANGE_COUNT].to_vec());
        assert_eq!(
            DEFAULT_MAX_RANGE_COUNT,
            at_cap.merge(100000, DEFAULT_MAX_RANGE_COUNT).len(),
        );

        let past_cap = set(specs);
        let merged = past_cap.merge(100000, DEFAULT_MAX_RANGE_COUNT);
        assert_eq!(1, merged.len());
        assert_eq!(past_cap.merge_to_single(100000), Some(merged[0]));
    }

    #[test]
    fn test_merge_coverage_matches_resolved_union() {
        let ranges = set(vec![
            bounded(5, 15),
            bounded(0, 10),
            RangeSpec::Suffix { last: 7 },
            bounded(90, 200),
            RangeSpec::TailFrom { from: 97 },
        ]);
        let length = 100;

        let mut covered = vec![false; length as usize];
        for range in ranges.resolve(length) {
            for pos in range.start..=range.end {
                covered[pos as usize] = true;
            }
        }

        let mut merged_covered = vec![false; length as usize];
        for range in ranges.merge_all(length) {
            for pos in range.start..=range.end {
                assert!(!merged_covered[pos as usize], "overlap at {pos}");
                merged_covered[pos as usize] = true;
            }
        }

        assert_eq!(covered, merged_covered);
    }
}

// ABOUTME: GTID set algebra over the server's textual GTID_EXECUTED format
// ABOUTME: Provides parsing, union, subtraction, cardinality, itemize and last-GTID lookups

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Source identifiers are hex UUIDs in practice, but any hyphenated
/// alphanumeric token is accepted so hand-written sets like `u:1-3` parse.
static UUID_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9A-Za-z][0-9A-Za-z-]*$").expect("valid uuid token regex"));

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GtidError {
    #[error("malformed GTID set '{input}': {reason}")]
    Format { input: String, reason: String },
    #[error("GTID set lists {count} transactions, more than the {limit} that can be itemized")]
    TooLarge { count: u128, limit: u128 },
}

impl GtidError {
    fn format(input: &str, reason: impl Into<String>) -> Self {
        GtidError::Format {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

pub type GtidResult<T> = Result<T, GtidError>;

/// Closed range of transaction sequence numbers, `start == end` for a single one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

impl Interval {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn single(sequence: u64) -> Self {
        Self::new(sequence, sequence)
    }

    /// Number of transactions covered by the interval
    pub fn count(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// A single global transaction identifier, `uuid:sequence`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gtid {
    uuid: String,
    sequence: u64,
}

impl Gtid {
    pub fn new(uuid: &str, sequence: u64) -> GtidResult<Self> {
        let input = format!("{}:{}", uuid, sequence);
        validate_uuid(uuid, &input)?;
        if sequence == 0 {
            return Err(GtidError::format(&input, "sequence numbers start at 1"));
        }
        Ok(Self {
            uuid: uuid.to_string(),
            sequence,
        })
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.sequence)
    }
}

impl FromStr for Gtid {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (uuid, sequence) = trimmed
            .split_once(':')
            .ok_or_else(|| GtidError::format(s, "expected 'uuid:sequence'"))?;
        let sequence = parse_sequence(sequence.trim(), s)?;
        Gtid::new(uuid.trim(), sequence)
    }
}

#[derive(Debug, Clone)]
struct UuidEntry {
    /// Spelling of the uuid as it appeared in the input
    display: String,
    /// Sorted, disjoint and non-adjacent
    intervals: Vec<Interval>,
}

/// Normalized GTID set keyed by lower-cased uuid.
///
/// Every uuid's interval list is kept sorted with no overlapping or touching
/// intervals, so two sets holding the same transactions compare equal no
/// matter how their source text was written.
#[derive(Debug, Clone, Default)]
pub struct GtidSet {
    entries: BTreeMap<String, UuidEntry>,
}

impl GtidSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Uuids in the set, in the order they are rendered
    pub fn uuids(&self) -> Vec<&str> {
        let mut uuids: Vec<&str> = self.entries.values().map(|e| e.display.as_str()).collect();
        uuids.sort_unstable();
        uuids
    }

    /// Normalized intervals for a uuid (case-insensitive lookup)
    pub fn intervals(&self, uuid: &str) -> Option<&[Interval]> {
        self.entries
            .get(&uuid.to_lowercase())
            .map(|e| e.intervals.as_slice())
    }

    pub fn insert(&mut self, uuid: &str, interval: Interval) {
        let entry = self
            .entries
            .entry(uuid.to_lowercase())
            .or_insert_with(|| UuidEntry {
                display: uuid.to_string(),
                intervals: Vec::new(),
            });
        if uuid < entry.display.as_str() {
            entry.display = uuid.to_string();
        }
        entry.intervals.push(interval);
        entry.intervals = merge_intervals(std::mem::take(&mut entry.intervals));
    }

    pub fn union(&self, other: &GtidSet) -> GtidSet {
        let mut result = self.clone();
        for entry in other.entries.values() {
            for interval in &entry.intervals {
                result.insert(&entry.display, *interval);
            }
        }
        result
    }

    /// Transactions in `self` that are absent from `other`
    pub fn subtract(&self, other: &GtidSet) -> GtidSet {
        let mut entries = BTreeMap::new();
        for (key, entry) in &self.entries {
            let remaining = match other.entries.get(key) {
                Some(cut) => subtract_intervals(&entry.intervals, &cut.intervals),
                None => entry.intervals.clone(),
            };
            if !remaining.is_empty() {
                entries.insert(
                    key.clone(),
                    UuidEntry {
                        display: entry.display.clone(),
                        intervals: remaining,
                    },
                );
            }
        }
        GtidSet { entries }
    }

    pub fn is_subset(&self, other: &GtidSet) -> bool {
        self.subtract(other).is_empty()
    }

    /// Number of transactions in the set.
    ///
    /// Wider than a sequence number: a few full-range uuids already exceed
    /// `u64::MAX` transactions.
    pub fn cardinality(&self) -> u128 {
        self.entries
            .values()
            .flat_map(|e| e.intervals.iter())
            .map(|i| u128::from(i.count()))
            .sum()
    }

    /// Greatest GTID recorded for `uuid`
    pub fn last(&self, uuid: &str) -> Option<Gtid> {
        let entry = self.entries.get(&uuid.to_lowercase())?;
        let end = entry.intervals.iter().map(|i| i.end).max()?;
        Some(Gtid {
            uuid: entry.display.clone(),
            sequence: end,
        })
    }
}

impl PartialEq for GtidSet {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(other.entries.iter())
                .all(|((ka, a), (kb, b))| ka == kb && a.intervals == b.intervals)
    }
}

impl Eq for GtidSet {}

impl fmt::Display for GtidSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<&UuidEntry> = self.entries.values().collect();
        entries.sort_by(|a, b| a.display.cmp(&b.display));
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(&entry.display)?;
            for interval in &entry.intervals {
                write!(f, ":{}", interval)?;
            }
        }
        Ok(())
    }
}

impl FromStr for GtidSet {
    type Err = GtidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parse a GTID set as reported by `GTID_EXECUTED`, `GTID_PURGED` or `GTID_OWNED`.
///
/// Accepts un-normalized text: groups in any order, the same uuid in several
/// groups, and duplicate, overlapping or touching intervals. Whitespace and
/// line breaks around groups (the server wraps long sets) are ignored. An
/// empty string is the empty set.
///
/// # Errors
///
/// Fails on empty groups, a uuid without intervals, non-integer or zero
/// sequence numbers, and ranges whose end precedes their start.
///
/// # Examples
///
/// ```
/// # use mysql_rpl_failover::gtid;
/// let set = gtid::parse("u:3-4:1-2,u:9").unwrap();
/// assert_eq!(set.to_string(), "u:1-4:9");
/// ```
pub fn parse(text: &str) -> GtidResult<GtidSet> {
    let mut set = GtidSet::new();
    for (uuid, intervals) in parse_groups(text)? {
        for interval in intervals {
            set.insert(uuid, interval);
        }
    }
    Ok(set)
}

/// Normalized union of two GTID set texts
///
/// # Examples
///
/// ```
/// # use mysql_rpl_failover::gtid;
/// let merged = gtid::union("u:2-4:6:8-9:12", "u:1-3:9-11:13").unwrap();
/// assert_eq!(merged, "u:1-4:6:8-13");
/// ```
pub fn union(a: &str, b: &str) -> GtidResult<String> {
    Ok(parse(a)?.union(&parse(b)?).to_string())
}

/// Transactions of `a` that are not in `b`, as normalized text
pub fn subtract(a: &str, b: &str) -> GtidResult<String> {
    Ok(parse(a)?.subtract(&parse(b)?).to_string())
}

pub fn is_subset(a: &str, b: &str) -> GtidResult<bool> {
    Ok(parse(a)?.is_subset(&parse(b)?))
}

/// Total number of transactions in the set
pub fn cardinality(text: &str) -> GtidResult<u128> {
    Ok(parse(text)?.cardinality())
}

/// Greatest GTID for `uuid` in the set, `None` when the uuid is absent.
///
/// The maximum is computed over every interval for the uuid rather than
/// read from the last textual interval, so out-of-order input is reported
/// correctly.
pub fn last(text: &str, uuid: &str) -> GtidResult<Option<Gtid>> {
    Ok(parse(text)?.last(uuid))
}

/// Most transactions `itemize` expands; larger sets are refused
pub const MAX_ITEMIZED: u128 = 1_000_000;

/// Expand every interval into individual sequence numbers.
///
/// Groups are returned in input order without merging, one entry per
/// textual group, which is what one-skip-per-transaction injection needs.
/// Fails with [`GtidError::TooLarge`] above [`MAX_ITEMIZED`] transactions.
pub fn itemize(text: &str) -> GtidResult<Vec<(String, Vec<u64>)>> {
    let groups = parse_groups(text)?;
    let count: u128 = groups
        .iter()
        .flat_map(|(_, intervals)| intervals.iter())
        .map(|i| u128::from(i.count()))
        .sum();
    if count > MAX_ITEMIZED {
        return Err(GtidError::TooLarge {
            count,
            limit: MAX_ITEMIZED,
        });
    }

    Ok(groups
        .into_iter()
        .map(|(uuid, intervals)| {
            let sequences = intervals.iter().flat_map(|i| i.start..=i.end).collect();
            (uuid.to_string(), sequences)
        })
        .collect())
}

fn parse_groups(text: &str) -> GtidResult<Vec<(&str, Vec<Interval>)>> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut groups = Vec::new();
    for group in trimmed.split(',') {
        let group = group.trim();
        if group.is_empty() {
            return Err(GtidError::format(text, "empty group"));
        }

        let mut tokens = group.split(':');
        let uuid = tokens.next().unwrap_or_default().trim();
        validate_uuid(uuid, text)?;

        let mut intervals = Vec::new();
        for token in tokens {
            intervals.push(parse_interval(token.trim(), text)?);
        }
        if intervals.is_empty() {
            return Err(GtidError::format(
                text,
                format!("uuid '{}' has no transaction intervals", uuid),
            ));
        }
        groups.push((uuid, intervals));
    }
    Ok(groups)
}

fn validate_uuid(uuid: &str, input: &str) -> GtidResult<()> {
    if !UUID_TOKEN.is_match(uuid) {
        return Err(GtidError::format(
            input,
            format!("invalid source uuid '{}'", uuid),
        ));
    }
    Ok(())
}

fn parse_interval(token: &str, input: &str) -> GtidResult<Interval> {
    if token.is_empty() {
        return Err(GtidError::format(input, "empty interval"));
    }
    let interval = match token.split_once('-') {
        Some((start, end)) => Interval::new(
            parse_sequence(start.trim(), input)?,
            parse_sequence(end.trim(), input)?,
        ),
        None => Interval::single(parse_sequence(token, input)?),
    };
    if interval.end < interval.start {
        return Err(GtidError::format(
            input,
            format!("interval '{}' ends before it starts", token),
        ));
    }
    Ok(interval)
}

fn parse_sequence(token: &str, input: &str) -> GtidResult<u64> {
    let value: u64 = token.parse().map_err(|_| {
        GtidError::format(input, format!("'{}' is not a sequence number", token))
    })?;
    if value == 0 {
        return Err(GtidError::format(input, "sequence numbers start at 1"));
    }
    Ok(value)
}

fn merge_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_unstable();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(prev) if interval.start <= prev.end.saturating_add(1) => {
                prev.end = prev.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Both inputs must be normalized
fn subtract_intervals(from: &[Interval], cut: &[Interval]) -> Vec<Interval> {
    let mut remaining = Vec::new();
    for interval in from {
        let mut start = interval.start;
        let mut covered = false;
        for c in cut {
            if c.end < start {
                continue;
            }
            if c.start > interval.end {
                break;
            }
            if c.start > start {
                remaining.push(Interval::new(start, c.start - 1));
            }
            if c.end >= interval.end {
                covered = true;
                break;
            }
            start = c.end + 1;
        }
        if !covered {
            remaining.push(Interval::new(start, interval.end));
        }
    }
    remaining
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID_A: &str = "cfb4bb6e-5c8a-11e3-a2b9-0800272864ba";
    const UUID_B: &str = "d0a1f40a-5c8a-11e3-a2b9-0800272864ba";

    #[test]
    fn union_merges_touching_and_overlapping_ranges() {
        let a = format!("{}:2-4:6:8-9:12", UUID_A);
        let b = format!("{}:1-3:9-11:13", UUID_A);
        assert_eq!(union(&a, &b).unwrap(), format!("{}:1-4:6:8-13", UUID_A));
    }

    #[test]
    fn union_merges_repeated_uuids_and_sorts_groups() {
        let a = format!("{}:5,{}:1-2", UUID_B, UUID_A);
        let b = format!("{}:3,{}:1-4", UUID_A, UUID_B);
        assert_eq!(
            union(&a, &b).unwrap(),
            format!("{}:1-3,{}:1-5", UUID_A, UUID_B)
        );
    }

    #[test]
    fn union_with_empty_set() {
        let a = format!("{}:1-3", UUID_A);
        assert_eq!(union(&a, "").unwrap(), a);
        assert_eq!(union("", "").unwrap(), "");
    }

    #[test]
    fn union_uuid_match_is_case_insensitive() {
        let upper = UUID_A.to_uppercase();
        let a = format!("{}:1-2", UUID_A);
        let b = format!("{}:3", upper);
        // Smallest spelling wins so the result does not depend on argument order
        assert_eq!(union(&a, &b).unwrap(), format!("{}:1-3", upper));
        assert_eq!(union(&b, &a).unwrap(), format!("{}:1-3", upper));
    }

    #[test]
    fn cardinality_counts_transactions() {
        assert_eq!(cardinality("u:1-3:7").unwrap(), 4);
        assert_eq!(cardinality("").unwrap(), 0);
        assert_eq!(cardinality("u:1-3,v:1-3").unwrap(), 6);
    }

    #[test]
    fn cardinality_of_full_range_sets_does_not_overflow() {
        let max = u64::MAX;
        assert_eq!(cardinality(&format!("u:1-{}", max)).unwrap(), u128::from(max));
        assert_eq!(
            cardinality(&format!("u:1-{},v:1-{}", max, max)).unwrap(),
            2 * u128::from(max)
        );
    }

    #[test]
    fn itemize_refuses_huge_sets() {
        let err = itemize("u:1-1000000000000").unwrap_err();
        assert_eq!(
            err,
            GtidError::TooLarge {
                count: 1_000_000_000_000,
                limit: MAX_ITEMIZED,
            }
        );
        assert_eq!(itemize(&format!("u:1-{}", MAX_ITEMIZED)).unwrap()[0].1.len(), 1_000_000);
    }

    #[test]
    fn cardinality_counts_duplicates_once() {
        assert_eq!(cardinality("u:1-3:2-4,u:4").unwrap(), 4);
    }

    #[test]
    fn last_returns_greatest_gtid() {
        let gtid = last("u:1-4:6:8:10-11", "u").unwrap().unwrap();
        assert_eq!(gtid.uuid(), "u");
        assert_eq!(gtid.sequence(), 11);
        assert_eq!(gtid.to_string(), "u:11");
    }

    #[test]
    fn last_is_case_insensitive_and_none_when_absent() {
        let text = format!("{}:1-9", UUID_A);
        let gtid = last(&text, &UUID_A.to_uppercase()).unwrap().unwrap();
        assert_eq!(gtid.sequence(), 9);
        assert!(last(&text, UUID_B).unwrap().is_none());
    }

    #[test]
    fn last_returns_true_maximum_for_out_of_order_intervals() {
        // The trailing textual interval is not the greatest one here
        let gtid = last("u:10-20:3", "u").unwrap().unwrap();
        assert_eq!(gtid.sequence(), 20);
    }

    #[test]
    fn itemize_expands_groups_in_input_order() {
        let items = itemize("v:3-4,u:1:5-6").unwrap();
        assert_eq!(
            items,
            vec![
                ("v".to_string(), vec![3, 4]),
                ("u".to_string(), vec![1, 5, 6]),
            ]
        );
    }

    #[test]
    fn subtract_removes_shared_transactions() {
        assert_eq!(subtract("u:1-10", "u:3-4:8").unwrap(), "u:1-2:5-7:9-10");
        assert_eq!(subtract("u:1-10", "u:1-10").unwrap(), "");
        assert_eq!(subtract("u:1-3,v:1", "u:1-5").unwrap(), "v:1");
    }

    #[test]
    fn subset_checks() {
        assert!(is_subset("u:2-3", "u:1-5").unwrap());
        assert!(!is_subset("u:2-6", "u:1-5").unwrap());
        assert!(is_subset("", "u:1").unwrap());
    }

    #[test]
    fn parse_tolerates_server_line_breaks() {
        let text = format!("{}:1-5,\n{}:1-2", UUID_A, UUID_B);
        let set = parse(&text).unwrap();
        assert_eq!(set.cardinality(), 7);
        assert_eq!(set.uuids(), vec![UUID_A, UUID_B]);
    }

    #[test]
    fn parse_rejects_malformed_input() {
        let malformed = vec![
            "u:1,,v:2",
            "u:abc",
            "u:1-x",
            "u",
            "u:",
            "u:0",
            "u:5-3",
            ":1-3",
            "u;drop:1",
        ];

        for text in malformed {
            let err = parse(text).unwrap_err();
            let GtidError::Format { input, .. } = &err else {
                panic!("expected Format error, got {err:?}");
            };
            assert_eq!(input, text, "error should name the offending input");
        }
    }

    #[test]
    fn gtid_from_str() {
        let gtid: Gtid = format!("{}:42", UUID_A).parse().unwrap();
        assert_eq!(gtid.uuid(), UUID_A);
        assert_eq!(gtid.sequence(), 42);
        assert!("u:0".parse::<Gtid>().is_err());
        assert!("u".parse::<Gtid>().is_err());
    }

    #[test]
    fn sets_compare_by_content() {
        let a = parse("u:1-2:3,v:7").unwrap();
        let b = parse("v:7,U:1-3").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, parse("u:1-3").unwrap());
    }
}

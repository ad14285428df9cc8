use std::fmt;

use regex::Regex;

use crate::error::{Error, Result};
use crate::inventory::InventoryEntry;

/// Selects inventory entries by their `:VAR:LEVEL:FORECAST:` text.
#[derive(Debug, Clone)]
pub enum SearchPattern {
    All,
    Matches(Regex),
}

impl SearchPattern {
    /// Regular expression search, e.g. `":(U|V)GRD:10 m above"`.
    /// An empty pattern or `":"` selects everything.
    pub fn regex(pattern: &str) -> Result<Self> {
        if pattern.is_empty() || pattern == ":" {
            return Ok(SearchPattern::All);
        }
        Regex::new(pattern)
            .map(SearchPattern::Matches)
            .map_err(|e| Error::InvalidRequest(format!("invalid search pattern {pattern:?}: {e}")))
    }

    /// Literal substring search.
    pub fn exact(text: &str) -> Result<Self> {
        if text.is_empty() || text == ":" {
            return Ok(SearchPattern::All);
        }
        Self::regex(&regex::escape(text))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, SearchPattern::All)
    }

    pub fn matches(&self, entry: &InventoryEntry) -> bool {
        match self {
            SearchPattern::All => true,
            SearchPattern::Matches(re) => re.is_match(&entry.search_text()),
        }
    }
}

impl fmt::Display for SearchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchPattern::All => f.write_str(":"),
            SearchPattern::Matches(re) => f.write_str(re.as_str()),
        }
    }
}

/// Inclusive byte range; `end == None` reads to the end of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn closed(start: u64, end: u64) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn open(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Number of bytes, when the end is known.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|e| e - self.start + 1)
    }

    /// Value for a single-range `Range` header.
    pub fn header_value(&self) -> String {
        format!("bytes={self}")
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// `Range` header value asking for several ranges at once.
pub fn multi_range_header(ranges: &[ByteRange]) -> String {
    let parts: Vec<String> = ranges.iter().map(|r| r.to_string()).collect();
    format!("bytes={}", parts.join(","))
}

/// The messages picked out of an inventory and the byte ranges covering them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    /// Merged ranges in file order.
    pub ranges: Vec<ByteRange>,
    /// `message_index` of every selected entry, ascending.
    pub messages: Vec<usize>,
    /// Index labels of the selected entries, same order as `messages`.
    pub labels: Vec<String>,
}

impl Selection {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Stable description of the selected messages, used for cache keys.
    pub fn signature(&self) -> String {
        let parts: Vec<String> = self.messages.iter().map(|m| m.to_string()).collect();
        parts.join(",")
    }

    /// Total bytes when every range is closed.
    pub fn total_len(&self) -> Option<u64> {
        self.ranges.iter().map(|r| r.len()).sum()
    }
}

/// Pick the entries matching `pattern` and coalesce their ranges.
pub fn resolve(entries: &[InventoryEntry], pattern: &SearchPattern) -> Selection {
    let selected: Vec<&InventoryEntry> = entries.iter().filter(|e| pattern.matches(e)).collect();

    let mut messages: Vec<usize> = selected.iter().map(|e| e.message_index).collect();
    messages.sort_unstable();
    messages.dedup();

    let mut labels = Vec::with_capacity(messages.len());
    for m in &messages {
        if let Some(e) = selected.iter().find(|e| e.message_index == *m) {
            labels.push(e.grib_message.clone());
        }
    }

    Selection {
        ranges: merge(selected.iter().map(|e| e.range()).collect()),
        messages,
        labels,
    }
}

/// Sort ranges by start and coalesce overlapping or adjacent ones.
pub fn merge(mut ranges: Vec<ByteRange>) -> Vec<ByteRange> {
    if ranges.len() < 2 {
        return ranges;
    }
    ranges.sort();

    let mut out: Vec<ByteRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        if let Some(last) = out.last_mut() {
            match last.end {
                // open range already runs to the end of the file
                None => continue,
                Some(last_end) if r.start <= last_end + 1 => {
                    last.end = match r.end {
                        Some(end) => Some(last_end.max(end)),
                        None => None,
                    };
                    continue;
                }
                Some(_) => {}
            }
        }
        out.push(r);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{IndexGrammar, parse_index};

    const IDX: &str = "\
1:0:d=2024010100:REFC:entire atmosphere:6 hour fcst:
2:1000:d=2024010100:RETOP:cloud top:6 hour fcst:
3:2500:d=2024010100:TMP:2 m above ground:6 hour fcst:
4:4000:d=2024010100:DPT:2 m above ground:6 hour fcst:
5:5200:d=2024010100:UGRD:10 m above ground:6 hour fcst:
6:6000:d=2024010100:VGRD:10 m above ground:6 hour fcst:
7:6100:d=2024010100:TMP:500 mb:6 hour fcst:
";

    fn entries() -> Vec<InventoryEntry> {
        parse_index(IDX, IndexGrammar::Wgrib2).entries
    }

    #[test]
    fn merges_adjacent_and_overlapping() {
        let merged = merge(vec![
            ByteRange::closed(200, 299),
            ByteRange::closed(0, 99),
            ByteRange::closed(100, 149),
            ByteRange::closed(250, 400),
            ByteRange::closed(500, 599),
        ]);
        assert_eq!(
            merged,
            vec![
                ByteRange::closed(0, 149),
                ByteRange::closed(200, 400),
                ByteRange::closed(500, 599)
            ]
        );
        for pair in merged.windows(2) {
            assert!(pair[0].end.unwrap() + 1 < pair[1].start);
        }
    }

    #[test]
    fn open_range_swallows_later_ranges() {
        let merged = merge(vec![
            ByteRange::closed(0, 9),
            ByteRange::open(10),
            ByteRange::closed(50, 60),
        ]);
        assert_eq!(merged, vec![ByteRange::open(0)]);
    }

    #[test]
    fn wind_components_coalesce() {
        let sel = resolve(&entries(), &SearchPattern::regex(":(U|V)GRD:10 m").unwrap());
        assert_eq!(sel.messages, vec![5, 6]);
        assert_eq!(sel.ranges, vec![ByteRange::closed(5200, 6099)]);
        assert_eq!(sel.signature(), "5,6");
        assert_eq!(sel.total_len(), Some(900));
    }

    #[test]
    fn separated_matches_stay_separate() {
        let sel = resolve(&entries(), &SearchPattern::exact(":TMP:").unwrap());
        assert_eq!(sel.messages, vec![3, 7]);
        assert_eq!(sel.ranges, vec![ByteRange::closed(2500, 3999), ByteRange::open(6100)]);
        assert_eq!(sel.total_len(), None);
    }

    #[test]
    fn resolving_is_idempotent() {
        let p = SearchPattern::regex(":(TMP|DPT):2 m").unwrap();
        let a = resolve(&entries(), &p);
        let b = resolve(&entries(), &p);
        assert_eq!(a, b);
        assert_eq!(merge(a.ranges.clone()), a.ranges);
    }

    #[test]
    fn empty_selection_is_not_an_error() {
        let sel = resolve(&entries(), &SearchPattern::regex(":APCP:").unwrap());
        assert!(sel.is_empty());
        assert!(sel.ranges.is_empty());
    }

    #[test]
    fn patterns() {
        assert!(SearchPattern::regex(":").unwrap().is_all());
        assert!(SearchPattern::exact("").unwrap().is_all());
        assert!(SearchPattern::regex("(").is_err());
        // exact escapes metacharacters
        let p = SearchPattern::exact("(U|V)").unwrap();
        assert!(!entries().iter().any(|e| p.matches(e)));
    }

    #[test]
    fn headers() {
        assert_eq!(ByteRange::closed(0, 0).header_value(), "bytes=0-0");
        assert_eq!(ByteRange::open(42).header_value(), "bytes=42-");
        assert_eq!(
            multi_range_header(&[ByteRange::closed(0, 9), ByteRange::closed(20, 29)]),
            "bytes=0-9,20-29"
        );
    }
}

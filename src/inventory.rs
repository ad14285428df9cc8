//! GRIB2 index ("inventory") files.
//!
//! Two grammars are understood:
//!
//! - [`IndexGrammar::Wgrib2`], the colon separated `.idx`/`.inv` files NOAA
//!   publishes next to every GRIB2 file:
//!   `12:3512453:d=2021010100:TMP:2 m above ground:anl:`
//! - [`IndexGrammar::Eccodes`], ECMWF's `.index` files with one JSON object per
//!   message carrying `_offset` and `_length`.
//!
//! Lines that cannot be understood are skipped and reported in
//! [`Inventory::malformed`]; one bad line never makes the whole index
//! unusable.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::date::{parse_eccodes_date_time, parse_forecast_lead, parse_reference_time};
use crate::error::{Error, Result};
use crate::subset::ByteRange;
use crate::transport::{Transport, read_body};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexGrammar {
    #[default]
    Wgrib2,
    Eccodes,
}

impl IndexGrammar {
    /// Suffix used when caching an index next to its data file.
    pub fn file_suffix(&self) -> &'static str {
        match self {
            IndexGrammar::Wgrib2 => "idx",
            IndexGrammar::Eccodes => "index",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryEntry {
    /// 1-based position in the index.
    pub message_index: usize,
    /// Message number as written in the index (`"12"`, `"12.2"`, or the
    /// position for ecCodes indexes).
    pub grib_message: String,
    pub byte_start: u64,
    /// Inclusive; `None` for the final message until the file size is known.
    pub byte_end: Option<u64>,
    pub variable: String,
    pub level: String,
    pub forecast: String,
    /// Trailing descriptors (ensemble member, probability, type, ...).
    pub extra: Vec<String>,
    pub reference_time: DateTime<Utc>,
    pub valid_time: DateTime<Utc>,
}

impl InventoryEntry {
    pub fn range(&self) -> ByteRange {
        ByteRange {
            start: self.byte_start,
            end: self.byte_end,
        }
    }

    /// The text a search pattern is matched against.
    pub fn search_text(&self) -> String {
        let mut s = format!(":{}:{}:{}:", self.variable, self.level, self.forecast);
        for e in &self.extra {
            s.push_str(e);
            s.push(':');
        }
        s
    }
}

/// An index line that was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedInventoryLine {
    /// 1-based line number in the index text.
    pub line_number: usize,
    pub line: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub grammar: IndexGrammar,
    pub entries: Vec<InventoryEntry>,
    pub malformed: Vec<MalformedInventoryLine>,
}

impl Inventory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Close the open-ended final range once the data file length is known.
    pub fn with_total_length(mut self, total_len: u64) -> Self {
        if total_len == 0 {
            return self;
        }
        let last_byte = total_len - 1;
        for e in self.entries.iter_mut().filter(|e| e.byte_end.is_none()) {
            if e.byte_start <= last_byte {
                e.byte_end = Some(last_byte);
            }
        }
        self
    }
}

/// Parse an index file.
pub fn parse_index(text: &str, grammar: IndexGrammar) -> Inventory {
    let mut malformed = Vec::new();
    let entries = match grammar {
        IndexGrammar::Wgrib2 => parse_wgrib2(text, &mut malformed),
        IndexGrammar::Eccodes => parse_eccodes(text, &mut malformed),
    };

    for m in &malformed {
        warn!(
            line_number = m.line_number,
            reason = %m.reason,
            line = %m.line,
            "skipping malformed index line"
        );
    }
    debug!(entries = entries.len(), skipped = malformed.len(), ?grammar, "parsed index");

    Inventory {
        grammar,
        entries,
        malformed,
    }
}

fn parse_wgrib2(text: &str, malformed: &mut Vec<MalformedInventoryLine>) -> Vec<InventoryEntry> {
    let mut entries: Vec<InventoryEntry> = Vec::new();

    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut reject = |reason: String| {
            malformed.push(MalformedInventoryLine {
                line_number: i + 1,
                line: line.to_string(),
                reason,
            })
        };

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 6 {
            reject(format!("expected at least 6 fields, found {}", fields.len()));
            continue;
        }

        let label = fields[0].trim();
        if label.is_empty() || !label.chars().all(|c| c.is_ascii_digit() || c == '.') {
            reject(format!("bad message number {label:?}"));
            continue;
        }
        let Ok(start) = fields[1].trim().parse::<u64>() else {
            reject(format!("bad byte offset {:?}", fields[1]));
            continue;
        };
        let Some(reference_time) = parse_reference_time(fields[2]) else {
            reject(format!("bad reference time {:?}", fields[2]));
            continue;
        };
        let variable = fields[3].trim();
        if variable.is_empty() {
            reject("empty variable".into());
            continue;
        }
        if let Some(prev) = entries.last() {
            if start < prev.byte_start {
                reject(format!("offset {start} goes backwards (previous {})", prev.byte_start));
                continue;
            }
        }

        let forecast = fields[5].trim().to_string();
        let lead = parse_forecast_lead(&forecast).unwrap_or_else(Duration::zero);
        let extra = fields[6..]
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        entries.push(InventoryEntry {
            message_index: entries.len() + 1,
            grib_message: label.to_string(),
            byte_start: start,
            byte_end: None,
            variable: variable.to_string(),
            level: fields[4].trim().to_string(),
            forecast,
            extra,
            reference_time,
            valid_time: reference_time + lead,
        });
    }

    // A message ends right before the next larger offset. Sub-messages
    // sharing an offset share the same range.
    let mut following: Option<u64> = None;
    for i in (0..entries.len()).rev() {
        if let Some(next) = entries.get(i + 1) {
            if next.byte_start > entries[i].byte_start {
                following = Some(next.byte_start);
            }
        }
        entries[i].byte_end = following.map(|s| s - 1);
    }

    entries
}

fn parse_eccodes(text: &str, malformed: &mut Vec<MalformedInventoryLine>) -> Vec<InventoryEntry> {
    let mut entries: Vec<InventoryEntry> = Vec::new();

    for (i, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let mut reject = |reason: String| {
            malformed.push(MalformedInventoryLine {
                line_number: i + 1,
                line: line.to_string(),
                reason,
            })
        };

        let v: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                reject(format!("invalid json: {e}"));
                continue;
            }
        };

        let Some(offset) = v.get("_offset").and_then(|x| x.as_u64()) else {
            reject("missing _offset".into());
            continue;
        };
        let Some(length) = v.get("_length").and_then(|x| x.as_u64()).filter(|l| *l > 0) else {
            reject("missing or zero _length".into());
            continue;
        };
        let Some(param) = field(&v, "param") else {
            reject("missing param".into());
            continue;
        };
        let reference_time = match (field(&v, "date"), field(&v, "time")) {
            (Some(d), Some(t)) => parse_eccodes_date_time(&d, &t),
            _ => None,
        };
        let Some(reference_time) = reference_time else {
            reject("missing or bad date/time".into());
            continue;
        };
        if let Some(prev) = entries.last() {
            if prev.byte_end.is_some_and(|end| offset <= end) {
                reject(format!("offset {offset} overlaps the previous message"));
                continue;
            }
        }

        let levtype = field(&v, "levtype").unwrap_or_default();
        let level = match field(&v, "levelist") {
            Some(l) => format!("{l}:{levtype}"),
            None => levtype,
        };
        let forecast = field(&v, "step").unwrap_or_default();
        let lead = forecast
            .rsplit('-')
            .next()
            .and_then(|h| h.trim().parse::<i64>().ok())
            .map(Duration::hours)
            .unwrap_or_else(Duration::zero);
        let extra = ["type", "stream", "number"]
            .iter()
            .filter_map(|k| field(&v, k).map(|val| format!("{k}={val}")))
            .collect();

        entries.push(InventoryEntry {
            message_index: entries.len() + 1,
            grib_message: (entries.len() + 1).to_string(),
            byte_start: offset,
            byte_end: Some(offset + length - 1),
            variable: param,
            level,
            forecast,
            extra,
            reference_time,
            valid_time: reference_time + lead,
        });
    }

    entries
}

/// String view of a JSON field that may be a string or a number.
fn field(v: &serde_json::Value, key: &str) -> Option<String> {
    match v.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Download and parse an index.
pub async fn fetch_inventory(
    transport: &dyn Transport,
    url: &str,
    grammar: IndexGrammar,
    cancel: &CancellationToken,
) -> Result<(Inventory, String)> {
    let unavailable = |reason: String| Error::InventoryUnavailable {
        url: url.to_string(),
        reason,
    };

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        r = transport.get(url, &[]) => r.map_err(|e| unavailable(e.to_string()))?,
    };
    if response.status != 200 {
        return Err(unavailable(format!("HTTP {}", response.status)));
    }

    let body = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        b = read_body(response.body) => b.map_err(|e| unavailable(e.to_string()))?,
    };
    let text = String::from_utf8_lossy(&body).into_owned();
    let inventory = parse_index(&text, grammar);
    if inventory.is_empty() {
        return Err(unavailable("index contains no usable lines".into()));
    }
    Ok((inventory, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) const HRRR_IDX: &str = "\
1:0:d=2024010100:REFC:entire atmosphere:6 hour fcst:
2:1000:d=2024010100:RETOP:cloud top:6 hour fcst:
3:2500:d=2024010100:TMP:2 m above ground:6 hour fcst:
4:4000:d=2024010100:DPT:2 m above ground:6 hour fcst:
5:5200:d=2024010100:UGRD:10 m above ground:6 hour fcst:
6:6000:d=2024010100:VGRD:10 m above ground:6 hour fcst:
";

    #[test]
    fn wgrib2_offsets_chain() {
        let inv = parse_index(HRRR_IDX, IndexGrammar::Wgrib2);
        assert_eq!(inv.len(), 6);
        assert!(inv.malformed.is_empty());
        for pair in inv.entries.windows(2) {
            assert_eq!(pair[0].byte_end, Some(pair[1].byte_start - 1));
            assert_eq!(pair[1].message_index, pair[0].message_index + 1);
        }
        assert_eq!(inv.entries[5].byte_end, None);

        let tmp = &inv.entries[2];
        assert_eq!(tmp.variable, "TMP");
        assert_eq!(tmp.level, "2 m above ground");
        assert_eq!(tmp.reference_time, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(tmp.valid_time, Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap());
        assert_eq!(tmp.search_text(), ":TMP:2 m above ground:6 hour fcst:");

        let closed = inv.with_total_length(7000);
        assert_eq!(closed.entries[5].byte_end, Some(6999));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let text = "\
1:0:d=2024010100:REFC:entire atmosphere:anl:
garbage line
2:abc:d=2024010100:TMP:2 m above ground:anl:
3:900:d=20240101:TMP:2 m above ground:anl:
4:1200:d=2024010100:TMP:2 m above ground:anl
5:800:d=2024010100:DPT:2 m above ground:anl:
";
        let inv = parse_index(text, IndexGrammar::Wgrib2);
        let labels: Vec<_> = inv.entries.iter().map(|e| e.grib_message.as_str()).collect();
        assert_eq!(labels, vec!["1", "4"]);
        assert_eq!(inv.entries[0].byte_end, Some(1199));
        let bad: Vec<_> = inv.malformed.iter().map(|m| m.line_number).collect();
        assert_eq!(bad, vec![2, 3, 4, 6]);
    }

    #[test]
    fn sub_messages_share_a_range() {
        let text = "\
1:0:d=2024010100:HGT:500 mb:anl:
2.1:100:d=2024010100:UGRD:500 mb:anl:
2.2:100:d=2024010100:VGRD:500 mb:anl:
3:300:d=2024010100:TMP:500 mb:anl:
";
        let inv = parse_index(text, IndexGrammar::Wgrib2);
        assert_eq!(inv.entries[1].range(), inv.entries[2].range());
        assert_eq!(inv.entries[1].byte_end, Some(299));
        assert_eq!(inv.entries[0].byte_end, Some(99));
    }

    #[test]
    fn extra_descriptors_are_kept() {
        let text = "1:0:d=2024010100:TMP:2 m above ground:6 hour fcst:ENS=+3\n";
        let inv = parse_index(text, IndexGrammar::Wgrib2);
        assert_eq!(inv.entries[0].extra, vec!["ENS=+3"]);
        assert!(inv.entries[0].search_text().ends_with(":ENS=+3:"));
    }

    #[test]
    fn eccodes_lines() {
        let text = r#"{"domain": "g", "date": "20220126", "time": "0000", "type": "fc", "stream": "oper", "step": "6", "levtype": "sfc", "param": "msl", "_offset": 0, "_length": 609069}
{"domain": "g", "date": "20220126", "time": "0000", "type": "fc", "stream": "oper", "step": "6", "levelist": "500", "levtype": "pl", "param": "gh", "_offset": 609069, "_length": 100}
not json
{"date": "20220126", "time": "0000", "param": "t", "_offset": 10}
"#;
        let inv = parse_index(text, IndexGrammar::Eccodes);
        assert_eq!(inv.len(), 2);
        assert_eq!(inv.malformed.len(), 2);

        let msl = &inv.entries[0];
        assert_eq!(msl.byte_end, Some(609068));
        assert_eq!(msl.level, "sfc");
        assert_eq!(msl.search_text(), ":msl:sfc:6:type=fc:stream=oper:");
        assert_eq!(msl.valid_time, Utc.with_ymd_and_hms(2022, 1, 26, 6, 0, 0).unwrap());

        let gh = &inv.entries[1];
        assert_eq!(gh.level, "500:pl");
        assert_eq!(gh.range(), ByteRange { start: 609069, end: Some(609168) });
    }
}

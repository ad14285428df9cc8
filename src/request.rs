use chrono::{DateTime, Duration, Utc};

use crate::date::parse_cycle;
use crate::error::{Error, Result};

/// What to retrieve: one model file (model, cycle, lead, product) and
/// optionally a subset of its messages.
///
/// Built with consuming builder methods; once handed to the client it is
/// not modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    model: String,
    cycle: DateTime<Utc>,
    lead_hours: u32,
    product: Option<String>,
    member: Option<u32>,
    search: Option<String>,
    priority: Option<Vec<String>>,
    overwrite: bool,
}

impl Request {
    pub fn new(model: impl Into<String>, cycle: DateTime<Utc>) -> Self {
        Self {
            model: model.into().to_lowercase(),
            cycle,
            lead_hours: 0,
            product: None,
            member: None,
            search: None,
            priority: None,
            overwrite: false,
        }
    }

    /// Like [`Request::new`] but parses the cycle with [`parse_cycle`].
    pub fn parse(model: impl Into<String>, cycle: &str) -> Result<Self> {
        Ok(Self::new(model, parse_cycle(cycle)?))
    }

    /// Build a request from the time the forecast is valid for; the cycle is
    /// `valid - lead`.
    pub fn from_valid_time(
        model: impl Into<String>,
        valid: DateTime<Utc>,
        lead_hours: u32,
    ) -> Self {
        Self::new(model, valid - Duration::hours(i64::from(lead_hours))).lead(lead_hours)
    }

    pub fn lead(mut self, hours: u32) -> Self {
        self.lead_hours = hours;
        self
    }

    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    pub fn member(mut self, member: u32) -> Self {
        self.member = Some(member);
        self
    }

    /// Search expression matched against `:VARIABLE:LEVEL:FORECAST:` of
    /// every index line, e.g. `":TMP:2 m"` or `":(U|V)GRD:10 m"`.
    /// `":"` or an empty string means the whole file.
    pub fn search(mut self, pattern: impl Into<String>) -> Self {
        self.search = Some(pattern.into());
        self
    }

    /// Only try these providers, in this order.
    pub fn priority<I, S>(mut self, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.priority = Some(providers.into_iter().map(|s| s.into().to_lowercase()).collect());
        self
    }

    /// Download again even when the cache already holds the result; the
    /// fresh copy replaces the cached one.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model
    }

    pub fn cycle(&self) -> DateTime<Utc> {
        self.cycle
    }

    pub fn lead_hours(&self) -> u32 {
        self.lead_hours
    }

    pub fn valid_time(&self) -> DateTime<Utc> {
        self.cycle + Duration::hours(i64::from(self.lead_hours))
    }

    pub fn product_name(&self) -> Option<&str> {
        self.product.as_deref()
    }

    pub fn member_number(&self) -> Option<u32> {
        self.member
    }

    /// The subset search, `None` when the whole file is wanted.
    pub fn search_pattern(&self) -> Option<&str> {
        match self.search.as_deref() {
            None | Some("") | Some(":") => None,
            Some(s) => Some(s),
        }
    }

    pub fn priority_override(&self) -> Option<&[String]> {
        self.priority.as_deref()
    }

    pub fn overwrites(&self) -> bool {
        self.overwrite
    }

    /// One request per lead time, e.g. `"0/to/18/by/6"` or `"1/2/3"`.
    pub fn for_leads(&self, leads: &str) -> Result<Vec<Request>> {
        let mut out = Vec::new();
        for token in expand_lead_list(leads)? {
            out.push(self.clone().lead(token));
        }
        Ok(out)
    }
}

/// Expand a list of lead hours: `"6"`, `"0,3,6"`, `"0/to/12"`,
/// `"0/to/12/by/3"`.
pub fn expand_lead_list(s: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();
    let trimmed = s.trim();
    let pieces: Vec<String> = if trimmed.contains("/to/") {
        vec![trimmed.to_string()]
    } else {
        trimmed
            .split([',', '/'])
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    };

    for piece in pieces {
        for v in expand_numeric_syntax(&piece)? {
            let hour: u32 = v
                .parse()
                .map_err(|_| Error::InvalidRequest(format!("invalid lead hour: {v}")))?;
            out.push(hour);
        }
    }
    Ok(out)
}

/// Expand a list-like value, accepting strings like "0/to/120/by/6".
pub fn expand_numeric_syntax(s: &str) -> Result<Vec<String>> {
    let tokens: Vec<&str> = s.split('/').filter(|t| !t.is_empty()).collect();
    if tokens.len() == 3 && tokens[1].eq_ignore_ascii_case("to") {
        let (start, end) = range_bounds(&tokens)?;
        return Ok((start..=end).map(|x| x.to_string()).collect());
    }

    if tokens.len() == 5
        && tokens[1].eq_ignore_ascii_case("to")
        && tokens[3].eq_ignore_ascii_case("by")
    {
        let (start, end) = range_bounds(&tokens)?;
        let by: i64 = tokens[4].parse().map_err(|_| {
            Error::InvalidRequest(format!("cannot parse range step {tokens:?}"))
        })?;
        if by <= 0 {
            return Err(Error::InvalidRequest(format!("range step must be >0, got {by}")));
        }

        let mut out = Vec::new();
        let mut cur = start;
        while cur <= end {
            out.push(cur.to_string());
            cur += by;
        }
        return Ok(out);
    }

    Ok(vec![s.to_string()])
}

fn range_bounds(tokens: &[&str]) -> Result<(i64, i64)> {
    let start: i64 = tokens[0].parse().map_err(|_| {
        Error::InvalidRequest(format!("cannot parse range start {tokens:?}"))
    })?;
    let end: i64 = tokens[2].parse().map_err(|_| {
        Error::InvalidRequest(format!("cannot parse range end {tokens:?}"))
    })?;
    if end < start {
        return Err(Error::InvalidRequest(format!("range end {end} < start {start}")));
    }
    Ok((start, end))
}

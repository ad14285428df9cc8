//! Provider URL templates.
//!
//! A template is plain text with `{name}` placeholders; integer and numeric
//! values can be zero padded with `{name:0N}`:
//!
//! ```text
//! https://noaa-hrrr-bdp-pds.s3.amazonaws.com/hrrr.{yyyymmdd}/conus/hrrr.t{HH}z.wrf{product}f{fxx:02}.grib2
//! ```
//!
//! Index templates additionally see `{data_url}` and `{data_stem}` (the data
//! URL without its final extension), so `{data_url}.idx` and
//! `{data_stem}.index` both work.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::registry::{ModelDef, Provider};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("template {template:?} uses {{{name}}} which is not available here")]
    MissingVariable { name: String, template: String },

    #[error("malformed template {template:?}: {reason}")]
    Malformed { template: String, reason: String },

    #[error("rendered url {url:?} is invalid: {reason}")]
    InvalidUrl { url: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var { name: String, width: Option<usize> },
}

/// A parsed path/URL template.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl fmt::Debug for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PathTemplate").field(&self.source).finish()
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl TryFrom<String> for PathTemplate {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PathTemplate::parse(&value)
    }
}

impl From<PathTemplate> for String {
    fn from(value: PathTemplate) -> Self {
        value.source
    }
}

impl PathTemplate {
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let malformed = |reason: &str| TemplateError::Malformed {
            template: source.to_string(),
            reason: reason.to_string(),
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = source.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut body = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') => return Err(malformed("nested '{'")),
                            Some(ch) => body.push(ch),
                            None => return Err(malformed("unterminated placeholder")),
                        }
                    }

                    let (name, width) = match body.split_once(':') {
                        Some((name, spec)) => {
                            let digits = spec.strip_prefix('0').unwrap_or(spec);
                            let width: usize = digits
                                .parse()
                                .map_err(|_| malformed(&format!("bad width spec {spec:?}")))?;
                            (name, Some(width))
                        }
                        None => (body.as_str(), None),
                    };
                    let valid = |ch: char| ch.is_ascii_alphanumeric() || ch == '_';
                    if name.is_empty() || !name.chars().all(valid) {
                        return Err(malformed(&format!("bad placeholder name {name:?}")));
                    }

                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Var {
                        name: name.to_string(),
                        width,
                    });
                }
                '}' => return Err(malformed("unmatched '}'")),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Placeholder names in order of appearance.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Var { name, .. } => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    pub fn render(&self, vars: &TemplateVars) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.source.len() + 32);
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Var { name, width } => {
                    let value = vars.get(name).ok_or_else(|| TemplateError::MissingVariable {
                        name: name.clone(),
                        template: self.source.clone(),
                    })?;
                    match (value, width) {
                        (Value::Int(n), Some(w)) => out.push_str(&format!("{n:0w$}", w = *w)),
                        (Value::Int(n), None) => out.push_str(&n.to_string()),
                        (Value::Text(s), Some(w)) if s.bytes().all(|b| b.is_ascii_digit()) => {
                            out.push_str(&format!("{s:0>w$}", w = *w))
                        }
                        (Value::Text(_), Some(_)) => {
                            return Err(TemplateError::Malformed {
                                template: self.source.clone(),
                                reason: format!("width given for non-numeric {{{name}}}"),
                            });
                        }
                        (Value::Text(s), None) => out.push_str(s),
                    }
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Text(String),
    Int(i64),
}

/// Substitution variables for one rendering.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
    vars: BTreeMap<String, Value>,
}

impl TemplateVars {
    /// Variables derived from a model run.
    pub fn for_run(
        model: &str,
        product: &str,
        cycle: DateTime<Utc>,
        lead_hours: u32,
        member: Option<u32>,
    ) -> Self {
        let mut v = Self::default();
        v.text("model", model);
        v.text("product", product);
        v.text("yyyy", cycle.format("%Y").to_string());
        v.text("mm", cycle.format("%m").to_string());
        v.text("dd", cycle.format("%d").to_string());
        v.text("HH", cycle.format("%H").to_string());
        v.text("MM", cycle.format("%M").to_string());
        v.text("yyyymm", cycle.format("%Y%m").to_string());
        v.text("yyyymmdd", cycle.format("%Y%m%d").to_string());
        v.text("yyyymmddHH", cycle.format("%Y%m%d%H").to_string());
        v.text("yyyymmddHHMMSS", cycle.format("%Y%m%d%H%M%S").to_string());
        v.int("fxx", i64::from(lead_hours));
        if let Some(m) = member {
            v.int("member", i64::from(m));
        }
        v
    }

    /// Run variables plus the model's per-product variables, which may
    /// themselves reference run variables.
    pub fn for_model(
        model: &ModelDef,
        product: &str,
        cycle: DateTime<Utc>,
        lead_hours: u32,
        member: Option<u32>,
    ) -> Result<Self, TemplateError> {
        let mut v = Self::for_run(&model.id, product, cycle, lead_hours, member);
        let mut extra = Vec::new();
        for (name, value) in model.vars_for(product) {
            extra.push((name, PathTemplate::parse(value)?.render(&v)?));
        }
        for (name, value) in extra {
            v.text(name, value);
        }
        Ok(v)
    }

    pub fn text(&mut self, name: &str, value: impl Into<String>) -> &mut Self {
        self.vars.insert(name.to_string(), Value::Text(value.into()));
        self
    }

    pub fn int(&mut self, name: &str, value: i64) -> &mut Self {
        self.vars.insert(name.to_string(), Value::Int(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }
}

/// URLs of one file on one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedUrls {
    pub data_url: String,
    pub index_url: Option<String>,
}

/// Render the data and index URLs of `provider` for a model run.
pub fn render(provider: &Provider, vars: &TemplateVars) -> Result<RenderedUrls, TemplateError> {
    let data_url = provider.data_template.render(vars)?;
    validate_url(&data_url)?;

    let index_url = match &provider.index_template {
        Some(t) => {
            let mut with_data = vars.clone();
            with_data.text("data_url", data_url.clone());
            with_data.text("data_stem", strip_extension(&data_url));
            let u = t.render(&with_data)?;
            validate_url(&u)?;
            Some(u)
        }
        None => None,
    };

    Ok(RenderedUrls { data_url, index_url })
}

fn validate_url(u: &str) -> Result<(), TemplateError> {
    match Url::parse(u) {
        Ok(parsed) if parsed.cannot_be_a_base() => Err(TemplateError::InvalidUrl {
            url: u.to_string(),
            reason: "not a hierarchical url".into(),
        }),
        Ok(_) => Ok(()),
        Err(e) => Err(TemplateError::InvalidUrl {
            url: u.to_string(),
            reason: e.to_string(),
        }),
    }
}

fn strip_extension(url: &str) -> String {
    let last_slash = url.rfind('/').map(|i| i + 1).unwrap_or(0);
    match url[last_slash..].rfind('.') {
        Some(dot) => url[..last_slash + dot].to_string(),
        None => url.to_string(),
    }
}

/// Last path segment of a URL, used as the local file name.
pub fn file_name_from_url(u: &str) -> Option<String> {
    let parsed = Url::parse(u).ok()?;
    parsed
        .path_segments()?
        .filter(|s| !s.is_empty())
        .next_back()
        .map(|s| s.to_string())
}

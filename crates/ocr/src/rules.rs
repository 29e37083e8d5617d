use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Failed to read template file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse template TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid pattern in template '{template}': {source}")]
    Pattern {
        template: String,
        #[source]
        source: regex::Error,
    },
    #[error("Template '{0}' needs at least one non-empty keyword")]
    NoKeywords(String),
}

// ── Compiled regex cache ─────────────────────────────────────────────────────

macro_rules! re {
    ($name:ident, $pat:expr) => {
        fn $name() -> &'static Regex {
            static R: OnceLock<Regex> = OnceLock::new();
            R.get_or_init(|| Regex::new($pat).expect("invalid regex"))
        }
    };
}

// Strict MM/DD/YYYY before the looser form, which also hits prices and phone fragments.
re!(re_date_strict, r"([0-9]{2}[/-][0-9]{2}[/-][0-9]{4})");
re!(re_date_loose, r"([0-9]{1,2}[/-][0-9]{1,2}[/-][0-9]{2,4})");

re!(re_subtotal, r"(?i)SUBTOTAL\s*\$?([0-9]+\.?[0-9]*)");
re!(re_subtotal_split, r"(?i)SUB[\s-]?TOTAL\s*\$?([0-9]+\.?[0-9]*)");

re!(re_tax, r"(?i)TAX\s*\$?([0-9]+\.?[0-9]*)");
re!(re_sales_tax, r"(?i)SALES TAX\s*\$?([0-9]+\.?[0-9]*)");

re!(re_total, r"(?i)TOTAL\s*\$?([0-9]+\.?[0-9]*)");
re!(re_total_word, r"(?i)\bTOTAL\s*\$?([0-9]+\.?[0-9]*)");
re!(re_amount_due, r"(?i)AMOUNT DUE\s*\$?([0-9]+\.?[0-9]*)");

// Subtotal label ending right before a `TOTAL` match: `SUB`, `SUB-`, `SUB `.
re!(re_subtotal_label, r"(?i)SUB[ \t-]?$");

re!(re_transaction_id, r"(?i)TRANS(?:ACTION)?\s*ID\s*[-:]?\s*([A-Z0-9]+)");
re!(re_trans_id, r"(?i)TRANS\s*ID\s*[-:]?\s*([A-Z0-9]+)");

// ── Rules ─────────────────────────────────────────────────────────────────────

/// One pattern in a field's fallback chain. The first capture group (or the
/// whole match, if the pattern has none) is the extracted value.
#[derive(Debug, Clone)]
pub struct Rule {
    pattern: Regex,
    /// A match is skipped when the text before it on the same line ends with
    /// this pattern. Keeps `TOTAL` from firing inside `SUBTOTAL` or `SUB-TOTAL`.
    reject_prefix: Option<Regex>,
}

impl Rule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::from_regex(Regex::new(pattern)?))
    }

    pub fn from_regex(pattern: Regex) -> Self {
        Self { pattern, reject_prefix: None }
    }

    /// Skip matches preceded by `prefix`, a case-insensitive pattern anchored
    /// to the start of the match.
    pub fn rejecting_prefix(self, prefix: &str) -> Result<Self, regex::Error> {
        Ok(self.rejecting(Regex::new(&format!("(?i)(?:{prefix})$"))?))
    }

    fn rejecting(mut self, prefix: Regex) -> Self {
        self.reject_prefix = Some(prefix);
        self
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Scan `text` left to right and return the first accepted match that
    /// `convert` turns into a value.
    pub fn find_map<T>(&self, text: &str, convert: impl Fn(&str) -> Option<T>) -> Option<T> {
        self.pattern.captures_iter(text).find_map(|caps| {
            let whole = caps.get(0)?;
            if let Some(prefix) = &self.reject_prefix {
                let before = &text[..whole.start()];
                let line = before.rfind('\n').map_or(before, |i| &before[i + 1..]);
                if prefix.is_match(line) {
                    return None;
                }
            }
            convert(caps.get(1).unwrap_or(whole).as_str())
        })
    }
}

/// Evaluate `rules` in order; the first rule yielding a value wins. Returns the
/// index of the winning rule alongside the value.
pub fn first_match<T>(
    rules: &[Rule],
    text: &str,
    convert: impl Fn(&str) -> Option<T>,
) -> Option<(usize, T)> {
    rules
        .iter()
        .enumerate()
        .find_map(|(i, rule)| rule.find_map(text, &convert).map(|v| (i, v)))
}

/// Ordered fallback chains for every extracted field. Order within each list
/// is precedence: earlier rules are less prone to false positives.
#[derive(Debug, Clone)]
pub struct FieldRules {
    pub date: Vec<Rule>,
    pub subtotal: Vec<Rule>,
    pub tax: Vec<Rule>,
    pub total: Vec<Rule>,
    pub transaction_id: Vec<Rule>,
}

impl FieldRules {
    /// Label vocabulary of a typical US big-box receipt.
    pub fn generic() -> Self {
        let rule = |re: fn() -> &'static Regex| Rule::from_regex(re().clone());
        Self {
            date: vec![rule(re_date_strict), rule(re_date_loose)],
            subtotal: vec![rule(re_subtotal), rule(re_subtotal_split)],
            tax: vec![rule(re_tax), rule(re_sales_tax)],
            total: vec![
                rule(re_total).rejecting(re_subtotal_label().clone()),
                rule(re_total_word).rejecting(re_subtotal_label().clone()),
                rule(re_amount_due),
            ],
            transaction_id: vec![rule(re_transaction_id), rule(re_trans_id)],
        }
    }
}

/// A vendor's canonical name, the keywords that identify its receipts, and
/// the rules used to read them.
#[derive(Debug, Clone)]
pub struct VendorTemplate {
    pub name: String,
    keywords: Vec<String>,
    pub rules: FieldRules,
}

impl VendorTemplate {
    pub fn new(name: impl Into<String>, keywords: &[&str], rules: FieldRules) -> Self {
        Self {
            name: name.into(),
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            rules,
        }
    }

    /// Case-insensitive substring match of any keyword.
    fn matches(&self, lowered_text: &str) -> bool {
        self.keywords.iter().any(|k| lowered_text.contains(k.as_str()))
    }
}

/// Vendor templates in detection order, plus the rules used when no vendor
/// is recognized.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: Vec<VendorTemplate>,
    fallback: FieldRules,
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl TemplateRegistry {
    pub fn builtin() -> Self {
        Self {
            templates: vec![VendorTemplate::new("Walmart", &["walmart"], FieldRules::generic())],
            fallback: FieldRules::generic(),
        }
    }

    pub fn with_template(mut self, template: VendorTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn templates(&self) -> &[VendorTemplate] {
        &self.templates
    }

    /// Built-in templates followed by those defined in `toml_content`.
    pub fn from_toml(toml_content: &str) -> Result<Self, TemplateError> {
        Self::builtin().extend_from_toml(toml_content)
    }

    pub fn load(path: &Path) -> Result<Self, TemplateError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    pub fn extend_from_toml(mut self, toml_content: &str) -> Result<Self, TemplateError> {
        let file: TemplateFile = toml::from_str(toml_content)?;
        for spec in file.templates {
            self.templates.push(spec.compile()?);
        }
        Ok(self)
    }

    /// The first registered template whose keyword appears in `text`.
    pub fn detect(&self, text: &str) -> Option<&VendorTemplate> {
        let lowered = text.to_lowercase();
        self.templates.iter().find(|t| t.matches(&lowered))
    }

    /// Detected template (if any) and the rules to apply.
    pub fn select(&self, text: &str) -> (Option<&VendorTemplate>, &FieldRules) {
        match self.detect(text) {
            Some(t) => (Some(t), &t.rules),
            None => (None, &self.fallback),
        }
    }
}

// ── TOML template definitions ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TemplateFile {
    #[serde(default, rename = "template")]
    templates: Vec<TemplateSpec>,
}

#[derive(Debug, Deserialize)]
struct TemplateSpec {
    name: String,
    keywords: Vec<String>,
    #[serde(default)]
    rules: RuleTableSpec,
}

/// A field left out inherits the generic chain.
#[derive(Debug, Default, Deserialize)]
struct RuleTableSpec {
    date: Option<Vec<RuleSpec>>,
    subtotal: Option<Vec<RuleSpec>>,
    tax: Option<Vec<RuleSpec>>,
    total: Option<Vec<RuleSpec>>,
    transaction_id: Option<Vec<RuleSpec>>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    pattern: String,
    #[serde(default)]
    reject_prefix: Option<String>,
}

impl TemplateSpec {
    fn compile(self) -> Result<VendorTemplate, TemplateError> {
        let keywords: Vec<&str> = self
            .keywords
            .iter()
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() {
            return Err(TemplateError::NoKeywords(self.name));
        }

        let name = &self.name;
        let compile = |specs: Option<Vec<RuleSpec>>, generic: Vec<Rule>| match specs {
            None => Ok(generic),
            Some(specs) => specs
                .into_iter()
                .map(|s| -> Result<Rule, TemplateError> {
                    let invalid = |source| TemplateError::Pattern { template: name.clone(), source };
                    let rule = Rule::new(&s.pattern).map_err(invalid)?;
                    match s.reject_prefix {
                        Some(prefix) => rule.rejecting_prefix(&prefix).map_err(invalid),
                        None => Ok(rule),
                    }
                })
                .collect::<Result<Vec<_>, TemplateError>>(),
        };

        let generic = FieldRules::generic();
        let rules = FieldRules {
            date: compile(self.rules.date, generic.date)?,
            subtotal: compile(self.rules.subtotal, generic.subtotal)?,
            tax: compile(self.rules.tax, generic.tax)?,
            total: compile(self.rules.total, generic.total)?,
            transaction_id: compile(self.rules.transaction_id, generic.transaction_id)?,
        };
        Ok(VendorTemplate::new(self.name.clone(), &keywords, rules))
    }
}

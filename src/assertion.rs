//! Assertion operators.
//!
//! An assertion resolves its `actualValue` and `expectedValue`
//! operands through the token resolver, checks that the operands have
//! the shape the operator needs, and compares them. The outcome is
//! always an [`AssertionResult`]; a failed comparison or a shape
//! mismatch is a failing result, never an error.

use crate::context::VariableContext;
use crate::error::{Error, Result};
use crate::registry::{self, Assertions, TypeDescriptor, BUILTIN_ASSERTIONS};
use crate::token::{resolve_value, stringify};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use linkme::distributed_slice;
use regex::RegexBuilder;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;

/// Placeholder printed instead of masked operand values.
pub const MASK: &str = "****";

/// `Ok(())` when the comparison holds, otherwise the failure message.
pub type Verdict = std::result::Result<(), String>;

/// Operand shape an operator needs before it can compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Any,
    /// `actual` must be a string, array or object.
    SizedActual,
    /// `expected` must be a two element `[min, max]` numeric array.
    RangeExpected,
}

/// Behaviour shared by every assertion operator.
pub trait AssertionOperation: fmt::Debug + Send + Sync {
    fn operands(&self) -> &Operands;

    fn requirement(&self) -> Requirement {
        Requirement::Any
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict;
}

/// Marker for operators that can be built from a JSON document.
pub trait AssertionType: AssertionOperation + DeserializeOwned + 'static {
    const DISCRIMINATOR: Option<&'static str> = None;
}

/// Unresolved operands and flags common to all operators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operands {
    #[serde(alias = "actual")]
    pub actual_value: Value,
    #[serde(default, alias = "expected")]
    pub expected_value: Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub mask: bool,
}

/// A constructed assertion together with its operator name.
#[derive(Debug)]
pub struct Assertion {
    operator: String,
    operation: Box<dyn AssertionOperation>,
}

impl Assertion {
    pub fn new(operator: &str, operands: Operands) -> Result<Self> {
        let args = match serde_json::to_value(&operands) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let operation = registry::construct_assertion(operator, args)?;
        Ok(Self {
            operator: operator.to_lowercase(),
            operation,
        })
    }

    pub fn operator(&self) -> &str {
        &self.operator
    }

    pub fn operands(&self) -> &Operands {
        self.operation.operands()
    }

    pub fn execute(&self, ctx: &VariableContext) -> AssertionResult {
        let operands = self.operation.operands();
        let actual = resolve_value(&operands.actual_value, ctx);
        let expected = resolve_value(&operands.expected_value, ctx);

        let verdict = check_requirement(
            &self.operator,
            self.operation.requirement(),
            &actual,
            &expected,
        )
        .and_then(|_| self.operation.evaluate(&actual, &expected));

        let success = verdict.is_ok();
        let mut message = verdict.err();
        if operands.mask {
            message = message.map(|m| hide_values(m, &[&actual, &expected]));
        }
        AssertionResult {
            operator: self.operator.clone(),
            success,
            description: operands.description.clone(),
            actual,
            expected,
            message,
            mask: operands.mask.then_some(true),
        }
    }
}

impl<'de> Deserialize<'de> for Assertion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let mut fields = Map::<String, Value>::deserialize(deserializer)?;
        let operator = take_discriminator(&mut fields, "assertion").map_err(D::Error::custom)?;
        let operation =
            registry::construct_assertion(&operator, fields).map_err(D::Error::custom)?;
        Ok(Self {
            operator: operator.to_lowercase(),
            operation,
        })
    }
}

/// Remove and return the `type` field of a polymorphic document.
pub(crate) fn take_discriminator(
    fields: &mut Map<String, Value>,
    family: &'static str,
) -> Result<String> {
    match fields.shift_remove("type") {
        Some(Value::String(kind)) if !kind.trim().is_empty() => Ok(kind.trim().to_string()),
        Some(other) => Err(Error::InvalidDefinition {
            family,
            discriminator: other.to_string(),
            message: "'type' must be a non-empty string".to_string(),
        }),
        None => Err(Error::InvalidDefinition {
            family,
            discriminator: String::new(),
            message: "missing 'type' field".to_string(),
        }),
    }
}

/// Outcome of one assertion.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionResult {
    pub operator: String,
    pub success: bool,
    pub description: Option<String>,
    pub actual: Value,
    pub expected: Value,
    pub message: Option<String>,
    #[serde(serialize_with = "serialize_mask")]
    mask: Option<bool>,
}

impl AssertionResult {
    /// Set the mask flag. It can be set only once per result.
    pub fn set_mask(&mut self, mask: bool) -> Result<()> {
        if self.mask.is_some() {
            return Err(Error::MaskAlreadySet);
        }
        self.mask = Some(mask);
        Ok(())
    }

    pub fn is_masked(&self) -> bool {
        self.mask.unwrap_or(false)
    }

    pub fn display_actual(&self) -> String {
        self.display(&self.actual)
    }

    pub fn display_expected(&self) -> String {
        self.display(&self.expected)
    }

    /// Copy safe to publish: masked operands are replaced by
    /// [`MASK`].
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if self.is_masked() {
            copy.actual = MASK.into();
            copy.expected = MASK.into();
        }
        copy
    }

    fn display(&self, value: &Value) -> String {
        if self.is_masked() {
            MASK.to_string()
        } else {
            stringify(value)
        }
    }
}

fn hide_values(message: String, values: &[&Value]) -> String {
    values
        .iter()
        .map(|v| stringify(v))
        .filter(|text| !text.is_empty())
        .fold(message, |message, text| message.replace(&text, MASK))
}

fn serialize_mask<S: Serializer>(mask: &Option<bool>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_bool(mask.unwrap_or(false))
}

fn check_requirement(
    operator: &str,
    requirement: Requirement,
    actual: &Value,
    expected: &Value,
) -> Verdict {
    match requirement {
        Requirement::Any => Ok(()),
        Requirement::SizedActual => match actual {
            Value::String(_) | Value::Array(_) | Value::Object(_) => Ok(()),
            other => Err(format!(
                "Operator '{operator}' requires a collection or string actual value, got {}",
                describe_type(other)
            )),
        },
        Requirement::RangeExpected => match range(expected) {
            Some(_) => Ok(()),
            None => Err(format!(
                "Operator '{operator}' requires [min,max] numeric expected value, got {}",
                expected
            )),
        },
    }
}

/// Descriptive JSON type name used in messages and by `type`.
pub fn describe_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn range(expected: &Value) -> Option<(f64, f64)> {
    match expected {
        Value::Array(bounds) if bounds.len() == 2 => {
            Some((as_number(&bounds[0])?, as_number(&bounds[1])?))
        }
        _ => None,
    }
}

/// Numbers, and strings holding a finite decimal number.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Date/time strings as an instant. Values without an offset are
/// taken as UTC.
fn as_instant(value: &Value) -> Option<DateTime<Utc>> {
    let text = value.as_str()?.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Equality: identical JSON, then same instant, then same number,
/// then ordinal text.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    if let (Some(a), Some(e)) = (as_instant(actual), as_instant(expected)) {
        return a == e;
    }
    if let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) {
        return a == e;
    }
    stringify(actual) == stringify(expected)
}

fn values_equal_ignore_case(actual: &Value, expected: &Value) -> bool {
    values_equal(actual, expected)
        || stringify(actual).to_lowercase() == stringify(expected).to_lowercase()
}

fn ordering(actual: &Value, expected: &Value) -> std::result::Result<Ordering, String> {
    if let (Some(a), Some(e)) = (as_instant(actual), as_instant(expected)) {
        return Ok(a.cmp(&e));
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(e)) => a
            .partial_cmp(&e)
            .ok_or_else(|| format!("Cannot compare {a} with {e}")),
        _ => Err(format!(
            "Cannot compare {} '{}' with {} '{}' numerically",
            describe_type(actual),
            stringify(actual),
            describe_type(expected),
            stringify(expected)
        )),
    }
}

/// Case-insensitive membership of `item` in `container`.
fn holds(container: &Value, item: &Value) -> bool {
    match container {
        Value::Array(items) => items.iter().any(|v| values_equal_ignore_case(v, item)),
        Value::Object(map) => {
            let key = stringify(item).to_lowercase();
            map.keys().any(|k| k.to_lowercase() == key)
        }
        other => stringify(other)
            .to_lowercase()
            .contains(&stringify(item).to_lowercase()),
    }
}

fn size(value: &Value) -> usize {
    match value {
        Value::String(s) => s.chars().count(),
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        _ => 0,
    }
}

fn is_present(value: &Value) -> bool {
    !matches!(value, Value::Null) && value.as_str() != Some("")
}

fn expect(holds: bool, message: impl FnOnce() -> String) -> Verdict {
    if holds {
        Ok(())
    } else {
        Err(message())
    }
}

macro_rules! operators {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Deserialize)]
            #[serde(transparent)]
            pub struct $name(pub Operands);

            const _: () = {
                #[distributed_slice(BUILTIN_ASSERTIONS)]
                static REGISTER: fn() -> TypeDescriptor<Assertions> =
                    TypeDescriptor::<Assertions>::of::<$name>;
            };
        )+
    };
}

operators! {
    EqualsAssertion,
    NotEqualsAssertion,
    GreaterThanAssertion,
    GreaterOrEqualAssertion,
    LessThanAssertion,
    LessOrEqualAssertion,
    /// `expectedValue` names a JSON type: `boolean`, `integer`,
    /// `number`, `string`, `array`, `object` or `null`.
    TypeAssertion,
    ExistsAssertion,
    NotExistsAssertion,
    EmptyAssertion,
    NotEmptyAssertion,
    ContainsAssertion,
    NotContainsAssertion,
    /// `expectedValue` is a regular expression, matched case-insensitively.
    MatchAssertion,
    NotMatchAssertion,
    /// Inclusive range check against `[min, max]`.
    BetweenAssertion,
    LengthAssertion,
    /// Every expected item must be a member of the actual collection.
    InAssertion,
    NotInAssertion,
    StartsWithAssertion,
    EndsWithAssertion,
}

impl AssertionType for EqualsAssertion {}
impl AssertionType for NotEqualsAssertion {}
impl AssertionType for GreaterThanAssertion {}
impl AssertionType for GreaterOrEqualAssertion {}
impl AssertionType for LessThanAssertion {}
impl AssertionType for LessOrEqualAssertion {}
impl AssertionType for TypeAssertion {}
impl AssertionType for ExistsAssertion {}
impl AssertionType for NotExistsAssertion {}
impl AssertionType for EmptyAssertion {}
impl AssertionType for NotEmptyAssertion {}
impl AssertionType for ContainsAssertion {}
impl AssertionType for NotContainsAssertion {}
impl AssertionType for MatchAssertion {}
impl AssertionType for NotMatchAssertion {}
impl AssertionType for BetweenAssertion {}
impl AssertionType for LengthAssertion {}
impl AssertionType for InAssertion {}
impl AssertionType for NotInAssertion {}
impl AssertionType for StartsWithAssertion {}
impl AssertionType for EndsWithAssertion {}

impl AssertionOperation for EqualsAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        expect(values_equal(actual, expected), || {
            format!("Expected '{}' but got '{}'", stringify(expected), stringify(actual))
        })
    }
}

impl AssertionOperation for NotEqualsAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        expect(!values_equal(actual, expected), || {
            format!("Expected a value other than '{}'", stringify(expected))
        })
    }
}

fn ordered(actual: &Value, expected: &Value, accept: &[Ordering], relation: &str) -> Verdict {
    let order = ordering(actual, expected)?;
    expect(accept.contains(&order), || {
        format!(
            "Expected '{}' to be {relation} '{}'",
            stringify(actual),
            stringify(expected)
        )
    })
}

impl AssertionOperation for GreaterThanAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        ordered(actual, expected, &[Ordering::Greater], "greater than")
    }
}

impl AssertionOperation for GreaterOrEqualAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        ordered(
            actual,
            expected,
            &[Ordering::Greater, Ordering::Equal],
            "greater than or equal to",
        )
    }
}

impl AssertionOperation for LessThanAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        ordered(actual, expected, &[Ordering::Less], "less than")
    }
}

impl AssertionOperation for LessOrEqualAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        ordered(
            actual,
            expected,
            &[Ordering::Less, Ordering::Equal],
            "less than or equal to",
        )
    }
}

impl AssertionOperation for TypeAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let wanted = stringify(expected).to_lowercase();
        let found = describe_type(actual);
        let matches = wanted == found || (wanted == "number" && found == "integer");
        expect(matches, || format!("Expected type '{wanted}' but got '{found}'"))
    }
}

impl AssertionOperation for ExistsAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, _expected: &Value) -> Verdict {
        expect(is_present(actual), || "Expected value to exist".to_string())
    }
}

impl AssertionOperation for NotExistsAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, _expected: &Value) -> Verdict {
        expect(!is_present(actual), || {
            format!("Expected no value but got '{}'", stringify(actual))
        })
    }
}

impl AssertionOperation for EmptyAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn requirement(&self) -> Requirement {
        Requirement::SizedActual
    }

    fn evaluate(&self, actual: &Value, _expected: &Value) -> Verdict {
        expect(size(actual) == 0, || {
            format!("Expected empty {} but it has {} item(s)", describe_type(actual), size(actual))
        })
    }
}

impl AssertionOperation for NotEmptyAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn requirement(&self) -> Requirement {
        Requirement::SizedActual
    }

    fn evaluate(&self, actual: &Value, _expected: &Value) -> Verdict {
        expect(size(actual) > 0, || {
            format!("Expected non-empty {}", describe_type(actual))
        })
    }
}

impl AssertionOperation for ContainsAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        expect(holds(actual, expected), || {
            format!("Expected '{}' to contain '{}'", stringify(actual), stringify(expected))
        })
    }
}

impl AssertionOperation for NotContainsAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        expect(!holds(actual, expected), || {
            format!("Expected '{}' not to contain '{}'", stringify(actual), stringify(expected))
        })
    }
}

fn regex_matches(actual: &Value, pattern: &Value) -> std::result::Result<bool, String> {
    let pattern = stringify(pattern);
    let regex = RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| format!("Invalid regular expression '{pattern}': {e}"))?;
    Ok(regex.is_match(&stringify(actual)))
}

impl AssertionOperation for MatchAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let matched = regex_matches(actual, expected)?;
        expect(matched, || {
            format!("Expected '{}' to match /{}/", stringify(actual), stringify(expected))
        })
    }
}

impl AssertionOperation for NotMatchAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let matched = regex_matches(actual, expected)?;
        expect(!matched, || {
            format!("Expected '{}' not to match /{}/", stringify(actual), stringify(expected))
        })
    }
}

impl AssertionOperation for BetweenAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn requirement(&self) -> Requirement {
        Requirement::RangeExpected
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let (min, max) = range(expected)
            .ok_or_else(|| "Operator 'between' requires [min,max]".to_string())?;
        let value = as_number(actual).ok_or_else(|| {
            format!("Expected a number between {min} and {max} but got {}", describe_type(actual))
        })?;
        expect(min <= value && value <= max, || {
            format!("Expected {value} to be between {min} and {max}")
        })
    }
}

impl AssertionOperation for LengthAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn requirement(&self) -> Requirement {
        Requirement::SizedActual
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let wanted = as_number(expected)
            .ok_or_else(|| format!("Expected length must be a number, got '{}'", stringify(expected)))?;
        let found = size(actual);
        expect(found as f64 == wanted, || {
            format!("Expected length {wanted} but got {found}")
        })
    }
}

fn expected_items(expected: &Value) -> Vec<&Value> {
    match expected {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

impl AssertionOperation for InAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn requirement(&self) -> Requirement {
        Requirement::SizedActual
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let missing: Vec<String> = expected_items(expected)
            .into_iter()
            .filter(|item| !holds(actual, item))
            .map(stringify)
            .collect();
        expect(missing.is_empty(), || {
            format!("Values [{}] not found in '{}'", missing.join(", "), stringify(actual))
        })
    }
}

impl AssertionOperation for NotInAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn requirement(&self) -> Requirement {
        Requirement::SizedActual
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let present: Vec<String> = expected_items(expected)
            .into_iter()
            .filter(|item| holds(actual, item))
            .map(stringify)
            .collect();
        expect(present.is_empty(), || {
            format!("Values [{}] unexpectedly found in '{}'", present.join(", "), stringify(actual))
        })
    }
}

impl AssertionOperation for StartsWithAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let text = stringify(actual);
        let prefix = stringify(expected);
        expect(text.to_lowercase().starts_with(&prefix.to_lowercase()), || {
            format!("Expected '{text}' to start with '{prefix}'")
        })
    }
}

impl AssertionOperation for EndsWithAssertion {
    fn operands(&self) -> &Operands {
        &self.0
    }

    fn evaluate(&self, actual: &Value, expected: &Value) -> Verdict {
        let text = stringify(actual);
        let suffix = stringify(expected);
        expect(text.to_lowercase().ends_with(&suffix.to_lowercase()), || {
            format!("Expected '{text}' to end with '{suffix}'")
        })
    }
}

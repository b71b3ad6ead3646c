//! Rendered-field snapshots for executed units of work.
//!
//! The pipeline is render -> redact -> persist:
//! - [`FieldRenderer`] walks the declared template fields of a [`HasTemplateFields`]
//!   owner and resolves template expressions through an injected [`TemplateEngine`].
//! - [`redact_fields`] masks values selected by a [`RedactionPolicy`].
//! - [`SnapshotStore`] persists one snapshot per [`RunIdentity`] and enforces
//!   per-task retention.
//!
//! [`SnapshotRecorder`] wires the three together for callers that execute work.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const DEFAULT_MAX_SNAPSHOTS_PER_TASK: i64 = 30;
pub const DEFAULT_MAX_RENDER_DEPTH: usize = 64;
pub const DEFAULT_MASK_MARKER: &str = "***";
pub const DEFAULT_SENSITIVE_FIELD_NAMES: &[&str] = &[
    "access_token",
    "api_key",
    "apikey",
    "authorization",
    "passphrase",
    "passwd",
    "password",
    "private_key",
    "secret",
    "token",
    "keyfile_dict",
    "service_account",
];

/// Map index stored for runs that are not part of a mapped expansion.
pub const UNMAPPED_INDEX: i64 = -1;

const OBJECT_KIND_KEY: &str = "__kind";
const OBJECT_TEMPLATE_FIELDS_KEY: &str = "__template_fields";
const OBJECT_ATTRIBUTES_KEY: &str = "__attributes";

const RAW_DATE_TAG: &str = "$date";
const RAW_TIMESTAMP_TAG: &str = "$timestamp";
const RAW_OBJECT_TAG: &str = "$object";

const VARIABLE_VALUE_PREFIX: &str = "var.value.";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TemplateError {
    #[error("template syntax error in {template:?}: {reason}")]
    Syntax { template: String, reason: String },
    #[error("undefined template reference: {expression}")]
    Undefined { expression: String },
    #[error("template engine failure: {0}")]
    Engine(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum RedactionError {
    #[error("invalid redaction pattern: {0}")]
    InvalidPattern(String),
    #[error("redaction policy unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SnapshotError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("failed to render template field {field}: {source}")]
    Template {
        field: String,
        #[source]
        source: TemplateError,
    },
    #[error("render depth exceeded limit of {limit}")]
    RenderDepthExceeded { limit: usize },
    #[error("{kind} declares template field {field} but does not expose it")]
    MissingTemplateField { kind: String, field: String },
    #[error("redaction policy error: {0}")]
    Redaction(#[from] RedactionError),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid field value: {0}")]
    InvalidFieldValue(String),
}

/// Run discriminator within a `(workflow_id, task_id)` group: a run id or a
/// logical date canonicalised to RFC3339 UTC.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RunKey(String);

impl RunKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Builds a run key from a logical date.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Validation`] when the timestamp cannot be
    /// formatted.
    pub fn from_logical_date(value: OffsetDateTime) -> Result<Self, SnapshotError> {
        Ok(Self(format_rfc3339(value)?))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RunKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunIdentity {
    pub workflow_id: String,
    pub task_id: String,
    pub run_key: RunKey,
    pub map_index: Option<u32>,
}

impl RunIdentity {
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, task_id: impl Into<String>, run_key: RunKey) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_id: task_id.into(),
            run_key,
            map_index: None,
        }
    }

    #[must_use]
    pub fn with_map_index(mut self, map_index: u32) -> Self {
        self.map_index = Some(map_index);
        self
    }

    /// Storage form of the map index; unmapped runs use [`UNMAPPED_INDEX`].
    #[must_use]
    pub fn stored_map_index(&self) -> i64 {
        self.map_index.map_or(UNMAPPED_INDEX, i64::from)
    }

    /// Validates identity components before any write or lookup.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Validation`] when a component is blank.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        for (name, value) in [
            ("workflow_id", self.workflow_id.as_str()),
            ("task_id", self.task_id.as_str()),
            ("run_key", self.run_key.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(SnapshotError::Validation(format!(
                    "{name} MUST be non-empty"
                )));
            }
        }
        Ok(())
    }
}

impl Display for RunIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}@{}", self.workflow_id, self.task_id, self.run_key)?;
        if let Some(index) = self.map_index {
            write!(f, "[{index}]")?;
        }
        Ok(())
    }
}

/// Capability of objects that declare which of their attributes are template
/// fields. The renderer is written against this trait only.
pub trait HasTemplateFields: std::fmt::Debug + Send + Sync {
    /// Label kept in the rendered view, usually the concrete type name.
    fn kind(&self) -> &str;

    fn template_field_names(&self) -> Vec<String>;

    fn get_field(&self, name: &str) -> Option<FieldValue>;

    /// Attributes surfaced in the nested rendered view. Non-template
    /// attributes are kept verbatim.
    fn attribute_names(&self) -> Vec<String> {
        self.template_field_names()
    }
}

/// Raw, unrendered field value as supplied by a work-unit definition.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Date(Date),
    Timestamp(OffsetDateTime),
    Sequence(Vec<FieldValue>),
    Mapping(BTreeMap<String, FieldValue>),
    Object(Arc<dyn HasTemplateFields>),
}

impl FieldValue {
    #[must_use]
    pub fn object(value: impl HasTemplateFields + 'static) -> Self {
        Self::Object(Arc::new(value))
    }

    /// Decodes a raw field value from JSON.
    ///
    /// Plain JSON maps onto the matching variant. Single-key objects tagged
    /// `$date`, `$timestamp` or `$object` decode into dates, timestamps and
    /// [`AttributeObject`] values respectively.
    ///
    /// # Errors
    /// Returns [`SnapshotError::InvalidFieldValue`] when a tagged form is
    /// malformed.
    pub fn from_json(value: &Value) -> Result<Self, SnapshotError> {
        match value {
            Value::Null => Ok(Self::Null),
            Value::Bool(flag) => Ok(Self::Bool(*flag)),
            Value::Number(number) => Ok(number_to_field(number)),
            Value::String(text) => Ok(Self::String(text.clone())),
            Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Sequence),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(raw) = map.get(RAW_DATE_TAG) {
                        return parse_tagged_date(raw).map(Self::Date);
                    }
                    if let Some(raw) = map.get(RAW_TIMESTAMP_TAG) {
                        return parse_tagged_timestamp(raw).map(Self::Timestamp);
                    }
                    if let Some(raw) = map.get(RAW_OBJECT_TAG) {
                        return AttributeObject::from_json(raw).map(Self::object);
                    }
                }

                let mut entries = BTreeMap::new();
                for (key, item) in map {
                    entries.insert(key.clone(), Self::from_json(item)?);
                }
                Ok(Self::Mapping(entries))
            }
        }
    }
}

fn number_to_field(number: &Number) -> FieldValue {
    match number.as_i64() {
        Some(value) => FieldValue::Integer(value),
        None => FieldValue::Float(number.as_f64().unwrap_or(f64::NAN)),
    }
}

fn parse_tagged_date(raw: &Value) -> Result<Date, SnapshotError> {
    let Some(text) = raw.as_str() else {
        return Err(SnapshotError::InvalidFieldValue(
            "$date MUST be a YYYY-MM-DD string".to_string(),
        ));
    };
    Date::parse(text, format_description!("[year]-[month]-[day]"))
        .map_err(|err| SnapshotError::InvalidFieldValue(format!("invalid $date {text}: {err}")))
}

fn parse_tagged_timestamp(raw: &Value) -> Result<OffsetDateTime, SnapshotError> {
    let Some(text) = raw.as_str() else {
        return Err(SnapshotError::InvalidFieldValue(
            "$timestamp MUST be an RFC3339 string".to_string(),
        ));
    };
    OffsetDateTime::parse(text, &time::format_description::well_known::Rfc3339).map_err(|err| {
        SnapshotError::InvalidFieldValue(format!("invalid $timestamp {text}: {err}"))
    })
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Date> for FieldValue {
    fn from(value: Date) -> Self {
        Self::Date(value)
    }
}

impl From<OffsetDateTime> for FieldValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Vec<FieldValue>> for FieldValue {
    fn from(value: Vec<FieldValue>) -> Self {
        Self::Sequence(value)
    }
}

impl From<BTreeMap<String, FieldValue>> for FieldValue {
    fn from(value: BTreeMap<String, FieldValue>) -> Self {
        Self::Mapping(value)
    }
}

/// Generic template-field owner: a kind label, declared template fields and
/// a set of named attributes.
#[derive(Debug, Clone)]
pub struct AttributeObject {
    kind: String,
    template_fields: Vec<String>,
    attributes: BTreeMap<String, FieldValue>,
}

impl AttributeObject {
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            template_fields: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_template_fields<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.template_fields = names.into_iter().map(Into::into).collect();
        self
    }

    /// Decodes `{"kind": ..., "template_fields": [...], "attributes": {...}}`.
    ///
    /// # Errors
    /// Returns [`SnapshotError::InvalidFieldValue`] when the payload shape is
    /// wrong or an attribute value cannot be decoded.
    pub fn from_json(value: &Value) -> Result<Self, SnapshotError> {
        let Some(map) = value.as_object() else {
            return Err(SnapshotError::InvalidFieldValue(
                "object descriptor MUST be a JSON object".to_string(),
            ));
        };

        let kind = match map.get("kind").and_then(Value::as_str) {
            Some(kind) if !kind.trim().is_empty() => kind.to_string(),
            _ => {
                return Err(SnapshotError::InvalidFieldValue(
                    "object descriptor requires a non-empty kind".to_string(),
                ))
            }
        };

        let template_fields = match map.get("template_fields") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        SnapshotError::InvalidFieldValue(format!(
                            "template_fields of {kind} MUST contain strings"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => {
                return Err(SnapshotError::InvalidFieldValue(format!(
                    "template_fields of {kind} MUST be an array"
                )))
            }
        };

        let mut attributes = BTreeMap::new();
        match map.get("attributes") {
            None | Some(Value::Null) => {}
            Some(Value::Object(entries)) => {
                for (name, raw) in entries {
                    attributes.insert(name.clone(), FieldValue::from_json(raw)?);
                }
            }
            Some(_) => {
                return Err(SnapshotError::InvalidFieldValue(format!(
                    "attributes of {kind} MUST be an object"
                )))
            }
        }

        Ok(Self {
            kind,
            template_fields,
            attributes,
        })
    }
}

impl HasTemplateFields for AttributeObject {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn template_field_names(&self) -> Vec<String> {
        self.template_fields.clone()
    }

    fn get_field(&self, name: &str) -> Option<FieldValue> {
        self.attributes.get(name).cloned()
    }

    fn attribute_names(&self) -> Vec<String> {
        self.attributes.keys().cloned().collect()
    }
}

/// Rendered, storable value. Nested template-field owners become
/// [`RenderedValue::Object`], which keeps the owner's kind label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Value", from = "Value")]
pub enum RenderedValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Sequence(Vec<RenderedValue>),
    Mapping(BTreeMap<String, RenderedValue>),
    Object {
        kind: String,
        template_fields: Vec<String>,
        attributes: BTreeMap<String, RenderedValue>,
    },
}

pub type RenderedFields = BTreeMap<String, RenderedValue>;

impl RenderedValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Bool(flag) => Value::Bool(*flag),
            Self::Integer(value) => Value::Number(Number::from(*value)),
            Self::Float(value) => Number::from_f64(*value)
                .map_or_else(|| Value::String(value.to_string()), Value::Number),
            Self::String(text) => Value::String(text.clone()),
            Self::Sequence(items) => Value::Array(items.iter().map(Self::to_json).collect()),
            Self::Mapping(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.to_json()))
                    .collect(),
            ),
            Self::Object {
                kind,
                template_fields,
                attributes,
            } => {
                let mut tagged = Map::new();
                tagged.insert(OBJECT_KIND_KEY.to_string(), Value::String(kind.clone()));
                tagged.insert(
                    OBJECT_TEMPLATE_FIELDS_KEY.to_string(),
                    Value::Array(
                        template_fields
                            .iter()
                            .map(|name| Value::String(name.clone()))
                            .collect(),
                    ),
                );
                tagged.insert(
                    OBJECT_ATTRIBUTES_KEY.to_string(),
                    Value::Object(
                        attributes
                            .iter()
                            .map(|(key, item)| (key.clone(), item.to_json()))
                            .collect(),
                    ),
                );
                Value::Object(tagged)
            }
        }
    }

    fn from_json_value(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(flag) => Self::Bool(flag),
            Value::Number(number) => match number.as_i64() {
                Some(value) => Self::Integer(value),
                None => Self::Float(number.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(text) => Self::String(text),
            Value::Array(items) => {
                Self::Sequence(items.into_iter().map(Self::from_json_value).collect())
            }
            Value::Object(map) => match decode_tagged_object(&map) {
                Some(object) => object,
                None => Self::Mapping(
                    map.into_iter()
                        .map(|(key, item)| (key, Self::from_json_value(item)))
                        .collect(),
                ),
            },
        }
    }
}

fn decode_tagged_object(map: &Map<String, Value>) -> Option<RenderedValue> {
    if map.len() != 3 {
        return None;
    }
    let kind = map.get(OBJECT_KIND_KEY)?.as_str()?.to_string();
    let template_fields = map
        .get(OBJECT_TEMPLATE_FIELDS_KEY)?
        .as_array()?
        .iter()
        .map(|item| item.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()?;
    let attributes = map
        .get(OBJECT_ATTRIBUTES_KEY)?
        .as_object()?
        .iter()
        .map(|(key, item)| (key.clone(), RenderedValue::from_json_value(item.clone())))
        .collect();
    Some(RenderedValue::Object {
        kind,
        template_fields,
        attributes,
    })
}

impl From<RenderedValue> for Value {
    fn from(value: RenderedValue) -> Self {
        value.to_json()
    }
}

impl From<Value> for RenderedValue {
    fn from(value: Value) -> Self {
        Self::from_json_value(value)
    }
}

impl From<&str> for RenderedValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl Display for RenderedValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(flag) => write!(f, "{flag}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::String(text) => write!(f, "{text:?}"),
            Self::Sequence(items) => {
                f.write_str("[")?;
                for (position, item) in items.iter().enumerate() {
                    if position > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Self::Mapping(entries) => write_entries(f, entries.iter(), None),
            Self::Object {
                kind,
                template_fields,
                attributes,
            } => {
                write!(f, "{kind}(")?;
                write_entries(f, attributes.iter(), Some(template_fields.as_slice()))?;
                f.write_str(")")
            }
        }
    }
}

fn write_entries<'v>(
    f: &mut Formatter<'_>,
    entries: impl Iterator<Item = (&'v String, &'v RenderedValue)>,
    template_fields: Option<&[String]>,
) -> std::fmt::Result {
    f.write_str("{")?;
    let mut first = true;
    for (key, item) in entries {
        if !first {
            f.write_str(", ")?;
        }
        first = false;
        write!(f, "{key:?}: {item}")?;
    }
    if let Some(names) = template_fields {
        if !first {
            f.write_str(", ")?;
        }
        let quoted = names
            .iter()
            .map(|name| format!("{name:?}"))
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "\"template_fields\": [{quoted}]")?;
    }
    f.write_str("}")
}

/// Encodes rendered fields as a JSON object.
#[must_use]
pub fn fields_to_json(fields: &RenderedFields) -> Value {
    Value::Object(
        fields
            .iter()
            .map(|(key, value)| (key.clone(), value.to_json()))
            .collect(),
    )
}

/// Decodes rendered fields from a JSON object.
///
/// # Errors
/// Returns [`SnapshotError::InvalidFieldValue`] when `value` is not an object.
pub fn fields_from_json(value: Value) -> Result<RenderedFields, SnapshotError> {
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, item)| (key, RenderedValue::from(item)))
            .collect()),
        other => Err(SnapshotError::InvalidFieldValue(format!(
            "rendered fields MUST be a JSON object, got {other}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedSnapshot {
    pub snapshot_id: Ulid,
    pub identity: RunIdentity,
    pub rendered_fields: RenderedFields,
    pub pod_spec_snapshot: Option<RenderedFields>,
    pub created_at: OffsetDateTime,
}

/// Named values available to template expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenderContext {
    values: Map<String, Value>,
}

impl RenderContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from a JSON object.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Validation`] when `value` is not an object.
    pub fn from_json(value: Value) -> Result<Self, SnapshotError> {
        match value {
            Value::Object(values) => Ok(Self { values }),
            other => Err(SnapshotError::Validation(format!(
                "render context MUST be a JSON object, got {other}"
            ))),
        }
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Resolves a dotted path; numeric segments index into arrays.
    #[must_use]
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let mut current = self.values.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

/// External template-substitution engine.
pub trait TemplateEngine {
    /// Renders one raw string against `context`.
    ///
    /// # Errors
    /// Returns [`TemplateError`] for malformed expressions or unresolved
    /// references.
    fn render(&self, raw: &str, context: &RenderContext) -> Result<String, TemplateError>;
}

/// Name -> value lookups used while rendering `var.value.*` references.
pub trait VariableLookup {
    fn lookup_variable(&self, name: &str) -> Option<String>;
}

impl VariableLookup for BTreeMap<String, String> {
    fn lookup_variable(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl VariableLookup for HashMap<String, String> {
    fn lookup_variable(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Variables read from the process environment as `<prefix><NAME>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVariables {
    prefix: String,
}

impl EnvVariables {
    pub const DEFAULT_PREFIX: &'static str = "RFS_VAR_";

    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Every prefixed variable currently set, keyed by its lowercased name.
    /// Values that are not valid unicode are skipped, as `lookup_variable`
    /// cannot resolve them either.
    #[must_use]
    pub fn variables(&self) -> BTreeMap<String, String> {
        std::env::vars_os()
            .filter_map(|(key, value)| {
                let key = key.into_string().ok()?;
                let name = key.strip_prefix(self.prefix.as_str())?;
                if name.is_empty() {
                    return None;
                }
                Some((name.to_ascii_lowercase(), value.into_string().ok()?))
            })
            .collect()
    }
}

impl Default for EnvVariables {
    fn default() -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX)
    }
}

impl VariableLookup for EnvVariables {
    fn lookup_variable(&self, name: &str) -> Option<String> {
        std::env::var(format!("{}{}", self.prefix, name.to_ascii_uppercase())).ok()
    }
}

/// First-variable-wins chain, e.g. explicit overrides ahead of the environment.
impl<A: VariableLookup, B: VariableLookup> VariableLookup for (A, B) {
    fn lookup_variable(&self, name: &str) -> Option<String> {
        self.0
            .lookup_variable(name)
            .or_else(|| self.1.lookup_variable(name))
    }
}

/// Built-in engine for `{{ dotted.path }}` expressions and `{# comments #}`.
///
/// `{{ var.value.NAME }}` resolves through the [`VariableLookup`]; any other
/// path resolves against the [`RenderContext`]. Statement blocks (`{% %}`)
/// are rejected.
#[derive(Debug, Clone, Default)]
pub struct ExpressionTemplateEngine<V> {
    variables: V,
}

impl<V: VariableLookup> ExpressionTemplateEngine<V> {
    #[must_use]
    pub fn new(variables: V) -> Self {
        Self { variables }
    }

    #[must_use]
    pub fn variables(&self) -> &V {
        &self.variables
    }

    fn evaluate(
        &self,
        template: &str,
        expression: &str,
        context: &RenderContext,
    ) -> Result<String, TemplateError> {
        if !is_valid_path(expression) {
            return Err(TemplateError::Syntax {
                template: template.to_string(),
                reason: format!("unsupported expression `{expression}`"),
            });
        }

        if let Some(name) = expression.strip_prefix(VARIABLE_VALUE_PREFIX) {
            return self
                .variables
                .lookup_variable(name)
                .ok_or_else(|| TemplateError::Undefined {
                    expression: expression.to_string(),
                });
        }

        match context.lookup(expression) {
            Some(Value::String(text)) => Ok(text.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(TemplateError::Undefined {
                expression: expression.to_string(),
            }),
        }
    }
}

impl<V: VariableLookup> TemplateEngine for ExpressionTemplateEngine<V> {
    fn render(&self, raw: &str, context: &RenderContext) -> Result<String, TemplateError> {
        if raw.contains("{%") {
            return Err(TemplateError::Syntax {
                template: raw.to_string(),
                reason: "statement blocks are not supported".to_string(),
            });
        }

        let mut rendered = String::with_capacity(raw.len());
        let mut rest = raw;
        loop {
            let expression_start = rest.find("{{");
            let comment_start = rest.find("{#");
            let (start, closing, is_comment) = match (expression_start, comment_start) {
                (None, None) => break,
                (Some(expr), Some(comment)) if comment < expr => (comment, "#}", true),
                (Some(expr), _) => (expr, "}}", false),
                (None, Some(comment)) => (comment, "#}", true),
            };

            rendered.push_str(&rest[..start]);
            let body = &rest[start + 2..];
            let Some(end) = body.find(closing) else {
                return Err(TemplateError::Syntax {
                    template: raw.to_string(),
                    reason: format!("unclosed tag, expected `{closing}`"),
                });
            };

            if !is_comment {
                let expression = body[..end].trim();
                if expression.is_empty() {
                    return Err(TemplateError::Syntax {
                        template: raw.to_string(),
                        reason: "empty expression".to_string(),
                    });
                }
                rendered.push_str(&self.evaluate(raw, expression, context)?);
            }
            rest = &body[end + 2..];
        }
        rendered.push_str(rest);

        Ok(rendered)
    }
}

fn is_valid_path(expression: &str) -> bool {
    expression.split('.').all(|segment| {
        !segment.is_empty()
            && segment
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    })
}

/// True when `raw` contains expression, statement or comment delimiters.
#[must_use]
pub fn contains_template_syntax(raw: &str) -> bool {
    ["{{", "{%", "{#"].iter().any(|marker| raw.contains(marker))
}

/// Formats a calendar date as `YYYY-MM-DD`.
///
/// # Errors
/// Returns [`SnapshotError::InvalidFieldValue`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, SnapshotError> {
    value
        .format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| SnapshotError::InvalidFieldValue(format!("failed to format date: {err}")))
}

/// Formats an instant in the ISO-8601 display form `YYYY-MM-DD HH:MM:SS+HH:MM`
/// (space separated, microseconds only when non-zero). The source offset is
/// preserved.
///
/// # Errors
/// Returns [`SnapshotError::InvalidFieldValue`] when formatting fails.
pub fn format_timestamp(value: OffsetDateTime) -> Result<String, SnapshotError> {
    let formatted = if value.nanosecond() == 0 {
        value.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second][offset_hour sign:mandatory]:[offset_minute]"
        ))
    } else {
        value.format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6][offset_hour sign:mandatory]:[offset_minute]"
        ))
    };
    formatted.map_err(|err| {
        SnapshotError::InvalidFieldValue(format!("failed to format timestamp: {err}"))
    })
}

/// Recursive renderer over [`FieldValue`] trees.
pub struct FieldRenderer<'a> {
    engine: &'a dyn TemplateEngine,
    context: &'a RenderContext,
    max_depth: usize,
}

impl<'a> FieldRenderer<'a> {
    #[must_use]
    pub fn new(engine: &'a dyn TemplateEngine, context: &'a RenderContext) -> Self {
        Self {
            engine,
            context,
            max_depth: DEFAULT_MAX_RENDER_DEPTH,
        }
    }

    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Renders every declared template field of `owner`.
    ///
    /// # Errors
    /// Fails on the first field that cannot be rendered; no partial result is
    /// returned.
    pub fn render_template_fields(
        &self,
        owner: &dyn HasTemplateFields,
    ) -> Result<RenderedFields, SnapshotError> {
        let mut rendered = RenderedFields::new();
        for name in owner.template_field_names() {
            let raw = owner
                .get_field(&name)
                .ok_or_else(|| SnapshotError::MissingTemplateField {
                    kind: owner.kind().to_string(),
                    field: name.clone(),
                })?;
            let value = self.convert(&raw, &name, 0, true)?;
            rendered.insert(name, value);
        }
        Ok(rendered)
    }

    /// Renders a single value, resolving template strings.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Template`] when the engine fails and
    /// [`SnapshotError::RenderDepthExceeded`] for over-deep structures.
    pub fn render_value(&self, field: &str, value: &FieldValue) -> Result<RenderedValue, SnapshotError> {
        self.convert(value, field, 0, true)
    }

    fn convert(
        &self,
        value: &FieldValue,
        field: &str,
        depth: usize,
        resolve: bool,
    ) -> Result<RenderedValue, SnapshotError> {
        if depth > self.max_depth {
            return Err(SnapshotError::RenderDepthExceeded {
                limit: self.max_depth,
            });
        }

        let rendered = match value {
            FieldValue::Null => RenderedValue::Null,
            FieldValue::Bool(flag) => RenderedValue::Bool(*flag),
            FieldValue::Integer(number) => RenderedValue::Integer(*number),
            FieldValue::Float(number) if !number.is_finite() => {
                return Err(SnapshotError::InvalidFieldValue(format!(
                    "field {field} holds non-finite number {number}"
                )));
            }
            FieldValue::Float(number) => RenderedValue::Float(*number),
            FieldValue::String(text) if resolve && contains_template_syntax(text) => {
                let output = self.engine.render(text, self.context).map_err(|source| {
                    SnapshotError::Template {
                        field: field.to_string(),
                        source,
                    }
                })?;
                RenderedValue::String(output)
            }
            FieldValue::String(text) => RenderedValue::String(text.clone()),
            FieldValue::Date(date) => RenderedValue::String(format_date(*date)?),
            FieldValue::Timestamp(instant) => RenderedValue::String(format_timestamp(*instant)?),
            FieldValue::Sequence(items) => RenderedValue::Sequence(
                items
                    .iter()
                    .map(|item| self.convert(item, field, depth + 1, resolve))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            FieldValue::Mapping(entries) => {
                let mut rendered = BTreeMap::new();
                for (key, item) in entries {
                    rendered.insert(key.clone(), self.convert(item, field, depth + 1, resolve)?);
                }
                RenderedValue::Mapping(rendered)
            }
            FieldValue::Object(object) => {
                self.convert_object(object.as_ref(), field, depth + 1, resolve)?
            }
        };

        Ok(rendered)
    }

    fn convert_object(
        &self,
        object: &dyn HasTemplateFields,
        field: &str,
        depth: usize,
        resolve: bool,
    ) -> Result<RenderedValue, SnapshotError> {
        if depth > self.max_depth {
            return Err(SnapshotError::RenderDepthExceeded {
                limit: self.max_depth,
            });
        }

        let template_fields = object.template_field_names();
        let declared: BTreeSet<&str> = template_fields.iter().map(String::as_str).collect();

        let mut names: Vec<String> = object.attribute_names();
        for name in &template_fields {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }

        let mut attributes = BTreeMap::new();
        for name in names {
            let is_template = declared.contains(name.as_str());
            let Some(raw) = object.get_field(&name) else {
                if is_template {
                    return Err(SnapshotError::MissingTemplateField {
                        kind: object.kind().to_string(),
                        field: name,
                    });
                }
                continue;
            };
            let value = self.convert(&raw, field, depth + 1, resolve && is_template)?;
            attributes.insert(name, value);
        }

        Ok(RenderedValue::Object {
            kind: object.kind().to_string(),
            template_fields,
            attributes,
        })
    }
}

/// Redaction policy collaborator.
pub trait RedactionPolicy {
    /// # Errors
    /// Returns [`RedactionError`] when the policy cannot decide.
    fn should_mask(&self, key: &str) -> Result<bool, RedactionError>;

    /// # Errors
    /// Returns [`RedactionError`] when the policy cannot decide.
    fn is_known_secret_value(&self, value: &str) -> Result<bool, RedactionError>;

    fn mask_marker(&self) -> &str {
        DEFAULT_MASK_MARKER
    }

    /// Returns a replacement for `value` when it carries a secret. The
    /// default masks only exact matches.
    ///
    /// # Errors
    /// Returns [`RedactionError`] when the policy cannot decide.
    fn scrub(&self, value: &str) -> Result<Option<String>, RedactionError> {
        if self.is_known_secret_value(value)? {
            return Ok(Some(self.mask_marker().to_string()));
        }
        Ok(None)
    }
}

/// Masks every value reachable from `fields`.
///
/// Values under a key the policy flags are masked together with everything
/// nested below that key. Other strings are scrubbed of known secrets.
/// Keys, sequence lengths and nulls are preserved.
///
/// # Errors
/// Any policy failure aborts redaction; nothing is returned unmasked.
pub fn redact_fields(
    fields: &RenderedFields,
    policy: &dyn RedactionPolicy,
) -> Result<RenderedFields, SnapshotError> {
    let mut redacted = RenderedFields::new();
    for (name, value) in fields {
        redacted.insert(name.clone(), redact_value(value, Some(name), false, policy)?);
    }
    Ok(redacted)
}

fn redact_value(
    value: &RenderedValue,
    key: Option<&str>,
    inherited_mask: bool,
    policy: &dyn RedactionPolicy,
) -> Result<RenderedValue, SnapshotError> {
    let masked = inherited_mask
        || match key {
            Some(name) => policy.should_mask(name)?,
            None => false,
        };

    let redacted = match value {
        RenderedValue::Null => RenderedValue::Null,
        RenderedValue::Bool(_) | RenderedValue::Integer(_) | RenderedValue::Float(_) => {
            if masked {
                RenderedValue::String(policy.mask_marker().to_string())
            } else {
                value.clone()
            }
        }
        RenderedValue::String(text) => {
            if masked {
                RenderedValue::String(policy.mask_marker().to_string())
            } else {
                match policy.scrub(text)? {
                    Some(scrubbed) => RenderedValue::String(scrubbed),
                    None => value.clone(),
                }
            }
        }
        RenderedValue::Sequence(items) => RenderedValue::Sequence(
            items
                .iter()
                .map(|item| redact_value(item, key, masked, policy))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        RenderedValue::Mapping(entries) => {
            let mut redacted = BTreeMap::new();
            for (name, item) in entries {
                redacted.insert(name.clone(), redact_value(item, Some(name), masked, policy)?);
            }
            RenderedValue::Mapping(redacted)
        }
        RenderedValue::Object {
            kind,
            template_fields,
            attributes,
        } => {
            let mut redacted = BTreeMap::new();
            for (name, item) in attributes {
                redacted.insert(name.clone(), redact_value(item, Some(name), masked, policy)?);
            }
            RenderedValue::Object {
                kind: kind.clone(),
                template_fields: template_fields.clone(),
                attributes: redacted,
            }
        }
    };

    Ok(redacted)
}

/// Built-in policy: case-insensitive substring match on key names plus a
/// registry of known secret values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsMasker {
    sensitive_names: Vec<String>,
    secrets: BTreeSet<String>,
    marker: String,
}

impl SecretsMasker {
    /// # Errors
    /// Returns [`RedactionError::InvalidPattern`] for blank name patterns or
    /// a blank marker.
    pub fn new<I, S>(sensitive_names: I, marker: impl Into<String>) -> Result<Self, RedactionError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names = Vec::new();
        for raw in sensitive_names {
            let name = raw.as_ref().trim().to_ascii_lowercase();
            if name.is_empty() {
                return Err(RedactionError::InvalidPattern(
                    "sensitive field name patterns MUST be non-empty".to_string(),
                ));
            }
            if !names.contains(&name) {
                names.push(name);
            }
        }

        let marker = marker.into();
        if marker.is_empty() {
            return Err(RedactionError::InvalidPattern(
                "mask marker MUST be non-empty".to_string(),
            ));
        }

        Ok(Self {
            sensitive_names: names,
            secrets: BTreeSet::new(),
            marker,
        })
    }

    /// # Errors
    /// Returns [`RedactionError::InvalidPattern`] when the settings carry
    /// invalid patterns.
    pub fn from_settings(settings: &SnapshotSettings) -> Result<Self, RedactionError> {
        Self::new(&settings.sensitive_field_names, settings.mask_marker.clone())
    }

    /// Registers a literal secret. Blank values are ignored since masking
    /// them would corrupt every string.
    pub fn add_secret(&mut self, secret: impl Into<String>) {
        let secret = secret.into();
        if !secret.trim().is_empty() {
            self.secrets.insert(secret);
        }
    }

    /// Registers the values of variables whose names are sensitive, returning
    /// how many were added.
    pub fn register_variables<'v, I>(&mut self, variables: I) -> usize
    where
        I: IntoIterator<Item = (&'v str, &'v str)>,
    {
        let mut registered = 0;
        for (name, value) in variables {
            if self.matches_name(name) && !value.trim().is_empty() {
                self.secrets.insert(value.to_string());
                registered += 1;
            }
        }
        registered
    }

    #[must_use]
    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    fn matches_name(&self, key: &str) -> bool {
        let lowered = key.to_ascii_lowercase();
        self.sensitive_names
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }
}

impl Default for SecretsMasker {
    fn default() -> Self {
        Self {
            sensitive_names: DEFAULT_SENSITIVE_FIELD_NAMES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            secrets: BTreeSet::new(),
            marker: DEFAULT_MASK_MARKER.to_string(),
        }
    }
}

impl RedactionPolicy for SecretsMasker {
    fn should_mask(&self, key: &str) -> Result<bool, RedactionError> {
        Ok(self.matches_name(key))
    }

    fn is_known_secret_value(&self, value: &str) -> Result<bool, RedactionError> {
        Ok(self.secrets.contains(value))
    }

    fn mask_marker(&self) -> &str {
        &self.marker
    }

    fn scrub(&self, value: &str) -> Result<Option<String>, RedactionError> {
        if self.secrets.is_empty() {
            return Ok(None);
        }

        // Longest first so a secret that contains another is masked whole.
        let mut ordered: Vec<&String> = self.secrets.iter().collect();
        ordered.sort_by(|lhs, rhs| rhs.len().cmp(&lhs.len()).then_with(|| lhs.cmp(rhs)));

        let mut scrubbed = value.to_string();
        for secret in ordered {
            if scrubbed.contains(secret.as_str()) {
                scrubbed = scrubbed.replace(secret.as_str(), &self.marker);
            }
        }

        if scrubbed == value {
            Ok(None)
        } else {
            Ok(Some(scrubbed))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotSettings {
    pub max_snapshots_per_task: i64,
    pub max_render_depth: usize,
    pub sensitive_field_names: Vec<String>,
    pub mask_marker: String,
}

impl Default for SnapshotSettings {
    fn default() -> Self {
        Self {
            max_snapshots_per_task: DEFAULT_MAX_SNAPSHOTS_PER_TASK,
            max_render_depth: DEFAULT_MAX_RENDER_DEPTH,
            sensitive_field_names: DEFAULT_SENSITIVE_FIELD_NAMES
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            mask_marker: DEFAULT_MASK_MARKER.to_string(),
        }
    }
}

impl SnapshotSettings {
    /// Validates settings bounds.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Configuration`] when a setting is out of
    /// bounds.
    pub fn validate(&self) -> Result<(), SnapshotError> {
        if self.max_render_depth == 0 {
            return Err(SnapshotError::Configuration(
                "max_render_depth MUST be >= 1".to_string(),
            ));
        }

        if self
            .sensitive_field_names
            .iter()
            .any(|name| name.trim().is_empty())
        {
            return Err(SnapshotError::Configuration(
                "sensitive_field_names MUST NOT contain blank entries".to_string(),
            ));
        }

        if self.mask_marker.is_empty() {
            return Err(SnapshotError::Configuration(
                "mask_marker MUST be non-empty".to_string(),
            ));
        }

        Ok(())
    }

    #[must_use]
    pub fn pruning_enabled(&self) -> bool {
        self.max_snapshots_per_task > 0
    }

    /// Decodes and validates settings from JSON. Missing keys take defaults.
    ///
    /// # Errors
    /// Returns [`SnapshotError::Configuration`] when decoding fails or the
    /// decoded values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, SnapshotError> {
        let settings: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SnapshotError::Configuration(format!("invalid settings JSON payload: {err}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Persistence for rendered snapshots, one row per [`RunIdentity`].
pub trait SnapshotStore {
    /// Replaces any existing snapshot for `identity`.
    #[allow(clippy::missing_errors_doc)]
    fn write_snapshot(
        &mut self,
        identity: &RunIdentity,
        rendered_fields: &RenderedFields,
        pod_spec_snapshot: Option<&RenderedFields>,
    ) -> anyhow::Result<RenderedSnapshot>;

    #[allow(clippy::missing_errors_doc)]
    fn get_rendered_fields(&self, identity: &RunIdentity) -> anyhow::Result<Option<RenderedFields>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_pod_spec_snapshot(
        &self,
        identity: &RunIdentity,
    ) -> anyhow::Result<Option<RenderedFields>>;

    /// Returns whether a snapshot was removed.
    #[allow(clippy::missing_errors_doc)]
    fn delete_snapshot(&mut self, identity: &RunIdentity) -> anyhow::Result<bool>;

    /// Keeps the `keep` most recent run keys of the group and returns the
    /// number of deleted rows. `keep <= 0` is a no-op.
    #[allow(clippy::missing_errors_doc)]
    fn prune_old_snapshots(
        &mut self,
        workflow_id: &str,
        task_id: &str,
        keep: i64,
    ) -> anyhow::Result<usize>;
}

/// Produces the rendered pod spec for a run, if any.
pub trait PodSpecBuilder {
    /// # Errors
    /// Returns [`SnapshotError`] when the pod spec cannot be built.
    fn build_pod_spec(&self, identity: &RunIdentity) -> Result<Option<RenderedFields>, SnapshotError>;
}

impl<F> PodSpecBuilder for F
where
    F: Fn(&RunIdentity) -> Result<Option<RenderedFields>, SnapshotError>,
{
    fn build_pod_spec(&self, identity: &RunIdentity) -> Result<Option<RenderedFields>, SnapshotError> {
        self(identity)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub snapshot: RenderedSnapshot,
    pub pruned: usize,
}

/// Render -> redact -> write -> prune for one executed run.
pub struct SnapshotRecorder<'a> {
    engine: &'a dyn TemplateEngine,
    policy: &'a dyn RedactionPolicy,
    settings: &'a SnapshotSettings,
}

impl<'a> SnapshotRecorder<'a> {
    #[must_use]
    pub fn new(
        engine: &'a dyn TemplateEngine,
        policy: &'a dyn RedactionPolicy,
        settings: &'a SnapshotSettings,
    ) -> Self {
        Self {
            engine,
            policy,
            settings,
        }
    }

    /// Renders and redacts the template fields of `owner` without storing.
    ///
    /// # Errors
    /// Returns the first render or redaction failure.
    pub fn render_redacted(
        &self,
        owner: &dyn HasTemplateFields,
        context: &RenderContext,
    ) -> Result<RenderedFields, SnapshotError> {
        self.settings.validate()?;
        let rendered = FieldRenderer::new(self.engine, context)
            .with_max_depth(self.settings.max_render_depth)
            .render_template_fields(owner)?;
        redact_fields(&rendered, self.policy)
    }

    /// Captures the snapshot for `identity` and applies retention.
    ///
    /// Nothing is written unless every field rendered and redacted cleanly.
    ///
    /// # Errors
    /// Returns render, redaction and pod-spec failures unchanged, and storage
    /// failures as [`SnapshotError::Persistence`].
    pub fn record<S>(
        &self,
        store: &mut S,
        identity: &RunIdentity,
        owner: &dyn HasTemplateFields,
        context: &RenderContext,
        pod_spec: Option<&dyn PodSpecBuilder>,
    ) -> Result<RecordOutcome, SnapshotError>
    where
        S: SnapshotStore + ?Sized,
    {
        identity.validate()?;
        let rendered_fields = self.render_redacted(owner, context)?;

        let pod_spec_snapshot = match pod_spec {
            Some(builder) => match builder.build_pod_spec(identity)? {
                Some(spec) => Some(redact_fields(&spec, self.policy)?),
                None => None,
            },
            None => None,
        };

        let snapshot = store
            .write_snapshot(identity, &rendered_fields, pod_spec_snapshot.as_ref())
            .map_err(|err| {
                tracing::warn!(identity = %identity, error = %err, "snapshot write failed");
                SnapshotError::Persistence(format!("{err:#}"))
            })?;

        let pruned = if self.settings.pruning_enabled() {
            store
                .prune_old_snapshots(
                    &identity.workflow_id,
                    &identity.task_id,
                    self.settings.max_snapshots_per_task,
                )
                .map_err(|err| SnapshotError::Persistence(format!("{err:#}")))?
        } else {
            0
        };

        tracing::debug!(
            identity = %identity,
            fields = snapshot.rendered_fields.len(),
            has_pod_spec = snapshot.pod_spec_snapshot.is_some(),
            pruned,
            "recorded rendered snapshot"
        );

        Ok(RecordOutcome { snapshot, pruned })
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`SnapshotError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, SnapshotError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SnapshotError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(SnapshotError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SnapshotError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SnapshotError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            SnapshotError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use time::macros::{date, datetime};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_context() -> RenderContext {
        RenderContext::new()
            .with("task", json!({"task_id": "test"}))
            .with("ds", json!("2019-01-01"))
    }

    fn fixture_engine() -> ExpressionTemplateEngine<BTreeMap<String, String>> {
        let mut variables = BTreeMap::new();
        variables.insert("test_key".to_string(), "test_val".to_string());
        variables.insert("api_key".to_string(), "secret".to_string());
        ExpressionTemplateEngine::new(variables)
    }

    fn render_one(value: FieldValue) -> Result<RenderedValue, SnapshotError> {
        let engine = fixture_engine();
        let context = fixture_context();
        FieldRenderer::new(&engine, &context).render_value("bash_command", &value)
    }

    fn custom_object(template_fields: &[&str]) -> AttributeObject {
        AttributeObject::new("ClassWithCustomAttributes")
            .with_template_fields(template_fields.iter().copied())
    }

    #[derive(Debug, Default)]
    struct MemoryStore {
        rows: BTreeMap<RunIdentity, (u64, RenderedSnapshot)>,
        next_seq: u64,
        fail_writes: bool,
    }

    impl SnapshotStore for MemoryStore {
        fn write_snapshot(
            &mut self,
            identity: &RunIdentity,
            rendered_fields: &RenderedFields,
            pod_spec_snapshot: Option<&RenderedFields>,
        ) -> anyhow::Result<RenderedSnapshot> {
            if self.fail_writes {
                return Err(anyhow::anyhow!("disk full"));
            }
            self.next_seq += 1;
            let snapshot = RenderedSnapshot {
                snapshot_id: Ulid::new(),
                identity: identity.clone(),
                rendered_fields: rendered_fields.clone(),
                pod_spec_snapshot: pod_spec_snapshot.cloned(),
                created_at: now_utc(),
            };
            self.rows
                .insert(identity.clone(), (self.next_seq, snapshot.clone()));
            Ok(snapshot)
        }

        fn get_rendered_fields(
            &self,
            identity: &RunIdentity,
        ) -> anyhow::Result<Option<RenderedFields>> {
            Ok(self
                .rows
                .get(identity)
                .map(|(_, row)| row.rendered_fields.clone()))
        }

        fn get_pod_spec_snapshot(
            &self,
            identity: &RunIdentity,
        ) -> anyhow::Result<Option<RenderedFields>> {
            Ok(self
                .rows
                .get(identity)
                .and_then(|(_, row)| row.pod_spec_snapshot.clone()))
        }

        fn delete_snapshot(&mut self, identity: &RunIdentity) -> anyhow::Result<bool> {
            Ok(self.rows.remove(identity).is_some())
        }

        fn prune_old_snapshots(
            &mut self,
            workflow_id: &str,
            task_id: &str,
            keep: i64,
        ) -> anyhow::Result<usize> {
            let Ok(keep) = usize::try_from(keep) else {
                return Ok(0);
            };
            if keep == 0 {
                return Ok(0);
            }
            let mut group: Vec<(u64, RunIdentity)> = self
                .rows
                .iter()
                .filter(|(id, _)| id.workflow_id == workflow_id && id.task_id == task_id)
                .map(|(id, (seq, _))| (*seq, id.clone()))
                .collect();
            group.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0));
            let stale: Vec<RunIdentity> = group.into_iter().skip(keep).map(|(_, id)| id).collect();
            for id in &stale {
                self.rows.remove(id);
            }
            Ok(stale.len())
        }
    }

    #[derive(Debug)]
    struct UnreachablePolicy;

    impl RedactionPolicy for UnreachablePolicy {
        fn should_mask(&self, _key: &str) -> Result<bool, RedactionError> {
            Err(RedactionError::Unavailable("policy backend offline".to_string()))
        }

        fn is_known_secret_value(&self, _value: &str) -> Result<bool, RedactionError> {
            Err(RedactionError::Unavailable("policy backend offline".to_string()))
        }
    }

    fn bash_operator(command: &str) -> AttributeObject {
        AttributeObject::new("BashOperator")
            .with_template_fields(["bash_command", "env"])
            .with_attribute("bash_command", command)
            .with_attribute("env", FieldValue::Null)
            .with_attribute("task_id", "test")
    }

    fn fixture_identity() -> RunIdentity {
        RunIdentity::new(
            "test_write",
            "test",
            must_ok(RunKey::from_logical_date(datetime!(2019-01-01 0:00 UTC))),
        )
    }

    #[test]
    fn values_without_template_syntax_render_unchanged() {
        let mut plain_mapping = BTreeMap::new();
        plain_mapping.insert("foo".to_string(), FieldValue::from("bar"));

        let cases = vec![
            (FieldValue::Null, RenderedValue::Null),
            (FieldValue::Sequence(Vec::new()), RenderedValue::Sequence(Vec::new())),
            (
                FieldValue::Mapping(BTreeMap::new()),
                RenderedValue::Mapping(BTreeMap::new()),
            ),
            (
                FieldValue::from("test-string"),
                RenderedValue::from("test-string"),
            ),
            (
                FieldValue::Mapping(plain_mapping),
                RenderedValue::Mapping(BTreeMap::from([(
                    "foo".to_string(),
                    RenderedValue::from("bar"),
                )])),
            ),
            (FieldValue::Integer(7), RenderedValue::Integer(7)),
            (FieldValue::Bool(true), RenderedValue::Bool(true)),
        ];

        for (input, expected) in cases {
            assert_eq!(must_ok(render_one(input)), expected);
        }
    }

    #[test]
    fn template_string_resolves_against_context() {
        let rendered = must_ok(render_one(FieldValue::from("{{ task.task_id }}")));
        assert_eq!(rendered, RenderedValue::from("test"));

        let rendered = must_ok(render_one(FieldValue::from("echo {{ ds }} {# note #}done")));
        assert_eq!(rendered, RenderedValue::from("echo 2019-01-01 done"));
    }

    #[test]
    fn non_finite_numbers_are_rejected() {
        for number in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let result = render_one(FieldValue::Sequence(vec![
                FieldValue::Integer(1),
                FieldValue::Float(number),
            ]));
            assert!(
                matches!(result, Err(SnapshotError::InvalidFieldValue(_))),
                "expected rejection of {number}, got {result:?}"
            );
        }
        assert_eq!(
            must_ok(render_one(FieldValue::Float(1.5))),
            RenderedValue::Float(1.5)
        );
    }

    #[test]
    fn dates_and_timestamps_render_as_iso_strings() {
        let rendered = must_ok(render_one(FieldValue::Date(date!(2018 - 12 - 06))));
        assert_eq!(rendered, RenderedValue::from("2018-12-06"));

        let rendered = must_ok(render_one(FieldValue::Timestamp(datetime!(
            2018-12-06 10:55 UTC
        ))));
        assert_eq!(rendered, RenderedValue::from("2018-12-06 10:55:00+00:00"));

        let rendered = must_ok(render_one(FieldValue::Timestamp(datetime!(
            2018-12-06 10:55:01.25 +02:00
        ))));
        assert_eq!(
            rendered,
            RenderedValue::from("2018-12-06 10:55:01.250000+02:00")
        );
    }

    #[test]
    fn nested_object_renders_only_declared_fields() {
        let object = custom_object(&["att1"])
            .with_attribute("att1", "{{ task.task_id }}")
            .with_attribute("att2", "{{ task.task_id }}");

        let rendered = must_ok(render_one(FieldValue::object(object)));
        assert_eq!(
            rendered.to_string(),
            r#"ClassWithCustomAttributes({"att1": "test", "att2": "{{ task.task_id }}", "template_fields": ["att1"]})"#
        );
    }

    #[test]
    fn two_level_nesting_keeps_undeclared_objects_verbatim() {
        let nested1 = custom_object(&["att1"])
            .with_attribute("att1", "{{ task.task_id }}")
            .with_attribute("att2", "{{ task.task_id }}");
        let nested2 = custom_object(&["att3"])
            .with_attribute("att3", "{{ task.task_id }}")
            .with_attribute("att4", "{{ task.task_id }}");
        let outer = custom_object(&["nested1"])
            .with_attribute("nested1", FieldValue::object(nested1))
            .with_attribute("nested2", FieldValue::object(nested2));

        let rendered = must_ok(render_one(FieldValue::object(outer)));
        assert_eq!(
            rendered.to_string(),
            concat!(
                r#"ClassWithCustomAttributes({"nested1": ClassWithCustomAttributes("#,
                r#"{"att1": "test", "att2": "{{ task.task_id }}", "template_fields": ["att1"]}), "#,
                r#""nested2": ClassWithCustomAttributes("#,
                r#"{"att3": "{{ task.task_id }}", "att4": "{{ task.task_id }}", "template_fields": ["att3"]}), "#,
                r#""template_fields": ["nested1"]})"#
            )
        );
    }

    #[test]
    fn tagged_object_survives_json_storage() {
        let object = custom_object(&["att1"])
            .with_attribute("att1", "{{ task.task_id }}")
            .with_attribute("count", 3_i64);
        let rendered = must_ok(render_one(FieldValue::object(object)));

        let stored = must_ok(serde_json::to_string(&rendered));
        let restored: RenderedValue = must_ok(serde_json::from_str(&stored));
        assert_eq!(restored, rendered);
        assert_eq!(
            rendered.to_json(),
            json!({
                "__kind": "ClassWithCustomAttributes",
                "__template_fields": ["att1"],
                "__attributes": {"att1": "test", "count": 3}
            })
        );
    }

    #[test]
    fn depth_guard_rejects_over_deep_structures() {
        let mut value = FieldValue::from("leaf");
        for _ in 0..5 {
            value = FieldValue::Sequence(vec![value]);
        }

        let engine = fixture_engine();
        let context = fixture_context();
        let renderer = FieldRenderer::new(&engine, &context).with_max_depth(3);
        let result = renderer.render_value("deep", &value);
        assert_eq!(result, Err(SnapshotError::RenderDepthExceeded { limit: 3 }));

        let renderer = FieldRenderer::new(&engine, &context).with_max_depth(5);
        assert!(renderer.render_value("deep", &value).is_ok());
    }

    #[test]
    fn render_errors_propagate_with_field_name() {
        let result = render_one(FieldValue::from("echo {{ var.value.missing }}"));
        assert_eq!(
            result,
            Err(SnapshotError::Template {
                field: "bash_command".to_string(),
                source: TemplateError::Undefined {
                    expression: "var.value.missing".to_string()
                },
            })
        );

        assert!(matches!(
            render_one(FieldValue::from("echo {{ ds")),
            Err(SnapshotError::Template {
                source: TemplateError::Syntax { .. },
                ..
            })
        ));
        assert!(matches!(
            render_one(FieldValue::from("{% if x %}y{% endif %}")),
            Err(SnapshotError::Template {
                source: TemplateError::Syntax { .. },
                ..
            })
        ));
        assert!(matches!(
            render_one(FieldValue::from("{{ ds | upper }}")),
            Err(SnapshotError::Template {
                source: TemplateError::Syntax { .. },
                ..
            })
        ));
    }

    #[test]
    fn missing_declared_field_is_reported() {
        let owner = AttributeObject::new("BashOperator").with_template_fields(["bash_command"]);
        let engine = fixture_engine();
        let context = fixture_context();
        let result = FieldRenderer::new(&engine, &context).render_template_fields(&owner);
        assert_eq!(
            result,
            Err(SnapshotError::MissingTemplateField {
                kind: "BashOperator".to_string(),
                field: "bash_command".to_string(),
            })
        );
    }

    #[test]
    fn render_template_fields_covers_only_declared_fields() {
        let engine = fixture_engine();
        let context = fixture_context();
        let fields = must_ok(
            FieldRenderer::new(&engine, &context)
                .render_template_fields(&bash_operator("echo {{ var.value.test_key }}")),
        );
        assert_eq!(
            fields,
            BTreeMap::from([
                (
                    "bash_command".to_string(),
                    RenderedValue::from("echo test_val")
                ),
                ("env".to_string(), RenderedValue::Null),
            ])
        );
    }

    #[test]
    fn redaction_masks_sensitive_keys_and_keeps_siblings() {
        let fields = BTreeMap::from([
            ("bash_command".to_string(), RenderedValue::from("echo hi")),
            (
                "env".to_string(),
                RenderedValue::Mapping(BTreeMap::from([
                    ("foo".to_string(), RenderedValue::from("bar")),
                    (
                        "other_api_key".to_string(),
                        RenderedValue::from("masked based on key name"),
                    ),
                    (
                        "Password".to_string(),
                        RenderedValue::Sequence(vec![
                            RenderedValue::from("a"),
                            RenderedValue::Integer(2),
                            RenderedValue::Null,
                        ]),
                    ),
                ])),
            ),
        ]);

        let redacted = must_ok(redact_fields(&fields, &SecretsMasker::default()));
        assert_eq!(redacted["bash_command"], RenderedValue::from("echo hi"));
        assert_eq!(
            redacted["env"],
            RenderedValue::Mapping(BTreeMap::from([
                ("foo".to_string(), RenderedValue::from("bar")),
                ("other_api_key".to_string(), RenderedValue::from("***")),
                (
                    "Password".to_string(),
                    RenderedValue::Sequence(vec![
                        RenderedValue::from("***"),
                        RenderedValue::from("***"),
                        RenderedValue::Null,
                    ]),
                ),
            ]))
        );
    }

    #[test]
    fn redaction_masks_known_secret_values_anywhere() {
        let mut masker = SecretsMasker::default();
        let registered = masker.register_variables([("api_key", "secret"), ("region", "eu")]);
        assert_eq!(registered, 1);

        let engine = fixture_engine();
        let context = fixture_context();
        let owner = AttributeObject::new("BashOperator")
            .with_template_fields(["bash_command", "env"])
            .with_attribute("bash_command", "echo {{ var.value.api_key }}")
            .with_attribute(
                "env",
                FieldValue::Mapping(BTreeMap::from([
                    ("foo".to_string(), FieldValue::from("secret")),
                    ("region".to_string(), FieldValue::from("eu")),
                ])),
            );

        let settings = SnapshotSettings::default();
        let recorder = SnapshotRecorder::new(&engine, &masker, &settings);
        let fields = must_ok(recorder.render_redacted(&owner, &context));
        assert_eq!(fields["bash_command"], RenderedValue::from("echo ***"));
        assert_eq!(
            fields["env"],
            RenderedValue::Mapping(BTreeMap::from([
                ("foo".to_string(), RenderedValue::from("***")),
                ("region".to_string(), RenderedValue::from("eu")),
            ]))
        );
    }

    #[test]
    fn redaction_walks_nested_objects() {
        let object = RenderedValue::Object {
            kind: "Connection".to_string(),
            template_fields: vec!["host".to_string()],
            attributes: BTreeMap::from([
                ("host".to_string(), RenderedValue::from("db.internal")),
                ("auth_token".to_string(), RenderedValue::from("t0k3n")),
            ]),
        };
        let fields = BTreeMap::from([("conn".to_string(), object)]);

        let redacted = must_ok(redact_fields(&fields, &SecretsMasker::default()));
        let RenderedValue::Object { attributes, .. } = &redacted["conn"] else {
            panic!("expected object, got {}", redacted["conn"]);
        };
        assert_eq!(attributes["host"], RenderedValue::from("db.internal"));
        assert_eq!(attributes["auth_token"], RenderedValue::from("***"));
    }

    #[test]
    fn redaction_fails_closed_when_policy_is_unreachable() {
        let fields = BTreeMap::from([("bash_command".to_string(), RenderedValue::from("echo"))]);
        let result = redact_fields(&fields, &UnreachablePolicy);
        assert!(matches!(
            result,
            Err(SnapshotError::Redaction(RedactionError::Unavailable(_)))
        ));
    }

    #[test]
    fn masker_rejects_blank_patterns() {
        assert!(SecretsMasker::new(["password", " "], "***").is_err());
        assert!(SecretsMasker::new(["password"], "").is_err());

        let mut masker = must_ok(SecretsMasker::new(["password"], "<hidden>"));
        masker.add_secret("   ");
        assert_eq!(masker.secret_count(), 0);
        masker.add_secret("hunter2");
        assert_eq!(must_ok(masker.scrub("pw=hunter2")), Some("pw=<hidden>".to_string()));
    }

    #[test]
    fn settings_defaults_validate_and_decode() {
        let settings = SnapshotSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.max_snapshots_per_task, 30);
        assert!(settings.pruning_enabled());

        let decoded = must_ok(SnapshotSettings::from_json(&json!({
            "max_snapshots_per_task": 0
        })));
        assert!(!decoded.pruning_enabled());
        assert_eq!(decoded.max_render_depth, DEFAULT_MAX_RENDER_DEPTH);

        assert!(SnapshotSettings::from_json(&json!({"max_render_depth": 0})).is_err());
        assert!(SnapshotSettings::from_json(&json!({"unknown": true})).is_err());
        assert!(SnapshotSettings::from_json(&json!({"sensitive_field_names": [""]})).is_err());
    }

    #[test]
    fn field_values_decode_from_tagged_json() {
        let value = must_ok(FieldValue::from_json(&json!({
            "$object": {
                "kind": "ClassWithCustomAttributes",
                "template_fields": ["att1"],
                "attributes": {
                    "att1": "{{ task.task_id }}",
                    "when": {"$date": "2018-12-06"},
                    "at": {"$timestamp": "2018-12-06T10:55:00Z"}
                }
            }
        })));

        let rendered = must_ok(render_one(value));
        assert_eq!(
            rendered.to_string(),
            r#"ClassWithCustomAttributes({"at": "2018-12-06 10:55:00+00:00", "att1": "test", "when": "2018-12-06", "template_fields": ["att1"]})"#
        );

        assert!(FieldValue::from_json(&json!({"$date": "06/12/2018"})).is_err());
        assert!(FieldValue::from_json(&json!({"$object": {"kind": ""}})).is_err());
    }

    #[test]
    fn identity_validation_and_display() {
        let identity = fixture_identity().with_map_index(2);
        assert!(identity.validate().is_ok());
        assert_eq!(identity.stored_map_index(), 2);
        assert_eq!(identity.to_string(), "test_write.test@2019-01-01T00:00:00Z[2]");
        assert_eq!(fixture_identity().stored_map_index(), UNMAPPED_INDEX);

        let blank = RunIdentity::new("dag", " ", RunKey::new("manual__1"));
        assert!(blank.validate().is_err());
    }

    #[test]
    fn recorder_writes_redacted_snapshot_and_prunes() {
        let engine = fixture_engine();
        let context = fixture_context();
        let masker = SecretsMasker::default();
        let settings = SnapshotSettings {
            max_snapshots_per_task: 2,
            ..SnapshotSettings::default()
        };
        let recorder = SnapshotRecorder::new(&engine, &masker, &settings);
        let mut store = MemoryStore::default();

        let pod_spec = |_: &RunIdentity| -> Result<Option<RenderedFields>, SnapshotError> {
            Ok(Some(BTreeMap::from([
                ("kind".to_string(), RenderedValue::from("Pod")),
                ("secret_ref".to_string(), RenderedValue::from("s3cr3t")),
            ])))
        };

        let mut last = None;
        for day in 1..=3 {
            let identity = RunIdentity::new("dag", "task", RunKey::new(format!("run_{day}")));
            let outcome = must_ok(recorder.record(
                &mut store,
                &identity,
                &bash_operator("echo {{ ds }}"),
                &context,
                Some(&pod_spec),
            ));
            last = Some((identity, outcome));
        }

        let Some((identity, outcome)) = last else {
            panic!("expected a recorded snapshot");
        };
        assert_eq!(outcome.pruned, 1);
        assert_eq!(store.rows.len(), 2);
        assert_eq!(
            must_ok(store.get_rendered_fields(&identity)),
            Some(BTreeMap::from([
                (
                    "bash_command".to_string(),
                    RenderedValue::from("echo 2019-01-01")
                ),
                ("env".to_string(), RenderedValue::Null),
            ]))
        );
        let pod = must_ok(store.get_pod_spec_snapshot(&identity));
        assert_eq!(
            pod.and_then(|spec| spec.get("secret_ref").cloned()),
            Some(RenderedValue::from("***"))
        );
    }

    #[test]
    fn recorder_writes_nothing_when_any_step_fails() {
        let engine = fixture_engine();
        let context = fixture_context();
        let settings = SnapshotSettings::default();
        let identity = fixture_identity();
        let mut store = MemoryStore::default();

        let masker = SecretsMasker::default();
        let recorder = SnapshotRecorder::new(&engine, &masker, &settings);
        let owner = AttributeObject::new("BashOperator")
            .with_template_fields(["bash_command", "env"])
            .with_attribute("bash_command", "echo ok")
            .with_attribute("env", "{{ var.value.nope }}");
        assert!(recorder
            .record(&mut store, &identity, &owner, &context, None)
            .is_err());
        assert!(store.rows.is_empty());

        let recorder = SnapshotRecorder::new(&engine, &UnreachablePolicy, &settings);
        let result = recorder.record(
            &mut store,
            &identity,
            &bash_operator("echo ok"),
            &context,
            None,
        );
        assert!(matches!(result, Err(SnapshotError::Redaction(_))));
        assert!(store.rows.is_empty());

        store.fail_writes = true;
        let recorder = SnapshotRecorder::new(&engine, &masker, &settings);
        let result = recorder.record(
            &mut store,
            &identity,
            &bash_operator("echo ok"),
            &context,
            None,
        );
        assert_eq!(
            result,
            Err(SnapshotError::Persistence("disk full".to_string()))
        );
    }

    #[test]
    fn recorder_skips_pruning_when_disabled() {
        let engine = fixture_engine();
        let context = fixture_context();
        let masker = SecretsMasker::default();
        let settings = SnapshotSettings {
            max_snapshots_per_task: 0,
            ..SnapshotSettings::default()
        };
        let recorder = SnapshotRecorder::new(&engine, &masker, &settings);
        let mut store = MemoryStore::default();

        for run in 0..4 {
            let identity = RunIdentity::new("dag", "task", RunKey::new(format!("run_{run}")));
            let outcome = must_ok(recorder.record(
                &mut store,
                &identity,
                &bash_operator("echo"),
                &context,
                None,
            ));
            assert_eq!(outcome.pruned, 0);
        }
        assert_eq!(store.rows.len(), 4);
    }

    #[test]
    fn env_variables_resolve_with_prefix() {
        let lookup = EnvVariables::with_prefix("RFS_CORE_TEST_VAR_");
        std::env::set_var("RFS_CORE_TEST_VAR_REGION", "eu-west-1");
        assert_eq!(lookup.lookup_variable("region"), Some("eu-west-1".to_string()));
        assert_eq!(lookup.lookup_variable("absent"), None);

        let overrides = BTreeMap::from([("region".to_string(), "us-east-1".to_string())]);
        let chained = (overrides, lookup);
        assert_eq!(chained.lookup_variable("region"), Some("us-east-1".to_string()));
    }

    #[test]
    fn env_variable_secrets_are_masked_wherever_they_appear() {
        let env_variables = EnvVariables::with_prefix("RFS_CORE_SECRET_VAR_");
        std::env::set_var("RFS_CORE_SECRET_VAR_API_KEY", "supersecret42");
        std::env::set_var("RFS_CORE_SECRET_VAR_REGION", "eu");

        let discovered = env_variables.variables();
        assert_eq!(discovered.get("api_key"), Some(&"supersecret42".to_string()));
        assert_eq!(discovered.get("region"), Some(&"eu".to_string()));

        let mut masker = SecretsMasker::default();
        let registered = masker.register_variables(
            discovered
                .iter()
                .map(|(name, value)| (name.as_str(), value.as_str())),
        );
        assert_eq!(registered, 1);

        let engine = ExpressionTemplateEngine::new(env_variables);
        let context = RenderContext::default();
        let owner = AttributeObject::new("BashOperator")
            .with_template_fields(["bash_command", "env"])
            .with_attribute("bash_command", "echo {{ var.value.api_key }}")
            .with_attribute(
                "env",
                FieldValue::Mapping(BTreeMap::from([(
                    "foo".to_string(),
                    FieldValue::from("supersecret42"),
                )])),
            );

        let settings = SnapshotSettings::default();
        let recorder = SnapshotRecorder::new(&engine, &masker, &settings);
        let fields = must_ok(recorder.render_redacted(&owner, &context));
        assert_eq!(fields["bash_command"], RenderedValue::from("echo ***"));
        assert_eq!(
            fields["env"],
            RenderedValue::Mapping(BTreeMap::from([(
                "foo".to_string(),
                RenderedValue::from("***"),
            )]))
        );
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_plain_strings_render_verbatim(text in "[a-zA-Z0-9 _./:-]{0,40}") {
            let rendered = render_one(FieldValue::from(text.as_str()));
            prop_assert_eq!(rendered, Ok(RenderedValue::String(text)));
        }

        #[test]
        fn prop_redaction_preserves_shape(values in prop::collection::vec("[a-z]{1,8}", 0..12)) {
            let sequence = RenderedValue::Sequence(
                values.iter().map(|value| RenderedValue::from(value.as_str())).collect(),
            );
            let fields = BTreeMap::from([
                ("password".to_string(), sequence.clone()),
                ("plain".to_string(), sequence.clone()),
            ]);

            let redacted = redact_fields(&fields, &SecretsMasker::default());
            let Ok(redacted) = redacted else {
                return Err(TestCaseError::fail("redaction failed"));
            };
            prop_assert_eq!(&redacted["plain"], &sequence);
            match &redacted["password"] {
                RenderedValue::Sequence(items) => {
                    prop_assert_eq!(items.len(), values.len());
                    prop_assert!(items.iter().all(|item| item.as_str() == Some("***")));
                }
                other => return Err(TestCaseError::fail(format!("unexpected shape {other}"))),
            }
        }
    }
}

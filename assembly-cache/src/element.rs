//! Elements, element ids and change batches.
//!
//! An element is a JSON object identified by `(collection, id)`. The string
//! form of an element id is `collection:id`, e.g. `core/tag:1`. Collections
//! may contain `/` but never `:`, so decoding splits on the last `:`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A single element's data.
pub type Element = Map<String, Value>;

/// Separator between collection and id in the string form.
pub const ELEMENT_ID_SEPARATOR: char = ':';

/// Field that keeps an element out of `deleted` for users who cannot see it.
pub const NO_DELETE_ON_RESTRICTION: &str = "_no_delete_on_restriction";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ElementIdError {
    #[error("element id '{0}' has no ':' separator")]
    MissingSeparator(String),
    #[error("element id '{0}' has an empty collection")]
    EmptyCollection(String),
    #[error("collection '{0}' contains the reserved ':' character")]
    ReservedCharacter(String),
    #[error("element id '{0}' has an invalid numeric id")]
    InvalidId(String),
}

/// Identity of an element: collection name plus numeric id.
///
/// Ordered by collection first, then id, which is the natural order used for
/// full dataset listings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ElementId {
    collection: String,
    id: u64,
}

impl ElementId {
    /// Build an element id, rejecting collections that could not round-trip.
    pub fn new(collection: impl Into<String>, id: u64) -> Result<Self, ElementIdError> {
        let collection = collection.into();
        validate_collection(&collection)?;
        Ok(Self { collection, id })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The `collection:id` string form.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Parse the `collection:id` string form.
    pub fn decode(s: &str) -> Result<Self, ElementIdError> {
        let (collection, id) = s
            .rsplit_once(ELEMENT_ID_SEPARATOR)
            .ok_or_else(|| ElementIdError::MissingSeparator(s.to_string()))?;
        if collection.is_empty() {
            return Err(ElementIdError::EmptyCollection(s.to_string()));
        }
        // u64::from_str accepts a leading '+'.
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ElementIdError::InvalidId(s.to_string()));
        }
        let id = id
            .parse::<u64>()
            .map_err(|_| ElementIdError::InvalidId(s.to_string()))?;
        Self::new(collection, id)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{ELEMENT_ID_SEPARATOR}{}", self.collection, self.id)
    }
}

impl FromStr for ElementId {
    type Err = ElementIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

impl TryFrom<String> for ElementId {
    type Error = ElementIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::decode(&value)
    }
}

impl From<ElementId> for String {
    fn from(value: ElementId) -> Self {
        value.encode()
    }
}

/// Check that a collection name is legal in an element id.
pub fn validate_collection(collection: &str) -> Result<(), ElementIdError> {
    if collection.is_empty() {
        return Err(ElementIdError::EmptyCollection(collection.to_string()));
    }
    if collection.contains(ELEMENT_ID_SEPARATOR) {
        return Err(ElementIdError::ReservedCharacter(collection.to_string()));
    }
    Ok(())
}

/// One entry of a change batch submitted to the element cache.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementChange {
    pub element_id: ElementId,
    /// New data, or `None` for a deletion.
    pub data: Option<Element>,
    /// Human readable history information, e.g. `["Object created"]`.
    pub information: Vec<String>,
    /// The acting user, if any.
    pub user_id: Option<u64>,
    /// Skip the history record for this element.
    pub disable_history: bool,
}

impl ElementChange {
    /// A change that sets new data.
    pub fn update(element_id: ElementId, data: Element) -> Self {
        Self {
            element_id,
            data: Some(data),
            information: Vec::new(),
            user_id: None,
            disable_history: false,
        }
    }

    /// A change that deletes the element.
    pub fn delete(element_id: ElementId) -> Self {
        Self {
            element_id,
            data: None,
            information: Vec::new(),
            user_id: None,
            disable_history: false,
        }
    }

    pub fn with_information(mut self, information: impl Into<String>) -> Self {
        self.information.push(information.into());
        self
    }

    pub fn by_user(mut self, user_id: u64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn without_history(mut self) -> Self {
        self.disable_history = true;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.data.is_none()
    }
}

/// Read the integer `"id"` field of an element.
pub fn element_numeric_id(element: &Element) -> Option<u64> {
    element.get("id").and_then(Value::as_u64)
}

/// Remove fields that are internal to the cache before handing data out.
pub fn strip_internal_fields(mut element: Element) -> Element {
    element.remove(NO_DELETE_ON_RESTRICTION);
    element
}

/// Whether an element asks not to be reported as deleted when restricted away.
pub fn no_delete_on_restriction(element: &Element) -> bool {
    element
        .get(NO_DELETE_ON_RESTRICTION)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

/// Group a flat `element id → data` map into `collection → [element]`,
/// ordered by collection and id.
pub fn group_by_collection(
    elements: impl IntoIterator<Item = (ElementId, Element)>,
) -> BTreeMap<String, Vec<Element>> {
    let mut grouped: BTreeMap<String, Vec<Element>> = BTreeMap::new();
    let mut sorted: Vec<(ElementId, Element)> = elements.into_iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (element_id, element) in sorted {
        grouped
            .entry(element_id.collection().to_string())
            .or_default()
            .push(element);
    }
    grouped
}

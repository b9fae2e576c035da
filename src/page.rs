//! Page payload handed to render modules.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{PageContext, SsrError};

/// Asset version token; the protocol allows either a string or a number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssetVersion {
    Text(String),
    Number(serde_json::Number),
}

impl fmt::Display for AssetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetVersion::Text(text) => f.write_str(text),
            AssetVersion::Number(number) => write!(f, "{}", number),
        }
    }
}

impl From<&str> for AssetVersion {
    fn from(value: &str) -> Self {
        AssetVersion::Text(value.to_string())
    }
}

impl From<String> for AssetVersion {
    fn from(value: String) -> Self {
        AssetVersion::Text(value)
    }
}

impl From<u64> for AssetVersion {
    fn from(value: u64) -> Self {
        AssetVersion::Number(value.into())
    }
}

/// A serialized page description.
///
/// Fields are private: a payload is immutable once built. Each render call
/// serializes a fresh copy for the module, so nothing a render function does
/// to its argument is visible to later calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "PageWire")]
pub struct PagePayload {
    component: String,
    props: Map<String, Value>,
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    version: Option<AssetVersion>,
    #[serde(skip_serializing_if = "is_false")]
    encrypt_history: bool,
    #[serde(skip_serializing_if = "is_false")]
    clear_history: bool,
}

fn is_false(flag: &bool) -> bool {
    !*flag
}

/// Wire form accepted on input; `props` may be absent or null.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageWire {
    component: String,
    #[serde(default)]
    props: Option<Map<String, Value>>,
    url: String,
    #[serde(default)]
    version: Option<AssetVersion>,
    #[serde(default)]
    encrypt_history: bool,
    #[serde(default)]
    clear_history: bool,
}

impl TryFrom<PageWire> for PagePayload {
    type Error = SsrError;

    fn try_from(wire: PageWire) -> Result<Self, Self::Error> {
        let mut page = PagePayload::new(wire.component, wire.url)?;
        page.props = wire.props.unwrap_or_default();
        page.version = wire.version;
        page.encrypt_history = wire.encrypt_history;
        page.clear_history = wire.clear_history;
        Ok(page)
    }
}

impl PagePayload {
    /// Build a payload with empty props.
    pub fn new(component: impl Into<String>, url: impl Into<String>) -> Result<Self, SsrError> {
        let component = component.into();
        if component.trim().is_empty() {
            return Err(SsrError::InvalidPayload(
                "component must be a non-empty string".to_string(),
            ));
        }

        Ok(Self {
            component,
            props: Map::new(),
            url: url.into(),
            version: None,
            encrypt_history: false,
            clear_history: false,
        })
    }

    /// Parse a payload from its JSON form.
    pub fn from_json(json: &str) -> Result<Self, SsrError> {
        serde_json::from_str(json).map_err(|e| SsrError::InvalidPayload(e.to_string()))
    }

    pub fn with_props(mut self, props: Map<String, Value>) -> Self {
        self.props = props;
        self
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<AssetVersion>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_history_flags(mut self, encrypt_history: bool, clear_history: bool) -> Self {
        self.encrypt_history = encrypt_history;
        self.clear_history = clear_history;
        self
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn props(&self) -> &Map<String, Value> {
        &self.props
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn version(&self) -> Option<&AssetVersion> {
        self.version.as_ref()
    }

    pub fn encrypt_history(&self) -> bool {
        self.encrypt_history
    }

    pub fn clear_history(&self) -> bool {
        self.clear_history
    }

    /// Diagnostic identity used by render errors.
    pub fn context(&self) -> PageContext {
        PageContext {
            component: self.component.clone(),
            url: self.url.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String, SsrError> {
        serde_json::to_string(self).map_err(|e| SsrError::InvalidPayload(e.to_string()))
    }
}

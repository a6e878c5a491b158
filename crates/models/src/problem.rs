use serde::{Deserialize, Serialize};

/// ProblemDetails is an RFC 7807 "problem+json" error document, as returned
/// by the edge APIs. Fields the gateway doesn't read are preserved in
/// `extensions` so the document can be re-serialized without loss.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProblemDetails>,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl ProblemDetails {
    /// A short human rendering: the title, falling back through detail and
    /// type to a generic placeholder.
    pub fn summary(&self) -> &str {
        self.title
            .as_deref()
            .or(self.detail.as_deref())
            .or(self.type_.as_deref())
            .unwrap_or("unspecified problem")
    }
}

impl std::fmt::Display for ProblemDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.summary())?;
        if let (Some(_), Some(detail)) = (&self.title, &self.detail) {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

use serde::{Deserialize, Serialize};

/// One raw source unit handed to the classifier: free-form text plus where it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUnit {
    pub text: String,
    pub origin: String,
}

impl SourceUnit {
    pub fn new(text: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            origin: origin.into(),
        }
    }
}

use serde_json::Value;

/// The serialized content of a shared document as it appears in the backing file.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Text(String),
    Json(Value),
}

impl Source {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Source::Text(text) => Some(text),
            Source::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Source::Json(value) => Some(value),
            Source::Text(_) => None,
        }
    }

    /// Render the content the way it is written to disk.
    pub fn to_file_string(&self) -> Result<String, serde_json::Error> {
        match self {
            Source::Text(text) => Ok(text.clone()),
            Source::Json(value) => {
                let mut out = serde_json::to_string_pretty(value)?;
                out.push('\n');
                Ok(out)
            }
        }
    }
}

impl From<&str> for Source {
    fn from(text: &str) -> Self {
        Source::Text(text.to_string())
    }
}

impl From<String> for Source {
    fn from(text: String) -> Self {
        Source::Text(text)
    }
}

impl From<Value> for Source {
    fn from(value: Value) -> Self {
        Source::Json(value)
    }
}

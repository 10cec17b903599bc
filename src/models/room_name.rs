use std::path::Path;

/// A persistent room name of the form `format:type:path`.
///
/// The path is everything after the second colon and may itself contain colons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPath {
    pub format: String,
    pub file_type: String,
    pub path: String,
}

impl DocumentPath {
    /// Returns `None` for names with fewer than two colons (transient rooms).
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.splitn(3, ':');
        let format = parts.next()?;
        let file_type = parts.next()?;
        let path = parts.next()?;
        Some(Self {
            format: format.to_string(),
            file_type: file_type.to_string(),
            path: path.to_string(),
        })
    }

    pub fn is_notebook(&self) -> bool {
        self.file_type == "notebook"
    }

    /// Format used when writing the document back to the content store.
    pub fn save_format(&self) -> &'static str {
        if self.is_notebook() {
            "json"
        } else {
            "text"
        }
    }

    /// Location of the update log: a hidden sibling named after the type and file name.
    pub fn update_log_location(&self) -> String {
        let path = Path::new(&self.path);
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let log_name = format!(".{}:{}.y", self.file_type, file_name);
        match path.parent() {
            Some(parent) => parent.join(log_name).to_string_lossy().into_owned(),
            None => log_name,
        }
    }
}

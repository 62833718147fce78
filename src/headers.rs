use http::HeaderMap;

/// Insertion-ordered header pairs. Lookups are case-sensitive; the metadata
/// sidecar is written in iteration order, so order must survive overwrites.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        // The new value may borrow from the old one upstream (e.g. a weak
        // ETag minus its prefix), so it is owned before the old is replaced.
        let value = value.to_string();
        for entry in &mut self.entries {
            if entry.0 == name {
                entry.1 = value;
                return;
            }
        }
        self.entries.push((name.to_string(), value));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Builds an ordered list from hyper headers, restoring HTTP title-case.
    /// hyper lowercases every name, but the sidecar format is case-sensitive
    /// and external consumers expect `ETag`, `Content-Length`, etc.
    pub fn from_http(headers: &HeaderMap) -> Self {
        let mut list = Self::new();
        for (name, value) in headers.iter() {
            if let Ok(value) = value.to_str() {
                list.set(&canonical_name(name.as_str()), value);
            }
        }
        list
    }
}

pub fn canonical_name(raw: &str) -> String {
    match raw.to_ascii_lowercase().as_str() {
        "etag" => return "ETag".to_string(),
        "www-authenticate" => return "WWW-Authenticate".to_string(),
        "content-md5" => return "Content-MD5".to_string(),
        _ => {}
    }
    let mut out = String::with_capacity(raw.len());
    for (i, part) in raw.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.push(first.to_ascii_uppercase());
            out.extend(chars.map(|c| c.to_ascii_lowercase()));
        }
    }
    out
}

/// Header fields in arrival order, looked up case-insensitively.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value of the first field called `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replace all fields called `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        let existing = self
            .fields
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(&name));

        if let Some(index) = existing {
            self.fields[index].1 = value;

            // Drop any duplicates after the replaced field
            let mut seen = 0;
            self.fields.retain(|(key, _)| {
                if !key.eq_ignore_ascii_case(&name) {
                    return true;
                }
                seen += 1;
                seen == 1
            });
        } else {
            self.fields.push((name, value));
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case() {
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive");

        assert_eq!(headers.get("connection"), Some("keep-alive"));
        assert_eq!(headers.get("CONNECTION"), Some("keep-alive"));
        assert_eq!(headers.get("host"), None);
    }

    #[test]
    fn set_replaces_every_duplicate() {
        let mut headers = Headers::new();
        headers.append("Date", "a");
        headers.append("Host", "example.com");
        headers.append("date", "b");

        headers.set("DATE", "c");

        let fields: Vec<_> = headers.iter().collect();
        assert_eq!(fields, vec![("Date", "c"), ("Host", "example.com")]);
    }
}

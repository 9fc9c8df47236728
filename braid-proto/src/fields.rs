use std::fmt::{self, Debug};

use http::{Method, StatusCode};

/// An immutable name/value pair representing a single header.
#[derive(Clone, PartialEq, Eq)]
pub struct Field {
    name: String,
    value: String,
    never_index: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            never_index: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether this field may be cached by header compression.
    ///
    /// Sensitive fields (cookies, authorization tokens) should set this.
    pub fn never_index(&self) -> bool {
        self.never_index
    }

    pub fn set_never_index(&mut self, value: bool) {
        self.never_index = value;
    }
}

impl Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// An ordered list of headers for an HTTP request or response.
///
/// All field name comparisons are case-insensitive. Fields with the same
/// name are kept adjacent, preserving insertion order relative to each
/// other.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct Fields {
    list: Vec<Field>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// The number of fields matching the given name.
    pub fn count(&self, name: &str) -> usize {
        self.list
            .iter()
            .filter(|f| f.name.eq_ignore_ascii_case(name))
            .count()
    }

    /// The first field matching the given name.
    pub fn find(&self, name: &str) -> Option<&Field> {
        self.list.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// The value of the first field matching the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.find(name).map(|f| f.value())
    }

    /// Insert a field after the last field matching its name, or at the end
    /// of the list.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.insert_field(Field::new(name, value))
    }

    /// Insert a field that must never be indexed by header compression.
    pub fn insert_never_index(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut Self {
        let mut field = Field::new(name, value);
        field.never_index = true;
        self.insert_field(field)
    }

    fn insert_field(&mut self, field: Field) -> &mut Self {
        let pos = self
            .list
            .iter()
            .rposition(|f| f.name.eq_ignore_ascii_case(&field.name))
            .map(|i| i + 1)
            .unwrap_or(self.list.len());
        self.list.insert(pos, field);
        self
    }

    /// Insert a field at the end of the list, erasing any existing fields
    /// with a matching name.
    pub fn assign(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let field = Field::new(name, value);
        self.list
            .retain(|f| !f.name.eq_ignore_ascii_case(&field.name));
        self.list.push(field);
        self
    }

    /// Remove every field matching the given name, returning how many were
    /// removed.
    pub fn erase(&mut self, name: &str) -> usize {
        let before = self.list.len();
        self.list.retain(|f| !f.name.eq_ignore_ascii_case(name));
        before - self.list.len()
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.list.iter()
    }

    // Pseudo-header helpers, in request/response building order.

    /// Build request pseudo-headers: `:method`, `:scheme`, `:authority`, `:path`.
    pub fn request(method: &Method, authority: &str, path: &str) -> Self {
        let mut fields = Self::new();
        fields.insert(":method", method.as_str());
        fields.insert(":scheme", "https");
        fields.insert(":authority", authority);
        fields.insert(":path", path);
        fields
    }

    /// Build response pseudo-headers: `:status`.
    pub fn response(status: StatusCode) -> Self {
        let mut fields = Self::new();
        fields.insert(":status", status.as_str());
        fields
    }

    pub fn method(&self) -> Option<Method> {
        self.get(":method")?.parse().ok()
    }

    pub fn status(&self) -> Option<StatusCode> {
        self.get(":status")?.parse().ok()
    }

    pub fn path(&self) -> Option<&str> {
        self.get(":path")
    }

    pub fn authority(&self) -> Option<&str> {
        self.get(":authority")
    }
}

impl Debug for Fields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.list.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a Fields {
    type Item = &'a Field;
    type IntoIter = std::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.list.iter()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Fields {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut fields = Self::new();
        for (name, value) in iter {
            fields.insert(name, value);
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive() {
        let mut fields = Fields::new();
        fields.insert("Content-Type", "text/plain");

        assert_eq!(fields.get("content-type"), Some("text/plain"));
        assert_eq!(fields.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(fields.count("content-type"), 1);
        assert_eq!(fields.get("content-length"), None);
    }

    #[test]
    fn duplicates_stay_adjacent_and_ordered() {
        let mut fields = Fields::new();
        fields.insert("set-cookie", "a=1");
        fields.insert("server", "braid");
        fields.insert("Set-Cookie", "b=2");

        let order: Vec<_> = fields.iter().map(|f| f.value()).collect();
        assert_eq!(order, ["a=1", "b=2", "braid"]);
        assert_eq!(fields.count("set-cookie"), 2);
    }

    #[test]
    fn assign_replaces_all() {
        let mut fields = Fields::new();
        fields.insert("accept", "text/html");
        fields.insert("Accept", "text/plain");
        fields.assign("accept", "*/*");

        assert_eq!(fields.count("accept"), 1);
        assert_eq!(fields.get("accept"), Some("*/*"));
    }

    #[test]
    fn erase() {
        let mut fields = Fields::new();
        fields.insert("a", "1");
        fields.insert("b", "2");
        fields.insert("A", "3");

        assert_eq!(fields.erase("a"), 2);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("b"), Some("2"));
    }

    #[test]
    fn never_index() {
        let mut fields = Fields::new();
        fields.insert_never_index("authorization", "Bearer token");
        assert!(fields.find("authorization").unwrap().never_index());
    }

    #[test]
    fn pseudo_headers() {
        let fields = Fields::request(&Method::GET, "example.com", "/echo");
        assert_eq!(fields.method(), Some(Method::GET));
        assert_eq!(fields.path(), Some("/echo"));
        assert_eq!(fields.authority(), Some("example.com"));

        let fields = Fields::response(StatusCode::OK);
        assert_eq!(fields.status(), Some(StatusCode::OK));
    }
}

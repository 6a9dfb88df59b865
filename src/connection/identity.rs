use std::collections::{BTreeMap, HashMap};

use crate::utils::error::ConnectionRejected;

/// Named identity fields of a connection, e.g. `current_user => "42"`.
///
/// Fields are kept sorted so the joined identifier is stable no matter the
/// order they were added in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifiedBy(BTreeMap<String, String>);

impl IdentifiedBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Values joined with `:` in key order; `None` when anonymous.
    pub fn connection_identifier(&self) -> Option<String> {
        if self.0.is_empty() {
            return None;
        }
        Some(self.0.values().cloned().collect::<Vec<_>>().join(":"))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for IdentifiedBy {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// What the connect hook can see of the upgrade request.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
}

impl ConnectRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Application hooks around a connection's life.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Decides whether to accept the client and who it is. The default
    /// accepts everyone anonymously.
    fn connect(&self, request: &ConnectRequest) -> Result<IdentifiedBy, ConnectionRejected> {
        let _ = request;
        Ok(IdentifiedBy::new())
    }

    /// Runs once after an accepted connection has closed.
    fn disconnect(&self, identified_by: &IdentifiedBy) {
        let _ = identified_by;
    }
}

/// Accepts every connection without identifying it.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ConnectionHandler for AllowAll {}

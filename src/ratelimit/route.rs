//! Route key generation and handling.

use reqwest::Method;

/// A key that identifies a logical route for rate limiting.
///
/// The key is composed of the HTTP method and the endpoint template, so
/// `GET channels/{channel_id}` is the same route regardless of which
/// channel is being fetched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    /// The HTTP method
    pub method: Method,
    /// The endpoint template, with path parameters left as `{name}`
    pub template: String,
}

impl RouteKey {
    /// Create a new route key.
    pub fn new(method: Method, template: impl Into<String>) -> Self {
        Self {
            method,
            template: template.into(),
        }
    }

    /// Convert the route key to a string representation.
    ///
    /// This is useful for logging and error messages.
    pub fn to_string_key(&self) -> String {
        format!("{} {}", self.method, self.template)
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// A concrete request target: the rate-limit key plus the compiled path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    key: RouteKey,
    path: String,
}

impl Route {
    /// Compile a route by substituting `{name}` placeholders in `template`.
    ///
    /// Placeholders without a matching parameter are left as they are.
    pub fn compile(method: Method, template: &str, params: &[(&str, &str)]) -> Self {
        let mut path = template.to_string();
        for (name, value) in params {
            path = path.replace(&format!("{{{}}}", name), value);
        }

        Self {
            key: RouteKey::new(method, template),
            path,
        }
    }

    /// The rate-limit identity of this route.
    pub fn key(&self) -> &RouteKey {
        &self.key
    }

    /// The path with parameters filled in.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn method(&self) -> &Method {
        &self.key.method
    }
}

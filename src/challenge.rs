//! Parser for `WWW-Authenticate: Bearer ...` challenges issued by a
//! Registry v2 upstream, per the Distribution token spec.

use std::collections::HashSet;

/// A single Registry v2 scope: `<resource_type>:<resource_name>:<actions>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    pub resource_type: String,
    pub resource_name: String,
    pub actions: HashSet<String>,
}

impl Scope {
    pub fn new(
        resource_type: impl Into<String>,
        resource_name: impl Into<String>,
        actions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            resource_name: resource_name.into(),
            actions: actions.into_iter().collect(),
        }
    }

    /// Render back to the wire form, e.g. `repository:alice/alpine:pull,push`.
    pub fn to_wire(&self) -> String {
        let mut actions: Vec<&str> = self.actions.iter().map(String::as_str).collect();
        actions.sort_unstable();
        format!(
            "{}:{}:{}",
            self.resource_type,
            self.resource_name,
            actions.join(",")
        )
    }

    /// Parse a single `type:name:actions` scope token (no surrounding whitespace).
    pub fn parse_one(token: &str) -> Option<Scope> {
        let mut parts = token.splitn(3, ':');
        let resource_type = parts.next()?;
        let resource_name = parts.next()?;
        let actions = parts.next()?;
        if resource_type.is_empty() || resource_name.is_empty() {
            return None;
        }
        Some(Scope::new(
            resource_type,
            resource_name,
            actions.split(',').filter(|a| !a.is_empty()).map(String::from),
        ))
    }

    /// Parse the space-separated list that can appear inside one `scope="..."` value.
    pub fn parse_list(raw: &str) -> Vec<Scope> {
        raw.split_whitespace().filter_map(Scope::parse_one).collect()
    }
}

/// A parsed `WWW-Authenticate: Bearer realm="...",service="...",scope="..."` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub service: String,
    pub scopes: Vec<Scope>,
}

/// Parse a `WWW-Authenticate` header value. Returns `None` if the
/// `auth-scheme` token is not `Bearer`, or if `realm` is missing; in
/// either case the caller should surface the original upstream response
/// rather than attempt recovery.
pub fn parse_www_authenticate(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let rest = header.strip_prefix("Bearer")?;
    let rest = rest.strip_prefix(' ').unwrap_or(rest);

    let params = parse_auth_params(rest);

    let realm = params.get("realm")?.clone();
    let service = params.get("service").cloned().unwrap_or_default();
    let scopes = params
        .get("scope")
        .map(|s| Scope::parse_list(s))
        .unwrap_or_default();

    Some(Challenge {
        realm,
        service,
        scopes,
    })
}

/// Parse the comma-separated `key="quoted value"` parameter list of an
/// auth-scheme challenge, per RFC 7235 `auth-param`. Quoted strings may
/// contain escaped characters (`\"`, `\\`) and commas.
fn parse_auth_params(input: &str) -> std::collections::HashMap<String, String> {
    let mut params = std::collections::HashMap::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && (bytes[i] == b',' || bytes[i] == b' ') {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let key_start = i;
        while i < bytes.len() && bytes[i] != b'=' {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        let key = input[key_start..i].trim().to_string();
        i += 1; // skip '='

        if i >= bytes.len() {
            break;
        }

        let value = if bytes[i] == b'"' {
            i += 1;
            let mut value = String::new();
            while i < bytes.len() && bytes[i] != b'"' {
                if bytes[i] == b'\\' && i + 1 < bytes.len() {
                    value.push(bytes[i + 1] as char);
                    i += 2;
                } else {
                    value.push(bytes[i] as char);
                    i += 1;
                }
            }
            i += 1; // skip closing '"'
            value
        } else {
            let value_start = i;
            while i < bytes.len() && bytes[i] != b',' {
                i += 1;
            }
            input[value_start..i].trim().to_string()
        };

        if !key.is_empty() {
            params.insert(key, value);
        }
    }

    params
}

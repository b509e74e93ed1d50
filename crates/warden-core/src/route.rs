//! Route resolution: placeholder substitution, glob endpoint allowlists,
//! header merging, and conflict detection.
//!
//! A [`ResolvedRoute`] is a connector after `${VAR}` resolution, pinned into
//! a session at handshake time. Its secrets substitute into that route's own
//! headers, URL, and (when enabled) body, never into another route's, and
//! never back to the client.

use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use tracing::warn;

use crate::config::{env_lookup, CallerConfig, IngestorConfig, RouteConfig};
use crate::error::GatewayError;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("static regex"))
}

/// Substitute `${VAR}` placeholders from `vars`, leaving unknown
/// placeholders verbatim (with a warning).
#[must_use]
pub fn resolve_placeholders(input: &str, vars: &HashMap<String, String>) -> String {
    let re = placeholder_re();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let whole = caps.get(0).expect("capture 0 always present");
        let name = &caps[1];
        out.push_str(&input[last..whole.start()]);
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                warn!(placeholder = name, "unresolved placeholder left verbatim");
                out.push_str(whole.as_str());
            }
        }
        last = whole.end();
    }
    out.push_str(&input[last..]);
    out
}

/// Compile one endpoint glob into an anchored regex.
///
/// `*` matches within a path segment (`[^/]*`), `**` across segments (`.*`);
/// every other character is matched literally.
pub fn compile_endpoint_pattern(pattern: &str) -> Result<Regex, GatewayError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '*' {
            if chars.peek() == Some(&'*') {
                chars.next();
                re.push_str(".*");
            } else {
                re.push_str("[^/]*");
            }
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| GatewayError::Config(format!("bad endpoint pattern {pattern:?}: {e}")))
}

/// A connector after placeholder resolution, pinned into a session.
#[derive(Clone)]
pub struct ResolvedRoute {
    /// Connector alias (the caller-facing name).
    pub alias: String,
    /// Human-readable label.
    pub name: Option<String>,
    /// What the connector is for.
    pub description: Option<String>,
    /// API documentation link.
    pub docs_url: Option<String>,
    /// OpenAPI document link.
    pub openapi_url: Option<String>,
    /// Auto-injected headers, fully resolved.
    pub headers: HashMap<String, String>,
    /// Resolved secrets. Only ever substituted into this route's own
    /// headers, URL, and body.
    pub secrets: HashMap<String, String>,
    /// Original glob patterns (for introspection).
    pub allowed_endpoints: Vec<String>,
    /// Substitute secrets into request bodies.
    pub resolve_secrets_in_body: bool,
    /// Attached event source, if any.
    pub ingestor: Option<IngestorConfig>,
    patterns: Vec<Regex>,
}

// Secrets must never reach logs; only their names are shown.
impl fmt::Debug for ResolvedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secret_names: Vec<&String> = self.secrets.keys().collect();
        secret_names.sort();
        f.debug_struct("ResolvedRoute")
            .field("alias", &self.alias)
            .field("allowed_endpoints", &self.allowed_endpoints)
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("secrets", &secret_names)
            .field("resolve_secrets_in_body", &self.resolve_secrets_in_body)
            .finish_non_exhaustive()
    }
}

impl ResolvedRoute {
    /// Resolve a connector for one caller.
    ///
    /// Secret values that are exactly `"${VAR}"` resolve through the caller
    /// env / process env chain; other values are literals. Header values are
    /// then substituted against the resolved secrets (falling back to the
    /// env chain for names no secret defines).
    pub fn resolve(
        alias: &str,
        config: &RouteConfig,
        caller_env: &HashMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let re = placeholder_re();

        let mut secrets = HashMap::with_capacity(config.secrets.len());
        for (key, value) in &config.secrets {
            let resolved = match re.captures(value) {
                Some(caps) if caps.get(0).map(|m| m.as_str()) == Some(value.as_str()) => {
                    match env_lookup(&caps[1], caller_env) {
                        Some(v) => v,
                        None => {
                            warn!(route = alias, secret = key.as_str(), "secret unresolved");
                            value.clone()
                        }
                    }
                }
                _ => value.clone(),
            };
            secrets.insert(key.clone(), resolved);
        }

        // Header placeholders draw from this route's secrets first, then the
        // env chain.
        let mut vars = secrets.clone();
        for caps in config.headers.values().flat_map(|v| re.captures_iter(v)) {
            let name = caps[1].to_string();
            if !vars.contains_key(&name) {
                if let Some(v) = env_lookup(&name, caller_env) {
                    vars.insert(name, v);
                }
            }
        }
        let headers = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), resolve_placeholders(v, &vars)))
            .collect();

        let patterns = config
            .allowed_endpoints
            .iter()
            .map(|p| compile_endpoint_pattern(p))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            alias: alias.to_string(),
            name: config.name.clone(),
            description: config.description.clone(),
            docs_url: config.docs_url.clone(),
            openapi_url: config.openapi_url.clone(),
            headers,
            secrets,
            allowed_endpoints: config.allowed_endpoints.clone(),
            resolve_secrets_in_body: config.resolve_secrets_in_body,
            ingestor: config.ingestor.clone(),
            patterns,
        })
    }

    /// Does `url` match at least one allowlist pattern?
    ///
    /// An empty allowlist matches nothing.
    #[must_use]
    pub fn is_endpoint_allowed(&self, url: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(url))
    }

    /// Substitute this route's secrets into a string (URL or body).
    #[must_use]
    pub fn substitute_secrets(&self, input: &str) -> String {
        resolve_placeholders(input, &self.secrets)
    }

    /// Introspection record for `list_routes`: secret names only.
    #[must_use]
    pub fn summary(&self, index: usize) -> RouteSummary {
        let mut secret_names: Vec<String> = self.secrets.keys().cloned().collect();
        secret_names.sort();
        RouteSummary {
            index,
            name: self.name.clone(),
            description: self.description.clone(),
            docs_url: self.docs_url.clone(),
            openapi_url: self.openapi_url.clone(),
            allowed_endpoints: self.allowed_endpoints.clone(),
            secret_names,
            auto_headers: {
                let mut keys: Vec<String> = self.headers.keys().cloned().collect();
                keys.sort();
                keys
            },
        }
    }
}

/// What `list_routes` returns per route. Secret values never appear.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    /// Position in the session's route list.
    pub index: usize,
    /// Human-readable label.
    pub name: Option<String>,
    /// What the connector is for.
    pub description: Option<String>,
    /// API documentation link.
    pub docs_url: Option<String>,
    /// OpenAPI document link.
    #[serde(rename = "openApiUrl")]
    pub openapi_url: Option<String>,
    /// Glob patterns.
    pub allowed_endpoints: Vec<String>,
    /// Names of secrets this route holds.
    pub secret_names: Vec<String>,
    /// Names of auto-injected headers.
    pub auto_headers: Vec<String>,
}

/// Resolve a caller's connectors in declaration order: the config pool
/// first, then built-in templates. Unknown names are skipped with a warning.
pub fn resolve_routes_for_caller(
    caller: &CallerConfig,
    connectors: &std::collections::BTreeMap<String, RouteConfig>,
    templates: &std::collections::BTreeMap<String, RouteConfig>,
) -> Result<Vec<ResolvedRoute>, GatewayError> {
    let mut routes = Vec::with_capacity(caller.connections.len());
    for alias in &caller.connections {
        let Some(config) = connectors.get(alias).or_else(|| templates.get(alias)) else {
            warn!(connection = alias.as_str(), "unknown connection alias, skipping");
            continue;
        };
        routes.push(ResolvedRoute::resolve(alias, config, &caller.env)?);
    }
    Ok(routes)
}

/// Pick the route serving `url` and the URL to actually fetch.
///
/// First match on the URL as supplied; if none, retry each route with its
/// own secrets substituted into the URL (supports `${HOST}/api/x`
/// templates). First match wins, in session route order.
#[must_use]
pub fn select_route<'a>(
    routes: &'a [ResolvedRoute],
    url: &str,
) -> Option<(&'a ResolvedRoute, String)> {
    for route in routes {
        if route.is_endpoint_allowed(url) {
            return Some((route, url.to_string()));
        }
    }
    for route in routes {
        if route.allowed_endpoints.is_empty() {
            continue;
        }
        let substituted = route.substitute_secrets(url);
        if substituted != url && route.is_endpoint_allowed(&substituted) {
            return Some((route, substituted));
        }
    }
    None
}

/// Apply the header pipeline for one outbound request.
///
/// 1. Substitute the matched route's secrets into client header values.
/// 2. Reject any client header that collides (case-insensitively) with a
///    route-injected header.
/// 3. Merge route headers on top.
pub fn build_request_headers(
    client_headers: &HashMap<String, String>,
    route: &ResolvedRoute,
) -> Result<HashMap<String, String>, GatewayError> {
    let route_keys: HashMap<String, &String> = route
        .headers
        .keys()
        .map(|k| (k.to_ascii_lowercase(), k))
        .collect();

    let mut merged = HashMap::with_capacity(client_headers.len() + route.headers.len());
    for (key, value) in client_headers {
        if route_keys.contains_key(&key.to_ascii_lowercase()) {
            return Err(GatewayError::HeaderConflict(key.clone()));
        }
        merged.insert(key.clone(), route.substitute_secrets(value));
    }
    for (key, value) in &route.headers {
        merged.insert(key.clone(), value.clone());
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route_with(endpoints: &[&str], secrets: &[(&str, &str)], headers: &[(&str, &str)]) -> ResolvedRoute {
        let config = RouteConfig {
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            secrets: secrets
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            allowed_endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        };
        ResolvedRoute::resolve("test", &config, &HashMap::new()).unwrap()
    }

    #[test]
    fn test_placeholder_substitution() {
        let vars: HashMap<String, String> = [("A", "x"), ("B", "y")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(resolve_placeholders("${A}${B}", &vars), "xy");
        assert_eq!(resolve_placeholders("pre ${A} post", &vars), "pre x post");
        assert_eq!(resolve_placeholders("${UNKNOWN}", &vars), "${UNKNOWN}");
        assert_eq!(resolve_placeholders("no placeholders", &vars), "no placeholders");
    }

    #[test]
    fn test_empty_allowlist_matches_nothing() {
        let route = route_with(&[], &[], &[]);
        assert!(!route.is_endpoint_allowed("https://api.github.com/user"));
    }

    #[test]
    fn test_single_star_stays_in_segment() {
        let route = route_with(&["https://api.github.com/users/*"], &[], &[]);
        assert!(route.is_endpoint_allowed("https://api.github.com/users/octocat"));
        assert!(!route.is_endpoint_allowed("https://api.github.com/users/octocat/repos"));
    }

    #[test]
    fn test_double_star_crosses_segments() {
        let route = route_with(&["https://api.github.com/**"], &[], &[]);
        assert!(route.is_endpoint_allowed("https://api.github.com/users/octocat/repos"));
        assert!(!route.is_endpoint_allowed("https://evil.example.com/users"));
    }

    #[test]
    fn test_regex_metacharacters_escaped() {
        let route = route_with(&["https://api.example.com/v1/items?page=*"], &[], &[]);
        assert!(route.is_endpoint_allowed("https://api.example.com/v1/items?page=2"));
        // The '?' must be literal, not an optional quantifier.
        assert!(!route.is_endpoint_allowed("https://api.example.com/v1/itemspage=2"));

        let dotted = route_with(&["https://api.example.com/*"], &[], &[]);
        assert!(!dotted.is_endpoint_allowed("https://apiXexample.com/x"));
    }

    #[test]
    fn test_secret_resolution_whole_string_only() {
        std::env::set_var("WARDEN_ROUTE_TEST_TOKEN", "tok-123");
        let route = route_with(
            &[],
            &[("TOKEN", "${WARDEN_ROUTE_TEST_TOKEN}"), ("LITERAL", "as-is ${X}")],
            &[],
        );
        assert_eq!(route.secrets["TOKEN"], "tok-123");
        // Not a whole-string match: stays literal.
        assert_eq!(route.secrets["LITERAL"], "as-is ${X}");
    }

    #[test]
    fn test_header_resolved_from_secret() {
        let route = route_with(
            &[],
            &[("API_KEY", "k-42")],
            &[("Authorization", "Bearer ${API_KEY}")],
        );
        assert_eq!(route.headers["Authorization"], "Bearer k-42");
    }

    #[test]
    fn test_caller_env_wins_over_process_env() {
        std::env::set_var("WARDEN_ROUTE_PRECEDENCE", "process");
        let caller_env: HashMap<String, String> =
            [("WARDEN_ROUTE_PRECEDENCE".to_string(), "caller".to_string())].into();
        let config = RouteConfig {
            secrets: [("VAL".to_string(), "${WARDEN_ROUTE_PRECEDENCE}".to_string())].into(),
            ..Default::default()
        };
        let route = ResolvedRoute::resolve("test", &config, &caller_env).unwrap();
        assert_eq!(route.secrets["VAL"], "caller");
    }

    #[test]
    fn test_header_conflict_case_insensitive() {
        let route = route_with(&[], &[], &[("Authorization", "token abc")]);
        let client: HashMap<String, String> =
            [("authorization".to_string(), "token other".to_string())].into();
        assert!(matches!(
            build_request_headers(&client, &route),
            Err(GatewayError::HeaderConflict(_))
        ));
    }

    #[test]
    fn test_header_merge_route_on_top() {
        let route = route_with(&[], &[("K", "v")], &[("X-Auto", "yes")]);
        let client: HashMap<String, String> =
            [("X-Client".to_string(), "${K}".to_string())].into();
        let merged = build_request_headers(&client, &route).unwrap();
        assert_eq!(merged["X-Auto"], "yes");
        assert_eq!(merged["X-Client"], "v");
    }

    #[test]
    fn test_select_route_direct_match() {
        let routes = vec![
            route_with(&["https://api.stripe.com/**"], &[], &[]),
            route_with(&["https://api.github.com/**"], &[], &[]),
        ];
        let (route, url) = select_route(&routes, "https://api.github.com/user").unwrap();
        assert_eq!(route.allowed_endpoints[0], "https://api.github.com/**");
        assert_eq!(url, "https://api.github.com/user");
    }

    #[test]
    fn test_select_route_via_substitution() {
        let route = route_with(
            &["https://internal.example.com/api/**"],
            &[("HOST", "https://internal.example.com")],
            &[],
        );
        let (_, url) = select_route(std::slice::from_ref(&route), "${HOST}/api/items").unwrap();
        assert_eq!(url, "https://internal.example.com/api/items");
    }

    #[test]
    fn test_select_route_none() {
        let routes = vec![route_with(&["https://api.github.com/**"], &[], &[])];
        assert!(select_route(&routes, "https://api.gitlab.com/user").is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let route = route_with(&[], &[("TOKEN", "super-secret-value")], &[]);
        let rendered = format!("{route:?}");
        assert!(rendered.contains("TOKEN"));
        assert!(!rendered.contains("super-secret-value"));
    }
}

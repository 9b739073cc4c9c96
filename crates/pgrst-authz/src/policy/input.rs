//! Canonical decision input.
//!
//! [`translate`] maps a proxied PostgREST request onto a [`DecisionInput`].
//! The mapping is shared by every policy backend, so a policy only ever sees
//! the SQL-level intent of a request, never raw HTTP.
//!
//! | HTTP                                         | Method   |
//! |----------------------------------------------|----------|
//! | `GET`                                        | `SELECT` |
//! | `POST`                                       | `INSERT` |
//! | `POST` + `prefer: resolution=merge-duplicates` | `UPSERT` |
//! | `PATCH`                                      | `UPDATE` |
//! | `PUT`                                        | `UPSERT` |
//! | `DELETE`                                     | `DELETE` |
//! | anything else                                | `""`     |

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::token::Claims;

/// Path prefix PostgREST uses for stored procedure calls.
const RPC_PREFIX: &str = "rpc/";

/// Preference that turns a `POST` into an upsert.
const MERGE_DUPLICATES: &str = "resolution=merge-duplicates";

/// SQL operation a request maps to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SqlMethod {
    Select,
    Insert,
    Upsert,
    Update,
    Delete,
    /// Unrecognized HTTP method. Serialized as the empty string.
    #[default]
    #[serde(rename = "")]
    Unknown,
}

impl SqlMethod {
    /// Map an HTTP method and the request headers onto a SQL operation.
    ///
    /// `headers` must be keyed by lower-case header name.
    #[must_use]
    pub fn from_http(method: &str, headers: &HashMap<String, String>) -> Self {
        match method {
            "GET" => Self::Select,
            "POST" if prefers_merge_duplicates(headers) => Self::Upsert,
            "POST" => Self::Insert,
            "PATCH" => Self::Update,
            "PUT" => Self::Upsert,
            "DELETE" => Self::Delete,
            _ => Self::Unknown,
        }
    }

    /// Wire name of the operation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Select => "SELECT",
            Self::Insert => "INSERT",
            Self::Upsert => "UPSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Unknown => "",
        }
    }
}

fn prefers_merge_duplicates(headers: &HashMap<String, String>) -> bool {
    headers
        .get("prefer")
        .is_some_and(|prefer| prefer.split(',').any(|p| p.trim() == MERGE_DUPLICATES))
}

/// The object a request addresses: a table (or view) or a stored function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Table(String),
    Function(String),
}

impl Resource {
    /// Name of the addressed object.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Table(name) | Self::Function(name) => name,
        }
    }

    /// Table name, or `""` for a function call.
    #[must_use]
    pub fn table(&self) -> &str {
        match self {
            Self::Table(name) => name,
            Self::Function(_) => "",
        }
    }

    /// Function name, or `""` for a table request.
    #[must_use]
    pub fn function(&self) -> &str {
        match self {
            Self::Function(name) => name,
            Self::Table(_) => "",
        }
    }
}

impl Default for Resource {
    fn default() -> Self {
        Self::Table(String::new())
    }
}

/// Evaluator-agnostic description of an authorization query.
///
/// Serializes to the flat wire form consumed by Rego rules and scripts:
///
/// ```json
/// {"path":"orders?select=id","table":"orders","function":"","select":["id"],
///  "filters":{},"method":"SELECT","jwt":null}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireInput", from = "WireInput")]
pub struct DecisionInput {
    /// Request target with the leading `/` stripped, query string included.
    pub path: String,
    pub resource: Resource,
    /// Requested columns, cast suffixes removed.
    pub select: Vec<String>,
    /// Every other query parameter.
    pub filters: BTreeMap<String, String>,
    pub method: SqlMethod,
    /// Claims of a verified bearer token, if any.
    pub identity: Option<Claims>,
}

#[derive(Serialize, Deserialize)]
struct WireInput {
    #[serde(default)]
    path: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    function: String,
    #[serde(default)]
    select: Vec<String>,
    #[serde(default)]
    filters: BTreeMap<String, String>,
    #[serde(default)]
    method: SqlMethod,
    #[serde(default)]
    jwt: Option<Claims>,
}

impl From<DecisionInput> for WireInput {
    fn from(input: DecisionInput) -> Self {
        let (table, function) = match input.resource {
            Resource::Table(name) => (name, String::new()),
            Resource::Function(name) => (String::new(), name),
        };
        Self {
            path: input.path,
            table,
            function,
            select: input.select,
            filters: input.filters,
            method: input.method,
            jwt: input.identity,
        }
    }
}

impl From<WireInput> for DecisionInput {
    fn from(wire: WireInput) -> Self {
        // An empty function name is still a function call when the path
        // routes to `rpc/`, so the path decides before the field contents.
        let is_call = route_of(&wire.path).starts_with(RPC_PREFIX) || !wire.function.is_empty();
        let resource = if is_call {
            Resource::Function(wire.function)
        } else {
            Resource::Table(wire.table)
        };
        Self {
            path: wire.path,
            resource,
            select: wire.select,
            filters: wire.filters,
            method: wire.method,
            identity: wire.jwt,
        }
    }
}

impl DecisionInput {
    /// Serialize to the JSON wire form.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        // The wire form only contains strings, maps and JSON values
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Returns the `id` claim if the identity carries one as a string.
    #[must_use]
    pub fn principal_id(&self) -> Option<&str> {
        self.identity
            .as_ref()
            .and_then(|claims| claims.get("id"))
            .and_then(|id| id.as_str())
    }
}

/// Translate a proxied request into a [`DecisionInput`].
///
/// `path` is the request target as seen by the proxy (`/orders?select=id`),
/// `headers` must be keyed by lower-case header name. Never fails: malformed
/// input degrades to empty fields. The identity is left empty; it is filled
/// in by the caller from the verified bearer token.
#[must_use]
pub fn translate(method: &str, path: &str, headers: &HashMap<String, String>) -> DecisionInput {
    let raw = path.strip_prefix('/').unwrap_or(path);
    let target = raw.split_once('#').map_or(raw, |(before, _)| before);
    let query = target.split_once('?').map_or("", |(_, query)| query);
    let route = route_of(raw);

    let resource = match route.strip_prefix(RPC_PREFIX) {
        Some(rest) => Resource::Function(rest.split('/').next().unwrap_or_default().to_string()),
        None => Resource::Table(route),
    };

    let (select, filters) = parse_query(query);

    DecisionInput {
        path: raw.to_string(),
        resource,
        select,
        filters,
        method: SqlMethod::from_http(method, headers),
        identity: None,
    }
}

/// Percent-decoded route of a request target, without query or fragment.
fn route_of(target: &str) -> String {
    let target = target.strip_prefix('/').unwrap_or(target);
    let end = target.find(['?', '#']).unwrap_or(target.len());
    let route = &target[..end];
    urlencoding::decode(route)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| route.to_string())
}

/// Split a query string into the `select` column list and filters.
///
/// Only the first value of a repeated key is kept.
fn parse_query(query: &str) -> (Vec<String>, BTreeMap<String, String>) {
    let mut select = None;
    let mut filters = BTreeMap::new();

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "select" {
            if select.is_none() {
                select = Some(parse_select(&value));
            }
        } else {
            filters
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }

    (select.unwrap_or_default(), filters)
}

fn parse_select(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|column| column.split_once("::").map_or(column, |(name, _)| name))
        .map(str::to_string)
        .collect()
}

//! Named URL pattern router shared by the dispatcher and the URI builders
//!
//! Templates look like `/users/{identifier}/inbox`. Each registered route has
//! a unique name; [Router::route] resolves a request path to the first
//! matching route in registration order, and [Router::build] is its inverse,
//! substituting variables back into the template.

use crate::error::Error;
use std::collections::HashMap;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

#[derive(Clone, Debug)]
struct Route {
    name: String,
    segments: Vec<Segment>,
}

/// Result of matching a request path against the route table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    /// Name of the route that matched.
    pub name: String,
    /// Values captured for each `{variable}` in the template.
    pub values: HashMap<String, String>,
}

/// Pattern-to-name URL router. Paths are case-sensitive; routes match in
/// registration order.
#[derive(Clone, Debug, Default)]
pub struct Router {
    routes: Vec<Route>,
    trailing_slash_insensitive: bool,
}

impl Router {
    /// Create an empty router. With `trailing_slash_insensitive`, a request
    /// path may carry one trailing slash more or less than the template.
    pub fn new(trailing_slash_insensitive: bool) -> Self {
        Router {
            routes: Vec::new(),
            trailing_slash_insensitive,
        }
    }

    /// Change the trailing-slash behavior; applied by the federation builder
    /// once the configuration is known.
    pub(crate) fn set_trailing_slash_insensitive(&mut self, insensitive: bool) {
        self.trailing_slash_insensitive = insensitive;
    }

    /// Register `template` under `name`. Each name is unique; re-registering
    /// fails with [Error::DuplicateRegistration].
    pub fn add(&mut self, name: impl Into<String>, template: &str) -> Result<(), Error> {
        let name = name.into();
        if self.routes.iter().any(|r| r.name == name) {
            return Err(Error::DuplicateRegistration(name));
        }
        self.routes.push(Route {
            name,
            segments: parse_template(template)?,
        });
        Ok(())
    }

    /// Whether a route is registered under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.routes.iter().any(|r| r.name == name)
    }

    /// Resolve `path` to the first registered route that matches.
    pub fn route(&self, path: &str) -> Option<RouteMatch> {
        let path = if self.trailing_slash_insensitive {
            normalize_trailing_slash(path)
        } else {
            path
        };
        let segments: Vec<&str> = split_path(path);
        for route in &self.routes {
            if let Some(values) = match_segments(&route.segments, &segments) {
                return Some(RouteMatch {
                    name: route.name.clone(),
                    values,
                });
            }
        }
        None
    }

    /// Substitute `values` into the template registered under `name`,
    /// producing a path. Returns `None` for unknown names or missing values.
    pub fn build(&self, name: &str, values: &HashMap<String, String>) -> Option<String> {
        let route = self.routes.iter().find(|r| r.name == name)?;
        let mut path = String::new();
        for segment in &route.segments {
            path.push('/');
            match segment {
                Segment::Literal(literal) => path.push_str(literal),
                Segment::Variable(var) => path.push_str(values.get(var)?),
            }
        }
        if path.is_empty() {
            path.push('/');
        }
        Some(path)
    }
}

fn parse_template(template: &str) -> Result<Vec<Segment>, Error> {
    let template = template.strip_prefix('/').unwrap_or(template);
    let template = template.strip_suffix('/').unwrap_or(template);
    if template.is_empty() {
        return Ok(Vec::new());
    }
    template
        .split('/')
        .map(|part| {
            if let Some(var) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                if var.is_empty() {
                    return Err(Error::UrlVerification("empty route variable"));
                }
                Ok(Segment::Variable(var.to_string()))
            } else if part.contains('{') || part.contains('}') {
                Err(Error::UrlVerification("unbalanced braces in route template"))
            } else {
                Ok(Segment::Literal(part.to_string()))
            }
        })
        .collect()
}

fn normalize_trailing_slash(path: &str) -> &str {
    if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    }
}

fn split_path(path: &str) -> Vec<&str> {
    let path = path.strip_prefix('/').unwrap_or(path);
    if path.is_empty() {
        Vec::new()
    } else {
        path.split('/').collect()
    }
}

fn match_segments(
    pattern: &[Segment],
    segments: &[&str],
) -> Option<HashMap<String, String>> {
    if pattern.len() != segments.len() {
        return None;
    }
    let mut values = HashMap::new();
    for (expected, actual) in pattern.iter().zip(segments) {
        match expected {
            Segment::Literal(literal) => {
                if literal != actual {
                    return None;
                }
            }
            Segment::Variable(var) => {
                values.insert(var.clone(), (*actual).to_string());
            }
        }
    }
    Some(values)
}

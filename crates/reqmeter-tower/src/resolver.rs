//! Path template resolvers for services without a router of their own.

use http::Request;
use reqmeter_core::{PathTemplate, RequestAdapter};

/// Matches request paths against a list of route templates.
///
/// Templates use `{name}` for a single path segment and `{*name}` as the
/// last segment for the remainder of the path. The first matching
/// template wins, so register specific routes before generic ones.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

#[derive(Debug, Clone)]
struct Route {
    template: String,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param,
    CatchAll,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, template: impl Into<String>) -> Self {
        let template = template.into();
        let segments = split(&template)
            .map(|s| {
                if s.starts_with("{*") && s.ends_with('}') {
                    Segment::CatchAll
                } else if s.starts_with('{') && s.ends_with('}') {
                    Segment::Param
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();
        self.routes.push(Route { template, segments });
        self
    }

    /// The template that `path` matches, if any.
    pub fn find(&self, path: &str) -> Option<&str> {
        let parts: Vec<&str> = split(path).collect();
        self.routes
            .iter()
            .find(|route| route.matches(&parts))
            .map(|route| route.template.as_str())
    }
}

impl<S: Into<String>> FromIterator<S> for RouteTable {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), |table, template| table.route(template))
    }
}

impl Route {
    fn matches(&self, parts: &[&str]) -> bool {
        let mut parts = parts.iter();
        for segment in &self.segments {
            match segment {
                Segment::CatchAll => return parts.next().is_some(),
                Segment::Param => match parts.next() {
                    Some(part) if !part.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => match parts.next() {
                    Some(part) if *part == lit.as_str() => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

fn split(path: &str) -> impl Iterator<Item = &str> {
    path.trim_start_matches('/').split('/').filter(|s| !s.is_empty())
}

impl<B> RequestAdapter<B> for RouteTable {
    fn resolve_path_template(&self, request: &Request<B>) -> PathTemplate {
        let path = request.uri().path();
        match self.find(path) {
            Some(template) => PathTemplate::handled(template),
            None => PathTemplate::unhandled(path),
        }
    }
}

/// Reads a [`PathTemplate`] that an upstream router stored in the request
/// extensions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtensionResolver;

impl<B> RequestAdapter<B> for ExtensionResolver {
    fn resolve_path_template(&self, request: &Request<B>) -> PathTemplate {
        match request.extensions().get::<PathTemplate>() {
            Some(template) => template.clone(),
            None => PathTemplate::unhandled(request.uri().path()),
        }
    }
}

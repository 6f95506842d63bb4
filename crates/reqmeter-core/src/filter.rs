//! Route inclusion/exclusion filtering by path template.

use std::collections::HashSet;

/// Include/exclude sets of path templates.
///
/// A non-empty include set takes precedence and disables the exclude set
/// entirely. An empty set behaves as if it were not configured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteFilter {
    include: Option<HashSet<String>>,
    exclude: Option<HashSet<String>>,
}

impl RouteFilter {
    /// A filter that lets every handled route through.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from optional lists (as found in config files).
    pub fn from_lists(include: Option<Vec<String>>, exclude: Option<Vec<String>>) -> Self {
        Self {
            include: include.map(|v| v.into_iter().collect()),
            exclude: exclude.map(|v| v.into_iter().collect()),
        }
    }

    /// Observe only these path templates.
    pub fn include<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include = Some(routes.into_iter().map(Into::into).collect());
        self
    }

    /// Never observe these path templates (ignored if an include set is set).
    pub fn exclude<I, S>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = Some(routes.into_iter().map(Into::into).collect());
        self
    }

    pub fn is_excluded(&self, path_template: &str) -> bool {
        if let Some(include) = self.include.as_ref().filter(|s| !s.is_empty()) {
            return !include.contains(path_template);
        }
        if let Some(exclude) = self.exclude.as_ref().filter(|s| !s.is_empty()) {
            return exclude.contains(path_template);
        }
        false
    }
}

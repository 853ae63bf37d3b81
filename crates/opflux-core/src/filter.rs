//! The predicate chain deciding which operations enter the pipeline.
//!
//! Modeled as an ordered list of predicates combined by short-circuit AND.
//! The standard chain admits only inserts and updates, excludes the
//! pipeline's own reserved database, GridFS chunk collections, and system
//! collections; optional namespace include/exclude regexes narrow further.

use regex::Regex;

use crate::event::ChangeEvent;

/// A single event predicate.
pub type Predicate = Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// An ordered AND-chain of event predicates.
pub struct FilterChain {
    predicates: Vec<Predicate>,
}

impl FilterChain {
    /// The standard chain, in evaluation order: insert/update only, not the
    /// reserved database, not `*.chunks`, not `system.*` collections.
    #[must_use]
    pub fn standard(reserved_database: &str) -> Self {
        let reserved = reserved_database.to_string();
        // Collection names never anchor at the start ("system.profile" and
        // "admin.system.profile" both count as system collections).
        let system = Regex::new(r"system\..+$").expect("static pattern");
        let predicates: Vec<Predicate> = vec![
            Box::new(|event| event.op.is_insert_or_update()),
            Box::new(move |event| event.ns.database != reserved),
            Box::new(|event| !event.ns.collection.ends_with(".chunks")),
            Box::new(move |event| !system.is_match(&event.ns.collection)),
        ];
        Self { predicates }
    }

    /// Appends a predicate admitting only namespaces matching `include`.
    #[must_use]
    pub fn include_namespaces(mut self, include: Regex) -> Self {
        self.predicates
            .push(Box::new(move |event| include.is_match(&event.ns.qualified())));
        self
    }

    /// Appends a predicate rejecting namespaces matching `exclude`.
    #[must_use]
    pub fn exclude_namespaces(mut self, exclude: Regex) -> Self {
        self.predicates
            .push(Box::new(move |event| !exclude.is_match(&event.ns.qualified())));
        self
    }

    /// True when every predicate accepts the event, in order,
    /// short-circuiting on the first rejection.
    #[must_use]
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        self.predicates.iter().all(|p| p(event))
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("predicates", &self.predicates.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Namespace, OpKind, ReplTimestamp};
    use crate::RESERVED_DATABASE;

    fn event(db: &str, coll: &str, op: OpKind) -> ChangeEvent {
        ChangeEvent::new(Namespace::new(db, coll), op, ReplTimestamp::new(1, 1))
    }

    #[test]
    fn admits_only_inserts_and_updates() {
        let chain = FilterChain::standard(RESERVED_DATABASE);
        assert!(chain.accepts(&event("weather", "city", OpKind::Insert)));
        assert!(chain.accepts(&event("weather", "city", OpKind::Update)));
        assert!(!chain.accepts(&event("weather", "city", OpKind::Delete)));
        assert!(!chain.accepts(&event("weather", "city", OpKind::Command)));
        assert!(!chain.accepts(&event("weather", "city", OpKind::Unknown)));
    }

    #[test]
    fn excludes_the_reserved_database() {
        let chain = FilterChain::standard(RESERVED_DATABASE);
        assert!(!chain.accepts(&event(RESERVED_DATABASE, "resume", OpKind::Insert)));
    }

    #[test]
    fn excludes_chunk_and_system_collections() {
        let chain = FilterChain::standard(RESERVED_DATABASE);
        assert!(!chain.accepts(&event("files", "fs.chunks", OpKind::Insert)));
        assert!(chain.accepts(&event("files", "fs.files", OpKind::Insert)));
        assert!(!chain.accepts(&event("admin", "system.users", OpKind::Insert)));
        assert!(!chain.accepts(&event("app", "my.system.profile", OpKind::Insert)));
        assert!(chain.accepts(&event("app", "systemic", OpKind::Insert)));
    }

    #[test]
    fn include_regex_narrows_namespaces() {
        let chain = FilterChain::standard(RESERVED_DATABASE)
            .include_namespaces(Regex::new(r"^weather\.").unwrap());
        assert!(chain.accepts(&event("weather", "city", OpKind::Insert)));
        assert!(!chain.accepts(&event("metrics", "cpu", OpKind::Insert)));
    }

    #[test]
    fn exclude_regex_rejects_namespaces() {
        let chain = FilterChain::standard(RESERVED_DATABASE)
            .exclude_namespaces(Regex::new(r"\.scratch$").unwrap());
        assert!(chain.accepts(&event("weather", "city", OpKind::Insert)));
        assert!(!chain.accepts(&event("weather", "scratch", OpKind::Insert)));
    }

    #[test]
    fn include_and_exclude_compose() {
        let chain = FilterChain::standard(RESERVED_DATABASE)
            .include_namespaces(Regex::new(r"^weather\.").unwrap())
            .exclude_namespaces(Regex::new(r"\.archive$").unwrap());
        assert!(chain.accepts(&event("weather", "city", OpKind::Insert)));
        assert!(!chain.accepts(&event("weather", "archive", OpKind::Insert)));
        assert!(!chain.accepts(&event("metrics", "cpu", OpKind::Insert)));
    }
}

//! Name to id resolution.

use crate::error::{Result, TimelineError};
use crate::types::{CategoryId, HostId, SampleKindId};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

/// Get-or-create lookup of numeric ids for host, category and metric-kind names.
///
/// Every method is idempotent: the same name always resolves to the same id.
pub trait IdResolver: std::fmt::Debug + Send + Sync + 'static {
    fn resolve_host(&self, name: &str) -> Result<HostId>;

    fn resolve_category(&self, name: &str) -> Result<CategoryId>;

    /// Kind ids are scoped to one host/category.
    fn resolve_sample_kind(
        &self,
        host_id: HostId,
        category_id: CategoryId,
        name: &str,
    ) -> Result<SampleKindId>;
}

/// Process-local [`IdResolver`]. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct InMemoryIdResolver {
    hosts: DashMap<String, HostId>,
    categories: DashMap<String, CategoryId>,
    kinds: DashMap<(HostId, CategoryId, String), SampleKindId>,
    next_host: AtomicU32,
    next_category: AtomicU32,
    next_kind: AtomicU32,
}

impl Default for InMemoryIdResolver {
    fn default() -> Self {
        InMemoryIdResolver {
            hosts: DashMap::new(),
            categories: DashMap::new(),
            kinds: DashMap::new(),
            next_host: AtomicU32::new(1),
            next_category: AtomicU32::new(1),
            next_kind: AtomicU32::new(1),
        }
    }
}

impl InMemoryIdResolver {
    pub fn new() -> Self {
        Self::default()
    }
}

fn check_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(TimelineError::Resolution(format!("empty {} name", what)));
    }
    Ok(())
}

impl IdResolver for InMemoryIdResolver {
    fn resolve_host(&self, name: &str) -> Result<HostId> {
        check_name("host", name)?;
        if let Some(id) = self.hosts.get(name) {
            return Ok(*id);
        }
        Ok(*self
            .hosts
            .entry(name.to_string())
            .or_insert_with(|| self.next_host.fetch_add(1, Ordering::Relaxed)))
    }

    fn resolve_category(&self, name: &str) -> Result<CategoryId> {
        check_name("category", name)?;
        if let Some(id) = self.categories.get(name) {
            return Ok(*id);
        }
        Ok(*self
            .categories
            .entry(name.to_string())
            .or_insert_with(|| self.next_category.fetch_add(1, Ordering::Relaxed)))
    }

    fn resolve_sample_kind(
        &self,
        host_id: HostId,
        category_id: CategoryId,
        name: &str,
    ) -> Result<SampleKindId> {
        check_name("sample kind", name)?;
        Ok(*self
            .kinds
            .entry((host_id, category_id, name.to_string()))
            .or_insert_with(|| self.next_kind.fetch_add(1, Ordering::Relaxed)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_resolution_is_idempotent() {
        let r = InMemoryIdResolver::new();
        let a = r.resolve_host("web-1").unwrap();
        let b = r.resolve_host("web-2").unwrap();
        assert_ne!(a, b);
        assert_eq!(r.resolve_host("web-1").unwrap(), a);

        let cpu = r.resolve_category("cpu").unwrap();
        let user = r.resolve_sample_kind(a, cpu, "user").unwrap();
        assert_eq!(r.resolve_sample_kind(a, cpu, "user").unwrap(), user);
        assert_ne!(r.resolve_sample_kind(b, cpu, "user").unwrap(), user);
    }

    #[test]
    fn test_empty_names_fail() {
        let r = InMemoryIdResolver::new();
        assert!(matches!(r.resolve_host(""), Err(TimelineError::Resolution(_))));
        assert!(r.resolve_sample_kind(1, 1, "").is_err());
    }

    #[test]
    fn test_concurrent_resolution_agrees() {
        let r = Arc::new(InMemoryIdResolver::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|i| r.resolve_host(&format!("host-{}", i)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<HostId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}

//! Registry of indexed interfaces, their indexes, and which actor kinds
//! implement them.

use crate::error::{IndexingError, Result};
use crate::partition::{IndexMetaData, IndexPartition};
use crate::types::{ActorProperties, IndexValue};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

/// Extracts an index key from an actor's properties.
pub type FieldGetter = Arc<dyn Fn(&ActorProperties) -> Option<IndexValue> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTolerancePolicy {
    NonFaultTolerant,
    /// Pending workflows are tracked on the actor and queue state is
    /// persisted, so updates survive host failures.
    FaultTolerant,
}

impl FaultTolerancePolicy {
    pub fn is_fault_tolerant(self) -> bool {
        self == FaultTolerancePolicy::FaultTolerant
    }
}

#[derive(Clone)]
pub struct IndexDescriptor {
    pub name: String,
    pub meta: IndexMetaData,
    pub partition: Arc<dyn IndexPartition>,
    pub getter: FieldGetter,
}

impl IndexDescriptor {
    pub fn new(
        name: impl Into<String>,
        meta: IndexMetaData,
        partition: Arc<dyn IndexPartition>,
        getter: FieldGetter,
    ) -> Self {
        IndexDescriptor {
            name: name.into(),
            meta,
            partition,
            getter,
        }
    }

    /// Index keyed on one named property.
    pub fn for_field(
        name: impl Into<String>,
        field: &str,
        meta: IndexMetaData,
        partition: Arc<dyn IndexPartition>,
    ) -> Self {
        let field = field.to_string();
        Self::new(
            name,
            meta,
            partition,
            Arc::new(move |props: &ActorProperties| props.get(&field).cloned()),
        )
    }

    pub fn key_of(&self, props: &ActorProperties) -> Option<IndexValue> {
        (self.getter)(props)
    }
}

impl fmt::Debug for IndexDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexDescriptor")
            .field("name", &self.name)
            .field("meta", &self.meta)
            .finish()
    }
}

/// An interface exposing indexed properties; each one gets its own set of
/// workflow queues.
#[derive(Debug, Clone)]
pub struct IndexedInterface {
    pub name: String,
    pub fault_tolerance: FaultTolerancePolicy,
    pub indexes: Vec<IndexDescriptor>,
}

impl IndexedInterface {
    pub fn new(name: impl Into<String>, fault_tolerance: FaultTolerancePolicy) -> Self {
        IndexedInterface {
            name: name.into(),
            fault_tolerance,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, index: IndexDescriptor) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn index(&self, name: &str) -> Option<&IndexDescriptor> {
        self.indexes.iter().find(|i| i.name == name)
    }

    pub fn has_total_index(&self) -> bool {
        self.indexes.iter().any(|i| i.meta.is_total())
    }

    pub fn has_active_index(&self) -> bool {
        self.indexes.iter().any(|i| !i.meta.is_total())
    }

    /// `None` for an interface without indexes.
    pub fn is_eager(&self) -> Option<bool> {
        self.indexes.first().map(|i| i.meta.is_eager)
    }

    /// Queue state is persisted only when losing it could lose a total
    /// index update.
    pub fn persists_queues(&self) -> bool {
        self.fault_tolerance.is_fault_tolerant() && self.has_total_index()
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for index in &self.indexes {
            if !seen.insert(index.name.as_str()) {
                return Err(IndexingError::Configuration(format!(
                    "index {} declared twice on {}",
                    index.name, self.name
                )));
            }
            index.meta.validate(&index.name)?;
        }
        if let Some(eager) = self.is_eager() {
            if self.indexes.iter().any(|i| i.meta.is_eager != eager) {
                return Err(IndexingError::Configuration(format!(
                    "interface {} mixes eager and lazy indexes",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct IndexRegistry {
    interfaces: DashMap<String, Arc<IndexedInterface>>,
    bindings: DashMap<String, Vec<Arc<IndexedInterface>>>,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_interface(&self, interface: IndexedInterface) -> Result<Arc<IndexedInterface>> {
        interface.validate()?;
        if self.interfaces.contains_key(&interface.name) {
            return Err(IndexingError::Configuration(format!(
                "interface {} already registered",
                interface.name
            )));
        }
        let interface = Arc::new(interface);
        tracing::info!(
            "Registered indexed interface {} with {} index(es)",
            interface.name,
            interface.indexes.len()
        );
        self.interfaces
            .insert(interface.name.clone(), Arc::clone(&interface));
        Ok(interface)
    }

    /// Declares that actors of `kind` implement `interfaces`. All indexes of
    /// one actor kind share eagerness and fault tolerance.
    pub fn bind(&self, kind: &str, interfaces: &[&str]) -> Result<()> {
        let mut bound = Vec::new();
        for name in interfaces {
            bound.push(self.interface(name)?);
        }
        let eager: Vec<bool> = bound.iter().filter_map(|i| i.is_eager()).collect();
        if eager.windows(2).any(|w| w[0] != w[1]) {
            return Err(IndexingError::Configuration(format!(
                "actor kind {} mixes eager and lazy indexes",
                kind
            )));
        }
        if bound
            .windows(2)
            .any(|w| w[0].fault_tolerance != w[1].fault_tolerance)
        {
            return Err(IndexingError::Configuration(format!(
                "actor kind {} mixes fault-tolerance policies",
                kind
            )));
        }
        self.bindings.insert(kind.to_string(), bound);
        Ok(())
    }

    pub fn interface(&self, name: &str) -> Result<Arc<IndexedInterface>> {
        self.interfaces
            .get(name)
            .map(|i| Arc::clone(i.value()))
            .ok_or_else(|| IndexingError::IndexNotFound(format!("interface {}", name)))
    }

    pub fn interfaces_of(&self, kind: &str) -> Result<Vec<Arc<IndexedInterface>>> {
        self.bindings
            .get(kind)
            .map(|b| b.value().clone())
            .ok_or_else(|| {
                IndexingError::Configuration(format!("actor kind {} has no indexed interfaces", kind))
            })
    }

    pub fn index(&self, interface: &str, index: &str) -> Result<IndexDescriptor> {
        self.interface(interface)?
            .index(index)
            .cloned()
            .ok_or_else(|| IndexingError::IndexNotFound(format!("{}.{}", interface, index)))
    }

    pub fn all_interfaces(&self) -> Vec<Arc<IndexedInterface>> {
        let mut all: Vec<_> = self.interfaces.iter().map(|i| Arc::clone(i.value())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn dispose_all(&self) -> Result<()> {
        for interface in self.all_interfaces() {
            for index in &interface.indexes {
                index.partition.dispose().await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::{HashIndexBucket, IndexLayout};

    fn bucket(name: &str) -> Arc<dyn IndexPartition> {
        Arc::new(HashIndexBucket::new(name, None))
    }

    fn location(meta: IndexMetaData) -> IndexDescriptor {
        IndexDescriptor::for_field("location", "location", meta, bucket("location"))
    }

    #[test]
    fn test_getter_reads_field() {
        let idx = location(IndexMetaData::total(IndexLayout::SingleBucket));
        let props = ActorProperties::new().with("location", "Seattle");
        assert_eq!(idx.key_of(&props), Some(IndexValue::text("Seattle")));
        assert_eq!(idx.key_of(&ActorProperties::new()), None);
    }

    #[test]
    fn test_mixed_eagerness_rejected() {
        let iface = IndexedInterface::new("IPlayer", FaultTolerancePolicy::NonFaultTolerant)
            .with_index(location(IndexMetaData::active(IndexLayout::SingleBucket).eager()))
            .with_index(IndexDescriptor::for_field(
                "score",
                "score",
                IndexMetaData::active(IndexLayout::SingleBucket),
                bucket("score"),
            ));
        let registry = IndexRegistry::new();
        assert!(matches!(
            registry.register_interface(iface),
            Err(IndexingError::Configuration(_))
        ));
    }

    #[test]
    fn test_bind_and_lookup() {
        let registry = IndexRegistry::new();
        registry
            .register_interface(
                IndexedInterface::new("IPlayer", FaultTolerancePolicy::FaultTolerant)
                    .with_index(location(IndexMetaData::total(IndexLayout::SingleBucket))),
            )
            .unwrap();
        registry.bind("Player", &["IPlayer"]).unwrap();

        let bound = registry.interfaces_of("Player").unwrap();
        assert_eq!(bound.len(), 1);
        assert!(bound[0].persists_queues());
        assert!(registry.index("IPlayer", "location").is_ok());
        assert!(matches!(
            registry.index("IPlayer", "email"),
            Err(IndexingError::IndexNotFound(_))
        ));
        assert!(registry.bind("Player", &["IMissing"]).is_err());
    }

    #[test]
    fn test_duplicate_interface_rejected() {
        let registry = IndexRegistry::new();
        let iface = IndexedInterface::new("IPlayer", FaultTolerancePolicy::NonFaultTolerant);
        registry.register_interface(iface.clone()).unwrap();
        assert!(registry.register_interface(iface).is_err());
    }
}

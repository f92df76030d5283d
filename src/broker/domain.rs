//! DomainRegistry: creation/deletion of domains, schema storage, queue
//! membership. A queue belongs to exactly one domain.

use std::collections::HashMap;
use std::sync::Arc;
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::broker::schema::Schema;
use crate::broker::types::QueueConfig;
use crate::error::BrokerError;

pub struct Domain {
    pub name: String,
    pub schema: Option<Schema>,
    queues: RwLock<HashMap<String, QueueConfig>>,
}

impl Domain {
    fn new(name: &str, schema: Option<Schema>) -> Self {
        Self {
            name: name.to_string(),
            schema,
            queues: RwLock::new(HashMap::new()),
        }
    }

    pub fn queue_config(&self, queue: &str) -> Option<QueueConfig> {
        self.queues.read().get(queue).cloned()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.queues.read().contains_key(queue)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

}

pub struct DomainRegistry {
    domains: DashMap<String, Arc<Domain>>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self { domains: DashMap::new() }
    }

    pub fn create_domain(&self, name: &str, schema: Option<Schema>) -> Result<Arc<Domain>, BrokerError> {
        match self.domains.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(BrokerError::DomainAlreadyExists(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let domain = Arc::new(Domain::new(name, schema));
                slot.insert(domain.clone());
                Ok(domain)
            }
        }
    }

    pub fn get(&self, name: &str) -> Result<Arc<Domain>, BrokerError> {
        self.domains
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| BrokerError::DomainNotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<Arc<Domain>> {
        let mut domains: Vec<Arc<Domain>> = self.domains.iter().map(|e| e.value().clone()).collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        domains
    }

    /// The caller must have stopped the domain's queues first.
    pub fn remove_domain(&self, name: &str) -> Result<Arc<Domain>, BrokerError> {
        self.domains
            .remove(name)
            .map(|(_, domain)| domain)
            .ok_or_else(|| BrokerError::DomainNotFound(name.to_string()))
    }

    pub fn create_queue(
        &self,
        domain: &str,
        queue: &str,
        mut config: QueueConfig,
    ) -> Result<(), BrokerError> {
        let domain = self.get(domain)?;
        let mut queues = domain.queues.write();
        if queues.contains_key(queue) {
            return Err(BrokerError::QueueAlreadyExists(domain.name.clone(), queue.to_string()));
        }
        config.merge_defaults();
        queues.insert(queue.to_string(), config);
        Ok(())
    }

    pub fn remove_queue(&self, domain: &str, queue: &str) -> Result<QueueConfig, BrokerError> {
        let domain = self.get(domain)?;
        let mut queues = domain.queues.write();
        queues
            .remove(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(domain.name.clone(), queue.to_string()))
    }

    pub fn queue_config(&self, domain: &str, queue: &str) -> Result<QueueConfig, BrokerError> {
        let domain = self.get(domain)?;
        domain
            .queue_config(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(domain.name.clone(), queue.to_string()))
    }
}

impl Default for DomainRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ==========================================
// TESTS
// ==========================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_create_conflict() {
        let registry = DomainRegistry::new();
        registry.create_domain("d", None).unwrap();
        assert!(matches!(
            registry.create_domain("d", None),
            Err(BrokerError::DomainAlreadyExists(_))
        ));
    }

    #[test]
    fn test_queue_lifecycle() {
        let registry = DomainRegistry::new();
        registry.create_domain("d", None).unwrap();
        registry.create_queue("d", "q", QueueConfig::default()).unwrap();

        assert!(matches!(
            registry.create_queue("d", "q", QueueConfig::default()),
            Err(BrokerError::QueueAlreadyExists(_, _))
        ));
        assert!(registry.queue_config("d", "q").is_ok());

        registry.remove_queue("d", "q").unwrap();
        assert!(matches!(
            registry.queue_config("d", "q"),
            Err(BrokerError::QueueNotFound(_, _))
        ));
    }

    #[test]
    fn test_queue_in_missing_domain() {
        let registry = DomainRegistry::new();
        assert!(matches!(
            registry.create_queue("nope", "q", QueueConfig::default()),
            Err(BrokerError::DomainNotFound(_))
        ));
    }
}

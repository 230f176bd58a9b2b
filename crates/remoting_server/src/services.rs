//! Well-known service objects.

use std::collections::BTreeMap;

/// Service ids and the type of the object that represents each.
///
/// The server creates one persistent object per registered service when it
/// starts; `oidForService` returns its identity.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: BTreeMap<String, String>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service_id` backed by an object of `type_name`.
    pub fn register(&mut self, service_id: impl Into<String>, type_name: impl Into<String>) {
        self.services.insert(service_id.into(), type_name.into());
    }

    /// Returns the type backing `service_id`.
    pub fn type_of(&self, service_id: &str) -> Option<&str> {
        self.services.get(service_id).map(String::as_str)
    }

    /// Iterates over `(service_id, type_name)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.services
            .iter()
            .map(|(id, type_name)| (id.as_str(), type_name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup() {
        let mut services = ServiceRegistry::new();
        services.register("customers", "CustomerRepository");
        services.register("orders", "OrderRepository");

        assert_eq!(services.type_of("orders"), Some("OrderRepository"));
        assert!(services.type_of("mail").is_none());
        assert_eq!(services.iter().count(), 2);
    }
}

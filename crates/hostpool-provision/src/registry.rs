use std::collections::BTreeMap;
use std::sync::Arc;

use hostpool_domain::Query;
use hostpool_query::sanitize;
use tracing::debug;

use crate::provisioner::Provisioner;

/// The set of registered provisioners, in registration order. Selection
/// picks the cheapest available one; ties keep the earlier registration.
#[derive(Clone, Default)]
pub struct ProvisionerRegistry {
    provisioners: Vec<Arc<dyn Provisioner>>,
}

impl ProvisionerRegistry {
    pub fn new() -> ProvisionerRegistry {
        ProvisionerRegistry::default()
    }

    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) -> &mut Self {
        self.provisioners.push(provisioner);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provisioner>> {
        self.provisioners.iter().find(|p| p.name() == name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Provisioner>> {
        self.provisioners.iter()
    }

    /// Name → display map served by `/provisioners`.
    pub fn display(&self) -> BTreeMap<String, String> {
        self.provisioners
            .iter()
            .map(|p| (p.name().to_string(), p.name().to_string()))
            .collect()
    }

    /// Choose the cheapest provisioner able to serve the query.
    ///
    /// The query is sanitised against each candidate's own parameter set; a
    /// validation failure just makes that candidate unavailable.
    pub fn find_available(&self, query: &Query) -> Option<Arc<dyn Provisioner>> {
        let mut best: Option<(f64, Arc<dyn Provisioner>)> = None;
        for provisioner in &self.provisioners {
            let mut candidate_query = query.clone();
            if sanitize(&mut candidate_query, &provisioner.parameters()).is_err() {
                debug!(provisioner = provisioner.name(), "query failed validation");
                continue;
            }
            if !provisioner.available(&candidate_query) {
                continue;
            }
            let cost = provisioner.cost(&candidate_query);
            if !cost.is_finite() {
                continue;
            }
            match &best {
                Some((best_cost, _)) if cost >= *best_cost => {}
                _ => best = Some((cost, provisioner.clone())),
            }
        }
        best.map(|(cost, provisioner)| {
            debug!(
                provisioner = provisioner.name(),
                cost, "selected provisioner"
            );
            provisioner
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProvisionError;
    use async_trait::async_trait;
    use hostpool_query::ParameterMap;
    use hostpool_store::MachineHandle;
    use tokio_util::sync::CancellationToken;

    struct Fixed {
        name: &'static str,
        cost: f64,
        available: bool,
    }

    #[async_trait]
    impl Provisioner for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }
        fn parameters(&self) -> ParameterMap {
            ParameterMap::new()
        }
        fn available(&self, _query: &Query) -> bool {
            self.available
        }
        fn cost(&self, _query: &Query) -> f64 {
            self.cost
        }
        async fn provision(
            &self,
            _machines: &mut [MachineHandle],
            _query: &Query,
            _cancel: &CancellationToken,
        ) -> Result<(), ProvisionError> {
            Ok(())
        }
        async fn teardown(
            &self,
            _machines: &mut [MachineHandle],
            _query: &Query,
        ) -> Result<(), ProvisionError> {
            Ok(())
        }
        async fn is_teardown(
            &self,
            _machines: &[MachineHandle],
            _query: &Query,
        ) -> Result<bool, ProvisionError> {
            Ok(true)
        }
    }

    fn registry(entries: Vec<Fixed>) -> ProvisionerRegistry {
        let mut registry = ProvisionerRegistry::new();
        for entry in entries {
            registry.register(Arc::new(entry));
        }
        registry
    }

    #[test]
    fn cheapest_available_wins() {
        let registry = registry(vec![
            Fixed { name: "slow", cost: 3600.0, available: true },
            Fixed { name: "fast", cost: 10.0, available: true },
        ]);
        let selected = registry.find_available(&Query::new()).unwrap();
        assert_eq!(selected.name(), "fast");
    }

    #[test]
    fn unavailable_is_skipped() {
        let registry = registry(vec![
            Fixed { name: "down", cost: 1.0, available: false },
            Fixed { name: "up", cost: 100.0, available: true },
        ]);
        assert_eq!(registry.find_available(&Query::new()).unwrap().name(), "up");
    }

    #[test]
    fn infinite_cost_means_unavailable() {
        let registry = registry(vec![Fixed {
            name: "infinite",
            cost: f64::INFINITY,
            available: true,
        }]);
        assert!(registry.find_available(&Query::new()).is_none());
    }

    #[test]
    fn ties_break_by_registration_order() {
        let registry = registry(vec![
            Fixed { name: "first", cost: 5.0, available: true },
            Fixed { name: "second", cost: 5.0, available: true },
        ]);
        assert_eq!(
            registry.find_available(&Query::new()).unwrap().name(),
            "first"
        );
    }

    #[test]
    fn empty_registry_finds_nothing() {
        assert!(ProvisionerRegistry::new()
            .find_available(&Query::new())
            .is_none());
    }
}

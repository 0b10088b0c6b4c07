use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use super::plan::{Module, Plan, PlanCatalog, PlanModuleComposition, SubModule};
use crate::clock::SharedClock;
use crate::ids::{PlanId, TenantId};

/// Answers "is feature X on for tenant T" from a two-level cache:
/// tenant → subscribed plan, then plan → active feature codes.
pub struct FeatureGate {
    catalog: PlanCatalog,
    tenant_plans: RwLock<HashMap<TenantId, Option<PlanId>>>,
    plan_features: RwLock<HashMap<PlanId, Arc<BTreeSet<String>>>>,
    misses: AtomicUsize,
    clock: SharedClock,
}

impl FeatureGate {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            catalog: PlanCatalog::default(),
            tenant_plans: RwLock::new(HashMap::new()),
            plan_features: RwLock::new(HashMap::new()),
            misses: AtomicUsize::new(0),
            clock,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub fn feature_active(&self, tenant_id: TenantId, code: &str) -> bool {
        let Some(plan_id) = self.plan_for(tenant_id) else {
            return false;
        };
        self.features_for(plan_id).contains(code)
    }

    /// Module global flags affect every plan.
    pub fn upsert_module(&self, module: Module) {
        self.catalog.upsert_module(module);
        self.plan_features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn upsert_submodule(&self, submodule: SubModule) {
        self.catalog.upsert_submodule(submodule);
    }

    pub fn add_plan(&self, name: &str) -> Plan {
        self.catalog.add_plan(name)
    }

    pub fn set_composition(&self, composition: PlanModuleComposition) {
        let plan_id = composition.plan_id;
        self.catalog.set_composition(composition);
        self.plan_features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&plan_id);
        tracing::debug!(%plan_id, "plan composition changed, feature cache invalidated");
    }

    pub fn subscribe(&self, tenant_id: TenantId, plan_id: PlanId) {
        self.catalog.subscribe(tenant_id, plan_id, self.clock.now());
        self.tenant_plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tenant_id);
    }

    /// Cache misses so far; used to observe cache behaviour.
    pub fn cache_misses(&self) -> usize {
        self.misses.load(Ordering::Acquire)
    }

    fn plan_for(&self, tenant_id: TenantId) -> Option<PlanId> {
        if let Some(cached) = self
            .tenant_plans
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
        {
            return *cached;
        }
        self.misses.fetch_add(1, Ordering::AcqRel);
        let plan = self.catalog.active_plan(tenant_id);
        self.tenant_plans
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, plan);
        plan
    }

    fn features_for(&self, plan_id: PlanId) -> Arc<BTreeSet<String>> {
        if let Some(cached) = self
            .plan_features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&plan_id)
        {
            return cached.clone();
        }
        self.misses.fetch_add(1, Ordering::AcqRel);
        let features = Arc::new(self.catalog.plan_features(plan_id));
        self.plan_features
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(plan_id, features.clone());
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;

    fn module(code: &str, active: bool) -> Module {
        Module {
            code: code.into(),
            name: code.into(),
            active,
        }
    }

    fn gate_with_plan() -> (FeatureGate, TenantId, PlanId) {
        let gate = FeatureGate::new(clock::system());
        gate.upsert_module(module("payments", true));
        gate.upsert_module(module("analytics", false));
        let plan = gate.add_plan("Standard");
        for code in ["payments", "analytics"] {
            gate.set_composition(PlanModuleComposition {
                plan_id: plan.id,
                module_code: code.into(),
                submodule_code: None,
                active: true,
            });
        }
        let tenant = TenantId::new();
        gate.subscribe(tenant, plan.id);
        (gate, tenant, plan.id)
    }

    #[test]
    fn feature_requires_plan_composition_and_global_flag() {
        let (gate, tenant, _) = gate_with_plan();
        assert!(gate.feature_active(tenant, "payments"));
        assert!(!gate.feature_active(tenant, "analytics"));
        assert!(!gate.feature_active(tenant, "unknown"));
    }

    #[test]
    fn tenants_without_subscription_have_nothing_on() {
        let (gate, _, _) = gate_with_plan();
        assert!(!gate.feature_active(TenantId::new(), "payments"));
    }

    #[test]
    fn answers_are_cached_until_composition_changes() {
        let (gate, tenant, plan) = gate_with_plan();
        assert!(gate.feature_active(tenant, "payments"));
        let misses = gate.cache_misses();
        assert!(gate.feature_active(tenant, "payments"));
        assert_eq!(gate.cache_misses(), misses);

        gate.set_composition(PlanModuleComposition {
            plan_id: plan,
            module_code: "payments".into(),
            submodule_code: None,
            active: false,
        });
        assert!(!gate.feature_active(tenant, "payments"));
        assert_eq!(gate.cache_misses(), misses + 1);
    }

    #[test]
    fn global_module_switch_invalidates_every_plan() {
        let (gate, tenant, _) = gate_with_plan();
        assert!(gate.feature_active(tenant, "payments"));
        gate.upsert_module(module("payments", false));
        assert!(!gate.feature_active(tenant, "payments"));
    }
}

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{PlanId, TenantId};

/// A named capability area. `active` is the global switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub code: String,
    pub name: String,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubModule {
    pub code: String,
    pub module_code: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub active: bool,
}

/// A (module, optional submodule) row owned by a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanModuleComposition {
    pub plan_id: PlanId,
    pub module_code: String,
    pub submodule_code: Option<String>,
    pub active: bool,
}

impl PlanModuleComposition {
    /// Feature code exposed to callers: `module` or `module.submodule`.
    pub fn feature_code(&self) -> String {
        match &self.submodule_code {
            Some(sub) => format!("{}.{}", self.module_code, sub),
            None => self.module_code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSubscription {
    pub tenant_id: TenantId,
    pub plan_id: PlanId,
    pub active: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CatalogState {
    modules: HashMap<String, Module>,
    submodules: HashMap<(String, String), SubModule>,
    plans: HashMap<PlanId, Plan>,
    compositions: Vec<PlanModuleComposition>,
    subscriptions: Vec<TenantSubscription>,
}

/// Public-schema plan catalog. Writes go through [`super::FeatureGate`] so
/// cached answers are invalidated.
#[derive(Debug, Default)]
pub struct PlanCatalog {
    state: RwLock<CatalogState>,
}

impl PlanCatalog {
    pub(crate) fn upsert_module(&self, module: Module) {
        self.write().modules.insert(module.code.clone(), module);
    }

    pub(crate) fn upsert_submodule(&self, submodule: SubModule) {
        self.write().submodules.insert(
            (submodule.module_code.clone(), submodule.code.clone()),
            submodule,
        );
    }

    pub(crate) fn add_plan(&self, name: &str) -> Plan {
        let plan = Plan {
            id: PlanId::new(),
            name: name.to_string(),
            active: true,
        };
        self.write().plans.insert(plan.id, plan.clone());
        plan
    }

    pub(crate) fn set_composition(&self, composition: PlanModuleComposition) {
        let mut state = self.write();
        state.compositions.retain(|existing| {
            !(existing.plan_id == composition.plan_id
                && existing.module_code == composition.module_code
                && existing.submodule_code == composition.submodule_code)
        });
        state.compositions.push(composition);
    }

    /// Activates `plan_id` for the tenant and retires any earlier subscription.
    pub(crate) fn subscribe(&self, tenant_id: TenantId, plan_id: PlanId, at: DateTime<Utc>) {
        let mut state = self.write();
        for subscription in state
            .subscriptions
            .iter_mut()
            .filter(|subscription| subscription.tenant_id == tenant_id)
        {
            subscription.active = false;
        }
        state.subscriptions.push(TenantSubscription {
            tenant_id,
            plan_id,
            active: true,
            started_at: at,
        });
    }

    pub fn active_plan(&self, tenant_id: TenantId) -> Option<PlanId> {
        let state = self.read();
        state
            .subscriptions
            .iter()
            .find(|subscription| subscription.tenant_id == tenant_id && subscription.active)
            .filter(|subscription| {
                state
                    .plans
                    .get(&subscription.plan_id)
                    .map(|plan| plan.active)
                    .unwrap_or(false)
            })
            .map(|subscription| subscription.plan_id)
    }

    /// Feature codes the plan switches on, restricted to globally active modules.
    pub fn plan_features(&self, plan_id: PlanId) -> BTreeSet<String> {
        let state = self.read();
        state
            .compositions
            .iter()
            .filter(|composition| composition.plan_id == plan_id && composition.active)
            .filter(|composition| {
                state
                    .modules
                    .get(&composition.module_code)
                    .map(|module| module.active)
                    .unwrap_or(false)
            })
            .map(PlanModuleComposition::feature_code)
            .collect()
    }

    pub fn modules(&self) -> Vec<Module> {
        let mut modules: Vec<_> = self.read().modules.values().cloned().collect();
        modules.sort_by(|a, b| a.code.cmp(&b.code));
        modules
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, CatalogState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, CatalogState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

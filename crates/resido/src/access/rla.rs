use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::ids::{BuildingId, CustomerId, FloorId, LocationId, PropertyId, ResidentId, UnitId};

/// Breadth of a staff member's row-level access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    Admin,
    Customer,
    Property,
    Location,
    Building,
    Floor,
    Unit,
}

/// The set of hierarchy nodes a staff member was granted at their level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessScope {
    pub level: AccessLevel,
    #[serde(default)]
    pub customers: BTreeSet<CustomerId>,
    #[serde(default)]
    pub properties: BTreeSet<PropertyId>,
    #[serde(default)]
    pub locations: BTreeSet<LocationId>,
    #[serde(default)]
    pub buildings: BTreeSet<BuildingId>,
    #[serde(default)]
    pub floors: BTreeSet<FloorId>,
    #[serde(default)]
    pub units: BTreeSet<UnitId>,
}

impl AccessScope {
    pub fn admin() -> Self {
        Self::empty(AccessLevel::Admin)
    }

    pub fn empty(level: AccessLevel) -> Self {
        Self {
            level,
            customers: BTreeSet::new(),
            properties: BTreeSet::new(),
            locations: BTreeSet::new(),
            buildings: BTreeSet::new(),
            floors: BTreeSet::new(),
            units: BTreeSet::new(),
        }
    }

    pub fn customers(customers: impl IntoIterator<Item = CustomerId>) -> Self {
        Self {
            customers: customers.into_iter().collect(),
            ..Self::empty(AccessLevel::Customer)
        }
    }

    pub fn properties(properties: impl IntoIterator<Item = PropertyId>) -> Self {
        Self {
            properties: properties.into_iter().collect(),
            ..Self::empty(AccessLevel::Property)
        }
    }

    pub fn units(units: impl IntoIterator<Item = UnitId>) -> Self {
        Self {
            units: units.into_iter().collect(),
            ..Self::empty(AccessLevel::Unit)
        }
    }

    fn admits(&self, path: &LocationPath) -> bool {
        fn contains<T: Ord>(set: &BTreeSet<T>, value: Option<T>) -> bool {
            value.map(|value| set.contains(&value)).unwrap_or(false)
        }

        match self.level {
            AccessLevel::Admin => true,
            AccessLevel::Customer => contains(&self.customers, path.customer),
            AccessLevel::Property => contains(&self.properties, path.property),
            AccessLevel::Location => contains(&self.locations, path.location),
            AccessLevel::Building => contains(&self.buildings, path.building),
            AccessLevel::Floor => contains(&self.floors, path.floor),
            AccessLevel::Unit => contains(&self.units, path.unit),
        }
    }
}

/// Where an entity sits in the customer → property → location → building →
/// floor → unit hierarchy. Missing levels never match a scoped filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationPath {
    pub customer: Option<CustomerId>,
    pub property: Option<PropertyId>,
    pub location: Option<LocationId>,
    pub building: Option<BuildingId>,
    pub floor: Option<FloorId>,
    pub unit: Option<UnitId>,
}

/// Entity metadata consumed by [`RowFilter`].
pub trait RowScoped {
    fn location_path(&self) -> Option<&LocationPath> {
        None
    }

    fn resident_path(&self) -> Option<ResidentId> {
        None
    }
}

/// Predicate composed once per query from the caller's principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    Unrestricted,
    Staff(AccessScope),
    Resident(ResidentId),
    Deny,
}

impl RowFilter {
    pub fn for_principal(principal: &Principal) -> Self {
        match principal {
            Principal::StaffUser(staff) if staff.scope.level == AccessLevel::Admin => {
                Self::Unrestricted
            }
            Principal::StaffUser(staff) => Self::Staff(staff.scope.clone()),
            Principal::CustomerAdmin(admin) => {
                Self::Staff(AccessScope::customers(admin.customers.iter().copied()))
            }
            Principal::Resident(resident) => Self::Resident(resident.id),
            Principal::ServiceClient(_) => Self::Unrestricted,
            Principal::Anonymous => Self::Deny,
        }
    }

    pub fn permits<E: RowScoped + ?Sized>(&self, entity: &E) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Staff(scope) => entity
                .location_path()
                .map(|path| scope.admits(path))
                .unwrap_or(false),
            Self::Resident(resident) => entity.resident_path() == Some(*resident),
            Self::Deny => false,
        }
    }

    pub fn apply<E: RowScoped>(&self, rows: Vec<E>) -> Vec<E> {
        rows.into_iter().filter(|row| self.permits(row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{ResidentPrincipal, StaffUser};
    use crate::ids::{LeaseId, UserId};

    struct Row {
        path: Option<LocationPath>,
        resident: Option<ResidentId>,
    }

    impl RowScoped for Row {
        fn location_path(&self) -> Option<&LocationPath> {
            self.path.as_ref()
        }

        fn resident_path(&self) -> Option<ResidentId> {
            self.resident
        }
    }

    fn staff(scope: AccessScope) -> Principal {
        Principal::StaffUser(StaffUser {
            id: UserId::new(),
            email: "ops@acme.test".into(),
            roles: BTreeSet::from(["manager".to_string()]),
            scope,
        })
    }

    #[test]
    fn property_scope_filters_by_property() {
        let visible = PropertyId::new();
        let hidden = PropertyId::new();
        let filter = RowFilter::for_principal(&staff(AccessScope::properties([visible])));

        let rows = vec![
            Row {
                path: Some(LocationPath {
                    property: Some(visible),
                    ..LocationPath::default()
                }),
                resident: None,
            },
            Row {
                path: Some(LocationPath {
                    property: Some(hidden),
                    ..LocationPath::default()
                }),
                resident: None,
            },
        ];

        assert_eq!(filter.apply(rows).len(), 1);
    }

    #[test]
    fn entities_without_paths_are_admin_only() {
        let pathless = Row {
            path: None,
            resident: None,
        };
        let scoped = RowFilter::for_principal(&staff(AccessScope::units([UnitId::new()])));
        let admin = RowFilter::for_principal(&staff(AccessScope::admin()));

        assert!(!scoped.permits(&pathless));
        assert!(admin.permits(&pathless));
    }

    #[test]
    fn residents_only_see_their_own_rows() {
        let resident_id = ResidentId::new();
        let principal = Principal::Resident(ResidentPrincipal {
            id: resident_id,
            unit: UnitId::new(),
            leases: vec![LeaseId::new()],
        });
        let filter = RowFilter::for_principal(&principal);

        let own = Row {
            path: None,
            resident: Some(resident_id),
        };
        let other = Row {
            path: None,
            resident: Some(ResidentId::new()),
        };

        assert!(filter.permits(&own));
        assert!(!filter.permits(&other));
    }

    #[test]
    fn anonymous_callers_see_nothing() {
        let row = Row {
            path: Some(LocationPath::default()),
            resident: None,
        };
        assert!(!RowFilter::for_principal(&Principal::Anonymous).permits(&row));
    }
}

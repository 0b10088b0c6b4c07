//! Strongly typed identifiers shared across the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(raw.trim()).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

uuid_id!(
    /// Primary key of a tenant in the public directory.
    TenantId
);
uuid_id!(
    /// Identifier of a durable process record.
    ProcessId
);
uuid_id!(
    /// Identifier attached to every inbound request and propagated into tasks.
    RequestId
);
uuid_id!(BillId);
uuid_id!(TransactionId);
uuid_id!(RefundRequestId);
uuid_id!(ResidentId);
uuid_id!(UserId);
uuid_id!(NotificationId);
uuid_id!(PlanId);
uuid_id!(
    /// Identifier of a row in the periodic task binding table.
    PeriodicBindingId
);

// Location hierarchy used by row-level access filters.
uuid_id!(CustomerId);
uuid_id!(PropertyId);
uuid_id!(LocationId);
uuid_id!(BuildingId);
uuid_id!(FloorId);
uuid_id!(UnitId);
uuid_id!(LeaseId);

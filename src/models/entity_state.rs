//! Entity State Types
//!
//! One `EntityState` row per unit of work inside a workflow. Status moves
//! forward only; `failed` and `cancelled` are reachable from any non-terminal
//! status, and the explicit retry path is the only way out of `failed`.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entity key of the single synthesis unit of an extraction workflow
pub const GLOBAL_ENTITY_KEY: &str = "global";

/// Kind of unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    Table,
    Column,
    Global,
    TestJoin,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::Global => "global",
            Self::TestJoin => "test-join",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Self::Table),
            "column" => Ok(Self::Column),
            "global" => Ok(Self::Global),
            "test-join" => Ok(Self::TestJoin),
            _ => Err(format!("Unknown entity type: {}", s)),
        }
    }
}

/// Status of a unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityStatus {
    Pending,
    Scanning,
    Scanned,
    Analyzing,
    NeedsInput,
    Testing,
    Complete,
    Failed,
    Cancelled,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scanning => "scanning",
            Self::Scanned => "scanned",
            Self::Analyzing => "analyzing",
            Self::NeedsInput => "needs-input",
            Self::Testing => "testing",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Cancelled)
    }

    /// Whether `entity_type` may move from `self` to `to`.
    ///
    /// Re-applying the current status is always allowed so status writes stay
    /// idempotent. Leaving a terminal status requires the retry path.
    pub fn can_transition(&self, entity_type: EntityType, to: EntityStatus) -> bool {
        use EntityStatus::*;

        if *self == to {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        if matches!(to, Failed | Cancelled) {
            return true;
        }

        match entity_type {
            EntityType::Table => matches!(
                (*self, to),
                (Pending, Scanning)
                    | (Scanning, Scanned)
                    | (Scanned, Analyzing)
                    | (Analyzing, Complete)
                    | (Analyzing, NeedsInput)
                    | (NeedsInput, Analyzing)
            ),
            EntityType::Global => matches!(
                (*self, to),
                (Pending, Scanned) | (Scanned, Analyzing) | (Analyzing, Complete)
            ),
            EntityType::Column => matches!((*self, to), (Pending, Scanning) | (Scanning, Complete)),
            EntityType::TestJoin => {
                matches!((*self, to), (Pending, Testing) | (Testing, Complete))
            }
        }
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "scanning" => Ok(Self::Scanning),
            "scanned" => Ok(Self::Scanned),
            "analyzing" => Ok(Self::Analyzing),
            "needs-input" => Ok(Self::NeedsInput),
            "testing" => Ok(Self::Testing),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown entity status: {}", s)),
        }
    }
}

/// A tracked unit of work within a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub entity_type: EntityType,
    /// Stable key, e.g. `public.orders` or `public.orders.user_id`
    pub entity_key: String,
    pub status: EntityStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    /// Opaque payload produced by one task and consumed by the next
    #[serde(default)]
    pub state_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityState {
    pub fn new(workflow_id: Uuid, entity_type: EntityType, entity_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            entity_type,
            entity_key: entity_key.into(),
            status: EntityStatus::Pending,
            retry_count: 0,
            last_error: None,
            state_data: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn global(workflow_id: Uuid) -> Self {
        Self::new(workflow_id, EntityType::Global, GLOBAL_ENTITY_KEY)
    }

    /// Decode the state payload, falling back to the default when absent
    pub fn data<T: DeserializeOwned + Default>(&self) -> Result<T, serde_json::Error> {
        if self.state_data.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.state_data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_forward_path() {
        use EntityStatus::*;
        let path = [Pending, Scanning, Scanned, Analyzing, Complete];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(EntityType::Table, pair[1]));
            assert!(!pair[1].can_transition(EntityType::Table, pair[0]));
        }
    }

    #[test]
    fn test_global_skips_scanning() {
        use EntityStatus::*;
        assert!(Pending.can_transition(EntityType::Global, Scanned));
        assert!(!Pending.can_transition(EntityType::Global, Scanning));
    }

    #[test]
    fn test_needs_input_only_from_analyzing() {
        use EntityStatus::*;
        assert!(Analyzing.can_transition(EntityType::Table, NeedsInput));
        assert!(NeedsInput.can_transition(EntityType::Table, Analyzing));
        assert!(!Scanned.can_transition(EntityType::Table, NeedsInput));
    }

    #[test]
    fn test_terminal_is_sticky_but_idempotent() {
        use EntityStatus::*;
        assert!(Complete.can_transition(EntityType::Table, Complete));
        assert!(!Complete.can_transition(EntityType::Table, Pending));
        assert!(!Failed.can_transition(EntityType::Column, Scanning));
        assert!(Scanning.can_transition(EntityType::Column, Failed));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(EntityStatus::NeedsInput.as_str(), "needs-input");
        assert_eq!(
            "needs-input".parse::<EntityStatus>(),
            Ok(EntityStatus::NeedsInput)
        );
        assert_eq!("test-join".parse::<EntityType>(), Ok(EntityType::TestJoin));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_status() -> impl Strategy<Value = EntityStatus> {
            prop_oneof![
                Just(EntityStatus::Pending),
                Just(EntityStatus::Scanning),
                Just(EntityStatus::Scanned),
                Just(EntityStatus::Analyzing),
                Just(EntityStatus::NeedsInput),
                Just(EntityStatus::Testing),
                Just(EntityStatus::Complete),
                Just(EntityStatus::Failed),
                Just(EntityStatus::Cancelled),
            ]
        }

        fn arb_type() -> impl Strategy<Value = EntityType> {
            prop_oneof![
                Just(EntityType::Table),
                Just(EntityType::Column),
                Just(EntityType::Global),
                Just(EntityType::TestJoin),
            ]
        }

        proptest! {
            /// Applying any sequence of requested writes through the
            /// transition check never moves a complete entity anywhere else.
            #[test]
            fn complete_never_regresses(
                entity_type in arb_type(),
                writes in prop::collection::vec(arb_status(), 0..32),
            ) {
                let mut status = EntityStatus::Pending;
                let mut seen_complete = false;
                for to in writes {
                    if status.can_transition(entity_type, to) {
                        status = to;
                    }
                    if status == EntityStatus::Complete {
                        seen_complete = true;
                    }
                    if seen_complete {
                        prop_assert_eq!(status, EntityStatus::Complete);
                    }
                }
            }
        }
    }
}

use crate::domain::result::DomainResult;
use crate::domain::search::IndexDimension;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceAssignmentStatus {
    Active,
    Missing,
    Released,
}

/// Association of a device with (at most) one customer, area and asset.
///
/// Owned by device management; the ingestion core only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAssignment {
    pub id: Uuid,
    pub device_id: Uuid,
    pub device_token: String,
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    #[serde(default)]
    pub area_id: Option<Uuid>,
    #[serde(default)]
    pub asset_id: Option<Uuid>,
    pub status: DeviceAssignmentStatus,
    #[serde(default)]
    pub active_date: Option<DateTime<Utc>>,
}

impl DeviceAssignment {
    /// Entity id this assignment contributes to the given index dimension, if any.
    pub fn entity_for(&self, dimension: IndexDimension) -> Option<Uuid> {
        match dimension {
            IndexDimension::Assignment => Some(self.id),
            IndexDimension::Customer => self.customer_id,
            IndexDimension::Area => self.area_id,
            IndexDimension::Asset => self.asset_id,
        }
    }
}

/// Read access to device assignments held by device management
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait DeviceAssignmentRepository: Send + Sync {
    /// Active assignment for the device identified by `device_token`
    async fn get_active_assignment(&self, device_token: &str)
        -> DomainResult<Option<DeviceAssignment>>;

    /// Assignment by id, regardless of status
    async fn get_assignment(&self, assignment_id: Uuid) -> DomainResult<Option<DeviceAssignment>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_for_each_dimension() {
        let customer = Uuid::new_v4();
        let assignment = DeviceAssignment {
            id: Uuid::new_v4(),
            device_id: Uuid::new_v4(),
            device_token: "dev-1".to_string(),
            customer_id: Some(customer),
            area_id: None,
            asset_id: None,
            status: DeviceAssignmentStatus::Active,
            active_date: None,
        };

        assert_eq!(
            assignment.entity_for(IndexDimension::Assignment),
            Some(assignment.id)
        );
        assert_eq!(assignment.entity_for(IndexDimension::Customer), Some(customer));
        assert_eq!(assignment.entity_for(IndexDimension::Area), None);
        assert_eq!(assignment.entity_for(IndexDimension::Asset), None);
    }
}

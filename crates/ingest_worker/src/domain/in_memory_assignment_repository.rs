use anyhow::Context;
use async_trait::async_trait;
use common::domain::{
    DeviceAssignment, DeviceAssignmentRepository, DeviceAssignmentStatus, DomainResult,
};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Assignment lookup for deployments without a device management service.
///
/// Seeded from a JSON array of assignments. When a token has several active
/// assignments the last one inserted wins.
#[derive(Default)]
pub struct InMemoryDeviceAssignmentRepository {
    assignments: RwLock<HashMap<Uuid, DeviceAssignment>>,
    active_by_token: RwLock<HashMap<String, Uuid>>,
}

impl InMemoryDeviceAssignmentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_assignments(assignments: Vec<DeviceAssignment>) -> Self {
        let repository = Self::new();
        for assignment in assignments {
            repository.insert(assignment).await;
        }
        repository
    }

    pub async fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read assignments from {}", path.display()))?;
        let assignments: Vec<DeviceAssignment> = serde_json::from_slice(&raw)
            .with_context(|| format!("invalid assignments file {}", path.display()))?;

        let count = assignments.len();
        let repository = Self::from_assignments(assignments).await;
        info!(path = %path.display(), count, "loaded device assignments");
        Ok(repository)
    }

    pub async fn insert(&self, assignment: DeviceAssignment) {
        let mut active = self.active_by_token.write().await;
        if assignment.status == DeviceAssignmentStatus::Active {
            active.insert(assignment.device_token.clone(), assignment.id);
        } else if active.get(&assignment.device_token) == Some(&assignment.id) {
            active.remove(&assignment.device_token);
        }
        self.assignments
            .write()
            .await
            .insert(assignment.id, assignment);
    }

    pub async fn len(&self) -> usize {
        self.assignments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.assignments.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceAssignmentRepository for InMemoryDeviceAssignmentRepository {
    async fn get_active_assignment(
        &self,
        device_token: &str,
    ) -> DomainResult<Option<DeviceAssignment>> {
        let Some(id) = self.active_by_token.read().await.get(device_token).copied() else {
            return Ok(None);
        };
        Ok(self.assignments.read().await.get(&id).cloned())
    }

    async fn get_assignment(&self, assignment_id: Uuid) -> DomainResult<Option<DeviceAssignment>> {
        Ok(self.assignments.read().await.get(&assignment_id).cloned())
    }
}

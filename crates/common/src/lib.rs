pub mod clickhouse;
pub mod domain;
pub mod nats;
pub mod telemetry;

pub use clickhouse::*;
pub use domain::*;
pub use nats::*;

// Re-export mocks when testing feature is enabled
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceAssignmentRepository;
#[cfg(any(test, feature = "testing"))]
pub use domain::MockDeviceEventManagement;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockJetStreamConsumer;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockMessageAcker;
#[cfg(any(test, feature = "testing"))]
pub use nats::MockPullConsumer;

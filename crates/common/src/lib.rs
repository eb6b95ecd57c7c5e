pub mod types;

pub use types::{SagaId, TenantId, UserId};

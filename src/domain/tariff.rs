use async_trait::async_trait;

use super::error::DeviceResult;

/// Optional tariff provider. A cheap tariff window lets PV-mode loadpoints
/// charge at full current regardless of surplus.
#[async_trait]
pub trait Tariff: Send + Sync {
    async fn is_cheap(&self) -> DeviceResult<bool>;
}

//! Contract with the remote phone-number registration directory.

use serde::{Deserialize, Serialize};

use parley_shared::UserId;

use crate::error::BridgeError;

#[async_trait::async_trait]
pub trait RegistrationLookupBridge: Send + Sync {
    /// Report which of `phone_numbers` (canonical form) belong to registered
    /// users.
    async fn check_many(&self, phone_numbers: &[String]) -> Result<LookupResult, BridgeError>;
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResult {
    /// Numbers confirmed as registered.
    pub registered: Vec<String>,
    /// Optional per-number detail carrying the remote user id.
    #[serde(default)]
    pub per_number: Vec<(String, Option<UserId>)>,
}

impl LookupResult {
    pub fn uid_for(&self, phone_no: &str) -> Option<&UserId> {
        self.per_number
            .iter()
            .find(|(phone, _)| phone == phone_no)
            .and_then(|(_, uid)| uid.as_ref())
    }
}

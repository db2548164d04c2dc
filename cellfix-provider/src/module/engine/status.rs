use cellfix_common::ProviderStatus;

/// Tracks the provider status and reports only real transitions.
#[derive(Debug, Default)]
pub struct StatusMachine {
    status: ProviderStatus,
}

impl StatusMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ProviderStatus {
        self.status
    }

    /// Move to `status`. Returns the new status if it differs from the old one.
    pub fn transition(&mut self, status: ProviderStatus) -> Option<ProviderStatus> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(status)
    }

    /// The fix-lost timeout only demotes an available provider.
    pub fn fix_lost(&mut self) -> Option<ProviderStatus> {
        if self.status != ProviderStatus::Available {
            return None;
        }
        self.transition(ProviderStatus::Acquiring)
    }
}

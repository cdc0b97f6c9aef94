//! Failure injection for the in-memory provider and mirror

use tracing::debug;

use crate::error::{MirrorError, ProviderError};

/// Describes how an in-memory store behaves during a test.
///
/// Each operation has a `(successes, failures)` pair: the operation succeeds
/// `successes` times, then fails `failures` times, then succeeds forever.
#[derive(Default, Clone, Debug)]
pub struct MockBehaviour {
    /// If this is true, every action will be allowed
    pub is_suspended: bool,

    // ProviderClient
    pub list_behaviour: (u32, u32),
    pub get_behaviour: (u32, u32),
    pub create_behaviour: (u32, u32),
    pub update_behaviour: (u32, u32),
    pub delete_behaviour: (u32, u32),
    pub search_contacts_behaviour: (u32, u32),

    // MirrorStore
    pub upsert_behaviour: (u32, u32),
    pub remove_behaviour: (u32, u32),
    pub remove_by_master_behaviour: (u32, u32),
    pub mirror_list_behaviour: (u32, u32),

    /// Returned by failing provider calls, `ProviderError::Unknown` when unset
    pub provider_error: Option<ProviderError>,
}

impl MockBehaviour {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every operation fails `n_fails` times from now on
    pub fn fail_now(n_fails: u32) -> Self {
        Self {
            is_suspended: false,
            list_behaviour: (0, n_fails),
            get_behaviour: (0, n_fails),
            create_behaviour: (0, n_fails),
            update_behaviour: (0, n_fails),
            delete_behaviour: (0, n_fails),
            search_contacts_behaviour: (0, n_fails),
            upsert_behaviour: (0, n_fails),
            remove_behaviour: (0, n_fails),
            remove_by_master_behaviour: (0, n_fails),
            mirror_list_behaviour: (0, n_fails),
            provider_error: None,
        }
    }

    /// Suspend this mock behaviour until you call `resume`
    pub fn suspend(&mut self) {
        self.is_suspended = true;
    }

    /// Make this behaviour active again
    pub fn resume(&mut self) {
        self.is_suspended = false;
    }

    fn provider_check(&mut self, pick: fn(&mut Self) -> &mut (u32, u32), descr: &str) -> Result<(), ProviderError> {
        if self.is_suspended || allow(pick(self), descr) {
            return Ok(());
        }
        Err(self
            .provider_error
            .clone()
            .unwrap_or_else(|| ProviderError::Unknown(format!("mocked {} failure", descr))))
    }

    fn mirror_check(
        &mut self,
        pick: fn(&mut Self) -> &mut (u32, u32),
        descr: &str,
        failure: fn(String) -> MirrorError,
    ) -> Result<(), MirrorError> {
        if self.is_suspended || allow(pick(self), descr) {
            return Ok(());
        }
        Err(failure(format!("mocked {} failure", descr)))
    }

    pub fn can_list(&mut self) -> Result<(), ProviderError> {
        self.provider_check(|b| &mut b.list_behaviour, "list_events")
    }
    pub fn can_get(&mut self) -> Result<(), ProviderError> {
        self.provider_check(|b| &mut b.get_behaviour, "get_event")
    }
    pub fn can_create(&mut self) -> Result<(), ProviderError> {
        self.provider_check(|b| &mut b.create_behaviour, "create_event")
    }
    pub fn can_update(&mut self) -> Result<(), ProviderError> {
        self.provider_check(|b| &mut b.update_behaviour, "update_event")
    }
    pub fn can_delete(&mut self) -> Result<(), ProviderError> {
        self.provider_check(|b| &mut b.delete_behaviour, "delete_event")
    }
    pub fn can_search_contacts(&mut self) -> Result<(), ProviderError> {
        self.provider_check(|b| &mut b.search_contacts_behaviour, "search_contacts")
    }

    pub fn can_upsert(&mut self) -> Result<(), MirrorError> {
        self.mirror_check(|b| &mut b.upsert_behaviour, "mirror upsert", MirrorError::WriteFailed)
    }
    pub fn can_remove(&mut self) -> Result<(), MirrorError> {
        self.mirror_check(|b| &mut b.remove_behaviour, "mirror remove", MirrorError::WriteFailed)
    }
    pub fn can_remove_by_master(&mut self) -> Result<(), MirrorError> {
        self.mirror_check(|b| &mut b.remove_by_master_behaviour, "mirror remove_by_master", MirrorError::WriteFailed)
    }
    pub fn can_list_mirror(&mut self) -> Result<(), MirrorError> {
        self.mirror_check(|b| &mut b.mirror_list_behaviour, "mirror list", MirrorError::ReadFailed)
    }
}

/// Consume one step of `(successes, failures)`; false when this call must fail
fn allow(value: &mut (u32, u32), descr: &str) -> bool {
    if value.0 > 0 {
        value.0 -= 1;
        debug!("Mock behaviour: allowing a {} ({:?})", descr, value);
        true
    } else if value.1 > 0 {
        value.1 -= 1;
        debug!("Mock behaviour: failing a {} ({:?})", descr, value);
        false
    } else {
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mock_behaviour() {
        let mut ok = MockBehaviour::new();
        for _ in 0..5 {
            assert!(ok.can_list().is_ok());
            assert!(ok.can_upsert().is_ok());
        }

        let mut now = MockBehaviour::fail_now(2);
        assert!(now.can_create().is_err());
        assert!(now.can_upsert().is_err());
        assert!(now.can_upsert().is_err());
        assert!(now.can_create().is_err());
        assert!(now.can_create().is_ok());
        assert!(now.can_upsert().is_ok());

        let mut custom = MockBehaviour {
            delete_behaviour: (1, 1),
            provider_error: Some(ProviderError::AuthExpired("gone".into())),
            ..MockBehaviour::default()
        };
        assert!(custom.can_delete().is_ok());
        assert!(matches!(custom.can_delete(), Err(ProviderError::AuthExpired(_))));
        assert!(custom.can_delete().is_ok());

        custom.delete_behaviour = (0, 1);
        custom.suspend();
        assert!(custom.can_delete().is_ok());
        custom.resume();
        assert!(custom.can_delete().is_err());
    }
}

//! Attendee suggestions

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::SyncResult;
use crate::traits::ProviderClient;

const MAX_SUGGESTIONS: usize = 10;

/// Every attendee address used so far, persisted as a JSON array
#[derive(Debug)]
pub struct AttendeeHistory {
    path: Option<PathBuf>,
    addresses: Mutex<BTreeSet<String>>,
}

impl AttendeeHistory {
    /// History that lives only as long as the process
    pub fn in_memory() -> Self {
        Self { path: None, addresses: Mutex::new(BTreeSet::new()) }
    }

    /// Load the history at `path`, starting empty when the file does not exist yet
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        let addresses = match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<BTreeSet<String>>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} attendee addresses from {}", addresses.len(), path.display());
        Ok(Self { path: Some(path), addresses: Mutex::new(addresses) })
    }

    /// Add addresses; the file is rewritten only when something new was added
    pub fn record<'a, I>(&self, addresses: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut known = self.addresses.lock();
        let mut added = false;
        for address in addresses {
            let address = address.trim().to_lowercase();
            if !address.is_empty() {
                added |= known.insert(address);
            }
        }

        match (&self.path, added) {
            (Some(path), true) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    fs::create_dir_all(dir)?;
                }
                fs::write(path, serde_json::to_string_pretty(&*known)?)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn matching(&self, query: &str) -> Vec<String> {
        let query = query.trim().to_lowercase();
        self.addresses
            .lock()
            .iter()
            .filter(|a| a.contains(&query))
            .take(MAX_SUGGESTIONS)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.addresses.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Suggests attendee addresses, preferring the provider's contact search
#[derive(Clone)]
pub struct ContactSuggester {
    provider: Arc<dyn ProviderClient>,
    history: Arc<AttendeeHistory>,
}

impl ContactSuggester {
    pub fn new(provider: Arc<dyn ProviderClient>, history: Arc<AttendeeHistory>) -> Self {
        Self { provider, history }
    }

    pub async fn suggest(&self, query: &str) -> Vec<String> {
        match self.provider.search_contacts(query).await {
            Ok(mut found) => {
                found.truncate(MAX_SUGGESTIONS);
                found
            }
            Err(e) => {
                debug!("Contact search failed, using attendee history: {}", e);
                self.history.matching(query)
            }
        }
    }
}

/// Record attendees of a committed event, logging instead of failing
pub(crate) fn remember_attendees(history: Option<&AttendeeHistory>, attendees: &BTreeSet<String>) {
    if let Some(history) = history {
        if let Err(e) = history.record(attendees) {
            warn!("Failed to update attendee history: {}", e);
        }
    }
}

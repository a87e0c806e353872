use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::context::CallbackT;

/// Ordered listeners of one hook.
///
/// Entries may be null; dispatch skips them.
#[derive(Debug)]
pub struct CallbackChain {
    name: String,
    callbacks: Mutex<Vec<Option<CallbackT>>>,
}

impl CallbackChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Option<CallbackT>>> {
        self.callbacks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, callback: Option<CallbackT>) {
        self.lock().push(callback);
    }

    /// Remove the first registration of `callback`.
    pub fn remove(&self, callback: CallbackT) -> bool {
        let mut callbacks = self.lock();
        let found = callbacks
            .iter()
            .position(|c| c.is_some_and(|c| core::ptr::fn_addr_eq(c, callback)));
        match found {
            Some(index) => {
                callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// Copy of the listeners in insertion order, so callbacks can register or
    /// unregister while a dispatch is running.
    pub fn snapshot(&self) -> Vec<Option<CallbackT>> {
        self.lock().clone()
    }
}

/// Process-wide registry of named callback chains.
#[derive(Debug, Default)]
pub struct CallbackManager {
    chains: Mutex<HashMap<String, Arc<CallbackChain>>>,
}

impl CallbackManager {
    pub fn global() -> &'static CallbackManager {
        static INSTANCE: OnceLock<CallbackManager> = OnceLock::new();
        INSTANCE.get_or_init(CallbackManager::default)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<CallbackChain>>> {
        self.chains.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a fresh, empty chain registered under `name`, replacing any
    /// previous chain of that name.
    pub fn create_callback(&self, name: &str) -> Arc<CallbackChain> {
        let chain = Arc::new(CallbackChain::new(name));
        self.lock().insert(name.to_string(), Arc::clone(&chain));
        chain
    }

    pub fn find_callback(&self, name: &str) -> Option<Arc<CallbackChain>> {
        self.lock().get(name).cloned()
    }

    pub fn release_callback(&self, chain: &CallbackChain) {
        let mut chains = self.lock();
        if chains.get(chain.name()).is_some_and(|c| core::ptr::eq(Arc::as_ptr(c), chain)) {
            chains.remove(chain.name());
        }
    }
}

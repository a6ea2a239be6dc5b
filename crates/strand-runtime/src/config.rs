//! Typed, hot-reloadable configuration variables
//!
//! Variables live in a process-wide registry keyed by dotted names
//! (`fiber.stack_size`). The first lookup creates the variable, seeding
//! it from the matching environment variable (`STRAND_FIBER_STACK_SIZE`)
//! when set. `set` applies immediately and notifies listeners; consumers
//! read at use time, so new values affect subsequent creations and calls.

use log::info;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use strand_core::env::env_get;

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// A single typed configuration value with change listeners.
pub struct ConfigVar<T> {
    name: String,
    value: RwLock<T>,
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replace the value. Listeners run on the calling thread, outside
    /// the value lock, with the old and new values. Setting an equal
    /// value is a no-op.
    pub fn set(&self, new: T) {
        let old = {
            let mut v = self.value.write();
            if *v == new {
                return;
            }
            let old = v.clone();
            *v = new.clone();
            old
        };
        for listener in self.listeners.lock().iter() {
            listener(&old, &new);
        }
    }

    /// Register a change listener, called as `(old, new)`.
    pub fn add_listener<F>(&self, f: F)
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        self.listeners.lock().push(Box::new(f));
    }
}

static REGISTRY: Lazy<Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn env_key(name: &str) -> String {
    format!("STRAND_{}", name.to_uppercase().replace(['.', '-'], "_"))
}

/// Find or create the variable `name`.
///
/// The default applies only on first creation, after the environment
/// override. Looking the same name up with a different type panics: two
/// subsystems disagreeing on a config type is a wiring bug.
pub fn lookup<T>(name: &str, default: T) -> Arc<ConfigVar<T>>
where
    T: Clone + PartialEq + Send + Sync + FromStr + 'static,
{
    let mut registry = REGISTRY.lock();
    if let Some(existing) = registry.get(name) {
        return existing
            .clone()
            .downcast::<ConfigVar<T>>()
            .unwrap_or_else(|_| panic!("config var {} already registered with another type", name));
    }

    let initial: T = env_get(&env_key(name), default);
    let var = Arc::new(ConfigVar {
        name: name.to_string(),
        value: RwLock::new(initial),
        listeners: Mutex::new(Vec::new()),
    });
    registry.insert(name.to_string(), var.clone());
    info!("config var {} registered", name);
    var
}

/// Default stack size in bytes for fibers created with `stack_size == 0`.
pub fn fiber_stack_size() -> Arc<ConfigVar<u32>> {
    static VAR: Lazy<Arc<ConfigVar<u32>>> = Lazy::new(|| lookup("fiber.stack_size", 128 * 1024));
    VAR.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_lookup_returns_same_instance() {
        let a = lookup::<u32>("test.same.instance", 7);
        let b = lookup::<u32>("test.same.instance", 99);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.get(), 7);
    }

    #[test]
    fn test_set_and_listener() {
        let var = lookup::<u64>("test.listener", 100);
        let seen = Arc::new(AtomicU64::new(0));
        let s = seen.clone();
        var.add_listener(move |old, new| {
            assert_eq!(*old, 100);
            s.store(*new, Ordering::SeqCst);
        });

        var.set(100); // equal value, no notification
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        var.set(250);
        assert_eq!(var.get(), 250);
        assert_eq!(seen.load(Ordering::SeqCst), 250);
    }

    #[test]
    fn test_env_override_on_first_lookup() {
        std::env::set_var("STRAND_TEST_ENV_SEEDED", "4242");
        let var = lookup::<u32>("test.env.seeded", 1);
        assert_eq!(var.get(), 4242);
        std::env::remove_var("STRAND_TEST_ENV_SEEDED");
    }

    #[test]
    #[should_panic(expected = "already registered with another type")]
    fn test_type_mismatch_panics() {
        let _ = lookup::<u32>("test.type.mismatch", 1);
        let _ = lookup::<u64>("test.type.mismatch", 1);
    }

    #[test]
    fn test_fiber_stack_size_default() {
        assert!(fiber_stack_size().get() >= 4096);
    }
}

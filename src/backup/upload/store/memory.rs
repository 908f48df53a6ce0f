use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::upload::store::ObjectStore;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Object store kept in memory, recording how many puts ran at once.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    puts: AtomicUsize,
    delay: Duration,
    fail_on: Option<String>,
}

impl MemoryStore {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Puts to keys containing `pattern` fail after their body was read.
    pub fn failing_on<S: Into<String>>(pattern: S) -> Self {
        Self {
            fail_on: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl ObjectStore for MemoryStore {
    fn put_object(&self, key: &str, body: &mut dyn Read, _size_hint: Option<u64>) -> Result<()> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        self.puts.fetch_add(1, Ordering::SeqCst);

        let mut data = Vec::new();
        let res = body.read_to_end(&mut data);
        std::thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res?;

        if self.fail_on.as_deref().is_some_and(|p| key.contains(p)) {
            return Err(Error::object_store(format!("rejected {key}")));
        }
        self.objects.lock().unwrap().insert(key.to_string(), data);
        Ok(())
    }
}

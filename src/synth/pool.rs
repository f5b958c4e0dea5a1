//! Synthesizer instance pool
//!
//! TTS backends are not assumed thread-safe, and model loading is expensive.
//! Instances are pooled per `(model_id, voice_id)`; a checkout hands the
//! instance to exactly one caller, which serializes use without a per-call
//! mutex. Pool growth is capped, and callers block until an instance frees
//! up once the cap is reached.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use super::traits::{Synthesizer, SynthesizerFactory};
use crate::core::error::Result;

type PoolKey = (String, Option<String>);

#[derive(Default)]
struct PoolState {
    idle: HashMap<PoolKey, Vec<Box<dyn Synthesizer>>>,
    totals: HashMap<PoolKey, usize>,
}

/// Capped pool of synthesizer instances
pub struct SynthesizerPool {
    factory: Arc<dyn SynthesizerFactory>,
    max_per_key: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl SynthesizerPool {
    pub fn new(factory: Arc<dyn SynthesizerFactory>, max_per_key: usize) -> Self {
        Self {
            factory,
            max_per_key: max_per_key.max(1),
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
        }
    }

    /// Check out an instance, creating one if the cap allows, blocking
    /// otherwise
    pub fn acquire(&self, model_id: &str, voice_id: Option<&str>) -> Result<PooledSynthesizer<'_>> {
        let key: PoolKey = (model_id.to_string(), voice_id.map(str::to_string));
        let mut state = self.state.lock().expect("pool lock");
        loop {
            if let Some(instance) = state.idle.get_mut(&key).and_then(Vec::pop) {
                return Ok(PooledSynthesizer {
                    pool: self,
                    key,
                    inner: Some(instance),
                });
            }
            let total = state.totals.get(&key).copied().unwrap_or(0);
            if total < self.max_per_key {
                *state.totals.entry(key.clone()).or_insert(0) += 1;
                drop(state);
                debug!(model_id, "creating synthesizer instance");
                match self.factory.create(model_id, voice_id) {
                    Ok(instance) => {
                        return Ok(PooledSynthesizer {
                            pool: self,
                            key,
                            inner: Some(instance),
                        })
                    }
                    Err(e) => {
                        let mut state = self.state.lock().expect("pool lock");
                        if let Some(total) = state.totals.get_mut(&key) {
                            *total = total.saturating_sub(1);
                        }
                        self.available.notify_one();
                        return Err(e);
                    }
                }
            }
            state = self.available.wait(state).expect("pool lock");
        }
    }

    /// Pre-load an instance for a model so the first job avoids the cost
    pub fn warmup(&self, model_id: &str) -> Result<()> {
        let checkout = self.acquire(model_id, None)?;
        drop(checkout);
        Ok(())
    }

    fn release(&self, key: PoolKey, instance: Box<dyn Synthesizer>) {
        let mut state = self.state.lock().expect("pool lock");
        state.idle.entry(key).or_default().push(instance);
        self.available.notify_one();
    }
}

/// Checkout guard; returns the instance to the pool on drop
pub struct PooledSynthesizer<'a> {
    pool: &'a SynthesizerPool,
    key: PoolKey,
    inner: Option<Box<dyn Synthesizer>>,
}

impl Deref for PooledSynthesizer<'_> {
    type Target = dyn Synthesizer;

    fn deref(&self) -> &Self::Target {
        self.inner.as_deref().expect("checked out synthesizer")
    }
}

impl DerefMut for PooledSynthesizer<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner.as_deref_mut().expect("checked out synthesizer")
    }
}

impl Drop for PooledSynthesizer<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.inner.take() {
            self.pool.release(self.key.clone(), instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ServiceError;
    use crate::synth::traits::{PcmAudio, SynthOutput};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingFactory {
        created: AtomicUsize,
    }

    struct NullSynth {
        model_id: String,
    }

    impl Synthesizer for NullSynth {
        fn model_id(&self) -> &str {
            &self.model_id
        }

        fn voice_id(&self) -> Option<&str> {
            None
        }

        fn supports_phonemes(&self) -> bool {
            false
        }

        fn synthesize(
            &mut self,
            _text: &str,
            _phonemes: Option<&str>,
            _rate: f32,
        ) -> Result<SynthOutput> {
            Ok(SynthOutput {
                audio: PcmAudio {
                    samples: vec![0.0; 8],
                    sample_rate: 22050,
                },
                used_phonemes: false,
            })
        }
    }

    impl SynthesizerFactory for CountingFactory {
        fn create(&self, model_id: &str, _voice_id: Option<&str>) -> Result<Box<dyn Synthesizer>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullSynth {
                model_id: model_id.to_string(),
            }))
        }
    }

    struct FailingFactory;

    impl SynthesizerFactory for FailingFactory {
        fn create(&self, _model_id: &str, _voice_id: Option<&str>) -> Result<Box<dyn Synthesizer>> {
            Err(ServiceError::synth("no backend", false))
        }
    }

    #[test]
    fn test_instances_are_reused() {
        let pool = Arc::new(SynthesizerPool::new(
            Arc::new(CountingFactory {
                created: AtomicUsize::new(0),
            }),
            2,
        ));
        {
            let _a = pool.acquire("m", None).unwrap();
        }
        {
            let _b = pool.acquire("m", None).unwrap();
        }
        // Only one instance ever created: the checkout was returned and reused
        let state = pool.state.lock().unwrap();
        assert_eq!(state.totals.get(&("m".to_string(), None)), Some(&1));
    }

    #[test]
    fn test_distinct_keys_get_distinct_instances() {
        let pool = Arc::new(SynthesizerPool::new(
            Arc::new(CountingFactory {
                created: AtomicUsize::new(0),
            }),
            2,
        ));
        let a = pool.acquire("m1", None).unwrap();
        let b = pool.acquire("m2", None).unwrap();
        assert_eq!(a.model_id(), "m1");
        assert_eq!(b.model_id(), "m2");
    }

    #[test]
    fn test_failed_create_releases_slot() {
        let pool = Arc::new(SynthesizerPool::new(Arc::new(FailingFactory), 1));
        assert!(pool.acquire("m", None).is_err());
        // The slot is free again; a second attempt errors rather than blocking
        assert!(pool.acquire("m", None).is_err());
    }

    #[test]
    fn test_blocking_checkout_wakes_on_release() {
        let pool = Arc::new(SynthesizerPool::new(
            Arc::new(CountingFactory {
                created: AtomicUsize::new(0),
            }),
            1,
        ));
        let held = pool.acquire("m", None).unwrap();
        let pool2 = Arc::clone(&pool);
        let waiter = std::thread::spawn(move || {
            let checkout = pool2.acquire("m", None).unwrap();
            checkout.model_id().to_string()
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap(), "m");
    }
}

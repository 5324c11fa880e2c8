//! Scriptable adapter doubles.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use server_core::kernel::publisher::{MediaFile, PublishReceipt, Publisher};
use server_core::AdapterError;

/// Publisher double. Scripted errors are consumed front-to-back; once the
/// script is empty every call succeeds with ids `T1`, `T2`, ...
#[derive(Default)]
pub struct MockPublisher {
    script: Mutex<VecDeque<Result<(), AdapterError>>>,
    successes: AtomicUsize,
    captions: Mutex<Vec<String>>,
}

impl MockPublisher {
    pub fn script_failure(&self, error: AdapterError) {
        self.script
            .lock()
            .expect("script lock")
            .push_back(Err(error));
    }

    pub fn script_success(&self) {
        self.script.lock().expect("script lock").push_back(Ok(()));
    }

    /// Captions seen so far, in call order.
    pub fn captions(&self) -> Vec<String> {
        self.captions.lock().expect("captions lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.captions.lock().expect("captions lock").len()
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(
        &self,
        caption: &str,
        _media: &MediaFile,
    ) -> Result<PublishReceipt, AdapterError> {
        self.captions
            .lock()
            .expect("captions lock")
            .push(caption.to_string());

        let next = self.script.lock().expect("script lock").pop_front();
        match next {
            Some(Err(error)) => Err(error),
            _ => {
                let n = self.successes.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(PublishReceipt {
                    post_id: format!("T{n}"),
                    duration_seconds: 0.05,
                })
            }
        }
    }
}

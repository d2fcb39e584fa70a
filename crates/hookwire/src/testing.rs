//! Recording agent used by the session and script unit tests

use crate::agent::{AgentMessage, AgentSessionApi, ScriptId, ScriptOptions};
use crate::{Error, Result};
use async_trait::async_trait;
use hookwire_proto::VariantDict;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
pub(crate) struct MockAgent {
    pub posts: Mutex<Vec<(Vec<AgentMessage>, u32)>>,
    pub failed_batches: Mutex<Vec<u32>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub post_delay: Mutex<Duration>,
    /// Number of upcoming posts to fail
    pub fail_posts: AtomicUsize,
    pub resume_calls: Mutex<Vec<u32>>,
    pub resume_reply: AtomicU32,
    pub close_calls: AtomicUsize,
    pub fail_close: AtomicBool,
    pub next_script_id: AtomicU32,
    pub loaded: Mutex<Vec<ScriptId>>,
    pub destroyed: Mutex<Vec<ScriptId>>,
    pub calls: Mutex<Vec<&'static str>>,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every delivered message text, in delivery order
    pub fn delivered_texts(&self) -> Vec<String> {
        self.posts
            .lock()
            .iter()
            .flat_map(|(messages, _)| messages.iter().map(|m| m.text.clone()))
            .collect()
    }

    pub fn batch_ids(&self) -> Vec<u32> {
        self.posts.lock().iter().map(|(_, id)| *id).collect()
    }

    pub async fn wait_for_batches(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.posts.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("batches were not delivered");
    }
}

#[async_trait]
impl AgentSessionApi for MockAgent {
    async fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(Error::Transport("Connection closed".to_string()));
        }
        Ok(())
    }

    async fn resume(&self, rx_batch_id: u32) -> Result<u32> {
        self.resume_calls.lock().push(rx_batch_id);
        Ok(self.resume_reply.load(Ordering::SeqCst))
    }

    async fn create_script(&self, _source: &str, _options: &ScriptOptions) -> Result<ScriptId> {
        Ok(ScriptId(self.next_script_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn destroy_script(&self, id: ScriptId) -> Result<()> {
        self.destroyed.lock().push(id);
        Ok(())
    }

    async fn load_script(&self, id: ScriptId) -> Result<()> {
        self.loaded.lock().push(id);
        Ok(())
    }

    async fn post_messages(&self, messages: Vec<AgentMessage>, batch_id: u32) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.post_delay.lock();
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .fail_posts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.failed_batches.lock().push(batch_id);
            return Err(Error::Transport("Connection reset".to_string()));
        }

        self.posts.lock().push((messages, batch_id));
        Ok(())
    }

    async fn offer_peer_connection(&self, offer_sdp: &str, _options: VariantDict) -> Result<String> {
        self.calls.lock().push("OfferPeerConnection");
        Ok(format!("answer-to:{}", offer_sdp))
    }

    async fn add_candidates(&self, _candidates: Vec<String>) -> Result<()> {
        self.calls.lock().push("AddCandidates");
        Ok(())
    }

    async fn notify_candidate_gathering_done(&self) -> Result<()> {
        self.calls.lock().push("NotifyCandidateGatheringDone");
        Ok(())
    }

    async fn begin_migration(&self) -> Result<()> {
        self.calls.lock().push("BeginMigration");
        Ok(())
    }

    async fn commit_migration(&self) -> Result<()> {
        self.calls.lock().push("CommitMigration");
        Ok(())
    }
}

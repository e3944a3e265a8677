//! Tool-call orchestrator
//!
//! Executes the operations the peer may invoke during a live turn. Every
//! call is acknowledged on the wire immediately; the slow work (deriving
//! listing artwork, persisting the record) runs as an unawaited background
//! task so the conversation never stalls behind it. In-flight bookkeeping
//! guarantees at-most-once finalization per item even when the peer
//! retries, re-asks, or loses interest.

use crate::events::{FinalizeResult, ToolCallRequest};
use crate::pipeline::{ListingPipeline, ListingRequest, ReferenceImage};
use crate::wire::ClientMessage;
use serde_json::{json, Map, Value};
use smallvec::SmallVec;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

pub const TOOL_CAPTURE: &str = "capture_item_photo";
pub const TOOL_FINALIZE: &str = "finalize_listing";
pub const TOOL_NEW_ITEM: &str = "new_item_detected";

/// Sliding window of reference photos kept per item.
const MAX_CAPTURES_PER_ITEM: usize = 9;

const ALLOWED_CONDITIONS: &[&str] = &["new", "like_new", "good", "fair", "poor"];
const DEFAULT_CONDITION: &str = "good";

const ALLOWED_CATEGORIES: &[&str] = &[
    "clothing",
    "electronics",
    "home",
    "toys",
    "books",
    "sports",
    "beauty",
    "collectibles",
    "other",
];
const DEFAULT_CATEGORY: &str = "other";

pub type FinalizeCallback = Arc<dyn Fn(FinalizeResult) + Send + Sync>;

/// Tool declarations advertised to the peer in the setup message.
pub fn tool_declarations() -> Value {
    json!([{
        "functionDeclarations": [
            {
                "name": TOOL_CAPTURE,
                "description": "Capture the current camera frame as a reference photo of the item being listed.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "description": {"type": "STRING", "description": "What this photo shows (angle, detail, flaw)."},
                        "item_ref": {"type": "STRING", "description": "Item this photo belongs to, if known."}
                    }
                }
            },
            {
                "name": TOOL_FINALIZE,
                "description": "Finalize the current item into a published listing.",
                "parameters": {
                    "type": "OBJECT",
                    "properties": {
                        "title": {"type": "STRING"},
                        "description": {"type": "STRING"},
                        "price": {"type": "NUMBER"},
                        "condition": {"type": "STRING", "description": "One of new, like_new, good, fair, poor."},
                        "brand": {"type": "STRING"},
                        "category": {"type": "STRING"},
                        "image_prompt": {"type": "STRING", "description": "Prompt for the derived listing artwork."},
                        "item_ref": {"type": "STRING"}
                    }
                }
            },
            {
                "name": TOOL_NEW_ITEM,
                "description": "Signal that the camera now shows a different item than the one being listed.",
                "parameters": {"type": "OBJECT", "properties": {}}
            }
        ]
    }])
}

#[derive(Debug, Clone)]
struct CapturedReference {
    jpeg: Vec<u8>,
    description: String,
    #[allow(dead_code)]
    captured_at: Instant,
}

#[derive(Debug, Default)]
struct CaptureGroup {
    images: SmallVec<[CapturedReference; MAX_CAPTURES_PER_ITEM]>,
}

impl CaptureGroup {
    fn push(&mut self, capture: CapturedReference) {
        self.images.push(capture);
        if self.images.len() > MAX_CAPTURES_PER_ITEM {
            self.images.remove(0);
        }
    }
}

/// Identity of one outstanding finalize operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InFlightKey {
    item_ref: String,
    call_id: String,
    title_hash: u64,
}

/// Finalize arguments after normalization. Validation never rejects:
/// incomplete remote input falls back to documented defaults so a listing
/// can always be finalized.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingDraft {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub condition: String,
    pub brand: Option<String>,
    pub category: String,
    pub image_prompt: String,
}

impl Default for ListingDraft {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            price: 0.0,
            condition: DEFAULT_CONDITION.to_string(),
            brand: None,
            category: DEFAULT_CATEGORY.to_string(),
            image_prompt: String::new(),
        }
    }
}

impl ListingDraft {
    pub fn from_args(args: &Map<String, Value>) -> Self {
        Self {
            title: str_arg(args, "title"),
            description: str_arg(args, "description"),
            price: price_arg(args),
            condition: enum_arg(args, "condition", ALLOWED_CONDITIONS, DEFAULT_CONDITION),
            brand: opt_str_arg(args, "brand"),
            category: enum_arg(args, "category", ALLOWED_CATEGORIES, DEFAULT_CATEGORY),
            image_prompt: str_arg(args, "image_prompt"),
        }
    }
}

fn str_arg(args: &Map<String, Value>, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn opt_str_arg(args: &Map<String, Value>, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn price_arg(args: &Map<String, Value>) -> f64 {
    let price = match args.get("price") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    };
    if price.is_finite() && price >= 0.0 {
        price
    } else {
        0.0
    }
}

fn enum_arg(args: &Map<String, Value>, key: &str, allowed: &[&str], default: &str) -> String {
    let raw = args
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default();
    if allowed.contains(&raw.as_str()) {
        raw
    } else {
        default.to_string()
    }
}

pub struct ToolOrchestrator {
    outbound: UnboundedSender<ClientMessage>,
    pipeline: Arc<dyn ListingPipeline>,
    finalize_cb: FinalizeCallback,

    /// Reference photos per item. Mutated only by this component, including
    /// the cleanup step of its own background tasks.
    groups: Arc<Mutex<HashMap<String, CaptureGroup>>>,
    in_flight: Arc<Mutex<HashSet<InFlightKey>>>,
    closed: Arc<AtomicBool>,

    current_item: Option<String>,
    /// Most recent frame forwarded by the pacer.
    last_frame: Option<Vec<u8>>,
}

impl ToolOrchestrator {
    pub fn new(
        outbound: UnboundedSender<ClientMessage>,
        pipeline: Arc<dyn ListingPipeline>,
        finalize_cb: FinalizeCallback,
    ) -> Self {
        Self {
            outbound,
            pipeline,
            finalize_cb,
            groups: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            closed: Arc::new(AtomicBool::new(false)),
            current_item: None,
            last_frame: None,
        }
    }

    /// Remember the latest frame the pacer put on the wire, so a capture
    /// tool call has something to grab.
    pub fn note_frame(&mut self, jpeg: Vec<u8>) {
        self.last_frame = Some(jpeg);
    }

    /// Handle one already-deduplicated tool call. The acknowledgment goes
    /// out before any slow work starts.
    pub fn handle(&mut self, req: ToolCallRequest) {
        match req.name.as_str() {
            TOOL_CAPTURE => self.handle_capture(&req),
            TOOL_FINALIZE => self.handle_finalize(&req),
            TOOL_NEW_ITEM => {
                let item_ref = self.begin_new_item();
                self.respond(&req, json!({ "itemRef": item_ref }));
            }
            other => {
                warn!(name = other, "peer invoked unregistered tool");
                self.respond(&req, json!({ "error": format!("unknown tool: {}", other) }));
            }
        }
    }

    /// Host-observed subject change: the camera shows a different item
    /// before the previous one was finalized. Finalization is never
    /// deferred waiting for more information — the previous item goes out
    /// with best-effort defaults, then a fresh capture group begins.
    pub fn begin_new_item(&mut self) -> String {
        if let Some(previous) = self.current_item.take() {
            info!(item = %previous, "new item detected, finalizing previous with defaults");
            self.spawn_finalize(previous, generated_call_id(), ListingDraft::default());
        }
        let fresh = generated_item_ref();
        self.groups
            .lock()
            .unwrap()
            .insert(fresh.clone(), CaptureGroup::default());
        self.current_item = Some(fresh.clone());
        fresh
    }

    /// Release all session-scoped bookkeeping. Background pipeline calls
    /// are not cancelled; their results are discarded on completion.
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.groups.lock().unwrap().clear();
        self.in_flight.lock().unwrap().clear();
        self.current_item = None;
        self.last_frame = None;
    }

    fn handle_capture(&mut self, req: &ToolCallRequest) {
        let frame = match self.last_frame.clone() {
            Some(f) => f,
            None => {
                warn!("capture requested before any frame reached the wire");
                self.respond(req, json!({ "error": "no camera frame available yet" }));
                return;
            }
        };

        let item_ref = self.resolve_item_ref(&req.args);
        let description = str_arg(&req.args, "description");

        let count = {
            let mut groups = self.groups.lock().unwrap();
            let group = groups.entry(item_ref.clone()).or_default();
            group.push(CapturedReference {
                jpeg: frame,
                description,
                captured_at: Instant::now(),
            });
            group.images.len()
        };

        debug!(item = %item_ref, count, "captured reference photo");
        self.respond(req, json!({ "itemRef": item_ref, "photoCount": count }));
    }

    fn handle_finalize(&mut self, req: &ToolCallRequest) {
        let draft = ListingDraft::from_args(&req.args);
        let item_ref = self.resolve_item_ref(&req.args);

        if self.item_in_flight(&item_ref) {
            debug!(item = %item_ref, "finalize already in flight, skipping duplicate");
            self.respond(
                req,
                json!({ "status": "already_processing", "itemRef": item_ref }),
            );
            return;
        }

        // Ack first so the peer's turn is never blocked on the pipeline.
        self.respond(req, json!({ "status": "processing", "itemRef": item_ref }));

        let call_id = if req.id.is_empty() {
            generated_call_id()
        } else {
            req.id.clone()
        };
        self.spawn_finalize(item_ref, call_id, draft);
    }

    fn spawn_finalize(&mut self, item_ref: String, call_id: String, draft: ListingDraft) {
        let key = InFlightKey {
            item_ref: item_ref.clone(),
            call_id,
            title_hash: hash_str(&draft.title),
        };
        self.in_flight.lock().unwrap().insert(key.clone());
        if self.current_item.as_deref() == Some(item_ref.as_str()) {
            self.current_item = None;
        }

        let reference_images: Vec<ReferenceImage> = self
            .groups
            .lock()
            .unwrap()
            .get(&item_ref)
            .map(|group| {
                group
                    .images
                    .iter()
                    .map(|c| ReferenceImage {
                        bytes: c.jpeg.clone(),
                        description: c.description.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let request = ListingRequest {
            reference_images,
            title: draft.title,
            description: draft.description,
            price: draft.price,
            condition: draft.condition,
            brand: draft.brand,
            category: draft.category,
            image_prompt: draft.image_prompt,
        };

        let pipeline = Arc::clone(&self.pipeline);
        let groups = Arc::clone(&self.groups);
        let in_flight = Arc::clone(&self.in_flight);
        let closed = Arc::clone(&self.closed);
        let finalize_cb = Arc::clone(&self.finalize_cb);

        info!(item = %item_ref, "starting background finalize");
        tokio::spawn(async move {
            let outcome = pipeline.create_listing(request).await;

            // Guaranteed cleanup, success or failure.
            in_flight.lock().unwrap().remove(&key);
            groups.lock().unwrap().remove(&item_ref);

            if closed.load(Ordering::SeqCst) {
                debug!(item = %item_ref, "session closed, discarding finalize result");
                return;
            }

            if outcome.success {
                info!(item = %item_ref, listing = ?outcome.listing_id, "finalize completed");
            } else {
                warn!(item = %item_ref, error = ?outcome.error, "finalize failed");
            }
            finalize_cb(FinalizeResult {
                item_ref: item_ref.clone(),
                success: outcome.success,
                listing_id: outcome.listing_id,
                artifact_url: outcome.artifact_url,
                error: outcome.error,
            });
        });
    }

    fn resolve_item_ref(&mut self, args: &Map<String, Value>) -> String {
        if let Some(explicit) = opt_str_arg(args, "item_ref") {
            self.current_item = Some(explicit.clone());
            return explicit;
        }
        if let Some(current) = &self.current_item {
            return current.clone();
        }
        let fresh = generated_item_ref();
        self.current_item = Some(fresh.clone());
        fresh
    }

    fn item_in_flight(&self, item_ref: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap()
            .iter()
            .any(|k| k.item_ref == item_ref)
    }

    fn respond(&self, req: &ToolCallRequest, payload: Value) {
        let msg = ClientMessage::tool_response(&req.id, &req.name, payload);
        if self.outbound.send(msg).is_err() {
            debug!("dropping tool response, session outbound closed");
        }
    }
}

fn generated_item_ref() -> String {
    format!("item-{:08x}", rand::random::<u32>())
}

fn generated_call_id() -> String {
    format!("auto-{:08x}", rand::random::<u32>())
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ListingOutcome;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio::sync::Notify;

    struct RecordingPipeline {
        requests: Mutex<Vec<ListingRequest>>,
        gate: Option<Arc<Notify>>,
    }

    impl RecordingPipeline {
        fn immediate() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                gate: None,
            })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                gate: Some(gate),
            })
        }

        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ListingPipeline for RecordingPipeline {
        async fn create_listing(&self, request: ListingRequest) -> ListingOutcome {
            self.requests.lock().unwrap().push(request);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            ListingOutcome::ok("listing-1", "https://example.test/art.png")
        }
    }

    struct Harness {
        orch: ToolOrchestrator,
        pipeline: Arc<RecordingPipeline>,
        wire_rx: UnboundedReceiver<ClientMessage>,
        results_rx: UnboundedReceiver<FinalizeResult>,
    }

    fn harness(pipeline: Arc<RecordingPipeline>) -> Harness {
        let (wire_tx, wire_rx) = unbounded_channel();
        let (results_tx, results_rx) = unbounded_channel();
        let cb: FinalizeCallback = Arc::new(move |result| {
            let _ = results_tx.send(result);
        });
        Harness {
            orch: ToolOrchestrator::new(wire_tx, pipeline.clone() as Arc<dyn ListingPipeline>, cb),
            pipeline,
            wire_rx,
            results_rx,
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            args: args.as_object().cloned().unwrap_or_default(),
        }
    }

    fn response_payload(msg: &ClientMessage) -> Value {
        match msg {
            ClientMessage::ToolResponse { tool_response } => {
                tool_response["functionResponses"][0]["response"].clone()
            }
            other => panic!("expected tool response, got {:?}", other),
        }
    }

    async fn recv_result(rx: &mut UnboundedReceiver<FinalizeResult>) -> FinalizeResult {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for finalize result")
            .expect("result channel closed")
    }

    #[tokio::test]
    async fn unknown_tool_gets_immediate_failure() {
        let mut h = harness(RecordingPipeline::immediate());
        h.orch.handle(call("c1", "set_thrusters", json!({})));

        let payload = response_payload(&h.wire_rx.recv().await.unwrap());
        assert!(payload["error"].as_str().unwrap().contains("unknown tool"));
        assert_eq!(h.pipeline.count(), 0);
    }

    #[tokio::test]
    async fn capture_without_frame_fails_softly() {
        let mut h = harness(RecordingPipeline::immediate());
        h.orch.handle(call("c1", TOOL_CAPTURE, json!({})));

        let payload = response_payload(&h.wire_rx.recv().await.unwrap());
        assert!(payload.get("error").is_some());
    }

    #[tokio::test]
    async fn capture_group_is_a_sliding_window() {
        let mut h = harness(RecordingPipeline::immediate());
        h.orch.note_frame(vec![0xFF; 16]);

        for i in 0..11 {
            h.orch.handle(call(
                &format!("c{}", i),
                TOOL_CAPTURE,
                json!({"item_ref": "item-a", "description": format!("angle {}", i)}),
            ));
        }

        let mut last_count = 0;
        for _ in 0..11 {
            let payload = response_payload(&h.wire_rx.recv().await.unwrap());
            last_count = payload["photoCount"].as_u64().unwrap();
        }
        assert_eq!(last_count as usize, MAX_CAPTURES_PER_ITEM);
    }

    #[tokio::test]
    async fn finalize_applies_fallback_defaults() {
        let mut h = harness(RecordingPipeline::immediate());
        // Missing condition and price entirely, bogus category.
        h.orch.handle(call(
            "c1",
            TOOL_FINALIZE,
            json!({"title": "Vintage lamp", "category": "antigravity"}),
        ));

        let result = recv_result(&mut h.results_rx).await;
        assert!(result.success);

        let requests = h.pipeline.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].condition, "good");
        assert_eq!(requests[0].price, 0.0);
        assert_eq!(requests[0].category, "other");
        assert_eq!(requests[0].title, "Vintage lamp");
    }

    #[tokio::test]
    async fn second_finalize_for_same_item_is_skipped_while_first_runs() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(RecordingPipeline::gated(gate.clone()));

        h.orch
            .handle(call("c1", TOOL_FINALIZE, json!({"item_ref": "item-a", "title": "First"})));
        // Give the background task a chance to reach the pipeline.
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.orch
            .handle(call("c2", TOOL_FINALIZE, json!({"item_ref": "item-a", "title": "Second"})));

        let first = response_payload(&h.wire_rx.recv().await.unwrap());
        assert_eq!(first["status"], "processing");
        let second = response_payload(&h.wire_rx.recv().await.unwrap());
        assert_eq!(second["status"], "already_processing");

        gate.notify_one();
        let result = recv_result(&mut h.results_rx).await;
        assert_eq!(result.item_ref, "item-a");
        assert_eq!(h.pipeline.count(), 1);
    }

    #[tokio::test]
    async fn finalize_releases_bookkeeping_after_completion() {
        let mut h = harness(RecordingPipeline::immediate());
        h.orch.note_frame(vec![1, 2, 3]);
        h.orch
            .handle(call("c1", TOOL_CAPTURE, json!({"item_ref": "item-a"})));
        h.orch
            .handle(call("c2", TOOL_FINALIZE, json!({"item_ref": "item-a", "title": "Lamp"})));

        let result = recv_result(&mut h.results_rx).await;
        assert!(result.success);
        assert!(h.orch.in_flight.lock().unwrap().is_empty());
        assert!(h.orch.groups.lock().unwrap().get("item-a").is_none());

        // A fresh finalize for the same item is allowed again.
        h.orch
            .handle(call("c3", TOOL_FINALIZE, json!({"item_ref": "item-a", "title": "Lamp"})));
        let result = recv_result(&mut h.results_rx).await;
        assert!(result.success);
        assert_eq!(h.pipeline.count(), 2);
    }

    #[tokio::test]
    async fn finalize_carries_captured_reference_images() {
        let mut h = harness(RecordingPipeline::immediate());
        h.orch.note_frame(vec![0xAB; 8]);
        h.orch.handle(call(
            "c1",
            TOOL_CAPTURE,
            json!({"item_ref": "item-a", "description": "front"}),
        ));
        h.orch
            .handle(call("c2", TOOL_FINALIZE, json!({"item_ref": "item-a", "title": "Lamp"})));

        recv_result(&mut h.results_rx).await;
        let requests = h.pipeline.requests.lock().unwrap();
        assert_eq!(requests[0].reference_images.len(), 1);
        assert_eq!(requests[0].reference_images[0].description, "front");
    }

    #[tokio::test]
    async fn new_item_finalizes_previous_with_defaults() {
        let mut h = harness(RecordingPipeline::immediate());
        h.orch.note_frame(vec![0xCD; 8]);
        h.orch
            .handle(call("c1", TOOL_CAPTURE, json!({"item_ref": "item-a"})));

        h.orch.handle(call("c2", TOOL_NEW_ITEM, json!({})));

        let result = recv_result(&mut h.results_rx).await;
        assert_eq!(result.item_ref, "item-a");

        let requests = h.pipeline.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].condition, "good");
        assert_eq!(requests[0].price, 0.0);
        assert_eq!(requests[0].reference_images.len(), 1);
    }

    #[tokio::test]
    async fn results_after_close_are_discarded() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(RecordingPipeline::gated(gate.clone()));

        h.orch
            .handle(call("c1", TOOL_FINALIZE, json!({"item_ref": "item-a", "title": "Lamp"})));
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.orch.close();
        gate.notify_one();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.results_rx.try_recv().is_err());
        // The pipeline still ran to completion; only the result was dropped.
        assert_eq!(h.pipeline.count(), 1);
    }

    #[test]
    fn draft_normalization_accepts_messy_input() {
        let args = json!({
            "title": "Chair",
            "price": "49.5",
            "condition": "LIKE_NEW",
            "brand": "",
            "category": "Electronics"
        });
        let draft = ListingDraft::from_args(args.as_object().unwrap());
        assert_eq!(draft.price, 49.5);
        assert_eq!(draft.condition, "like_new");
        assert_eq!(draft.brand, None);
        assert_eq!(draft.category, "electronics");
    }

    #[test]
    fn draft_normalization_rejects_nothing() {
        let args = json!({"price": -12.0, "condition": "mint", "category": 7});
        let draft = ListingDraft::from_args(args.as_object().unwrap());
        assert_eq!(draft.price, 0.0);
        assert_eq!(draft.condition, "good");
        assert_eq!(draft.category, "other");
        assert_eq!(draft.title, "");
    }
}

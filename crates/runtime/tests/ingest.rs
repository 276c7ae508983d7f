//! End-to-end ingest scenarios over the in-memory queue and graph, with a
//! scripted LLM driving every model stage.

use std::sync::Arc;

use serde_json::json;

use vestige_config::AppConfig;
use vestige_graph::{GraphBuilder, GraphStore, MemoryGraph};
use vestige_llm::fake::FakeLlm;
use vestige_llm::LlmService;
use vestige_nlp::NlpPipeline;
use vestige_queue::{keys, MemoryQueue, Queue};
use vestige_resolver::{EntityResolver, HashEmbedder, Resolution};
use vestige_runtime::{DlqEntry, IngestContext};

struct Harness {
    llm: Arc<FakeLlm>,
    queue: Arc<dyn Queue>,
    store: Arc<MemoryGraph>,
    resolver: Arc<EntityResolver>,
    ctx: IngestContext,
    builder: GraphBuilder,
}

async fn harness() -> Harness {
    let mut cfg = AppConfig::default();
    cfg.user.user_name = "Yinka".to_string();

    let llm = Arc::new(FakeLlm::new());
    let queue: Arc<dyn Queue> = Arc::new(MemoryQueue::new());
    let store = Arc::new(MemoryGraph::new());
    let resolver = Arc::new(EntityResolver::new(
        Arc::new(HashEmbedder::new(cfg.resolver.embedding_dim)),
        cfg.resolver.clone(),
    ));
    let nlp = Arc::new(NlpPipeline::new(llm.clone() as Arc<dyn LlmService>));

    let ctx = IngestContext::bootstrap(
        cfg,
        queue.clone(),
        store.clone() as Arc<dyn GraphStore>,
        llm.clone() as Arc<dyn LlmService>,
        resolver.clone(),
        nlp,
    )
    .await
    .expect("bootstrap");

    let builder = GraphBuilder::new(queue.clone(), store.clone() as Arc<dyn GraphStore>);
    // Land the seeded user entity in the store so batch-time hydration
    // keeps the root node.
    builder.drain_available().await.expect("seed drain");

    Harness {
        llm,
        queue,
        store,
        resolver,
        ctx,
        builder,
    }
}

fn script_batch(
    llm: &FakeLlm,
    ner: serde_json::Value,
    resolution_block: &str,
    entries: serde_json::Value,
    connections_block: &str,
    message_results: serde_json::Value,
) {
    llm.push_structured(Some(ner));
    llm.push_reasoning(Some(resolution_block));
    llm.push_structured(Some(entries));
    llm.push_reasoning(Some(connections_block));
    llm.push_structured(Some(message_results));
}

#[tokio::test]
async fn fresh_user_single_message_builds_two_entities_and_one_edge() {
    let h = harness().await;

    script_batch(
        &h.llm,
        json!({"entities": [
            {"name": "Priya", "label": "person", "topic": "General"},
            {"name": "IronWorks", "label": "organization", "topic": "General"}
        ]}),
        "<resolution>\nNEW_SINGLE | Priya\nNEW_SINGLE | IronWorks\n</resolution>",
        json!({"entries": [
            {"verdict": "NEW_SINGLE", "mentions": ["Priya"], "entity_type": "person", "canonical_name": "Priya", "topic": "General"},
            {"verdict": "NEW_SINGLE", "mentions": ["IronWorks"], "entity_type": "organization", "canonical_name": "IronWorks", "topic": "General"}
        ]}),
        "<connections>\nMSG 1 | IronWorks, Priya | met there today\n</connections>",
        json!({"message_results": [
            {"message_id": 1, "entity_pairs": [
                {"entity_a": "IronWorks", "entity_b": "Priya", "confidence": 0.9, "reason": "met there"}
            ]}
        ]}),
    );

    let msg_id = h.ctx.add_message("Met Priya at IronWorks today.").await.unwrap();
    assert_eq!(msg_id, 1);

    h.ctx.process_batch().await.unwrap();
    h.ctx.shutdown().await.unwrap();
    h.builder.drain_available().await.unwrap();

    let priya = h.store.get_entity_profile("Priya").await.unwrap().unwrap();
    assert_eq!(priya.entity_type, "person");
    let ironworks = h.store.get_entity_profile("IronWorks").await.unwrap().unwrap();
    assert_eq!(ironworks.entity_type, "organization");

    let related = h
        .store
        .get_related_entities(&["Priya".to_string()], true)
        .await
        .unwrap();
    let edge = related.iter().find(|c| c.target == "IronWorks").unwrap();
    assert!(edge.confidence >= 0.8);
    assert_eq!(edge.evidence_ids, vec!["msg_1"]);
}

#[tokio::test]
async fn alias_introduction_resolves_to_the_same_entity() {
    let h = harness().await;

    // Batch 1: Chloe enters the graph.
    script_batch(
        &h.llm,
        json!({"entities": [{"name": "Chloe", "label": "person", "topic": "General"}]}),
        "<resolution>\nNEW_SINGLE | Chloe\n</resolution>",
        json!({"entries": [
            {"verdict": "NEW_SINGLE", "mentions": ["Chloe"], "entity_type": "person", "canonical_name": "Chloe", "topic": "General"}
        ]}),
        "<connections>\nMSG 1 | NO CONNECTIONS\n</connections>",
        json!({"message_results": [{"message_id": 1, "entity_pairs": []}]}),
    );
    h.ctx.add_message("My roommate Chloe is great.").await.unwrap();
    h.ctx.process_batch().await.unwrap();
    // Let the fire-and-forget profile task drain against the empty script
    // queue before batch 2 is scripted.
    h.ctx.shutdown().await.unwrap();
    h.builder.drain_available().await.unwrap();

    let chloe_id = h.resolver.get_id("Chloe").expect("chloe registered");

    // Batch 2: the nickname arrives.
    script_batch(
        &h.llm,
        json!({"entities": [
            {"name": "Chloe", "label": "person", "topic": "General"},
            {"name": "Chlo", "label": "person", "topic": "General"}
        ]}),
        "<resolution>\nEXISTING | Chloe\n</resolution>",
        json!({"entries": [
            {"verdict": "EXISTING", "mentions": ["Chloe", "Chlo"], "entity_type": "person", "canonical_name": "Chloe", "topic": "General"}
        ]}),
        "<connections>\nMSG 2 | NO CONNECTIONS\n</connections>",
        json!({"message_results": [{"message_id": 2, "entity_pairs": []}]}),
    );
    h.ctx.add_message("Chloe (Chlo) baked cookies.").await.unwrap();
    h.ctx.process_batch().await.unwrap();
    h.ctx.shutdown().await.unwrap();
    h.builder.drain_available().await.unwrap();

    match h.resolver.resolve("Chlo", "cookies") {
        Resolution::Resolved(c) => assert_eq!(c.id, chloe_id),
        other => panic!("expected resolved, got {other:?}"),
    }

    let profile = h.store.get_entity_profile("Chloe").await.unwrap().unwrap();
    assert!(profile.aliases.contains(&"Chlo".to_string()));
    assert_eq!(profile.entity_type, "person");
}

#[tokio::test]
async fn failed_relationship_stage_dead_letters_the_batch() {
    let h = harness().await;

    h.llm.push_structured(Some(json!({"entities": [
        {"name": "Priya", "label": "person", "topic": "General"}
    ]})));
    h.llm
        .push_reasoning(Some("<resolution>\nNEW_SINGLE | Priya\n</resolution>"));
    h.llm.push_structured(Some(json!({"entries": [
        {"verdict": "NEW_SINGLE", "mentions": ["Priya"], "entity_type": "person", "canonical_name": "Priya", "topic": "General"}
    ]})));
    // Relationship reasoning fails outright.
    h.llm.push_reasoning(None);

    h.ctx.add_message("Priya texted me about the meet.").await.unwrap();
    h.ctx.process_batch().await.unwrap();

    let dlq = h
        .queue
        .lrange(&keys::dlq("Yinka"), 0, -1)
        .await
        .unwrap();
    assert_eq!(dlq.len(), 1);
    let entry: DlqEntry = serde_json::from_str(&dlq[0]).unwrap();
    assert!(entry.error.contains("relationship extraction"));
    assert_eq!(entry.batch_size, 1);
    assert_eq!(entry.messages[0].message, "Priya texted me about the meet.");

    // Nothing was published for the failed batch.
    let drained = h.builder.drain_available().await.unwrap();
    assert_eq!(drained, 0);
}

#[tokio::test]
async fn no_mention_batch_publishes_nothing_and_skips_llm_stages() {
    let h = harness().await;

    h.llm.push_structured(Some(json!({"entities": []})));
    h.ctx.add_message("just rambling to myself").await.unwrap();
    h.ctx.process_batch().await.unwrap();

    assert_eq!(
        h.llm
            .reasoning_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
    assert_eq!(h.builder.drain_available().await.unwrap(), 0);
    // The buffer is empty either way.
    assert_eq!(h.queue.llen(&keys::buffer("Yinka")).await.unwrap(), 0);
}

#[tokio::test]
async fn every_processed_message_gets_exactly_one_structure_record() {
    let h = harness().await;

    // Structured responses pop FIFO: NER for message 1, NER for message 2,
    // then the two formatter stages.
    h.llm.push_structured(Some(
        json!({"entities": [{"name": "Marcus", "label": "person", "topic": "General"}]}),
    ));
    h.llm.push_structured(Some(json!({"entities": []})));
    h.llm
        .push_reasoning(Some("<resolution>\nNEW_SINGLE | Marcus\n</resolution>"));
    h.llm.push_structured(Some(json!({"entries": [
        {"verdict": "NEW_SINGLE", "mentions": ["Marcus"], "entity_type": "person", "canonical_name": "Marcus", "topic": "General"}
    ]})));
    h.llm.push_reasoning(Some(
        "<connections>\nMSG 1 | Marcus, Yinka | trained together\nMSG 2 | NO CONNECTIONS\n</connections>",
    ));
    h.llm.push_structured(Some(json!({"message_results": [
        {"message_id": 1, "entity_pairs": [
            {"entity_a": "Marcus", "entity_b": "Yinka", "confidence": 0.9, "reason": "trained together"}
        ]},
        {"message_id": 2, "entity_pairs": []}
    ]})));

    h.ctx.add_message("Trained with Marcus this morning.").await.unwrap();
    h.ctx.add_message("Feeling good about the week.").await.unwrap();
    h.ctx.process_batch().await.unwrap();
    h.ctx.shutdown().await.unwrap();

    // Two messages → two USER_MESSAGE records, ascending ids.
    h.queue
        .ensure_group(keys::STREAM_STRUCTURE, "probe")
        .await
        .unwrap();
    let entries = h
        .queue
        .read_group(
            "probe",
            "t",
            &[keys::STREAM_STRUCTURE.to_string()],
            100,
            std::time::Duration::from_millis(10),
        )
        .await
        .unwrap();

    let records: Vec<vestige_graph::BatchRecord> = entries
        .iter()
        .map(|e| vestige_graph::BatchRecord::from_json(&e.payload).unwrap())
        .filter(|r| r.kind == vestige_graph::RecordKind::UserMessage)
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].message_id, 1);
    assert_eq!(records[1].message_id, 2);
    assert_eq!(records[0].relationships.len(), 1);
    assert!(records[1].relationships.is_empty());

    // The user self-edge landed with the Marcus entity.
    h.builder.drain_available().await.unwrap();
    let related = h
        .store
        .get_related_entities(&["Marcus".to_string()], true)
        .await
        .unwrap();
    assert_eq!(related[0].target, "Yinka");
}

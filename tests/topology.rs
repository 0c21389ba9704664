use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use topoweave::{
  ConnDir, ConnectionConfig, Context, InMemoryStateStorage, InputConstraints, NodeConfig, NodeState,
  Processor, Result, Sink, Source, StateStorage, Topology, TopologyConfig, TopologyError, Tuple,
  Writer,
};

const WAIT: Duration = Duration::from_secs(5);

// A source emitting a fixed list of words
struct Words(Vec<&'static str>);

#[async_trait]
impl Source for Words {
  async fn generate_stream(&self, ctx: &Context, writer: &dyn Writer) -> Result<()> {
    for word in &self.0 {
      writer.write(ctx, Tuple::from_value(json!(word))).await?;
    }
    Ok(())
  }
}

// Counts words per input and persists the counts on termination
struct Counter {
  counts: Mutex<BTreeMap<String, u64>>,
  storage: Arc<dyn StateStorage>,
}

#[async_trait]
impl Processor for Counter {
  async fn process(&self, ctx: &Context, tuple: Tuple, writer: &dyn Writer) -> Result<()> {
    let word = tuple
      .get("value")
      .and_then(|v| v.as_str())
      .ok_or_else(|| TopologyError::processing("not a word"))?
      .to_string();
    let count = {
      let mut counts = self.counts.lock().unwrap();
      let count = counts.entry(format!("{}:{}", tuple.input_name, word)).or_default();
      *count += 1;
      *count
    };
    let mut out = Tuple::from_value(json!({ "word": word, "count": count }));
    out.timestamp = tuple.timestamp;
    writer.write(ctx, out).await
  }

  fn input_constraints(&self) -> Option<InputConstraints> {
    Some(InputConstraints::new(["left", "right"]))
  }

  async fn terminate(&self, ctx: &Context) -> Result<()> {
    let counts = serde_json::to_vec(&*self.counts.lock().unwrap())
      .map_err(TopologyError::fatal)?;
    let mut w = self.storage.save(ctx.topology_name(), "counts")?;
    w.write_all(&counts)?;
    w.commit()
  }

  fn status(&self) -> Option<serde_json::Value> {
    Some(json!({ "distinct": self.counts.lock().unwrap().len() }))
  }
}

#[derive(Clone, Default)]
struct Collect(Arc<Mutex<Vec<Tuple>>>);

#[async_trait]
impl Sink for Collect {
  async fn write(&self, _ctx: &Context, tuple: Tuple) -> Result<()> {
    self.0.lock().unwrap().push(tuple);
    Ok(())
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn fan_in_fan_out_pipeline() {
  let storage = Arc::new(InMemoryStateStorage::new());
  let t = Topology::new("words", TopologyConfig::default()).unwrap();
  t.add_source("left_src", Words(vec!["a", "b", "a"]), NodeConfig::default())
    .unwrap();
  t.add_source("right_src", Words(vec!["a", "c"]), NodeConfig::default())
    .unwrap();
  let counter = t
    .add_box(
      "counter",
      Counter {
        counts: Mutex::new(BTreeMap::new()),
        storage: storage.clone(),
      },
      NodeConfig::default(),
    )
    .unwrap();
  let (one, two) = (Collect::default(), Collect::default());
  t.add_sink("one", one.clone(), NodeConfig::default()).unwrap();
  t.add_sink("two", two.clone(), NodeConfig::default()).unwrap();

  t.connect("left_src", "counter", &ConnectionConfig::default().with_input_name("left"))
    .unwrap();
  t.connect("right_src", "counter", &ConnectionConfig::default().with_input_name("right"))
    .unwrap();
  t.connect("counter", "one", &ConnectionConfig::default()).unwrap();
  t.connect("counter", "two", &ConnectionConfig::default().with_capacity(1))
    .unwrap();
  assert!(matches!(
    t.connect("left_src", "counter", &ConnectionConfig::default().with_input_name("middle")),
    Err(TopologyError::Validation(_))
  ));

  // Both sources finish on their own; the counter follows once both are gone.
  counter.stop_on_disconnect(ConnDir::INBOUND).await;
  t.start().unwrap();
  timeout(WAIT, counter.wait(NodeState::Stopped)).await.unwrap();
  assert!(counter.run_error().is_none());
  timeout(WAIT, t.stop()).await.unwrap();

  for sink in [&one, &two] {
    let got = sink.0.lock().unwrap();
    assert_eq!(got.len(), 5);
    assert!(got.iter().all(|t| t.input_name == "*"));
  }

  let mut saved = String::new();
  storage
    .load("words", "counts")
    .unwrap()
    .read_to_string(&mut saved)
    .unwrap();
  let counts: BTreeMap<String, u64> = serde_json::from_str(&saved).unwrap();
  assert_eq!(counts["left:a"], 2);
  assert_eq!(counts["left:b"], 1);
  assert_eq!(counts["right:a"], 1);
  assert_eq!(counts["right:c"], 1);

  let status = t.status();
  assert_eq!(status.state, NodeState::Stopped);
  let counter_status = &status.nodes["counter"];
  assert_eq!(counter_status.unit.as_ref().unwrap()["distinct"], 4);
  assert_eq!(counter_status.input_stats.as_ref().unwrap().num_received_total, 5);
}

//! Integration tests for the scheduler: pipelines, barrier joins, forking,
//! on-demand restart, persistence reuse, and failure semantics.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use cairn_engine::{EngineError, RunConfig, Scheduler};
use cairn_node::{GroupMode, InputSpec, Item, NodeDefinition, NodeError};
use cairn_stream::{Header, MsgData, Setid, StreamError};

fn setid() -> Setid {
  Setid::from_u128(0xfeed_f00d_dead_beef)
}

fn run(nodes: &[Arc<NodeDefinition>]) -> (Scheduler, cairn_engine::RunReport) {
  run_with(nodes, RunConfig::default())
}

fn run_with(
  nodes: &[Arc<NodeDefinition>],
  config: RunConfig,
) -> (Scheduler, cairn_engine::RunReport) {
  let mut scheduler = Scheduler::new(setid(), config).expect("scheduler");
  let report = scheduler
    .run(nodes, &CancellationToken::new())
    .expect("run failed");
  (scheduler, report)
}

/// `root(offset)` pushes `10 + offset, 20 + offset`.
fn root_node(offset: i64) -> Arc<NodeDefinition> {
  NodeDefinition::builder("demo", "root")
    .output_schema("i64")
    .input_value("offset", json!(offset))
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let offset = inputs.value("offset")?.as_i64().unwrap_or(0);
        ctx.push(json!(10 + offset)).await?;
        ctx.push(json!(20 + offset)).await?;
        Ok(())
      })
    })
    .build()
}

/// `square` pushes the square of every upstream value.
fn square_node(source: &Arc<NodeDefinition>) -> Arc<NodeDefinition> {
  NodeDefinition::builder("demo", "square")
    .output_schema("i64")
    .input_node("source", source)
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let source = inputs.stream("source")?.clone();
        while let Some(item) = ctx.pull(&source).await? {
          if let Item::Value(value) = item {
            let v = value.as_i64().unwrap_or(0);
            ctx.push(json!(v * v)).await?;
          }
        }
        Ok(())
      })
    })
    .build()
}

#[test]
fn test_pipeline_with_barrier_join() {
  let root = root_node(0);
  let root5 = root
    .clone_with([("offset".to_string(), InputSpec::Value(json!(5)))])
    .unwrap();
  let square = square_node(&root);
  let add = NodeDefinition::builder("demo", "add")
    .output_schema("i64")
    .input_node("a", &root)
    .input_node("b", &root5)
    .input_node("c", &square)
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let streams = [
          inputs.stream("a")?.clone(),
          inputs.stream("b")?.clone(),
          inputs.stream("c")?.clone(),
        ];
        while let Some(items) = ctx.pull_all(&streams).await? {
          // The reply list is never partial: one slot per handle.
          assert_eq!(items.len(), 3);
          let sum: i64 = items
            .iter()
            .filter_map(|slot| match slot {
              Some(Item::Value(value)) => value.as_i64(),
              _ => None,
            })
            .sum();
          ctx.push(json!(sum)).await?;
        }
        Ok(())
      })
    })
    .build();

  let (scheduler, report) = run(&[root.clone(), square.clone(), add.clone()]);

  // root, root5 (materialized dependency), square, add.
  assert_eq!(report.finished.len(), 4);
  assert_eq!(
    scheduler.payload_values(&root.default_stream(setid())).unwrap(),
    vec![json!(10), json!(20)]
  );
  assert_eq!(
    scheduler.payload_values(&root5.default_stream(setid())).unwrap(),
    vec![json!(15), json!(25)]
  );
  assert_eq!(
    scheduler.payload_values(&square.default_stream(setid())).unwrap(),
    vec![json!(100), json!(400)]
  );
  assert_eq!(
    scheduler.payload_values(&add.default_stream(setid())).unwrap(),
    vec![json!(125), json!(445)]
  );
}

#[test]
fn test_header_and_enumerated_pull() {
  let source = NodeDefinition::builder("demo", "scans")
    .output_schema("f64")
    .routine(|ctx, _inputs| {
      Box::pin(async move {
        ctx
          .set_header(Header::new().with("topic", json!("/scan")))
          .await?;
        ctx.push(json!(1.5)).await?;
        ctx.push(json!(2.5)).await?;
        Ok(())
      })
    })
    .build();

  let counts = Rc::new(RefCell::new(Vec::new()));
  let sink = counts.clone();
  let source_def = source.clone();
  let reader = NodeDefinition::builder("demo", "reader")
    .input_node("scans", &source)
    .routine(move |ctx, inputs| {
      let sink = sink.clone();
      let source_def = source_def.clone();
      Box::pin(async move {
        let info = ctx.get_stream(&source_def, None).await?;
        assert_eq!(info.header.get("topic").unwrap(), &json!("/scan"));
        assert!(info.header.get("fooBar").is_err());

        let handle = inputs.stream("scans")?.clone();
        while let Some((count, _item)) = ctx.pull_enumerated(&handle).await? {
          sink.borrow_mut().push(count);
        }
        Ok(())
      })
    })
    .build();

  run(&[reader]);
  assert_eq!(*counts.borrow(), vec![1, 2]);
}

#[test]
fn test_foreach_forks_one_task_per_message() {
  let topics = NodeDefinition::builder("demo", "topics")
    .output_schema("str")
    .routine(|ctx, _inputs| {
      Box::pin(async move {
        for topic in ["gps", "imu", "cam"] {
          ctx.push(json!(topic)).await?;
        }
        Ok(())
      })
    })
    .build();

  let per_topic = NodeDefinition::builder("demo", "per_topic")
    .output_schema("str")
    .foreach_node("topic", &topics)
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let topic = inputs.value("topic")?.as_str().unwrap_or("").to_string();
        ctx.push(json!(format!("{topic}-summary"))).await?;
        Ok(())
      })
    })
    .build();

  let (scheduler, report) = run(&[per_topic.clone()]);

  // topics + the forking node + 3 forked sub-tasks.
  assert_eq!(report.finished.len(), 5);

  let parent = per_topic.default_stream(setid());
  let msgs = scheduler.cached_messages(&parent).unwrap();
  let announced: Vec<String> = msgs
    .iter()
    .filter_map(|m| match &m.data {
      MsgData::Handle(info) if m.idx >= 0 => Some(info.handle.name.clone()),
      _ => None,
    })
    .collect();
  assert_eq!(announced, vec!["0", "1", "2"]);
  assert!(msgs.last().unwrap().is_end());

  for (name, topic) in [("0", "gps"), ("1", "imu"), ("2", "cam")] {
    let values = scheduler.payload_values(&parent.sub(name)).unwrap();
    assert_eq!(values, vec![json!(format!("{topic}-summary"))]);
  }
}

#[test]
fn test_ondemand_group_restarts_on_grown_demand() {
  let invocations = Rc::new(Cell::new(0u32));
  let calls = invocations.clone();
  let bands = NodeDefinition::builder("demo", "bands")
    .group(GroupMode::OnDemand)
    .routine(move |ctx, _inputs| {
      let calls = calls.clone();
      Box::pin(async move {
        calls.set(calls.get() + 1);
        let names = ctx.get_requested().await?;
        for name in &names {
          ctx.create_stream(name, false, Header::new()).await?;
        }
        for i in 0..2 {
          for name in &names {
            ctx.push_to(name, json!(format!("{name}{i}"))).await?;
          }
        }
        Ok(())
      })
    })
    .build();

  let seen_a = Rc::new(RefCell::new(Vec::new()));
  let sink_a = seen_a.clone();
  let first = NodeDefinition::builder("demo", "first")
    .input_sub_stream("src", &bands, "a")
    .routine(move |ctx, inputs| {
      let sink = sink_a.clone();
      Box::pin(async move {
        let src = inputs.stream("src")?.clone();
        while let Some(item) = ctx.pull(&src).await? {
          if let Item::Value(value) = item {
            sink.borrow_mut().push(value.as_str().unwrap_or("").to_string());
          }
        }
        ctx.push(json!("done")).await?;
        Ok(())
      })
    })
    .build();

  let seen_b = Rc::new(RefCell::new(Vec::new()));
  let sink_b = seen_b.clone();
  let bands_def = bands.clone();
  let second = NodeDefinition::builder("demo", "second")
    .input_node("gate", &first)
    .routine(move |ctx, inputs| {
      let sink = sink_b.clone();
      let bands = bands_def.clone();
      Box::pin(async move {
        // Sequence after the first consumer so demand for "b" arrives only
        // once "a" has already been answered.
        let gate = inputs.stream("gate")?.clone();
        while ctx.pull(&gate).await?.is_some() {}

        let info = ctx.get_stream(&bands, Some("b")).await?;
        while let Some(item) = ctx.pull(&info.handle).await? {
          if let Item::Value(value) = item {
            sink.borrow_mut().push(value.as_str().unwrap_or("").to_string());
          }
        }
        Ok(())
      })
    })
    .build();

  let (_, report) = run(&[first, second]);

  assert_eq!(invocations.get(), 2, "demand growth must restart the group once");
  assert_eq!(report.restarted, vec![bands.key().to_string()]);
  assert_eq!(*seen_a.borrow(), vec!["a0", "a1"]);
  assert_eq!(*seen_b.borrow(), vec!["b0", "b1"]);
}

#[test]
fn test_persisted_output_reused_across_runs() {
  let dir = tempfile::tempdir().unwrap();
  let invocations = Rc::new(Cell::new(0u32));

  let make_root = |calls: Rc<Cell<u32>>| {
    NodeDefinition::builder("demo", "root")
      .version("1")
      .output_schema("i64")
      .routine(move |ctx, _inputs| {
        let calls = calls.clone();
        Box::pin(async move {
          calls.set(calls.get() + 1);
          let path = ctx.make_file("readings.txt").await?;
          std::fs::write(&path, "10 20").map_err(|e| NodeError::Protocol(e.to_string()))?;
          ctx.push(json!(10)).await?;
          ctx.push(json!(20)).await?;
          Ok(())
        })
      })
      .build()
  };

  let config = RunConfig {
    store_root: Some(dir.path().to_path_buf()),
    persist: vec!["demo.root".to_string()],
    ..RunConfig::default()
  };

  let root = make_root(invocations.clone());
  let (_, report) = run_with(&[root.clone()], config.clone());
  assert_eq!(invocations.get(), 1);
  assert_eq!(report.committed, vec![(root.key().to_string(), 1)]);

  // The artifact travelled through the commit into the generation.
  let artifact = dir
    .path()
    .join(setid().to_string())
    .join(root.key())
    .join("gen-000001")
    .join("files")
    .join("root")
    .join("readings.txt");
  assert!(artifact.exists());

  // A second run resolves the dependency from the store without invoking
  // the routine again.
  let root_again = make_root(invocations.clone());
  let square = square_node(&root_again);
  let (scheduler, report) = run_with(&[square.clone()], config);
  assert_eq!(invocations.get(), 1, "committed output must be reused");
  assert_eq!(report.cached.len(), 0);
  assert_eq!(report.finished, vec![square.key().to_string()]);
  assert_eq!(
    scheduler.payload_values(&square.default_stream(setid())).unwrap(),
    vec![json!(100), json!(400)]
  );
}

#[test]
fn test_requested_node_with_current_generation_is_cached() {
  let dir = tempfile::tempdir().unwrap();
  let invocations = Rc::new(Cell::new(0u32));
  let calls = invocations.clone();
  let root = NodeDefinition::builder("demo", "root")
    .version("1")
    .routine(move |ctx, _inputs| {
      let calls = calls.clone();
      Box::pin(async move {
        calls.set(calls.get() + 1);
        ctx.push(json!(1)).await?;
        Ok(())
      })
    })
    .build();

  let config = RunConfig {
    store_root: Some(dir.path().to_path_buf()),
    persist: vec!["demo.root".to_string()],
    ..RunConfig::default()
  };

  run_with(&[root.clone()], config.clone());
  let (_, report) = run_with(&[root.clone()], config.clone());
  assert_eq!(invocations.get(), 1);
  assert_eq!(report.cached, vec![root.key().to_string()]);
  assert!(report.finished.is_empty());

  // Forcing re-runs the routine and commits a new generation.
  let forced = RunConfig {
    force: true,
    ..config
  };
  let (_, report) = run_with(&[root.clone()], forced);
  assert_eq!(invocations.get(), 2);
  assert_eq!(report.committed, vec![(root.key().to_string(), 2)]);
}

#[test]
fn test_unmet_dependency_when_materialization_disabled() {
  let root = root_node(0);
  let square = square_node(&root);
  let config = RunConfig {
    materialize_deps: false,
    ..RunConfig::default()
  };
  let mut scheduler = Scheduler::new(setid(), config).unwrap();
  let err = scheduler
    .run(&[square], &CancellationToken::new())
    .unwrap_err();
  match err {
    EngineError::UnmetDependency { handle, .. } => {
      assert_eq!(handle.name, "root");
    }
    other => panic!("expected UnmetDependency, got {other}"),
  }
}

#[test]
fn test_aborting_node_reads_as_empty_stream() {
  let flaky = NodeDefinition::builder("demo", "gnss")
    .output_schema("fix")
    .routine(|_ctx, _inputs| {
      Box::pin(async move { Err(NodeError::abort("no gnss messages in dataset")) })
    })
    .build();

  let pulled = Rc::new(Cell::new(0u32));
  let count = pulled.clone();
  let plot = NodeDefinition::builder("demo", "plot")
    .input_node("fixes", &flaky)
    .routine(move |ctx, inputs| {
      let count = count.clone();
      Box::pin(async move {
        let fixes = inputs.stream("fixes")?.clone();
        while ctx.pull(&fixes).await?.is_some() {
          count.set(count.get() + 1);
        }
        ctx.push(json!("empty-plot")).await?;
        Ok(())
      })
    })
    .build();

  let (scheduler, report) = run(&[plot.clone()]);
  assert_eq!(pulled.get(), 0, "aborted node must read as empty");
  assert_eq!(report.finished.len(), 2);
  assert_eq!(
    scheduler.payload_values(&plot.default_stream(setid())).unwrap(),
    vec![json!("empty-plot")]
  );
}

#[test]
fn test_lagging_consumer_fails_with_too_old() {
  let firehose = NodeDefinition::builder("demo", "firehose")
    .routine(|ctx, _inputs| {
      Box::pin(async move {
        for i in 0..10 {
          ctx.push(json!(i)).await?;
        }
        Ok(())
      })
    })
    .build();

  // Drains the firehose completely before emitting anything, so the late
  // reader below starts after the window has moved past index 0.
  let gate = NodeDefinition::builder("demo", "gate")
    .input_node("src", &firehose)
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let src = inputs.stream("src")?.clone();
        while ctx.pull(&src).await?.is_some() {}
        ctx.push(json!("drained")).await?;
        Ok(())
      })
    })
    .build();

  let late = NodeDefinition::builder("demo", "late")
    .input_node("gate", &gate)
    .input_node("src", &firehose)
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let gate = inputs.stream("gate")?.clone();
        let src = inputs.stream("src")?.clone();
        while ctx.pull(&gate).await?.is_some() {}
        ctx.pull(&src).await?;
        Ok(())
      })
    })
    .build();

  let config = RunConfig {
    cache_size: 2,
    ..RunConfig::default()
  };
  let mut scheduler = Scheduler::new(setid(), config).unwrap();
  let err = scheduler
    .run(&[firehose, late], &CancellationToken::new())
    .unwrap_err();
  match err {
    EngineError::Node { source, .. } => {
      assert!(matches!(
        source,
        NodeError::Stream(StreamError::RequestedMessageTooOld { .. })
      ));
    }
    other => panic!("expected a too-old failure, got {other}"),
  }
}

#[test]
fn test_make_file_on_volatile_stream_fails() {
  let node = NodeDefinition::builder("demo", "render")
    .routine(|ctx, _inputs| {
      Box::pin(async move {
        ctx.make_file("plot.png").await?;
        Ok(())
      })
    })
    .build();

  let mut scheduler = Scheduler::new(setid(), RunConfig::default()).unwrap();
  let err = scheduler
    .run(&[node], &CancellationToken::new())
    .unwrap_err();
  match err {
    EngineError::Node { source, .. } => {
      assert!(matches!(
        source,
        NodeError::Stream(StreamError::MakeFileNotSupported { .. })
      ));
    }
    other => panic!("expected MakeFileNotSupported, got {other}"),
  }
}

#[test]
fn test_mandatory_node_blocked_forever_is_reported() {
  let root = root_node(0);
  let reader = NodeDefinition::builder("demo", "reader")
    .input(
      "src",
      InputSpec::SubStream {
        node: root.clone(),
        name: "never-created".to_string(),
      },
    )
    .routine(|ctx, inputs| {
      Box::pin(async move {
        let src = inputs.stream("src")?.clone();
        ctx.pull(&src).await?;
        Ok(())
      })
    })
    .build();

  let mut scheduler = Scheduler::new(setid(), RunConfig::default()).unwrap();
  let err = scheduler
    .run(&[reader.clone()], &CancellationToken::new())
    .unwrap_err();
  match err {
    EngineError::UnfinishedDriver { node, handle, idx } => {
      assert_eq!(node, reader.key());
      assert_eq!(handle.name, "never-created");
      assert_eq!(idx, 0);
    }
    other => panic!("expected UnfinishedDriver, got {other}"),
  }
}

#[test]
fn test_cancellation_is_observed_before_dispatch() {
  let root = root_node(0);
  let cancel = CancellationToken::new();
  cancel.cancel();
  let mut scheduler = Scheduler::new(setid(), RunConfig::default()).unwrap();
  let err = scheduler.run(&[root], &cancel).unwrap_err();
  assert!(matches!(err, EngineError::Cancelled));
}

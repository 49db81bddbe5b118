//! Workflow trees: atomic submission, barrier results and failure propagation.

mod common;

use std::sync::Arc;

use common::{test_system, within};
use jobflow::{BuildContext, JobflowError, TaskDefinition, TraceId, WorkflowDefinition};
use parking_lot::Mutex;

#[tokio::test]
async fn test_barrier_collects_every_invocation_of_a_child() {
    let t = test_system();
    let traces = Arc::new(Mutex::new(Vec::new()));
    let seen = traces.clone();

    let embed = t
        .system
        .register_task(TaskDefinition::<String, usize>::new("embed").handler(move |text, ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().push(ctx.trace_id().to_string());
                Ok(text.len())
            }
        }))
        .unwrap();

    let child = embed.clone();
    let barrier = embed.clone();
    let reindex = t
        .system
        .register_workflow(
            WorkflowDefinition::<Vec<String>, usize>::new("reindex")
                .dependencies(move |texts, ctx: &BuildContext| {
                    texts
                        .iter()
                        .map(|text| child.as_child_spec(text, ctx.trace()))
                        .collect()
                })
                .handler(move |_texts, ctx| {
                    let barrier = barrier.clone();
                    async move {
                        let lengths = ctx.get_task_result(&barrier)?;
                        Ok(lengths.iter().sum())
                    }
                }),
        )
        .unwrap();
    let workers = t.system.start_workers();

    let handle = reindex
        .dispatch(
            &vec!["hello".to_string(), "translation".to_string()],
            Some(TraceId::from("trace-7")),
        )
        .await
        .unwrap();
    assert_eq!(handle.job_id(), "reindex:root:trace-7");

    assert_eq!(within(handle.wait()).await.unwrap(), 16);
    assert_eq!(*traces.lock(), vec!["trace-7".to_string(); 2]);
    workers.shutdown().await;
}

#[tokio::test]
async fn test_nested_workflow_results_reach_the_outer_barrier() {
    let t = test_system();
    let parse = t
        .system
        .register_task(
            TaskDefinition::<String, Vec<String>>::new("parse")
                .handler(|doc, _ctx| async move { Ok(doc.split(' ').map(str::to_string).collect()) }),
        )
        .unwrap();

    let parse_child = parse.clone();
    let parse_barrier = parse.clone();
    let count_words = t
        .system
        .register_workflow(
            WorkflowDefinition::<String, usize>::new("count-words")
                .dependencies(move |doc, ctx| Ok(vec![parse_child.as_child_spec(doc, ctx.trace())?]))
                .handler(move |_doc, ctx| {
                    let parse = parse_barrier.clone();
                    async move {
                        let parsed = ctx.get_task_result(&parse)?;
                        Ok(parsed.iter().map(Vec::len).sum())
                    }
                }),
        )
        .unwrap();

    let inner_child = count_words.clone();
    let inner_barrier = count_words.clone();
    let summarize = t
        .system
        .register_workflow(
            WorkflowDefinition::<Vec<String>, usize>::new("summarize")
                .dependencies(move |docs, ctx| {
                    docs.iter()
                        .map(|doc| inner_child.as_child_spec(doc, ctx.trace()))
                        .collect()
                })
                .handler(move |_docs, ctx| {
                    let inner = inner_barrier.clone();
                    async move { Ok(ctx.get_task_result(&inner)?.into_iter().sum()) }
                }),
        )
        .unwrap();
    let workers = t.system.start_workers();

    let total = within(summarize.run_and_await(
        &vec!["a b c".to_string(), "d e".to_string()],
        None,
    ))
    .await
    .unwrap();

    assert_eq!(total, 5);
    workers.shutdown().await;
}

#[tokio::test]
async fn test_child_failure_fails_the_root() {
    let t = test_system();
    let barrier_runs = Arc::new(Mutex::new(0u32));
    let runs = barrier_runs.clone();

    let vectorize = t
        .system
        .register_task(
            TaskDefinition::<String, usize>::new("vectorize")
                .handler(|_text, _ctx| async move { anyhow::bail!("model unavailable") }),
        )
        .unwrap();
    let child = vectorize.clone();
    let import = t
        .system
        .register_workflow(
            WorkflowDefinition::<String, usize>::new("import-plugin")
                .dependencies(move |text, ctx| Ok(vec![child.as_child_spec(text, ctx.trace())?]))
                .handler(move |_text, _ctx| {
                    let runs = runs.clone();
                    async move {
                        *runs.lock() += 1;
                        Ok(0)
                    }
                }),
        )
        .unwrap();
    let workers = t.system.start_workers();

    let err = within(import.run_and_await(&"plugin".to_string(), None))
        .await
        .unwrap_err();

    match err {
        JobflowError::JobFailed { job_id, reason } => {
            assert!(job_id.starts_with("import-plugin:root:"));
            assert!(reason.contains("vectorize"), "reason: {reason}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(*barrier_runs.lock(), 0);
    workers.shutdown().await;
}

#[tokio::test]
async fn test_children_with_a_foreign_trace_are_rejected() {
    let t = test_system();
    let parse = t
        .system
        .register_task(TaskDefinition::<u32, u32>::new("parse").handler(|n, _ctx| async move { Ok(n) }))
        .unwrap();
    let workflow = t
        .system
        .register_workflow(
            WorkflowDefinition::<u32, u32>::new("stray")
                .dependencies(move |n, _ctx| Ok(vec![parse.as_child_spec(n, None)?]))
                .handler(|n, _ctx| async move { Ok(n) }),
        )
        .unwrap();

    let err = workflow.dispatch(&1, None).await.unwrap_err();

    assert!(matches!(err, JobflowError::Validation(_)));
    assert_eq!(t.broker.submitted_count(), 0);
}

#[tokio::test]
async fn test_missing_child_result_fails_the_barrier() {
    let t = test_system();
    let unused = t
        .system
        .register_task(TaskDefinition::<u32, u32>::new("unused").handler(|n, _ctx| async move { Ok(n) }))
        .unwrap();
    let lonely = t
        .system
        .register_workflow(WorkflowDefinition::<u32, u32>::new("lonely").handler(move |_n, ctx| {
            let unused = unused.clone();
            async move { Ok(ctx.get_task_result(&unused)?.into_iter().sum()) }
        }))
        .unwrap();
    let workers = t.system.start_workers();

    let err = within(lonely.run_and_await(&1, None)).await.unwrap_err();

    match err {
        JobflowError::JobFailed { reason, .. } => assert!(reason.contains("unused"), "reason: {reason}"),
        other => panic!("unexpected error: {other:?}"),
    }
    workers.shutdown().await;
}

//! Task runner behaviour against the in-memory broker.

#![allow(clippy::unwrap_used, clippy::panic)]

use keel_core::context::{self, AppContext};
use keel_core::extension::{Binding, Extension, ExtensionMap, InstanceId};
use keel_runtime::{
    Execution, RetryPolicy, RunnerError, Task, TaskEnvelope, TaskFault, TaskModule, TaskRunner,
    TaskState,
};
use keel_testing::{InMemoryBroker, test_config};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

struct Greeting {
    binding: Binding,
    text: &'static str,
}

impl Extension for Greeting {
    const NAME: &'static str = "greeting";

    fn binding(&self) -> &Binding {
        &self.binding
    }
}

fn context() -> Arc<AppContext> {
    let instance = InstanceId::new();
    let mut extensions = ExtensionMap::new();
    extensions
        .bind(
            instance,
            Arc::new(Greeting {
                binding: Binding::new(),
                text: "hello",
            }),
        )
        .unwrap();
    AppContext::new(instance, Arc::new(test_config()), extensions)
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy::builder()
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

struct SiteTasks;

impl TaskModule for SiteTasks {
    fn name(&self) -> &'static str {
        "site"
    }

    fn tasks(&self) -> Vec<Task> {
        vec![
            Task::new("describe", |_args| async {
                let ctx = context::require_current()?;
                let greeting = ctx.require::<Greeting>()?;
                Ok(json!({
                    "site": ctx.config().get_string("SITE_NAME"),
                    "greeting": greeting.text,
                }))
            }),
            Task::new("echo", |args| async move { Ok(args) }),
        ]
    }
}

async fn explode(_args: Value) -> Result<Value, TaskFault> {
    panic!("kaboom")
}

fn explode_before_await(_args: Value) -> std::future::Ready<Result<Value, TaskFault>> {
    panic!("kaboom before await")
}

fn runner(broker: &InMemoryBroker) -> TaskRunner {
    TaskRunner::builder(context(), Arc::new(broker.clone()))
        .module(&SiteTasks)
        .retry_policy(fast_retries())
        .poll_timeout(Duration::from_millis(20))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_module_tasks_are_registered_and_wrapped() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker);

    assert_eq!(runner.task_names(), vec!["site.describe", "site.echo"]);
    assert!(runner.task("site.echo").unwrap().is_wrapped());
    assert_eq!(runner.concurrency(), 4);
}

#[tokio::test]
async fn test_wrapped_task_reads_config_and_extensions_without_a_request() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker);
    assert!(context::current().is_none());

    let envelope = TaskEnvelope::new("site.describe", Value::Null);
    let id = envelope.id;
    let outcome = runner.execute(envelope).await;

    assert_eq!(
        outcome,
        Execution::Succeeded(json!({ "site": "Keel Test", "greeting": "hello" }))
    );
    assert!(context::current().is_none());
    assert_eq!(broker.result(id).unwrap().state, TaskState::Success);
}

#[tokio::test]
async fn test_failed_task_is_retried_then_fails() {
    let broker = InMemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let runner = TaskRunner::builder(context(), Arc::new(broker.clone()))
        .task(
            Task::new("flaky", move |_args| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TaskFault::failed("upstream timeout"))
                }
            })
            .with_max_retries(1),
        )
        .retry_policy(fast_retries())
        .build()
        .unwrap();

    let first = TaskEnvelope::new("flaky", Value::Null);
    let id = first.id;
    let outcome = runner.execute(first).await;
    assert!(matches!(outcome, Execution::RetryScheduled { attempt: 1, .. }));

    assert!(broker.wait_for_pending(1, Duration::from_secs(1)).await);
    let retry = broker.pop().unwrap();
    assert_eq!(retry.id, id);
    assert_eq!(retry.attempt, 1);

    let outcome = runner.execute(retry).await;
    assert_eq!(outcome, Execution::Failed("upstream timeout".into()));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stored = broker.result(id).unwrap();
    assert_eq!(stored.state, TaskState::Failure);
    assert_eq!(stored.result, json!("upstream timeout"));
}

#[tokio::test]
async fn test_invalid_arguments_are_not_retried() {
    let broker = InMemoryBroker::new();
    let runner = TaskRunner::builder(context(), Arc::new(broker.clone()))
        .task(Task::new("typed", |args| async move {
            let n: u32 = keel_runtime::parse_args(args)?;
            Ok(json!(n + 1))
        }))
        .build()
        .unwrap();

    let outcome = runner.execute(TaskEnvelope::new("typed", json!("nope"))).await;
    assert!(matches!(outcome, Execution::Failed(_)));
    assert!(broker.is_empty());
}

#[tokio::test]
async fn test_panicking_task_fails_without_killing_the_runner() {
    let broker = InMemoryBroker::new();
    let runner = TaskRunner::builder(context(), Arc::new(broker.clone()))
        .task(Task::new("boom", explode))
        .build()
        .unwrap();

    let outcome = runner.execute(TaskEnvelope::new("boom", Value::Null)).await;
    assert_eq!(outcome, Execution::Failed("task panicked: kaboom".into()));
    assert!(context::current().is_none());
}

#[tokio::test]
async fn test_panic_before_first_await_is_contained() {
    let broker = InMemoryBroker::new();
    let runner = Arc::new(
        TaskRunner::builder(context(), Arc::new(broker.clone()))
            .task(Task::new("early", explode_before_await))
            .build()
            .unwrap(),
    );

    let worker = Arc::clone(&runner);
    let outcome = tokio::spawn(async move {
        worker.execute(TaskEnvelope::new("early", Value::Null)).await
    })
    .await
    .unwrap();

    assert_eq!(
        outcome,
        Execution::Failed("task panicked: kaboom before await".into())
    );
    assert!(context::current().is_none());
}

#[tokio::test]
async fn test_unregistered_task() {
    let broker = InMemoryBroker::new();
    let runner = runner(&broker);

    let envelope = TaskEnvelope::new("site.missing", Value::Null);
    let id = envelope.id;
    assert_eq!(runner.execute(envelope).await, Execution::Unregistered);
    assert_eq!(broker.result(id).unwrap().state, TaskState::Failure);

    let err = runner.enqueue("site.missing", Value::Null).await.unwrap_err();
    assert!(matches!(err, RunnerError::UnknownTask(name) if name == "site.missing"));
}

#[tokio::test]
async fn test_poll_timeout_comes_from_worker_setting() {
    let broker = InMemoryBroker::new();
    let runner = TaskRunner::builder(context(), Arc::new(broker))
        .module(&SiteTasks)
        .build()
        .unwrap();
    assert_eq!(runner.poll_timeout(), Duration::from_secs(2));
    assert!(format!("{runner:?}").contains("site.describe"));
}

#[tokio::test]
async fn test_duplicate_task_names_are_rejected() {
    let broker = InMemoryBroker::new();
    let err = TaskRunner::builder(context(), Arc::new(broker))
        .module(&SiteTasks)
        .module(&SiteTasks)
        .build()
        .unwrap_err();
    assert!(matches!(err, RunnerError::DuplicateTask(name) if name == "site.describe"));
}

#[tokio::test]
async fn test_worker_pool_processes_queue_until_shutdown() {
    let broker = InMemoryBroker::new();
    let runner = Arc::new(runner(&broker));

    let ids = vec![
        runner.enqueue("site.echo", json!(1)).await.unwrap(),
        runner.enqueue("site.echo", json!(2)).await.unwrap(),
        runner.enqueue("site.echo", json!(3)).await.unwrap(),
    ];

    let (shutdown, _) = broadcast::channel(1);
    let pool = {
        let runner = Arc::clone(&runner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run(&shutdown).await })
    };

    let done = tokio::time::timeout(Duration::from_secs(2), async {
        while ids.iter().any(|id| broker.result(*id).is_none()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(done.is_ok());

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), pool)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(broker.result(ids[1]).unwrap().result, json!(2));
}

#[tokio::test]
async fn test_workers_survive_broker_outage() {
    let broker = InMemoryBroker::new();
    let runner = Arc::new(runner(&broker));
    broker.set_offline(true);

    let (shutdown, _) = broadcast::channel(1);
    let pool = {
        let runner = Arc::clone(&runner);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run(&shutdown).await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.set_offline(false);
    let id = runner.enqueue("site.echo", json!("back")).await.unwrap();

    let done = tokio::time::timeout(Duration::from_secs(2), async {
        while broker.result(id).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(done.is_ok());

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), pool)
        .await
        .unwrap()
        .unwrap();
}

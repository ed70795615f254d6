//! Context re-entry for deferred work.
//!
//! [`wrap`] decorates a task so every invocation runs inside the application
//! context captured when the runner was built. The runner applies it to every
//! registered task; task authors never call it themselves.

use crate::task::{Task, TaskFn, TaskFuture};
use keel_core::context::{self, AppContext};
use std::sync::Arc;

/// Wrap `task` so it runs inside `ctx`.
///
/// The wrapped task enters `ctx`, runs the original body with its original
/// arguments, leaves the context and returns the body's result unchanged.
/// Wrapping an already wrapped task returns it as-is. Invoking the wrapped
/// task from code already running inside `ctx` does not stack a second scope.
#[must_use]
pub fn wrap(ctx: Arc<AppContext>, task: Task) -> Task {
    if task.is_wrapped() {
        return task;
    }

    let inner = task.handler();
    let handler: TaskFn = Arc::new(move |args| -> TaskFuture {
        let ctx = Arc::clone(&ctx);
        let inner = Arc::clone(&inner);
        // The body is built inside the scope so its synchronous prelude sees
        // the context too.
        Box::pin(context::scope(ctx, async move { inner(args).await }))
    });

    Task::from_parts(task.name().to_string(), handler, task.max_retries(), true)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::TaskFault;
    use keel_core::{Configuration, ExtensionMap, InstanceId, SettingValue};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;

    fn ctx() -> Arc<AppContext> {
        let mut values = BTreeMap::new();
        values.insert("SITE_NAME".to_string(), SettingValue::from("Keel"));
        AppContext::new(
            InstanceId::new(),
            Arc::new(Configuration::from_map(values)),
            ExtensionMap::new(),
        )
    }

    fn site_name_task() -> Task {
        Task::new("site_name", |_args| async {
            let ctx = context::require_current()?;
            Ok(ctx.config().get_string("SITE_NAME").map_or(Value::Null, Value::from))
        })
    }

    #[tokio::test]
    async fn test_unwrapped_task_has_no_context() {
        let err = site_name_task().call(Value::Null).await.unwrap_err();
        assert!(matches!(err, TaskFault::Context(_)));
    }

    #[tokio::test]
    async fn test_wrapped_task_sees_configuration() {
        let wrapped = wrap(ctx(), site_name_task());
        assert!(wrapped.is_wrapped());
        assert_eq!(wrapped.call(Value::Null).await.unwrap(), json!("Keel"));
        assert!(context::current().is_none());
    }

    #[tokio::test]
    async fn test_failures_pass_through_unchanged() {
        let failing = Task::new("boom", |_args| async { Err(TaskFault::failed("feed offline")) })
            .with_max_retries(7);
        let wrapped = wrap(ctx(), failing);

        assert_eq!(wrapped.max_retries(), 7);
        let err = wrapped.call(Value::Null).await.unwrap_err();
        assert_eq!(err.to_string(), "feed offline");
        assert!(context::current().is_none());
    }

    #[tokio::test]
    async fn test_wrapping_twice_keeps_first_context() {
        let first = ctx();
        let instance_task = Task::new("instance", |_args| async {
            Ok(json!(context::require_current()?.instance_id().to_string()))
        });

        let rewrapped = wrap(ctx(), wrap(Arc::clone(&first), instance_task));

        assert!(rewrapped.is_wrapped());
        assert_eq!(
            rewrapped.call(Value::Null).await.unwrap(),
            json!(first.instance_id().to_string())
        );
    }

    #[tokio::test]
    async fn test_synchronous_prelude_runs_inside_context() {
        let prelude = Task::new("prelude", |_args| {
            let seen = context::current().is_some();
            async move { Ok(json!(seen)) }
        });
        let ctx = ctx();

        let direct = context::scope(Arc::clone(&ctx), async { prelude.call(Value::Null).await })
            .await
            .unwrap();
        assert_eq!(direct, json!(true));

        let wrapped = wrap(ctx, prelude);
        assert_eq!(wrapped.call(Value::Null).await.unwrap(), json!(true));
        assert!(context::current().is_none());
    }

    #[tokio::test]
    async fn test_reentry_from_inside_context_is_a_noop() {
        let ctx = ctx();
        let wrapped = wrap(Arc::clone(&ctx), site_name_task());

        let result = context::scope(Arc::clone(&ctx), async move {
            wrapped.call(Value::Null).await
        })
        .await;

        assert_eq!(result.unwrap(), json!("Keel"));
        assert!(context::current().is_none());
    }
}
